#[macro_use]
extern crate log;

use configuration::{Configuration, Settings};
use kube::Client;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use webapp_controller::WebAppController;

mod cluster_api;
mod configuration;
mod deployment;
mod dispatcher;
mod errors;
mod observer;
mod prometheus_exporter;
mod reconciler;
mod resync;
mod retry;
#[cfg(test)]
mod testing;
mod tracker;
mod utils;
mod watch;
mod webapp_controller;

/// The K8s field manager name.
const MANAGER: &'static str = "mywebapp-operator";

/// The K8s finalizer name.
///
/// Note, changing the finalizer name is a breaking change and needs
/// additional code to remove the old finalizer (name) from all affected
/// K8s objects. So, think twice before you rename it, otherwise users might
/// be stuck with K8s objects which cannot be deleted as they have a finalizer
/// set which is not automatically removed.
const FINALIZER: &'static str = "mycompany.com/mywebapp-operator";

/// Label put on every Deployment the operator manages, value is [`MANAGER`].
const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let settings = Settings::from_env()?;
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider.clone());
    let prometheus_metrics_exporter =
        start_prometheus_metrics_server(settings.metrics_addr, registry);

    let client = Client::try_default().await?;
    let configuration = Configuration::new(client, settings);
    let controller = WebAppController::new(configuration).start();
    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       res = prometheus_metrics_exporter => res?,
       _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
    };
    if let Err(e) = provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    Ok(())
}
