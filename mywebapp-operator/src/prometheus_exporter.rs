use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
    Request, Response,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, time::sleep};

/// Pause after a failed accept, e.g. when the process ran out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn render(registry: &Registry) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder()
                .status(500)
                .body(Full::new(Bytes::new()))
        }
    }
}

async fn serve_req(
    _req: Request<Incoming>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    render(&registry)
}

/// Serve the metrics of `registry` in Prometheus text format on every path.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}", addr);
    serve(listener, registry).await;
    Ok(())
}

async fn serve(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to accept metrics connection: {}", e);
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}
