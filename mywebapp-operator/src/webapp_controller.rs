use crate::{
    cluster_api::{ClusterApi, KubeClusterApi},
    configuration::Configuration,
    dispatcher::{Dispatcher, Handler, HandlerTable},
    errors::ControllerError,
    observer::{Observer, TelemetryObserver},
    reconciler::Reconciler,
    resync::ResyncScheduler,
    tracker::AnnotationTracker,
    utils::metric_name,
    watch::{subscribe, EventKind, ObjectIndex, WatchEvent},
};
use futures::{FutureExt, Stream, StreamExt};
use opentelemetry::{
    global,
    metrics::{Counter, Meter},
};
use std::{future::Future, sync::Arc, time::Instant};

const WEBAPP_CONTROLLER: &'static str = "webapp_controller";

/// Reconcile with the desired state carried by the event; deleting objects
/// resolve to the cleanup path.
async fn apply(
    reconciler: Arc<Reconciler>,
    observer: Arc<dyn Observer>,
    event: WatchEvent,
) -> Result<(), ControllerError> {
    let start = Instant::now();
    let report = reconciler.reconcile(&event.key, event.desired()).await;
    observer.observe(&event, &report, start.elapsed());
    report.into_result()
}

async fn remove(
    reconciler: Arc<Reconciler>,
    observer: Arc<dyn Observer>,
    event: WatchEvent,
) -> Result<(), ControllerError> {
    let start = Instant::now();
    let report = reconciler.reconcile(&event.key, None).await;
    observer.observe(&event, &report, start.elapsed());
    report.into_result()
}

/// The registration table: ADD, UPDATE and SYNC converge, DELETE cleans up.
pub(crate) fn handler_table(
    reconciler: Arc<Reconciler>,
    observer: Arc<dyn Observer>,
) -> HandlerTable {
    let converge: Handler = {
        let reconciler = reconciler.clone();
        let observer = observer.clone();
        Arc::new(move |event: WatchEvent| apply(reconciler.clone(), observer.clone(), event).boxed())
    };
    let cleanup: Handler =
        Arc::new(move |event: WatchEvent| remove(reconciler.clone(), observer.clone(), event).boxed());
    HandlerTable::default()
        .register(EventKind::Add, converge.clone())
        .register(EventKind::Update, converge.clone())
        .register(EventKind::Sync, converge)
        .register(EventKind::Delete, cleanup)
}

/// Hand every watch event to the dispatcher until the stream ends. Failures
/// are counted, the watcher restarts on its own with backoff.
async fn forward<S, E>(events: S, dispatcher: Dispatcher, watch_restarts: Counter<u64>) -> u64
where
    S: Stream<Item = Result<WatchEvent, E>>,
    E: std::fmt::Display,
{
    events
        .fold(0, move |failures, res| {
            let failures = match res {
                Ok(event) => {
                    debug!("{} {}@{}", event.kind, event.key, event.revision);
                    dispatcher.dispatch(event);
                    failures
                }
                Err(e) => {
                    warn!("MyWebApp watch failed, restarting: {}", e);
                    watch_restarts.add(1, &[]);
                    failures + 1
                }
            };
            futures::future::ready(failures)
        })
        .await
}

/// Wires the watch stream, the dispatcher and the resync scheduler for `MyWebApp` objects.
pub(crate) struct WebAppController {
    configuration: Configuration,
    api: Arc<dyn ClusterApi>,
    index: ObjectIndex,
    dispatcher: Dispatcher,
    watch_restarts: Counter<u64>,
}

impl WebAppController {
    pub fn new(configuration: Configuration) -> Self {
        let settings = &configuration.settings;
        let api: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(
            configuration.client.clone(),
            settings.api_timeout,
            settings.single_namespace().map(|ns| ns.to_string()),
        ));
        let tracker = Arc::new(AnnotationTracker::new(api.clone()));
        let reconciler = Arc::new(Reconciler::new(
            api.clone(),
            tracker,
            settings.defaults.clone(),
        ));
        let dispatcher = Dispatcher::new(
            handler_table(reconciler, Arc::new(TelemetryObserver::new())),
            settings.workers,
            settings.retry.clone(),
        );
        let meter: Meter = global::meter(WEBAPP_CONTROLLER);
        let watch_restarts = meter
            .u64_counter(metric_name("watch_restarts"))
            .with_description("Count of MyWebApp watch stream failures followed by a restart")
            .build();
        Self {
            configuration,
            api,
            index: ObjectIndex::default(),
            dispatcher,
            watch_restarts,
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let resync = ResyncScheduler::new(
            self.configuration.settings.resync_interval,
            self.index.clone(),
            self.dispatcher.clone(),
            self.api.clone(),
        )
        .with_namespaces(self.configuration.settings.watch_namespaces.clone());
        let events = subscribe(
            self.configuration.webapps.clone(),
            self.index.clone(),
            self.configuration.settings.watch_namespaces.clone(),
        );
        let watch = forward(events, self.dispatcher.clone(), self.watch_restarts.clone()).map(
            |failures| warn!("MyWebApp watch ended after {} failures", failures),
        );
        async move {
            info!(
                "start MyWebApp controller (resync every {:?}, {} workers)",
                self.configuration.settings.resync_interval, self.configuration.settings.workers
            );
            tokio::join!(watch, resync.run());
        }
    }
}
