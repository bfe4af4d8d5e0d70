use crate::{
    cluster_api::ClusterApi,
    configuration::is_watched,
    deployment::owner_of,
    dispatcher::Dispatcher,
    errors::ControllerError,
    utils::{metric_name, NamespacedName},
    watch::{EventKind, ObjectIndex, WatchEvent},
};
use opentelemetry::{global, metrics::Counter, KeyValue};
use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const RESYNC: &'static str = "resync";

/// Periodically re-delivers every known `MyWebApp` as a [`EventKind::Sync`]
/// event and removes Deployments whose `MyWebApp` no longer exists.
pub(crate) struct ResyncScheduler {
    interval: Duration,
    index: ObjectIndex,
    dispatcher: Dispatcher,
    api: Arc<dyn ClusterApi>,
    /// Orphans outside these namespaces are left alone, `None` sweeps all.
    namespaces: Option<HashSet<String>>,
    resync_events: Counter<u64>,
}

impl ResyncScheduler {
    pub fn new(
        interval: Duration,
        index: ObjectIndex,
        dispatcher: Dispatcher,
        api: Arc<dyn ClusterApi>,
    ) -> Self {
        let resync_events = global::meter(RESYNC)
            .u64_counter(metric_name("resync_events"))
            .with_description("Count of events injected by the resync scheduler")
            .build();
        Self {
            interval,
            index,
            dispatcher,
            api,
            namespaces: None,
            resync_events,
        }
    }

    pub fn with_namespaces(mut self, namespaces: Option<HashSet<String>>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Runs forever; the first tick fires one interval after start since the
    /// initial list already delivers every object.
    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let synced = self.resync_once();
            match self.sweep_orphans().await {
                Ok(orphans) => debug!(
                    "resync injected {} sync and {} orphan delete events",
                    synced,
                    orphans.len()
                ),
                Err(e) => warn!("orphan sweep failed, will retry on next resync: {}", e),
            }
        }
    }

    /// Dispatch a sync event for every known object.
    pub fn resync_once(&self) -> usize {
        let objects = self.index.snapshot();
        for object in &objects {
            self.dispatcher
                .dispatch(WatchEvent::new(EventKind::Sync, object.clone()));
        }
        self.resync_events
            .add(objects.len() as u64, &[KeyValue::new("kind", "sync")]);
        objects.len()
    }

    /// Dispatch a deletion for every managed Deployment whose `MyWebApp` is
    /// neither known to the watch nor present in the cluster.
    pub async fn sweep_orphans(&self) -> Result<Vec<NamespacedName>, ControllerError> {
        let parents: BTreeSet<NamespacedName> = self
            .api
            .list_children()
            .await?
            .iter()
            .filter_map(owner_of)
            .filter(|parent| is_watched(self.namespaces.as_ref(), &parent.namespace))
            .filter(|parent| !self.index.contains(parent))
            .collect();
        let mut orphans = vec![];
        for parent in parents {
            match self.api.get_parent(&parent).await {
                Err(e) if e.is_not_found() => orphans.push(parent),
                Err(e) => Err(e)?,
                // Created after the index was read, the watch will deliver it.
                Ok(_) => (),
            }
        }
        for parent in &orphans {
            info!("Deployment of {} has no MyWebApp, scheduling removal", parent);
            self.dispatcher.dispatch(WatchEvent::tombstone(parent));
        }
        self.resync_events
            .add(orphans.len() as u64, &[KeyValue::new("kind", "orphan")]);
        Ok(orphans)
    }
}
