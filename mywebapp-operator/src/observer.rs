use crate::{
    reconciler::{ReconcileReport, ReconcileState},
    utils::metric_name,
    watch::WatchEvent,
};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use std::time::Duration;

const RECONCILER: &'static str = "reconciler";

/// Side-channel invoked once per finished reconcile.
pub(crate) trait Observer: Send + Sync {
    fn observe(&self, event: &WatchEvent, report: &ReconcileReport, elapsed: Duration);
}

/// Turns [`ReconcileReport`]s into log lines and metrics.
pub(crate) struct TelemetryObserver {
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    child_writes: Counter<u64>,
}

impl TelemetryObserver {
    pub fn new() -> Self {
        let meter: Meter = global::meter(RECONCILER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of MyWebApp reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of MyWebApp objects in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocation errors for MyWebApp objects")
            .build();
        let child_writes = meter
            .u64_counter(metric_name("child_writes"))
            .with_description("Count of Deployment writes by action")
            .build();
        Self {
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            child_writes,
        }
    }
}

impl Observer for TelemetryObserver {
    fn observe(&self, event: &WatchEvent, report: &ReconcileReport, elapsed: Duration) {
        let labels = &[
            KeyValue::new("object_name", report.key.name.clone()),
            KeyValue::new("object_namespace", report.key.namespace.clone()),
            KeyValue::new("event", event.kind.to_string()),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(elapsed.as_millis() as u64, labels);

        for (from, to) in &report.transitions {
            debug!("{} {} -> {}", report.key, from, to);
        }
        for action in report.actions.iter().filter(|a| a.is_write()) {
            info!(
                "Deployment {} {} ({} of {}@{})",
                report.key, action, event.kind, report.key, event.revision
            );
            self.child_writes
                .add(1, &[KeyValue::new("action", action.to_string())]);
        }
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        match &report.outcome {
            Ok(()) if report.state() == ReconcileState::Absent => {
                info!("{} removed after {} event", report.key, event.kind)
            }
            Ok(()) => debug!(
                "reconciled {}@{} in {:?} ({})",
                report.key,
                report.revision,
                elapsed,
                report.state()
            ),
            Err(e) => {
                let kind = if e.is_temporary() {
                    "temporary"
                } else {
                    "permanent"
                };
                self.reconcile_errors
                    .add(1, &[KeyValue::new("kind", kind)]);
                if e.is_temporary() {
                    warn!("reconcile of {}@{} failed: {}", report.key, event.revision, e);
                } else {
                    error!("reconcile of {}@{} failed: {}", report.key, event.revision, e);
                }
            }
        }
    }
}
