use crate::{cache::DerivativeCache, schedule::TaskScheduler};
use prometheus_client::{
    collector::Collector,
    encoding::{
        DescriptorEncoder, EncodeLabelSet, EncodeLabelValue, EncodeMetric, LabelValueEncoder,
    },
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    errors: Family<ErrorLabels, Counter>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ErrorKind {
    /// A group could not be resolved.
    Resolve,
    /// A parent's status could not be written.
    Status,
    /// A derivative could not be written to or deleted from the store.
    Store,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    kind: ErrorKind,
}

#[derive(Debug)]
struct Instrumented {
    cache: DerivativeCache,
    tasks: TaskScheduler,
}

// === impl ErrorKind ===

impl EncodeLabelValue for ErrorKind {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> Result<(), std::fmt::Error> {
        use std::fmt::Write;
        encoder.write_str(match self {
            Self::Resolve => "resolve",
            Self::Status => "status",
            Self::Store => "store",
        })
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let errors = Family::default();
        reg.register(
            "derivative_errors",
            "Count of errors encountered while reconciling derivative policies",
            errors.clone(),
        );

        Self { errors }
    }

    pub(crate) fn inc_error(&self, kind: ErrorKind) {
        self.errors.get_or_create(&ErrorLabels { kind }).inc();
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors.get_or_create(&ErrorLabels { kind }).get()
    }
}

/// Registers gauges describing the controller's in-memory state.
pub fn register_state(reg: &mut Registry, cache: DerivativeCache, tasks: TaskScheduler) {
    reg.register_collector(Box::new(Instrumented { cache, tasks }));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let cache_encoder = encoder.encode_descriptor(
            "derivative_cache_size",
            "The number of parent policies with an active derivative",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.cache.len() as i64).encode(cache_encoder)?;

        let tasks_encoder = encoder.encode_descriptor(
            "pending_tasks",
            "The number of reconciliation tasks that have not completed",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.tasks.len() as i64).encode(tasks_encoder)?;

        Ok(())
    }
}
