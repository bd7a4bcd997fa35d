//! OpenTelemetry instruments for blob store operations.

use std::time::Instant;

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

const METER_NAME: &str = "blob_store";
const OP_LABEL: &str = "op";

/// Latency and failure instruments, labelled by operation name.
#[derive(Clone)]
pub struct OperationMetrics {
    durations: Histogram<f64>,
    errors: Counter<u64>,
}

impl OperationMetrics {
    pub fn new(meter: &Meter) -> Self {
        let durations = meter
            .f64_histogram("blob_store.operation_duration_seconds")
            .with_description("Duration of blob store operations in seconds")
            .with_unit("s")
            .build();

        let errors = meter
            .u64_counter("blob_store.errors_total")
            .with_description("Total number of failed blob store operations")
            .build();

        Self { durations, errors }
    }

    /// Instruments registered on the process-wide meter provider. Without an
    /// installed provider they record nothing.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    /// Starts timing `op`; the duration is recorded when the timer drops.
    pub fn timer(&self, op: &'static str) -> Timer {
        Timer {
            start: Instant::now(),
            histogram: self.durations.clone(),
            op,
        }
    }

    pub fn record_error(&self, op: &'static str) {
        self.errors.add(1, &[KeyValue::new(OP_LABEL, op)]);
    }
}

/// Drop guard recording the elapsed time of one operation.
pub struct Timer {
    start: Instant,
    histogram: Histogram<f64>,
    op: &'static str,
}

impl Timer {
    pub fn op(&self) -> &'static str {
        self.op
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram
            .record(duration, &[KeyValue::new(OP_LABEL, self.op)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_work_without_a_provider() {
        let metrics = OperationMetrics::global();
        {
            let timer = metrics.timer("get");
            assert_eq!(timer.op(), "get");
        }
        metrics.record_error("get");
    }
}
