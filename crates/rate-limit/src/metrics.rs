//! Counters describing admission decisions.
//!
//! Without an installed meter provider these are no-ops.

use opentelemetry::metrics::Counter;
use opentelemetry::{Key, KeyValue, Value};

use crate::error::Dimension;

const METER_NAME: &str = "gateway";

/// Admission decisions, by dimension and outcome.
pub const RATE_LIMIT_DECISIONS: &str = "gateway.rate_limit.decisions";

/// Successful requests whose window entry could not be recorded.
pub const RATE_LIMIT_RECORD_FAILURES: &str = "gateway.rate_limit.record_failures";

/// Outcome of one dimension check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Allowed,
    Denied,
    Error,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Denied => "denied",
            Outcome::Error => "error",
        }
    }
}

#[derive(Clone)]
pub(crate) struct Metrics {
    decisions: Counter<u64>,
    record_failures: Counter<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);

        Self {
            decisions: meter.u64_counter(RATE_LIMIT_DECISIONS).build(),
            record_failures: meter.u64_counter(RATE_LIMIT_RECORD_FAILURES).build(),
        }
    }

    pub fn decision(&self, dimension: Dimension, outcome: Outcome) {
        let attributes = [
            KeyValue::new(Key::from("dimension"), Value::from(dimension.as_str())),
            KeyValue::new(Key::from("outcome"), Value::from(outcome.as_str())),
        ];

        self.decisions.add(1, &attributes);
    }

    pub fn record_failure(&self) {
        self.record_failures.add(1, &[]);
    }
}
