//! Job-level reductions supplied by an algorithm.
//!
//! Vertices report values into named aggregators while computing a
//! superstep. Each worker folds its local reports, the conductor folds the
//! per-worker contributions and broadcasts the result with the next
//! superstep so vertices and the master context can read it.

use crate::message::AggregatorValues;

use serde_json::Value;
use std::collections::BTreeMap;

pub trait Aggregator: Send + Sync {
    /// Value of the aggregator before anything was reported.
    fn identity(&self) -> Value;

    fn aggregate(&self, a: Value, b: Value) -> Value;

    /// Permanent aggregators keep their value across supersteps, the others
    /// restart from `identity` every superstep.
    fn permanent(&self) -> bool {
        false
    }
}

pub struct SumAggregator;

impl Aggregator for SumAggregator {
    fn identity(&self) -> Value {
        Value::from(0.0)
    }

    fn aggregate(&self, a: Value, b: Value) -> Value {
        match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Value::from(a + b),
            (Some(_), None) => a,
            _ => b,
        }
    }
}

pub struct MaxAggregator;

impl Aggregator for MaxAggregator {
    fn identity(&self) -> Value {
        Value::Null
    }

    fn aggregate(&self, a: Value, b: Value) -> Value {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                if x >= y {
                    a
                } else {
                    b
                }
            }
            (Some(_), None) => a,
            _ => b,
        }
    }
}

pub struct MinAggregator;

impl Aggregator for MinAggregator {
    fn identity(&self) -> Value {
        Value::Null
    }

    fn aggregate(&self, a: Value, b: Value) -> Value {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                if x <= y {
                    a
                } else {
                    b
                }
            }
            (Some(_), None) => a,
            _ => b,
        }
    }
}

/// Logical or of boolean reports, e.g. "did anything change".
pub struct AnyAggregator;

impl Aggregator for AnyAggregator {
    fn identity(&self) -> Value {
        Value::Bool(false)
    }

    fn aggregate(&self, a: Value, b: Value) -> Value {
        Value::Bool(a.as_bool().unwrap_or(false) || b.as_bool().unwrap_or(false))
    }
}

/// Keeps the last non-null report. Set by the master context to broadcast a
/// value to every vertex; permanent so it survives supersteps.
pub struct OverwriteAggregator;

impl Aggregator for OverwriteAggregator {
    fn identity(&self) -> Value {
        Value::Null
    }

    fn aggregate(&self, a: Value, b: Value) -> Value {
        if b.is_null() {
            a
        } else {
            b
        }
    }

    fn permanent(&self) -> bool {
        true
    }
}

/// The named aggregators of one algorithm.
#[derive(Default)]
pub struct Aggregators {
    entries: BTreeMap<String, Box<dyn Aggregator>>,
}

impl Aggregators {
    pub fn new() -> Self {
        Aggregators::default()
    }

    pub fn register(&mut self, name: impl Into<String>, aggregator: Box<dyn Aggregator>) -> &mut Self {
        self.entries.insert(name.into(), aggregator);
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Aggregator> {
        self.entries.get(name).map(|a| a.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn identity_values(&self) -> AggregatorValues {
        self.entries
            .iter()
            .map(|(name, aggregator)| (name.clone(), aggregator.identity()))
            .collect()
    }

    /// Folds a single report into `values`. Reports for unknown names are
    /// dropped.
    pub fn report(&self, values: &mut AggregatorValues, name: &str, value: Value) -> bool {
        let Some(aggregator) = self.entries.get(name) else {
            return false;
        };

        let (name, value) = match values.remove_entry(name) {
            Some((name, init)) => (name, aggregator.aggregate(init, value)),
            None => (name.to_string(), value),
        };
        values.insert(name, value);
        true
    }

    /// Folds every value of `other` into `values`.
    pub fn reduce_into(&self, values: &mut AggregatorValues, other: AggregatorValues) {
        for (name, value) in other {
            self.report(values, &name, value);
        }
    }

    /// Values a new superstep starts from: permanent aggregators keep what
    /// they hold in `previous`, the others restart from their identity.
    pub fn next_superstep(&self, previous: &AggregatorValues) -> AggregatorValues {
        self.entries
            .iter()
            .map(|(name, aggregator)| {
                let value = match previous.get(name) {
                    Some(value) if aggregator.permanent() => value.clone(),
                    _ => aggregator.identity(),
                };
                (name.clone(), value)
            })
            .collect()
    }
}
