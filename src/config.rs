//! Cluster-wide and per-job configuration.

use crate::error::{PregelError, Result};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PregelConfig {
    /// Deadline for the replies of one broadcast round.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// How long a worker waits for the message counts declared by its peers.
    #[serde(with = "humantime_serde")]
    pub message_wait_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub requeue_delay: Duration,

    /// Re-queue attempts of a command one superstep ahead before the worker
    /// gives up with a superstep mismatch.
    pub max_requeues: u32,

    pub cancel_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub cancel_backoff: Duration,

    /// Wall-clock budget of the whole cancel phase.
    #[serde(with = "humantime_serde")]
    pub cancel_budget: Duration,

    /// How long finished and failed jobs are kept.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,

    /// Compute tasks per worker.
    pub parallelism: usize,

    /// Outgoing vertex messages per batch.
    pub batch_size: usize,

    pub max_gss: u64,
}

impl Default for PregelConfig {
    fn default() -> Self {
        PregelConfig {
            rpc_timeout: Duration::from_secs(30),
            message_wait_timeout: Duration::from_secs(10),
            requeue_delay: Duration::from_millis(50),
            max_requeues: 40,
            cancel_attempts: 3,
            cancel_backoff: Duration::from_secs(1),
            cancel_budget: Duration::from_secs(300),
            retention: Duration::from_secs(600),
            reap_interval: Duration::from_secs(30),
            parallelism: num_cpus::get(),
            batch_size: 500,
            max_gss: 500,
        }
    }
}

impl PregelConfig {
    pub fn new() -> Self {
        PregelConfig::default()
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_message_wait_timeout(mut self, timeout: Duration) -> Self {
        self.message_wait_timeout = timeout;
        self
    }

    pub fn with_requeue(mut self, delay: Duration, attempts: u32) -> Self {
        self.requeue_delay = delay;
        self.max_requeues = attempts;
        self
    }

    pub fn with_cancel_policy(mut self, attempts: u32, backoff: Duration, budget: Duration) -> Self {
        self.cancel_attempts = attempts;
        self.cancel_backoff = backoff;
        self.cancel_budget = budget;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_gss(mut self, max_gss: u64) -> Self {
        self.max_gss = max_gss;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout.is_zero() {
            return Err(PregelError::Config("rpc_timeout must be greater than 0".into()));
        }
        if self.message_wait_timeout.is_zero() {
            return Err(PregelError::Config(
                "message_wait_timeout must be greater than 0".into(),
            ));
        }
        if self.cancel_attempts == 0 {
            return Err(PregelError::Config("cancel_attempts must be at least 1".into()));
        }
        if self.cancel_budget < self.cancel_backoff {
            return Err(PregelError::Config(
                "cancel_budget must not be shorter than cancel_backoff".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(PregelError::Config("reap_interval must be greater than 0".into()));
        }
        if self.parallelism == 0 {
            return Err(PregelError::Config("parallelism must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(PregelError::Config("batch_size must be at least 1".into()));
        }
        if self.max_gss == 0 {
            return Err(PregelError::Config("max_gss must be at least 1".into()));
        }
        Ok(())
    }
}

/// Options of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Write results back into the vertex documents.
    pub store: bool,
    pub max_gss: Option<u64>,
    pub params: Value,
    pub parallelism: Option<usize>,
    pub result_field: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            store: false,
            max_gss: None,
            params: Value::Object(Default::default()),
            parallelism: None,
            result_field: "result".to_string(),
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        JobOptions::default()
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn with_max_gss(mut self, max_gss: u64) -> Self {
        self.max_gss = Some(max_gss);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_result_field(mut self, field: impl Into<String>) -> Self {
        self.result_field = field.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.params.is_object() && !self.params.is_null() {
            return Err(PregelError::InvalidParameters(
                "params must be an object".into(),
            ));
        }
        if self.result_field.is_empty() || self.result_field.starts_with('_') {
            return Err(PregelError::InvalidParameters(format!(
                "invalid result field '{}'",
                self.result_field
            )));
        }
        if self.max_gss == Some(0) || self.parallelism == Some(0) {
            return Err(PregelError::InvalidParameters(
                "max_gss and parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
