use serde::{Deserialize, Serialize};

/// How a `QueryPlan` schedules its operators. Both modes run the exact
/// same `Operator` implementations; they differ only in how a producer's
/// send reaches a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Direct, in-order dispatch on a single task: a producer's send
    /// pushes a job onto a shared work queue and the driver dispatches
    /// it before moving to the next job. No channels, no concurrency.
    Cooperative,
    /// Each operator owns a private `tokio::sync::mpsc` inbound queue
    /// and runs as its own Tokio task; sends cross real channels.
    TaskParallel,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Cooperative
    }
}

/// How many messages an outbound buffer accumulates before it's flushed
/// to the target consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Flush after every message.
    Immediate,
    /// Flush once the buffer reaches this many messages.
    Count(usize),
    /// Never flush early; only flush on `complete()`.
    Unbounded,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        BufferPolicy::Count(1024)
    }
}

impl BufferPolicy {
    pub fn should_flush(&self, buffered_len: usize) -> bool {
        match self {
            BufferPolicy::Immediate => true,
            BufferPolicy::Count(n) => buffered_len >= *n,
            BufferPolicy::Unbounded => false,
        }
    }
}

/// Ambient, plan-wide configuration loaded from a YAML file and/or
/// `SCANFLOW_*` environment overlays via the `config` crate (see
/// `GraphConfig::load`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub transport: Transport,
    pub buffer_policy: BufferPolicy,
    /// Maximum length, in bytes, of a SQL expression the remote scan
    /// backend will accept. Bounds `BloomCreate`'s serialized predicate.
    pub max_remote_expression_len: usize,
    /// Default false-positive rate `BloomCreate` targets before any
    /// budget-driven widening.
    pub default_bloom_fp_rate: f64,
    /// Multiple of `max_tuples` sampled by `TopKTableScan` before it
    /// derives a filter threshold.
    pub top_k_sample_scale: usize,
    /// Per-operator inbound `tokio::sync::mpsc` channel capacity under
    /// `Transport::TaskParallel`. Irrelevant under `Cooperative`.
    pub mailbox_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            buffer_policy: BufferPolicy::default(),
            max_remote_expression_len: 262_144,
            default_bloom_fp_rate: 0.3,
            top_k_sample_scale: 2,
            mailbox_capacity: 256,
        }
    }
}

impl GraphConfig {
    /// Loads a `GraphConfig` layered from a YAML file overlaid with
    /// `SCANFLOW_*` environment variables, using the `config` crate so
    /// overrides don't require a code change.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, crate::error::EngineError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(::config::Environment::with_prefix("SCANFLOW"));
        let built = builder
            .build()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        // `config::Config` defaults missing keys to the struct's own
        // `Default`, so an empty file (or none at all) is valid input.
        let defaults = serde_json::to_value(GraphConfig::default())
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        let mut merged = built
            .try_deserialize::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Object(Default::default()));
        if let (serde_json::Value::Object(defaults), serde_json::Value::Object(overrides)) =
            (&defaults, &mut merged)
        {
            for (k, v) in defaults {
                overrides.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        serde_json::from_value(merged).map_err(|e| crate::error::EngineError::Config(e.to_string()))
    }
}
