use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_num_cores() -> usize {
    1
}

fn default_block_size() -> usize {
    64
}

fn default_aggregator_autoflush_ticks() -> u64 {
    2000
}

fn default_aggregator_target_size() -> usize {
    4096
}

fn default_aggregator_max_flush() -> usize {
    0
}

fn default_aggregator_enable() -> bool {
    true
}

fn default_flush_on_idle() -> bool {
    true
}

fn default_flat_combining() -> bool {
    true
}

fn default_combiner_batch_size() -> usize {
    1024
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds after which a barrier that has not completed prints a warning, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The lamellae backend to use
    /// local -- all cores are threads of the calling process
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Number of cores a world is launched with unless the builder overrides it, default: 1
    #[serde(default = "default_num_cores")]
    pub num_cores: usize,

    /// Block size (in elements) of the block-cyclic layout used by the distributed containers, default: 64
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Maximum number of ticks (microseconds) a record may sit in an aggregation buffer before the poller flushes it, default: 2000
    #[serde(default = "default_aggregator_autoflush_ticks")]
    pub aggregator_autoflush_ticks: u64,

    /// Number of bytes an aggregation buffer may hold before it is flushed, default: 4096
    #[serde(default = "default_aggregator_target_size")]
    pub aggregator_target_size: usize,

    /// Maximum number of timed out buffers flushed by a single poll, 0 means unlimited, default: 0
    #[serde(default = "default_aggregator_max_flush")]
    pub aggregator_max_flush: usize,

    /// When false every record is handed to the transport as soon as it is sent, default: true
    #[serde(default = "default_aggregator_enable")]
    pub aggregator_enable: bool,

    /// Flush every non-empty buffer whenever a core runs out of runnable tasks, default: true
    #[serde(default = "default_flush_on_idle")]
    pub flush_on_idle: bool,

    /// Route container operations through their flat combiner, default: true
    #[serde(default = "default_flat_combining")]
    pub flat_combining: bool,

    /// Number of distinct operations a combiner batch holds before it reports full, default: 1024
    #[serde(default = "default_combiner_batch_size")]
    pub combiner_batch_size: usize,

    /// pin each core thread to a cpu, default: false
    pub pin_cores: Option<bool>,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("LAMELLAR_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
