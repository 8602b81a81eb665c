use serde::Deserialize;

/// Configuration for the state store backend.
#[derive(Debug, Deserialize)]
pub struct StateConfig {
    /// Which backend to use. Only `"memory"` ships in this build.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// How often expired entries are swept from the memory backend
    /// (seconds). `0` disables the sweep; expired entries are still
    /// ignored on read.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_owned()
}

fn default_sweep_interval() -> u64 {
    60
}
