use std::sync::Arc;

use meter_state::StateStore;
use meter_state_memory::MemoryStateStore;

use crate::config::StateConfig;
use crate::error::ServerError;

/// A constructed state backend.
pub struct StateBackend {
    pub store: Arc<dyn StateStore>,
    /// Set when the backend needs an external sweep to reclaim expired
    /// entries.
    pub memory: Option<Arc<MemoryStateStore>>,
}

/// Create a state store from the given configuration.
pub fn create_state(config: &StateConfig) -> Result<StateBackend, ServerError> {
    match config.backend.as_str() {
        "memory" => {
            let memory = Arc::new(MemoryStateStore::new());
            Ok(StateBackend {
                store: Arc::clone(&memory) as Arc<dyn StateStore>,
                memory: Some(memory),
            })
        }
        other => Err(ServerError::Config(format!(
            "unknown state backend: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_exposes_sweeper() {
        let backend = create_state(&StateConfig::default()).unwrap();
        assert!(backend.memory.is_some());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = StateConfig {
            backend: "etcd".into(),
            ..StateConfig::default()
        };
        let err = create_state(&config).err().unwrap();
        assert!(err.to_string().contains("etcd"));
    }
}
