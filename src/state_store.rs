//! Provisioning and agent state store
//!
//! Key-value facts that a provisioning flow writes and the agent reads (broker
//! hostname, external device id, scope id) plus the progress flags the
//! operations maintain. [`AgentStateStore`] keeps them in memory and, when
//! given a path, persists them as JSON after every change.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// State store errors
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Failed to access state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Read and write access to provisioning facts and operation progress
pub trait ProvisioningStore: Send + Sync {
    fn get_broker_hostname(&self) -> Option<String>;
    fn get_external_device_id(&self) -> Option<String>;
    /// Scope id (service instance) assigned at enrollment
    fn get_scope_id(&self) -> Option<String>;
    fn is_device_enrolled(&self) -> bool;
    fn is_agent_info_reported(&self) -> bool;

    fn set_broker_hostname(&self, hostname: Option<String>) -> Result<(), StateStoreError>;
    fn set_external_device_id(&self, device_id: Option<String>) -> Result<(), StateStoreError>;
    fn set_scope_id(&self, scope_id: Option<String>) -> Result<(), StateStoreError>;
    fn set_device_enrolled(&self, enrolled: bool) -> Result<(), StateStoreError>;
    fn set_agent_info_reported(&self, reported: bool) -> Result<(), StateStoreError>;
}

/// Persisted agent state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub broker_hostname: Option<String>,
    pub external_device_id: Option<String>,
    pub scope_id: Option<String>,
    pub device_enrolled: bool,
    pub agent_info_reported: bool,
}

/// In-process state store with optional JSON persistence
#[derive(Debug)]
pub struct AgentStateStore {
    state: Mutex<AgentState>,
    path: Option<PathBuf>,
}

impl AgentStateStore {
    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::with_state(AgentState::default())
    }

    pub fn with_state(state: AgentState) -> Self {
        Self {
            state: Mutex::new(state),
            path: None,
        }
    }

    /// Open a persisted store; a missing file starts from defaults
    pub fn open(path: &Path) -> Result<Self, StateStoreError> {
        let state = match std::fs::read_to_string(path) {
            Ok(content) => {
                let state: AgentState = serde_json::from_str(&content)?;
                info!("Loaded agent state from {}", path.display());
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", path.display());
                AgentState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> AgentState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        // the state is plain data, so a panic elsewhere cannot leave it half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F>(&self, mutate: F) -> Result<(), StateStoreError>
    where
        F: FnOnce(&mut AgentState),
    {
        let mut state = self.lock();
        mutate(&mut state);
        if let Some(path) = &self.path {
            Self::persist(path, &state)?;
        }
        Ok(())
    }

    fn persist(path: &Path, state: &AgentState) -> Result<(), StateStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for AgentStateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ProvisioningStore for AgentStateStore {
    fn get_broker_hostname(&self) -> Option<String> {
        self.lock().broker_hostname.clone().filter(|h| !h.is_empty())
    }

    fn get_external_device_id(&self) -> Option<String> {
        self.lock()
            .external_device_id
            .clone()
            .filter(|id| !id.is_empty())
    }

    fn get_scope_id(&self) -> Option<String> {
        self.lock().scope_id.clone().filter(|id| !id.is_empty())
    }

    fn is_device_enrolled(&self) -> bool {
        self.lock().device_enrolled
    }

    fn is_agent_info_reported(&self) -> bool {
        self.lock().agent_info_reported
    }

    fn set_broker_hostname(&self, hostname: Option<String>) -> Result<(), StateStoreError> {
        self.update(|state| state.broker_hostname = hostname)
    }

    fn set_external_device_id(&self, device_id: Option<String>) -> Result<(), StateStoreError> {
        self.update(|state| state.external_device_id = device_id)
    }

    fn set_scope_id(&self, scope_id: Option<String>) -> Result<(), StateStoreError> {
        self.update(|state| state.scope_id = scope_id)
    }

    fn set_device_enrolled(&self, enrolled: bool) -> Result<(), StateStoreError> {
        self.update(|state| state.device_enrolled = enrolled)
    }

    fn set_agent_info_reported(&self, reported: bool) -> Result<(), StateStoreError> {
        self.update(|state| state.agent_info_reported = reported)
    }
}
