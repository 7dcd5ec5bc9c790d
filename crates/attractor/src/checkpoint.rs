//! Resume checkpoints. One JSON document per run, rewritten after every
//! completed step via write-to-temp-and-rename so a concurrent reader never
//! observes a partial file.
//!
//! Format: `timestamp` (float seconds), `current_node`, `completed_nodes`,
//! `node_retries`, `context`, `logs`. Unknown fields are ignored and
//! missing fields default to empty, so newer writers stay readable.

use crate::{AttractorError, ContextSnapshot, ContextStore, ContextValues};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub current_node: String,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub node_retries: BTreeMap<String, u32>,
    #[serde(default, rename = "context")]
    pub context_values: ContextValues,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl Checkpoint {
    pub fn from_state(
        snapshot: &ContextSnapshot,
        current_node: &str,
        completed_nodes: &[String],
        node_retries: &BTreeMap<String, u32>,
    ) -> Self {
        Self {
            timestamp: unix_timestamp(),
            current_node: current_node.to_string(),
            completed_nodes: completed_nodes.to_vec(),
            node_retries: node_retries.clone(),
            context_values: snapshot.values.clone(),
            logs: snapshot.logs.clone(),
        }
    }

    /// Restore a context store carrying this checkpoint's values and logs.
    pub fn restore_context(&self) -> ContextStore {
        ContextStore::from_parts(self.context_values.clone(), self.logs.clone())
    }

    pub fn save(&self, path: &Path) -> Result<(), AttractorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create checkpoint directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            AttractorError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        // Write-to-temp-and-rename keeps the checkpoint file whole under a
        // crash mid-write.
        let tmp_path = temp_sibling(path);
        fs::write(&tmp_path, &bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed writing checkpoint temp file '{}': {error}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed renaming checkpoint into place at '{}': {error}",
                path.display()
            ))
        })
    }

    pub fn load(path: &Path) -> Result<Self, AttractorError> {
        let bytes = fs::read(path).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed reading checkpoint file '{}': {error}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed deserializing checkpoint file '{}': {error}",
                path.display()
            ))
        })
    }
}

pub fn checkpoint_file_path(logs_root: &Path) -> PathBuf {
    logs_root.join(CHECKPOINT_FILE_NAME)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| CHECKPOINT_FILE_NAME.to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}
