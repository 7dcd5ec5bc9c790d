use crate::{AttractorError, ContextValues};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Point-in-time copy of the store: values, their insertion order, and the
/// run log lines.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: ContextValues,
    pub order: Vec<String>,
    pub logs: Vec<String>,
}

impl ContextSnapshot {
    /// Entries in insertion order. Keys restored from a checkpoint fall back
    /// to lexicographic order.
    pub fn ordered_entries(&self) -> Vec<(&str, &Value)> {
        self.order
            .iter()
            .filter_map(|key| self.values.get(key).map(|value| (key.as_str(), value)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.values.get(key).map(value_to_string).unwrap_or_default()
    }
}

/// Shared key-value store for one pipeline run. Reads are concurrent,
/// writes exclusive; an outcome's updates land atomically.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<ContextState>>,
}

#[derive(Clone, Debug, Default)]
struct ContextState {
    values: ContextValues,
    order: Vec<String>,
    logs: Vec<String>,
}

impl ContextState {
    fn insert(&mut self, key: String, value: Value) {
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(values: ContextValues, logs: Vec<String>) -> Self {
        let order = values.keys().cloned().collect();
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                values,
                order,
                logs,
            })),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), AttractorError> {
        let mut state = self.write_lock()?;
        state.insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, AttractorError> {
        let state = self.read_lock()?;
        Ok(state.values.get(key).cloned())
    }

    pub fn get_string(&self, key: &str) -> Result<String, AttractorError> {
        let state = self.read_lock()?;
        Ok(state.values.get(key).map(value_to_string).unwrap_or_default())
    }

    /// Merge an outcome's updates under one write lock so readers observe
    /// either none or all of them.
    pub fn apply_updates(&self, updates: &ContextValues) -> Result<(), AttractorError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut state = self.write_lock()?;
        for (key, value) in updates {
            state.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), AttractorError> {
        let mut state = self.write_lock()?;
        state.values.remove(key);
        state.order.retain(|existing| existing != key);
        Ok(())
    }

    /// Drop every value, keeping the store handle itself alive.
    pub fn clear(&self) -> Result<(), AttractorError> {
        let mut state = self.write_lock()?;
        state.values.clear();
        state.order.clear();
        state.logs.clear();
        Ok(())
    }

    pub fn append_log(&self, entry: impl Into<String>) -> Result<(), AttractorError> {
        let mut state = self.write_lock()?;
        state.logs.push(entry.into());
        Ok(())
    }

    pub fn logs(&self) -> Result<Vec<String>, AttractorError> {
        let state = self.read_lock()?;
        Ok(state.logs.clone())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot, AttractorError> {
        let state = self.read_lock()?;
        Ok(ContextSnapshot {
            values: state.values.clone(),
            order: state.order.clone(),
            logs: state.logs.clone(),
        })
    }

    /// Deep copy for branch isolation: the clone shares no backing storage
    /// with the parent.
    pub fn clone_isolated(&self) -> Result<Self, AttractorError> {
        let state = self.read_lock()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(state.clone())),
        })
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, ContextState>, AttractorError> {
        self.inner
            .read()
            .map_err(|_| AttractorError::Runtime("context read lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, ContextState>, AttractorError> {
        self.inner
            .write()
            .map_err(|_| AttractorError::Runtime("context write lock poisoned".to_string()))
    }
}

/// String form used by the condition evaluator and `get_string`:
/// strings verbatim, booleans as `true`/`false`, everything else via JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(inner) => inner.clone(),
        Value::Bool(inner) => inner.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
