use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::tensor::TensorValue;

/// Named store carrying intermediate values from one partial run to a later
/// one of the same step.
///
/// Clones share the same map. The caller owns its lifetime and must clear or
/// replace it before an unrelated step.
#[derive(Debug, Clone, Default)]
pub struct ValueCache {
    inner: Arc<Mutex<HashMap<String, Arc<TensorValue>>>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: Arc<TensorValue>) {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Arc<TensorValue>> {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<TensorValue>> {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("value cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("value cache mutex poisoned")
            .clear();
    }

    /// Cached names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .inner
            .lock()
            .expect("value cache mutex poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// True if both handles share the same map.
    pub fn ptr_eq(&self, other: &ValueCache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
