//! In-memory key space: a base snapshot plus a chain of sealed layers.
//!
//! Resolution order for a key is newest layer first, then the base. A layer
//! entry of `None` is a tombstone and shadows everything older. Layers are
//! never mutated once pushed; the chain itself is published as an immutable
//! [`ChainSnapshot`] behind an `Arc`, so readers clone a pointer and walk it
//! without holding any lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use rayon::prelude::*;

/// Fully compacted key space, as persisted in `slots.json`.
pub type Base = BTreeMap<String, String>;

/// A set of writes and tombstones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layer {
    entries: AHashMap<String, Option<String>>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.entries.insert(key.into(), None);
    }

    /// Returns:
    /// - `None` if the layer has no entry for `key`
    /// - `Some(None)` if the layer holds a tombstone
    /// - `Some(Some(value))` if the layer holds a value
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries.get(key).map(Option::as_deref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Copies every entry of `other` over this layer, tombstones included.
    pub fn merge_from(&mut self, other: &Layer) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Applies this layer on top of `base`: values overwrite, tombstones delete.
    pub fn apply_to(&self, base: &mut Base) {
        self.apply_filtered_to(base, |_| true);
    }

    pub fn apply_filtered_to(&self, base: &mut Base, keep: impl Fn(&str) -> bool) {
        for (key, value) in &self.entries {
            if !keep(key) {
                continue;
            }
            match value {
                Some(value) => {
                    base.insert(key.clone(), value.clone());
                }
                None => {
                    base.remove(key);
                }
            }
        }
    }
}

/// Immutable view of the base and every sealed layer (oldest first).
#[derive(Debug, Default)]
pub struct ChainSnapshot {
    base: Arc<Base>,
    layers: Vec<Arc<Layer>>,
}

impl ChainSnapshot {
    pub fn base(&self) -> &Base {
        &self.base
    }

    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    /// Same contract as [`Layer::get`], searched newest layer first and then
    /// the base.
    pub fn lookup(&self, key: &str) -> Option<Option<&str>> {
        for layer in self.layers.iter().rev() {
            if let Some(hit) = layer.get(key) {
                return Some(hit);
            }
        }
        self.base.get(key).map(|v| Some(v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lookup(key).flatten().map(str::to_string)
    }

    /// Flattens the chain into a new base.
    pub fn fold(&self) -> Base {
        let mut out = Base::clone(&self.base);
        for layer in &self.layers {
            layer.apply_to(&mut out);
        }
        out
    }

    /// Flattens only the keys accepted by `keep`.
    pub fn fold_filtered<F>(&self, keep: F) -> Base
    where
        F: Fn(&str) -> bool + Sync,
    {
        let mut out: Base = self
            .base
            .par_iter()
            .filter(|(key, _)| keep(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for layer in &self.layers {
            layer.apply_filtered_to(&mut out, &keep);
        }
        out
    }
}

#[derive(Debug)]
pub(crate) struct LayerChain {
    current: RwLock<Arc<ChainSnapshot>>,
}

impl LayerChain {
    pub fn new(base: Base) -> Self {
        Self {
            current: RwLock::new(Arc::new(ChainSnapshot {
                base: Arc::new(base),
                layers: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.current.read().clone()
    }

    pub fn layer_count(&self) -> usize {
        self.current.read().layers.len()
    }

    /// Appends a sealed layer. Empty layers are not pushed.
    pub fn push(&self, layer: Layer) -> bool {
        if layer.is_empty() {
            return false;
        }
        let mut guard = self.current.write();
        let mut layers = guard.layers.clone();
        layers.push(Arc::new(layer));
        *guard = Arc::new(ChainSnapshot {
            base: guard.base.clone(),
            layers,
        });
        true
    }

    /// Replaces the base with `base`, dropping the `folded` oldest layers it
    /// already contains. Layers pushed after the fold was computed are kept.
    pub fn install_base(&self, base: Base, folded: usize) {
        let mut guard = self.current.write();
        let keep = guard.layers.iter().skip(folded).cloned().collect();
        *guard = Arc::new(ChainSnapshot {
            base: Arc::new(base),
            layers: keep,
        });
    }
}
