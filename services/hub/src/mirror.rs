//! Flat per-device cache of remote parameter values.
//!
//! The watcher resolves variables by string key without walking the shadow
//! component tree; every push update lands here under both key forms:
//! `"<comp>.<param>[r,c]"` and `"param_<id>[r,c]"`.
//!
//! The mirror survives a disconnect (readers keep the last known values)
//! and is wiped at the start of the next discovery, which rebuilds it from
//! scratch.

use pb_protocol::ParamValue;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct Mirror {
    map: RwLock<HashMap<String, ParamValue>>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named_key(component: &str, param: &str, row: u16, col: u16) -> String {
        format!("{component}.{param}[{row},{col}]")
    }

    pub fn id_key(param_id: u32, row: u16, col: u16) -> String {
        format!("param_{param_id}[{row},{col}]")
    }

    /// Store a cell value under both key forms.  Returns the previous value
    /// of the cell, if any.
    pub fn apply(
        &self,
        component: &str,
        param: &str,
        param_id: u32,
        row: u16,
        col: u16,
        value: ParamValue,
    ) -> Option<ParamValue> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(Self::id_key(param_id, row, col), value.clone());
        map.insert(Self::named_key(component, param, row, col), value)
    }

    pub fn get(&self, key: &str) -> Option<ParamValue> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn clear(&self) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of entries (two per cell).
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
