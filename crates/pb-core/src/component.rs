//! Components and the local-component registry.
//!
//! A `Component` is built single-threaded at startup (`add_*` methods),
//! then frozen behind an `Arc` when registered.  The registry supports the
//! three lookup paths the discovery protocol needs: by parameter id, by
//! `(component, parameter)` name, and by `(component, type, index)` in
//! insertion order.

use crate::param::Parameter;
use pb_protocol::{stable_component_id, ComponentParamsResponse, ParamType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Allocator for process-unique parameter ids.
///
/// Owned by the registry rather than hidden in static state so tests can
/// construct independent id spaces.
#[derive(Debug)]
pub struct ParamIdAllocator {
    next: AtomicU32,
}

impl ParamIdAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ParamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A named container of parameters, indexed three ways.
pub struct Component {
    name: String,
    id: u32,
    ids: Arc<ParamIdAllocator>,
    params: Vec<Arc<Parameter>>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

impl Component {
    pub fn new(name: &str, ids: Arc<ParamIdAllocator>) -> Self {
        Self {
            name: name.to_owned(),
            id: stable_component_id(name),
            ids,
            params: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable wire id derived from the name.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn add_int(
        &mut self,
        name: &str,
        rows: u16,
        cols: u16,
        min: i64,
        max: i64,
        default: i64,
        read_only: bool,
    ) -> Arc<Parameter> {
        let id = self.ids.allocate();
        self.insert(Parameter::new_int(name, id, rows, cols, min, max, default, read_only))
    }

    pub fn add_float(
        &mut self,
        name: &str,
        rows: u16,
        cols: u16,
        min: f64,
        max: f64,
        default: f64,
        read_only: bool,
    ) -> Arc<Parameter> {
        let id = self.ids.allocate();
        self.insert(Parameter::new_float(name, id, rows, cols, min, max, default, read_only))
    }

    pub fn add_bool(&mut self, name: &str, rows: u16, cols: u16, default: bool, read_only: bool) -> Arc<Parameter> {
        let id = self.ids.allocate();
        self.insert(Parameter::new_bool(name, id, rows, cols, default, read_only))
    }

    pub fn add_str(&mut self, name: &str, rows: u16, cols: u16, default: &str, read_only: bool) -> Arc<Parameter> {
        let id = self.ids.allocate();
        self.insert(Parameter::new_str(name, id, rows, cols, default, read_only))
    }

    fn insert(&mut self, param: Parameter) -> Arc<Parameter> {
        let param = Arc::new(param);
        let idx = self.params.len();
        self.by_name.insert(param.name().to_owned(), idx);
        self.by_id.insert(param.param_id(), idx);
        self.params.push(param.clone());
        param
    }

    pub fn param(&self, name: &str) -> Option<Arc<Parameter>> {
        self.by_name.get(name).map(|&i| self.params[i].clone())
    }

    pub fn param_by_id(&self, param_id: u32) -> Option<Arc<Parameter>> {
        self.by_id.get(&param_id).map(|&i| self.params[i].clone())
    }

    /// The `idx`-th parameter of the given type, in insertion order.
    pub fn param_by_type_index(&self, param_type: ParamType, idx: usize) -> Option<Arc<Parameter>> {
        self.params
            .iter()
            .filter(|p| p.param_type() == param_type)
            .nth(idx)
            .cloned()
    }

    pub fn count_of_type(&self, param_type: ParamType) -> usize {
        self.params.iter().filter(|p| p.param_type() == param_type).count()
    }

    /// Parameters in insertion order.
    pub fn params(&self) -> &[Arc<Parameter>] {
        &self.params
    }

    /// Full metadata payload for `get_component_params`.
    pub fn describe(&self) -> ComponentParamsResponse {
        ComponentParamsResponse {
            component: self.name.clone(),
            component_id: self.id,
            params: self.params.iter().map(|p| p.describe()).collect(),
        }
    }
}

struct RegistryInner {
    list: Vec<Arc<Component>>,
    by_name: HashMap<String, usize>,
}

/// Registry of the local components of one hub process.
///
/// Owns the parameter-id allocator; registration happens at startup, after
/// which the registry is read-shared by every engine and server task.
pub struct Registry {
    ids: Arc<ParamIdAllocator>,
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            ids: Arc::new(ParamIdAllocator::new()),
            inner: RwLock::new(RegistryInner { list: Vec::new(), by_name: HashMap::new() }),
        }
    }

    pub fn allocator(&self) -> Arc<ParamIdAllocator> {
        self.ids.clone()
    }

    pub fn register(&self, component: Component) -> Arc<Component> {
        let component = Arc::new(component);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let idx = inner.list.len();
        inner.by_name.insert(component.name().to_owned(), idx);
        inner.list.push(component.clone());
        component
    }

    pub fn component(&self, name: &str) -> Option<Arc<Component>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.get(name).map(|&i| inner.list[i].clone())
    }

    pub fn component_by_id(&self, id: u32) -> Option<Arc<Component>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.list.iter().find(|c| c.id() == id).cloned()
    }

    /// Components in registration order.
    pub fn components(&self) -> Vec<Arc<Component>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .clone()
    }

    /// O(components) scan by parameter id; id uniqueness makes the first
    /// hit the only hit.
    pub fn find_by_id(&self, param_id: u32) -> Option<(Arc<Component>, Arc<Parameter>)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for component in &inner.list {
            if let Some(param) = component.param_by_id(param_id) {
                return Some((component.clone(), param));
            }
        }
        None
    }

    pub fn find_by_name(&self, component: &str, param: &str) -> Option<(Arc<Component>, Arc<Parameter>)> {
        let comp = self.component(component)?;
        let param = comp.param(param)?;
        Some((comp, param))
    }

    /// Legacy discovery path: the `idx`-th parameter of `type_str` within a
    /// component.  `"str"` and `"string"` are equivalent type strings.
    pub fn find_by_type_index(
        &self,
        component: &str,
        type_str: &str,
        idx: usize,
    ) -> Option<(Arc<Component>, Arc<Parameter>)> {
        let comp = self.component(component)?;
        let param_type = ParamType::parse(type_str)?;
        let param = comp.param_by_type_index(param_type, idx)?;
        Some((comp, param))
    }

    /// Every `(component, parameter)` pair, in deterministic registration
    /// and insertion order.
    pub fn all_params(&self) -> Vec<(Arc<Component>, Arc<Parameter>)> {
        let mut out = Vec::new();
        for component in self.components() {
            for param in component.params() {
                out.push((component.clone(), param.clone()));
            }
        }
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> (Registry, Arc<Component>, Arc<Component>) {
        let registry = Registry::new();

        let mut relays = Component::new("Relays", registry.allocator());
        relays.add_int("state", 1, 4, 0, 1, 0, false);
        relays.add_str("labels", 1, 4, "", false);
        relays.add_int("toggle_count", 1, 1, 0, 999_999, 0, true);
        let relays = registry.register(relays);

        let mut sensors = Component::new("Sensors", registry.allocator());
        sensors.add_float("lux", 1, 1, 0.0, 10_000.0, 0.0, true);
        sensors.add_bool("motion", 1, 1, false, true);
        let sensors = registry.register(sensors);

        (registry, relays, sensors)
    }

    #[test]
    fn param_ids_are_unique_across_components() {
        let (registry, _, _) = sample_registry();
        let mut seen = std::collections::HashSet::new();
        for (_, param) in registry.all_params() {
            assert!(seen.insert(param.param_id()), "duplicate id {}", param.param_id());
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn lookup_by_id_and_by_name_agree() {
        let (registry, relays, _) = sample_registry();
        let by_name = registry.find_by_name("Relays", "state").unwrap();
        let by_id = registry.find_by_id(by_name.1.param_id()).unwrap();
        assert_eq!(by_id.0.name(), relays.name());
        assert_eq!(by_id.1.name(), "state");
    }

    #[test]
    fn type_index_lookup_follows_insertion_order() {
        let (registry, _, _) = sample_registry();
        // Relays has two int parameters: state (0), toggle_count (1).
        let (_, first) = registry.find_by_type_index("Relays", "int", 0).unwrap();
        assert_eq!(first.name(), "state");
        let (_, second) = registry.find_by_type_index("Relays", "int", 1).unwrap();
        assert_eq!(second.name(), "toggle_count");
        assert!(registry.find_by_type_index("Relays", "int", 2).is_none());
    }

    #[test]
    fn string_type_aliases_are_equivalent() {
        let (registry, _, _) = sample_registry();
        let a = registry.find_by_type_index("Relays", "str", 0).unwrap();
        let b = registry.find_by_type_index("Relays", "string", 0).unwrap();
        assert_eq!(a.1.param_id(), b.1.param_id());
        assert_eq!(a.1.name(), "labels");
    }

    #[test]
    fn component_ids_are_stable_and_describe_matches() {
        let (registry, relays, _) = sample_registry();
        let again = registry.component_by_id(relays.id()).unwrap();
        assert_eq!(again.name(), "Relays");

        let described = relays.describe();
        assert_eq!(described.component, "Relays");
        assert_eq!(described.component_id, relays.id());
        assert_eq!(described.params.len(), 3);
        assert_eq!(described.params[0].name, "state");
    }

    #[test]
    fn unknown_lookups_return_none() {
        let (registry, _, _) = sample_registry();
        assert!(registry.find_by_name("Relays", "nope").is_none());
        assert!(registry.find_by_name("Nope", "state").is_none());
        assert!(registry.find_by_type_index("Relays", "quaternion", 0).is_none());
        assert!(registry.find_by_id(9999).is_none());
    }
}
