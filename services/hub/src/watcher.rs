//! Expression watcher: re-evaluates boolean expressions against mirrored
//! state at a fixed tick and fires edge-triggered action batches.
//!
//! Each tick refreshes variable bindings first (local parameters read
//! directly, remote ones through the device mirror), then evaluates the 50
//! watch slots.  A slot fires its rising actions on a false→true
//! transition and its falling actions on true→false; the first evaluation
//! of a slot fires neither.  Slot errors are logged at debug level and
//! leave the previous result untouched.

use crate::actions;
use crate::expr::{self, Value};
use crate::scheduler::Scheduler;
use crate::state::{DeviceTable, Nicknames};
use crate::mirror::Mirror;
use pb_core::{Component, Parameter, Registry};
use pb_protocol::ParamValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

pub const NUM_SLOTS: u16 = 50;
const EVAL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a watch variable reads from.
#[derive(Debug, Clone, Deserialize)]
pub struct VarBinding {
    #[serde(default = "default_device")]
    pub device: String,
    pub component: String,
    pub param: String,
    #[serde(default)]
    pub row: u16,
    #[serde(default)]
    pub col: u16,
}

fn default_device() -> String {
    "self".to_owned()
}

/// The watcher component and its evaluation state.
pub struct Watcher {
    registry: Arc<Registry>,
    devices: Arc<DeviceTable>,
    nicknames: Nicknames,
    scheduler: Weak<Scheduler>,
    expressions: Arc<Parameter>,
    rising_actions: Arc<Parameter>,
    falling_actions: Arc<Parameter>,
    enabled: Arc<Parameter>,
    eval_count: Arc<Parameter>,
    var_defs: Mutex<HashMap<String, VarBinding>>,
    var_values: Mutex<HashMap<String, Value>>,
    prev_results: Mutex<Vec<Option<bool>>>,
}

impl Watcher {
    pub const COMPONENT: &'static str = "Watcher";

    pub fn new(
        registry: Arc<Registry>,
        devices: Arc<DeviceTable>,
        nicknames: Nicknames,
        scheduler: &Arc<Scheduler>,
    ) -> Arc<Self> {
        let mut comp = Component::new(Self::COMPONENT, registry.allocator());
        let variables = comp.add_str("variables", 1, 1, "{}", false);
        let expressions = comp.add_str("expressions", NUM_SLOTS, 1, "", false);
        let rising_actions = comp.add_str("rising_actions", NUM_SLOTS, 1, "", false);
        let falling_actions = comp.add_str("falling_actions", NUM_SLOTS, 1, "", false);
        let enabled = comp.add_bool("enabled", 1, 1, true, false);
        let eval_count = comp.add_int("eval_count", 1, 1, 0, 999_999_999, 0, true);
        registry.register(comp);

        let watcher = Arc::new(Self {
            registry,
            devices,
            nicknames,
            scheduler: Arc::downgrade(scheduler),
            expressions,
            rising_actions,
            falling_actions,
            enabled,
            eval_count,
            var_defs: Mutex::new(HashMap::new()),
            var_values: Mutex::new(HashMap::new()),
            prev_results: Mutex::new(vec![None; usize::from(NUM_SLOTS)]),
        });

        // Reparse bindings whenever the variables cell changes.
        let weak = Arc::downgrade(&watcher);
        variables.subscribe(Arc::new(move |_param, _row, _col, new, _old| {
            let Some(watcher) = weak.upgrade() else { return };
            let ParamValue::Str(text) = new else { return };
            watcher.parse_variables(text);
        }));

        watcher
    }

    /// Evaluation loop; runs on its own task until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("watcher evaluation started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = sleep(EVAL_INTERVAL) => {
                    if self.enabled.get(0, 0).ok() == Some(ParamValue::Bool(true)) {
                        self.tick();
                    }
                }
            }
        }
        info!("watcher evaluation stopped");
    }

    /// One evaluation pass: refresh variables, evaluate slots, fire edges.
    pub fn tick(&self) {
        self.refresh_variables();

        let values = self
            .var_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let lookup = |name: &str| values.get(name).cloned();

        for slot in 0..NUM_SLOTS {
            let Ok(ParamValue::Str(text)) = self.expressions.get(slot, 0) else { continue };
            if text.is_empty() {
                continue;
            }

            match expr::evaluate(&text, &lookup) {
                Ok(result) => {
                    let prev = {
                        let mut prev_results =
                            self.prev_results.lock().unwrap_or_else(PoisonError::into_inner);
                        std::mem::replace(&mut prev_results[usize::from(slot)], Some(result))
                    };
                    match prev {
                        Some(false) if result => self.fire(slot, true),
                        Some(true) if !result => self.fire(slot, false),
                        _ => {}
                    }
                }
                // A bad expression neither fires nor clears its last result.
                Err(e) => debug!(slot, error = %e, "expression evaluation failed"),
            }
        }

        if let Ok(ParamValue::Int(count)) = self.eval_count.get(0, 0) {
            let _ = self
                .eval_count
                .set(0, 0, ParamValue::Int(count.saturating_add(1)), false);
        }
    }

    /// Reset a slot: expression, both action cells, and the edge state.
    pub fn clear_watch(&self, slot: u16) {
        if slot >= NUM_SLOTS {
            return;
        }
        let empty = ParamValue::Str(String::new());
        let _ = self.expressions.set(slot, 0, empty.clone(), true);
        let _ = self.rising_actions.set(slot, 0, empty.clone(), true);
        let _ = self.falling_actions.set(slot, 0, empty, true);
        self.prev_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[usize::from(slot)] = None;
    }

    /// Current cached value of a variable, if it has resolved at least once.
    pub fn variable_value(&self, name: &str) -> Option<Value> {
        self.var_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    // -- internal --

    fn parse_variables(&self, text: &str) {
        let source = if text.is_empty() { "{}" } else { text };
        let defs = match serde_json::from_str::<HashMap<String, VarBinding>>(source) {
            Ok(defs) => {
                debug!(variables = defs.len(), "watch variables updated");
                defs
            }
            Err(e) => {
                error!(error = %e, "failed to parse watch variables");
                HashMap::new()
            }
        };
        *self.var_defs.lock().unwrap_or_else(PoisonError::into_inner) = defs;
    }

    /// Resolve each binding; unresolved variables keep their prior cached
    /// value.
    fn refresh_variables(&self) {
        let defs = self
            .var_defs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (name, binding) in defs {
            let resolved = self.resolve_binding(&binding);
            if let Some(value) = resolved {
                self.var_values
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name, value);
            }
        }
    }

    fn resolve_binding(&self, binding: &VarBinding) -> Option<Value> {
        if binding.device.eq_ignore_ascii_case("self") {
            let (_, param) = self
                .registry
                .find_by_name(&binding.component, &binding.param)?;
            let value = param.get(binding.row, binding.col).ok()?;
            return Some(Value::from(&value));
        }

        let endpoint = self.nicknames.resolve(&binding.device);
        let device = self.devices.get(&endpoint)?;
        let key = Mirror::named_key(&binding.component, &binding.param, binding.row, binding.col);
        device.mirror.get(&key).map(|v| Value::from(&v))
    }

    fn fire(&self, slot: u16, rising: bool) {
        let cell = if rising { &self.rising_actions } else { &self.falling_actions };
        let Ok(ParamValue::Str(text)) = cell.get(slot, 0) else { return };
        if text.is_empty() {
            return;
        }

        let edge = if rising { "rising" } else { "falling" };
        let batch = match actions::parse_batch(&text) {
            Ok(batch) => batch,
            Err(e) => {
                error!(slot, edge, error = %e, "invalid action batch for watch slot");
                return;
            }
        };

        info!(slot, edge, count = batch.len(), "edge actions triggered");

        // Preferred path: hand the batch to the scheduler.  The inline
        // fallback only matters if the scheduler is gone mid-shutdown.
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.enqueue(batch);
        } else {
            let registry = self.registry.clone();
            let devices = self.devices.clone();
            let nicknames = self.nicknames.clone();
            tokio::spawn(async move {
                for action in batch {
                    actions::execute(&action, &registry, &devices, &nicknames);
                    if action.wait_after_ms > 0 {
                        sleep(Duration::from_millis(action.wait_after_ms)).await;
                    }
                }
            });
        }
    }
}
