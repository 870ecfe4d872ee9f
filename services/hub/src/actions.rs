//! Timed-action payloads: parsing, validation, and execution.
//!
//! Actions arrive as JSON batches (`{"actions": [...]}`) written into the
//! scheduler's `action_to_send` cell or stored in watcher slot cells.  The
//! raw shape is validated on parse into a target key, so malformed actions
//! become decode errors instead of silent no-ops at execution time.

use crate::state::{DeviceTable, Nicknames};
use pb_core::Registry;
use pb_protocol::ParamValue;
use serde::Deserialize;
use tracing::{debug, warn};

/// How an action addresses its target parameter.  `param_id` wins when both
/// forms are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKey {
    ById(u32),
    ByName { component: String, param: String },
}

/// A validated action, ready to queue or execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// `"self"`, a nickname, or an IP endpoint.
    pub device: String,
    pub key: ActionKey,
    pub row: u16,
    pub col: u16,
    pub value: ParamValue,
    /// Delay until the *next* action in the batch, not before this one.
    pub wait_after_ms: u64,
}

impl Action {
    pub fn is_local(&self) -> bool {
        self.device.eq_ignore_ascii_case("self")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid action JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no actions in batch")]
    EmptyBatch,
    #[error("action {index} has neither param_id nor component+param")]
    MissingKey { index: usize },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default)]
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(default = "default_device")]
    device: String,
    #[serde(default)]
    param_id: Option<u32>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    param: Option<String>,
    #[serde(default)]
    row: u16,
    #[serde(default)]
    col: u16,
    value: ParamValue,
    #[serde(default)]
    wait_after_ms: u64,
}

fn default_device() -> String {
    "self".to_owned()
}

/// Parse and validate an `{"actions": [...]}` batch.
pub fn parse_batch(text: &str) -> Result<Vec<Action>, ActionError> {
    let raw: RawBatch = serde_json::from_str(text)?;
    if raw.actions.is_empty() {
        return Err(ActionError::EmptyBatch);
    }

    let mut actions = Vec::with_capacity(raw.actions.len());
    for (index, raw) in raw.actions.into_iter().enumerate() {
        let key = match (raw.param_id, raw.component, raw.param) {
            (Some(id), _, _) => ActionKey::ById(id),
            (None, Some(component), Some(param)) => ActionKey::ByName { component, param },
            _ => return Err(ActionError::MissingKey { index }),
        };
        actions.push(Action {
            device: raw.device,
            key,
            row: raw.row,
            col: raw.col,
            value: raw.value,
            wait_after_ms: raw.wait_after_ms,
        });
    }
    Ok(actions)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Apply one action to its target.
///
/// Never fails: unresolvable targets, read-only parameters, and offline
/// devices are logged and dropped.  Remote sends go through the device
/// outbox and do not suspend.
pub fn execute(action: &Action, registry: &Registry, devices: &DeviceTable, nicknames: &Nicknames) {
    if action.is_local() {
        execute_local(action, registry);
    } else {
        execute_remote(action, devices, nicknames);
    }
}

fn execute_local(action: &Action, registry: &Registry) {
    let found = match &action.key {
        ActionKey::ById(id) => registry.find_by_id(*id),
        ActionKey::ByName { component, param } => registry.find_by_name(component, param),
    };
    let Some((component, param)) = found else {
        warn!(?action.key, "local parameter not found, dropping action");
        return;
    };
    if param.read_only() {
        warn!(
            component = component.name(),
            param = param.name(),
            "cannot set read-only parameter, dropping action"
        );
        return;
    }
    match param.set(action.row, action.col, action.value.clone(), true) {
        Ok(stored) => debug!(
            component = component.name(),
            param = param.name(),
            row = action.row,
            col = action.col,
            value = %stored,
            "local action applied"
        ),
        Err(e) => warn!(
            component = component.name(),
            param = param.name(),
            error = %e,
            "local action rejected"
        ),
    }
}

fn execute_remote(action: &Action, devices: &DeviceTable, nicknames: &Nicknames) {
    let endpoint = nicknames.resolve(&action.device);
    let Some(device) = devices.get(&endpoint) else {
        warn!(device = %endpoint, "unknown device, dropping action");
        return;
    };

    let param_id = match &action.key {
        ActionKey::ById(id) => Some(*id),
        ActionKey::ByName { component, param } => device.param_id_by_name(component, param),
    };
    let Some(param_id) = param_id else {
        warn!(device = %endpoint, ?action.key, "cannot resolve remote param_id, dropping action");
        return;
    };

    if let Err(e) = device.send_set(param_id, action.row, action.col, &action.value) {
        warn!(device = %endpoint, param_id, error = %e, "dropping remote write");
    }
}
