// pb-protocol: Parameter-bus wire protocol types and serialization.
//
// All WebSocket messages are JSON, one per text frame, with a top-level
// `type` field for discriminated deserialization.  The same message set is
// spoken in both directions: the hub consumes it as a client against remote
// devices and serves it for its own local components.
//
// Request/response correlation uses an optional integer `id` echoed back on
// the response.  Responses themselves are untagged objects whose shape is
// implied by the request type; the only tagged server-initiated frame is
// `param_update`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Parameter types and values
// ---------------------------------------------------------------------------

/// The four parameter types of the bus.
///
/// The normalized wire set is `{int, float, bool, str}`; `string` is
/// accepted as an alias for `str` when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "str", alias = "string")]
    Str,
}

impl ParamType {
    /// Parse a type string, case-insensitively, normalizing the `string`
    /// alias.  Returns `None` for unknown names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            "str" | "string" => Some(Self::Str),
            _ => None,
        }
    }

    /// The normalized wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "str",
        }
    }

    /// Discovery iterates types in this fixed order.
    pub const DISCOVERY_ORDER: [ParamType; 4] =
        [Self::Int, Self::Float, Self::Bool, Self::Str];
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cell value as it appears on the wire: a bare JSON scalar.
///
/// Untagged; variant order matters for deserialization (`true` must not be
/// read as a number, integers must not collapse to floats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.  Bools count as 0/1;
    /// numeric-looking strings parse.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter metadata
// ---------------------------------------------------------------------------

/// Parameter metadata blob, as returned by `get_param_info` and inside
/// `get_component_params`.
///
/// `param_type` is optional on the parse side because some device firmwares
/// omit `type` from `get_param_info` responses (the requester already knows
/// which type it asked for); the hub's own server always emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub param_id: u32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ParamType>,
    pub rows: u16,
    pub cols: u16,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
    /// Numeric bounds; present only for int/float parameters.  Kept as wire
    /// values so int parameters round-trip integer bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ParamValue>,
}

/// One entry in a `get_components` response.
///
/// Devices may also send bare name strings; see [`ComponentEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedComponent {
    pub name: String,
    pub id: u32,
}

/// A component-list entry as devices actually send it: either a full
/// `{name, id}` object or a bare string name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentEntry {
    Named(NamedComponent),
    Bare(String),
}

impl ComponentEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(n) => &n.name,
            Self::Bare(s) => s,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// All request kinds, discriminated by the `type` field.
///
/// `SET` is a legacy alias for `set_param`, used by action executors for
/// fire-and-forget writes (no `id`, no response expected by the sender).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "get_components")]
    GetComponents {},
    #[serde(rename = "get_component_params")]
    GetComponentParams {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comp_id: Option<u32>,
    },
    #[serde(rename = "get_param_info")]
    GetParamInfo {
        comp: String,
        param_type: String,
        /// `-1` asks for the count of parameters of that type.
        #[serde(default = "count_sentinel")]
        idx: i64,
    },
    #[serde(rename = "get_param")]
    GetParam {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idx: Option<usize>,
        #[serde(default)]
        row: u16,
        #[serde(default)]
        col: u16,
    },
    #[serde(rename = "set_param", alias = "SET")]
    SetParam {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        param_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idx: Option<usize>,
        #[serde(default)]
        row: u16,
        #[serde(default)]
        col: u16,
        /// Absent or `null` both decode to `None`; string parameters coerce
        /// that to `""`.
        #[serde(default)]
        value: Option<ParamValue>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        param_id: u32,
        #[serde(default)]
        row: u16,
        #[serde(default)]
        col: u16,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        param_id: u32,
        #[serde(default)]
        row: u16,
        #[serde(default)]
        col: u16,
    },
}

fn count_sentinel() -> i64 {
    -1
}

/// An inbound frame: optional correlation `id` plus the request body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Incoming {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(flatten)]
    pub request: Request,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// `get_components` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentsResponse {
    pub components: Vec<ComponentEntry>,
}

/// `get_component_params` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentParamsResponse {
    pub component: String,
    pub component_id: u32,
    pub params: Vec<ParamInfo>,
}

/// `get_param_info` response when `idx == -1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

/// `get_param` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueResponse {
    pub name: String,
    pub id: u32,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub value: ParamValue,
}

/// `subscribe` response carrying the current cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub value: ParamValue,
}

/// `set_param` / `unsubscribe` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetResponse {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()) }
    }
}

/// Generic `{error}` response for lookup misses and malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

// ---------------------------------------------------------------------------
// Push frames
// ---------------------------------------------------------------------------

/// Server-initiated push: one cell of a subscribed parameter changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "param_update")]
pub struct ParamUpdate {
    pub param_id: u32,
    pub row: u16,
    pub col: u16,
    pub value: ParamValue,
}

// ---------------------------------------------------------------------------
// Component ids
// ---------------------------------------------------------------------------

/// Stable 32-bit component id derived from the component name.
///
/// FNV-1a over the UTF-8 bytes, truncated to 32 bits.  Stable across
/// processes so dashboards can cache ids between hub restarts.
pub fn stable_component_id(name: &str) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in name.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    (hash & 0xFFFF_FFFF) as u32
}
