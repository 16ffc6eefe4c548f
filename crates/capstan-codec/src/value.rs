//! Dynamic value model for values crossing engine boundaries
//!
//! `CodecValue` is the in-memory form of anything a workflow argument,
//! step argument, or return value can contain. It is an owned tree:
//! cycles are only expressible through the class-instance path and are
//! not traversed by the codec.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Structured error blob carried by failed runs and steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorValue {}

/// Which typed-array family a byte buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedArrayKind {
    U8,
    U8Clamped,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    U64,
    I64,
    ArrayBuffer,
    DataView,
}

impl TypedArrayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U8Clamped => "u8_clamped",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::ArrayBuffer => "array_buffer",
            Self::DataView => "data_view",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "u8" => Self::U8,
            "u8_clamped" => Self::U8Clamped,
            "i8" => Self::I8,
            "u16" => Self::U16,
            "i16" => Self::I16,
            "u32" => Self::U32,
            "i32" => Self::I32,
            "f32" => Self::F32,
            "f64" => Self::F64,
            "u64" => Self::U64,
            "i64" => Self::I64,
            "array_buffer" => Self::ArrayBuffer,
            "data_view" => Self::DataView,
            _ => return None,
        })
    }
}

/// Byte buffer plus the typed-array family it round-trips as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesValue {
    pub kind: TypedArrayKind,
    pub data: Vec<u8>,
}

impl BytesValue {
    pub fn plain(data: Vec<u8>) -> Self {
        Self {
            kind: TypedArrayKind::U8,
            data,
        }
    }
}

/// Date including the invalid-date sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateValue {
    Valid(DateTime<Utc>),
    Invalid,
}

/// Arbitrary-precision integer carried as a signed decimal string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigIntValue(pub String);

impl BigIntValue {
    pub fn from_i128(v: i128) -> Self {
        Self(v.to_string())
    }
}

/// Serialized HTTP request crossing a boundary
#[derive(Debug, Clone, PartialEq)]
pub struct RequestValue {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<CodecValue>,
}

/// Serialized HTTP response crossing a boundary
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseValue {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<CodecValue>,
}

/// Readable or writable side of a named byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Readable,
    Writable,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Readable => "readable",
            Self::Writable => "writable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "readable" => Some(Self::Readable),
            "writable" => Some(Self::Writable),
            _ => None,
        }
    }
}

pub(crate) enum StreamSource {
    /// Hydrated inside the deterministic sandbox; must not be read there
    Placeholder,
    /// Local contents to be pumped into the stream store on dehydration
    Channel(Option<mpsc::Receiver<Vec<u8>>>),
    /// Hydrated in a step or caller context; reads pipe from the store
    Store,
}

pub(crate) struct StreamState {
    pub name: Option<String>,
    pub source: StreamSource,
}

/// A stream reference: a name in the stream store plus a direction.
///
/// Streams serialize to `{name, kind}`. A stream without a name is
/// assigned a `strm_<ULID>` name the first time it is dehydrated.
#[derive(Clone)]
pub struct StreamValue {
    pub kind: StreamKind,
    pub(crate) state: Arc<Mutex<StreamState>>,
}

impl StreamValue {
    /// A named reference to a stream that already lives in the store
    pub fn named(name: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(StreamState {
                name: Some(name.into()),
                source: StreamSource::Store,
            })),
        }
    }

    /// An opaque placeholder produced by workflow-context hydration
    pub fn placeholder(name: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(StreamState {
                name: Some(name.into()),
                source: StreamSource::Placeholder,
            })),
        }
    }

    /// A readable stream over local contents; the receiver is drained
    /// into the stream store when the value is dehydrated.
    pub fn from_channel(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Readable,
            state: Arc::new(Mutex::new(StreamState {
                name: None,
                source: StreamSource::Channel(Some(rx)),
            })),
        }
    }

    /// Convenience: a readable stream over fixed chunks
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity covers every chunk, so try_send cannot fail here.
            let _ = tx.try_send(chunk);
        }
        drop(tx);
        Self::from_channel(rx)
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    /// True when this value is a sandbox placeholder that must not be read
    pub fn is_placeholder(&self) -> bool {
        matches!(self.state.lock().source, StreamSource::Placeholder)
    }

    pub(crate) fn assign_name(&self, name: String) -> String {
        let mut state = self.state.lock();
        match &state.name {
            Some(existing) => existing.clone(),
            None => {
                state.name = Some(name.clone());
                name
            }
        }
    }

    pub(crate) fn take_channel(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        match &mut self.state.lock().source {
            StreamSource::Channel(rx) => rx.take(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamValue")
            .field("kind", &self.kind)
            .field("name", &self.name())
            .finish()
    }
}

impl PartialEq for StreamValue {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name() == other.name()
    }
}

/// Reference to a registered step function: `{step_id, closure_vars?}`
#[derive(Debug, Clone, PartialEq)]
pub struct StepRefValue {
    /// Symbolic step identifier (`step//<module>//<function>`)
    pub step_id: String,

    /// Captured variables travelling with the reference
    pub closure_vars: Option<Box<CodecValue>>,
}

impl StepRefValue {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            closure_vars: None,
        }
    }

    pub fn with_closure(mut self, vars: CodecValue) -> Self {
        self.closure_vars = Some(Box::new(vars));
        self
    }
}

/// Live instance of a registered serialization class
#[derive(Clone)]
pub struct ClassInstance {
    pub class_id: String,
    pub value: Arc<dyn Any + Send + Sync>,
}

impl ClassInstance {
    pub fn downcast<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        self.value.clone().downcast::<C>().ok()
    }
}

impl std::fmt::Debug for ClassInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInstance")
            .field("class_id", &self.class_id)
            .finish()
    }
}

impl PartialEq for ClassInstance {
    fn eq(&self, other: &Self) -> bool {
        self.class_id == other.class_id && Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Opaque instance of a class the receiving side does not know.
///
/// Observability tooling renders these; the encoded data is preserved so
/// nothing is silently lost.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInstanceRef {
    pub class_id: String,
    pub data: Box<CodecValue>,
}

/// A value crossing an engine boundary
#[derive(Debug, Clone, PartialEq)]
pub enum CodecValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(BigIntValue),
    String(String),
    Bytes(BytesValue),
    Date(DateValue),
    Url(String),
    UrlSearch(Vec<(String, String)>),
    Regex { source: String, flags: String },
    Error(ErrorValue),
    List(Vec<CodecValue>),
    /// Insertion-ordered string-keyed object
    Object(Vec<(String, CodecValue)>),
    Map(Vec<(CodecValue, CodecValue)>),
    Set(Vec<CodecValue>),
    /// Multi-valued header list
    Headers(Vec<(String, String)>),
    Request(Box<RequestValue>),
    Response(Box<ResponseValue>),
    Stream(StreamValue),
    StepRef(StepRefValue),
    Instance(ClassInstance),
    Opaque(ClassInstanceRef),
}

impl CodecValue {
    /// Short kind name for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::Url(_) => "url",
            Self::UrlSearch(_) => "url_search",
            Self::Regex { .. } => "regex",
            Self::Error(_) => "error",
            Self::List(_) => "list",
            Self::Object(_) => "object",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Headers(_) => "headers",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Stream(_) => "stream",
            Self::StepRef(_) => "step_ref",
            Self::Instance(_) => "class_instance",
            Self::Opaque(_) => "class_instance_ref",
        }
    }

    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, CodecValue)>,
    {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Look a key up in an `Object` value
    pub fn get(&self, key: &str) -> Option<&CodecValue> {
        match self {
            Self::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert a plain JSON value; fails only on non-finite numbers,
    /// which JSON cannot carry anyway.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Project into plain JSON where possible; rich types fall back to
    /// descriptive objects (used by observability surfaces).
    pub fn to_json_lossy(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => json!(b),
            Self::Int(i) => json!(i),
            Self::Float(f) if f.is_finite() => json!(f),
            Self::Float(_) => serde_json::Value::Null,
            Self::BigInt(b) => json!({ "$bigint": b.0 }),
            Self::String(s) => json!(s),
            Self::Bytes(b) => json!({ "$bytes": b.data.len(), "kind": b.kind.as_str() }),
            Self::Date(DateValue::Valid(d)) => json!(d.to_rfc3339()),
            Self::Date(DateValue::Invalid) => json!({ "$date": "invalid" }),
            Self::Url(u) => json!(u),
            Self::UrlSearch(pairs) | Self::Headers(pairs) => json!(pairs),
            Self::Regex { source, flags } => json!({ "$regex": source, "flags": flags }),
            Self::Error(e) => json!({ "$error": e.message, "code": e.code }),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json_lossy()).collect())
            }
            Self::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect(),
            ),
            Self::Map(entries) => json!({
                "$map": entries
                    .iter()
                    .map(|(k, v)| vec![k.to_json_lossy(), v.to_json_lossy()])
                    .collect::<Vec<_>>()
            }),
            Self::Set(items) => json!({
                "$set": items.iter().map(|v| v.to_json_lossy()).collect::<Vec<_>>()
            }),
            Self::Request(r) => json!({ "$request": r.url, "method": r.method }),
            Self::Response(r) => json!({ "$response": r.status }),
            Self::Stream(s) => json!({ "$stream": s.name(), "kind": s.kind.as_str() }),
            Self::StepRef(s) => json!({ "$step": s.step_id }),
            Self::Instance(i) => json!({ "$class": i.class_id }),
            Self::Opaque(o) => json!({ "$class": o.class_id, "data": o.data.to_json_lossy() }),
        }
    }
}

impl From<i64> for CodecValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for CodecValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for CodecValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for CodecValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for CodecValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
