//! Codec error types

/// Error raised while dehydrating a value at a boundary
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// Value has no registered reducer
    #[error(
        "cannot serialize value of kind `{kind}`; supported built-ins are null, bool, int, \
         float, bigint, string, bytes and typed arrays, date, url, url search params, regex, \
         error, list, object, map, set, headers, request, response, streams, step references, \
         and classes registered with the class registry"
    )]
    Unsupported { kind: String },

    /// Class instance whose class is not in the registry
    #[error("class `{class_id}` is not registered for serialization")]
    UnknownClass { class_id: String },

    /// A stream's contents could not be drained into the stream store
    #[error("stream `{name}` could not be drained: {reason}")]
    StreamDrain { name: String, reason: String },

    /// A stream value was produced in a context without a stream environment
    #[error("no stream environment available to dehydrate stream values")]
    NoStreamEnvironment,

    /// Envelope encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The node payload itself could not be written
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Error raised while hydrating a payload at a boundary
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    /// Format tag in the envelope is not one this reader understands
    #[error("unknown format tag `{tag}`")]
    UnknownFormatTag { tag: String },

    /// Payload bytes do not parse as any known shape
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A tagged node carries a type tag with no registered reviver
    #[error("unknown type tag `{0}`")]
    UnknownTypeTag(String),

    /// A node references an index outside the node table
    #[error("node index {0} out of range")]
    BadNodeIndex(usize),

    /// A registered class rejected its encoded data
    #[error("class `{class_id}` failed to decode: {reason}")]
    ClassDecode { class_id: String, reason: String },

    /// Envelope decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl DeserializationError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
