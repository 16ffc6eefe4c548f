//! # Cross-boundary serialization codec
//!
//! Values crossing the engine's boundaries (caller ↔ workflow ↔ step)
//! are encoded into a versioned binary envelope: a 4-byte ASCII format
//! tag (`devl`) followed by a topological node-array payload with typed
//! tags for dates, bigints, maps, sets, typed arrays, URLs, headers,
//! requests/responses, streams, step references, and registered class
//! instances.
//!
//! Four dehydrate/hydrate pairs exist, one per boundary. They differ
//! only by reviver set: payloads hydrated into the deterministic
//! sandbox revive streams as opaque placeholders; payloads hydrated in
//! a step or external caller revive live stream-store references.
//!
//! ```
//! use capstan_codec::{Boundary, BoundaryCodec, ClassRegistry, CodecValue};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let codec = BoundaryCodec::new(Arc::new(ClassRegistry::new()));
//! let value = CodecValue::object([("answer", CodecValue::Int(42))]);
//!
//! let bytes = codec
//!     .dehydrate(Boundary::StepArguments, &value, "wrun_example")
//!     .unwrap()
//!     .flush()
//!     .await
//!     .unwrap();
//! assert_eq!(codec.hydrate(Boundary::StepArguments, &bytes).unwrap(), value);
//! # });
//! ```

mod boundary;
mod class;
mod encryption;
mod error;
mod value;
mod wire;

pub use boundary::{Boundary, BoundaryCodec, Dehydrated, SideEffect, StreamEnvironment};
pub use class::{instance, ClassRegistry, SerializableClass};
pub use encryption::{generate_encryption_key, EncryptedEnvelope, PayloadEncryption};
pub use error::{DeserializationError, SerializationError};
pub use value::{
    BigIntValue, BytesValue, ClassInstance, ClassInstanceRef, CodecValue, DateValue, ErrorValue,
    RequestValue, ResponseValue, StepRefValue, StreamKind, StreamValue, TypedArrayKind,
};
pub use wire::{decode_envelope, encode_envelope, StreamRevival, FORMAT_TAG};
