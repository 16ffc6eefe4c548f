//! Boundary dehydrate/hydrate pairs
//!
//! Four pairs exist, one per crossing: workflow arguments, workflow
//! return value, step arguments, step return value. They differ only in
//! which reviver set runs on the receiving side: payloads hydrated into
//! the deterministic sandbox revive streams as opaque placeholders,
//! payloads hydrated in a step or external caller revive them as live
//! references into the stream store.
//!
//! Dehydration can produce async side effects (pumping local stream
//! contents into the store). Those are collected in an `ops` list the
//! caller awaits before acknowledging durability.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::class::ClassRegistry;
use crate::encryption::PayloadEncryption;
use crate::error::{DeserializationError, SerializationError};
use crate::value::CodecValue;
use crate::wire::{self, StreamRevival};

/// Where a payload crosses between contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Caller → workflow (hydrated inside the sandbox)
    WorkflowArguments,
    /// Workflow → caller (hydrated outside the sandbox)
    WorkflowReturn,
    /// Workflow → step (hydrated in the step context)
    StepArguments,
    /// Step → workflow (hydrated inside the sandbox)
    StepReturn,
}

impl Boundary {
    /// Stream reviver selection for the side that hydrates this boundary
    fn revival(&self) -> StreamRevival {
        match self {
            Self::WorkflowArguments | Self::StepReturn => StreamRevival::Placeholder,
            Self::WorkflowReturn | Self::StepArguments => StreamRevival::Store,
        }
    }
}

/// Deferred side effect produced while dehydrating
pub type SideEffect = BoxFuture<'static, Result<(), SerializationError>>;

/// A dehydrated payload plus the side effects backing its durability
pub struct Dehydrated {
    pub bytes: Vec<u8>,
    pub ops: Vec<SideEffect>,
}

impl std::fmt::Debug for Dehydrated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dehydrated")
            .field("bytes", &self.bytes)
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl Dehydrated {
    /// Await every pending side effect and return the payload bytes
    pub async fn flush(self) -> Result<Vec<u8>, SerializationError> {
        for op in self.ops {
            op.await?;
        }
        Ok(self.bytes)
    }
}

/// Write access to the stream store, as the codec needs it
#[async_trait::async_trait]
pub trait StreamEnvironment: Send + Sync {
    async fn write_chunks(
        &self,
        name: &str,
        run_id: &str,
        chunks: Vec<Vec<u8>>,
    ) -> Result<(), SerializationError>;

    async fn close_stream(&self, name: &str, run_id: &str) -> Result<(), SerializationError>;
}

/// The codec bound to a class registry, stream environment, and
/// optional payload encryption.
#[derive(Clone)]
pub struct BoundaryCodec {
    classes: Arc<ClassRegistry>,
    streams: Option<Arc<dyn StreamEnvironment>>,
    encryption: Option<PayloadEncryption>,
}

impl BoundaryCodec {
    pub fn new(classes: Arc<ClassRegistry>) -> Self {
        Self {
            classes,
            streams: None,
            encryption: None,
        }
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamEnvironment>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn with_encryption(mut self, encryption: PayloadEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Dehydrate a value for the given boundary.
    ///
    /// Local stream contents are scheduled for pumping into the stream
    /// store; await [`Dehydrated::ops`] before treating the payload as
    /// durable.
    pub fn dehydrate(
        &self,
        _boundary: Boundary,
        value: &CodecValue,
        run_id: &str,
    ) -> Result<Dehydrated, SerializationError> {
        let mut ops: Vec<SideEffect> = Vec::new();
        self.prepare_streams(value, run_id, &mut ops)?;

        let mut bytes = wire::encode_envelope(value, &self.classes)?;
        if let Some(encryption) = &self.encryption {
            bytes = encryption.seal(&bytes)?;
        }

        Ok(Dehydrated { bytes, ops })
    }

    /// Hydrate a payload for the given boundary.
    pub fn hydrate(
        &self,
        boundary: Boundary,
        bytes: &[u8],
    ) -> Result<CodecValue, DeserializationError> {
        let plaintext;
        let payload = if bytes.first().copied() == Some(b'{') {
            let encryption = self.encryption.as_ref().ok_or_else(|| {
                DeserializationError::Decryption("payload is encrypted but no key is configured".into())
            })?;
            plaintext = encryption.open(bytes)?;
            plaintext.as_slice()
        } else {
            bytes
        };

        wire::decode_envelope(payload, &self.classes, boundary.revival())
    }

    /// Walk the value, naming unnamed streams and scheduling pumps for
    /// any that carry local contents.
    fn prepare_streams(
        &self,
        value: &CodecValue,
        run_id: &str,
        ops: &mut Vec<SideEffect>,
    ) -> Result<(), SerializationError> {
        match value {
            CodecValue::Stream(stream) => {
                let name = stream.assign_name(new_stream_name());
                if let Some(rx) = stream.take_channel() {
                    let env = self
                        .streams
                        .clone()
                        .ok_or(SerializationError::NoStreamEnvironment)?;
                    ops.push(pump_stream(env, name, run_id.to_string(), rx));
                }
                Ok(())
            }
            CodecValue::List(items) | CodecValue::Set(items) => {
                for item in items {
                    self.prepare_streams(item, run_id, ops)?;
                }
                Ok(())
            }
            CodecValue::Object(entries) => {
                for (_, item) in entries {
                    self.prepare_streams(item, run_id, ops)?;
                }
                Ok(())
            }
            CodecValue::Map(entries) => {
                for (key, item) in entries {
                    self.prepare_streams(key, run_id, ops)?;
                    self.prepare_streams(item, run_id, ops)?;
                }
                Ok(())
            }
            CodecValue::Request(req) => match &req.body {
                Some(body) => self.prepare_streams(body, run_id, ops),
                None => Ok(()),
            },
            CodecValue::Response(res) => match &res.body {
                Some(body) => self.prepare_streams(body, run_id, ops),
                None => Ok(()),
            },
            CodecValue::StepRef(step) => match &step.closure_vars {
                Some(vars) => self.prepare_streams(vars, run_id, ops),
                None => Ok(()),
            },
            CodecValue::Opaque(opaque) => self.prepare_streams(&opaque.data, run_id, ops),
            _ => Ok(()),
        }
    }
}

fn new_stream_name() -> String {
    format!("strm_{}", Ulid::new())
}

fn pump_stream(
    env: Arc<dyn StreamEnvironment>,
    name: String,
    run_id: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> SideEffect {
    Box::pin(async move {
        let mut batch = Vec::new();
        while let Some(chunk) = rx.recv().await {
            batch.push(chunk);
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }
            env.write_chunks(&name, &run_id, std::mem::take(&mut batch))
                .await?;
        }
        env.close_stream(&name, &run_id).await
    })
}
