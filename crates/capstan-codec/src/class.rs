//! Class serialization registry
//!
//! Classes opt into boundary crossing by implementing [`SerializableClass`]
//! and being registered at construction time. An instance serializes to
//! `{class_id, data}`; the receiving side revives it through the same
//! registry, or surfaces a [`ClassInstanceRef`](crate::ClassInstanceRef)
//! when the class is unknown there.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DeserializationError, SerializationError};
use crate::value::{ClassInstance, CodecValue};

/// A type that can cross boundaries as a registered class instance
pub trait SerializableClass: Send + Sync + Sized + 'static {
    /// Stable identifier, shaped `class//<module>//<name>`
    const CLASS_ID: &'static str;

    /// Encode this instance into codec values (recursively encoded)
    fn encode(&self) -> CodecValue;

    /// Rebuild an instance from its encoded data
    fn decode(data: CodecValue) -> Result<Self, DeserializationError>;
}

/// Wrap a value into a [`CodecValue::Instance`]
pub fn instance<C: SerializableClass>(value: C) -> CodecValue {
    CodecValue::Instance(ClassInstance {
        class_id: C::CLASS_ID.to_string(),
        value: Arc::new(value),
    })
}

type EncodeFn = Box<dyn Fn(&ClassInstance) -> Option<CodecValue> + Send + Sync>;
type DecodeFn =
    Box<dyn Fn(CodecValue) -> Result<Arc<dyn Any + Send + Sync>, DeserializationError> + Send + Sync>;

struct ClassEntry {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of serialization classes, built once at construction
#[derive(Default)]
pub struct ClassRegistry {
    entries: HashMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: SerializableClass>(&mut self) {
        let entry = ClassEntry {
            encode: Box::new(|inst: &ClassInstance| {
                inst.downcast::<C>().map(|v| v.encode())
            }),
            decode: Box::new(|data: CodecValue| {
                let value = C::decode(data)?;
                Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
            }),
        };
        self.entries.insert(C::CLASS_ID.to_string(), entry);
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.entries.contains_key(class_id)
    }

    pub fn class_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Encode a live instance via its registered serializer
    pub fn encode_instance(
        &self,
        inst: &ClassInstance,
    ) -> Result<CodecValue, SerializationError> {
        let entry = self
            .entries
            .get(&inst.class_id)
            .ok_or_else(|| SerializationError::UnknownClass {
                class_id: inst.class_id.clone(),
            })?;
        (entry.encode)(inst).ok_or_else(|| SerializationError::UnknownClass {
            class_id: inst.class_id.clone(),
        })
    }

    /// Revive encoded data into a live instance.
    ///
    /// Returns `None` when the class is not registered here; the caller
    /// surfaces the data as an opaque `ClassInstanceRef` instead.
    pub fn decode_instance(
        &self,
        class_id: &str,
        data: CodecValue,
    ) -> Option<Result<ClassInstance, DeserializationError>> {
        let entry = self.entries.get(class_id)?;
        Some((entry.decode)(data).map(|value| ClassInstance {
            class_id: class_id.to_string(),
            value,
        }))
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("class_ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Money {
        cents: i64,
        currency: String,
    }

    impl SerializableClass for Money {
        const CLASS_ID: &'static str = "class//./src/money//Money";

        fn encode(&self) -> CodecValue {
            CodecValue::object([
                ("cents", CodecValue::Int(self.cents)),
                ("currency", CodecValue::String(self.currency.clone())),
            ])
        }

        fn decode(data: CodecValue) -> Result<Self, DeserializationError> {
            let cents = data
                .get("cents")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| DeserializationError::malformed("missing cents"))?;
            let currency = data
                .get("currency")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DeserializationError::malformed("missing currency"))?
                .to_string();
            Ok(Self { cents, currency })
        }
    }

    #[test]
    fn test_register_and_round_trip() {
        let mut registry = ClassRegistry::new();
        registry.register::<Money>();
        assert!(registry.contains(Money::CLASS_ID));

        let value = instance(Money {
            cents: 125,
            currency: "USD".into(),
        });
        let CodecValue::Instance(inst) = &value else {
            panic!("expected instance");
        };

        let encoded = registry.encode_instance(inst).unwrap();
        let revived = registry
            .decode_instance(Money::CLASS_ID, encoded)
            .unwrap()
            .unwrap();

        let money = revived.downcast::<Money>().unwrap();
        assert_eq!(money.cents, 125);
        assert_eq!(money.currency, "USD");
    }

    #[test]
    fn test_unregistered_class_yields_none() {
        let registry = ClassRegistry::new();
        assert!(registry
            .decode_instance("class//./nope//X", CodecValue::Null)
            .is_none());
    }
}
