//! # Message adapter
//!
//! Wraps dynamic protobuf messages for the script side. At every boundary
//! between the channel and script code a message is either wrapped
//! ([`MessageValue`], script-visible) or unwrapped (`DynamicMessage`,
//! channel-visible). Wrapping is O(1) when the underlying representation is
//! already the descriptor-dynamic form; a foreign prost message is
//! round-tripped through the wire encoding instead.
use prost::Message;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, Value};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message '{message}' has no field named '{field}'")]
    UnknownField { message: String, field: String },
    #[error("value is not valid for field '{field}'")]
    InvalidFieldValue { field: String },
    #[error("expected a message of type '{expected}', got '{actual}'")]
    WrongType { expected: String, actual: String },
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// One step of a stream's receive side: either the next message, or `done`
/// once the peer half-closed.
#[derive(Debug)]
pub struct RecvItem {
    pub value: Option<MessageValue>,
    pub done: bool,
}

/// A typed container over a descriptor, mutated only through set/get.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageValue {
    inner: DynamicMessage,
}

impl MessageValue {
    /// Creates an empty message of the descriptor's type.
    pub fn new(descriptor: MessageDescriptor) -> Self {
        Self {
            inner: DynamicMessage::new(descriptor),
        }
    }

    /// Adopts a channel-side dynamic message without copying.
    pub fn wrap(inner: DynamicMessage) -> Self {
        Self { inner }
    }

    /// Decodes a wire-format buffer into a message of the descriptor's type.
    pub fn decode(descriptor: MessageDescriptor, buf: &[u8]) -> Result<Self, MessageError> {
        Ok(Self {
            inner: DynamicMessage::decode(descriptor, buf)?,
        })
    }

    /// Round-trips a foreign prost message through the wire encoding into
    /// the descriptor-dynamic form.
    pub fn from_prost<M: Message>(
        descriptor: MessageDescriptor,
        message: &M,
    ) -> Result<Self, MessageError> {
        Self::decode(descriptor, message.encode_to_vec().as_slice())
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        self.inner.descriptor()
    }

    pub fn full_name(&self) -> String {
        self.inner.descriptor().full_name().to_string()
    }

    /// Sets a field by name, validating that the value fits its kind.
    pub fn set(&mut self, field: &str, value: Value) -> Result<(), MessageError> {
        let descriptor = self.field(field)?;
        if !value_fits_field(&descriptor, &value) {
            return Err(MessageError::InvalidFieldValue {
                field: field.to_string(),
            });
        }
        self.inner.set_field(&descriptor, value);
        Ok(())
    }

    /// Reads a field by name; unset fields yield their default value.
    pub fn get(&self, field: &str) -> Result<Value, MessageError> {
        let descriptor = self.field(field)?;
        Ok(self.inner.get_field(&descriptor).into_owned())
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.inner.encode_to_vec()
    }

    /// Checks that this message is of the expected type.
    pub fn expect_type(&self, expected: &MessageDescriptor) -> Result<(), MessageError> {
        if self.inner.descriptor().full_name() == expected.full_name() {
            Ok(())
        } else {
            Err(MessageError::WrongType {
                expected: expected.full_name().to_string(),
                actual: self.inner.descriptor().full_name().to_string(),
            })
        }
    }

    /// Unwraps into the channel-visible form, refusing a message that is not
    /// of the method's declared type.
    pub(crate) fn unwrap_for(
        self,
        expected: &MessageDescriptor,
    ) -> Result<DynamicMessage, MessageError> {
        self.expect_type(expected)?;
        Ok(self.inner)
    }

    fn field(&self, name: &str) -> Result<FieldDescriptor, MessageError> {
        self.inner
            .descriptor()
            .get_field_by_name(name)
            .ok_or_else(|| MessageError::UnknownField {
                message: self.inner.descriptor().full_name().to_string(),
                field: name.to_string(),
            })
    }
}

fn value_fits_field(field: &FieldDescriptor, value: &Value) -> bool {
    if field.is_map() {
        return matches!(value, Value::Map(_));
    }
    if field.is_list() {
        return match value {
            Value::List(items) => items.iter().all(|item| value_fits_kind(&field.kind(), item)),
            _ => false,
        };
    }
    value_fits_kind(&field.kind(), value)
}

fn value_fits_kind(kind: &Kind, value: &Value) -> bool {
    match (kind, value) {
        (Kind::Double, Value::F64(_)) | (Kind::Float, Value::F32(_)) => true,
        (Kind::Int32 | Kind::Sint32 | Kind::Sfixed32, Value::I32(_)) => true,
        (Kind::Int64 | Kind::Sint64 | Kind::Sfixed64, Value::I64(_)) => true,
        (Kind::Uint32 | Kind::Fixed32, Value::U32(_)) => true,
        (Kind::Uint64 | Kind::Fixed64, Value::U64(_)) => true,
        (Kind::Bool, Value::Bool(_)) => true,
        (Kind::String, Value::String(_)) => true,
        (Kind::Bytes, Value::Bytes(_)) => true,
        (Kind::Enum(_), Value::EnumNumber(_)) => true,
        (Kind::Message(descriptor), Value::Message(message)) => {
            message.descriptor().full_name() == descriptor.full_name()
        }
        _ => false,
    }
}
