use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_bool, put_bytes, put_string, try_get_bool, try_get_bytes, try_get_string};
use crate::wire::correlation_id::CorrelationId;

/// Nesting limit for list values. Protects the decoder against a hostile
///  payload of nothing but list tags.
const MAX_VALUE_DEPTH: u32 = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum ValueTag {
    Null = 0,
    Bool = 1,
    I32 = 2,
    I64 = 3,
    F64 = 4,
    Str = 5,
    Bytes = 6,
    List = 7,
    Callback = 8,
}

/// The self-describing argument / result encoding the dispatch layer and the
///  client pipeline agree on. The envelope body of a call is a [CallBody] of
///  these; a response body is a single one.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// a callback or event subscription passed as an argument; the actual
    ///  callable stays on the calling side, only the descriptor crosses
    Callback(CallbackDescriptor),
}

/// What a [Value] is, without its payload. Parameter signatures are built
///  from these, and method resolution compares them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    I32,
    I64,
    F64,
    Str,
    Bytes,
    List,
    Callback,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F64(_) => ValueKind::F64,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Callback(_) => ValueKind::Callback,
        }
    }

    fn tag(&self) -> ValueTag {
        match self {
            Value::Null => ValueTag::Null,
            Value::Bool(_) => ValueTag::Bool,
            Value::I32(_) => ValueTag::I32,
            Value::I64(_) => ValueTag::I64,
            Value::F64(_) => ValueTag::F64,
            Value::Str(_) => ValueTag::Str,
            Value::Bytes(_) => ValueTag::Bytes,
            Value::List(_) => ValueTag::List,
            Value::Callback(_) => ValueTag::Callback,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag().into());
        match self {
            Value::Null => {}
            Value::Bool(value) => put_bool(buf, *value),
            Value::I32(value) => buf.put_i32_varint(*value),
            Value::I64(value) => buf.put_i64_varint(*value),
            Value::F64(value) => buf.put_u64(value.to_bits()),
            Value::Str(value) => put_string(buf, value),
            Value::Bytes(value) => put_bytes(buf, value),
            Value::List(values) => {
                buf.put_usize_varint(values.len());
                for value in values {
                    value.ser(buf);
                }
            }
            Value::Callback(descriptor) => descriptor.ser(buf),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Value> {
        Self::try_deser_bounded(buf, 0)
    }

    fn try_deser_bounded(buf: &mut impl Buf, depth: u32) -> anyhow::Result<Value> {
        if depth > MAX_VALUE_DEPTH {
            bail!("value nesting deeper than {} levels", MAX_VALUE_DEPTH);
        }

        let tag = ValueTag::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid value tag: {}", e))?;
        match tag {
            ValueTag::Null => Ok(Value::Null),
            ValueTag::Bool => Ok(Value::Bool(try_get_bool(buf)?)),
            ValueTag::I32 => Ok(Value::I32(buf.try_get_i32_varint()?)),
            ValueTag::I64 => Ok(Value::I64(buf.try_get_i64_varint()?)),
            ValueTag::F64 => Ok(Value::F64(f64::from_bits(buf.try_get_u64()?))),
            ValueTag::Str => Ok(Value::Str(try_get_string(buf)?)),
            ValueTag::Bytes => Ok(Value::Bytes(try_get_bytes(buf)?)),
            ValueTag::List => {
                let len = buf.try_get_usize_varint()?;
                let mut values = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    values.push(Self::try_deser_bounded(buf, depth + 1)?);
                }
                Ok(Value::List(values))
            }
            ValueTag::Callback => Ok(Value::Callback(CallbackDescriptor::try_deser(buf)?)),
        }
    }
}

/// Created by the calling side when it passes a callback or event
///  subscription as an argument; the receiving side wires an adapter to it.
///  The correlation id names the callable in the caller's registry for as
///  long as the wiring lives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallbackDescriptor {
    pub correlation_id: CorrelationId,
    pub member: String,
    pub is_event: bool,
}

impl CallbackDescriptor {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.correlation_id.ser(buf);
        put_string(buf, &self.member);
        put_bool(buf, self.is_event);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CallbackDescriptor> {
        let correlation_id = CorrelationId::try_deser(buf)?;
        let member = try_get_string(buf)?;
        let is_event = try_get_bool(buf)?;
        Ok(CallbackDescriptor {
            correlation_id,
            member,
            is_event,
        })
    }
}

/// Body of a request or callback-request envelope: the method (or member)
///  name plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallBody {
    pub method: String,
    pub args: Vec<Value>,
}

impl CallBody {
    pub fn new(method: &str, args: Vec<Value>) -> CallBody {
        CallBody {
            method: method.to_owned(),
            args,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.method);
        buf.put_usize_varint(self.args.len());
        for arg in &self.args {
            arg.ser(buf);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CallBody> {
        let method = try_get_string(buf)?;
        let num_args = buf.try_get_usize_varint()?;
        let mut args = Vec::with_capacity(num_args.min(32));
        for _ in 0..num_args {
            args.push(Value::try_deser(buf)?);
        }
        Ok(CallBody { method, args })
    }

    /// the callback descriptors among the arguments, in argument order
    pub fn callback_descriptors(&self) -> Vec<CallbackDescriptor> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                Value::Callback(descriptor) => Some(descriptor.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::null(Value::Null)]
    #[case::bool_true(Value::Bool(true))]
    #[case::i32_negative(Value::I32(-12345))]
    #[case::i64_large(Value::I64(i64::MAX / 3))]
    #[case::f64(Value::F64(2.5))]
    #[case::string(Value::Str("hello".to_owned()))]
    #[case::bytes(Value::Bytes(vec![0, 255, 127]))]
    #[case::list(Value::List(vec![Value::I32(1), Value::Str("two".to_owned()), Value::Null]))]
    #[case::nested_list(Value::List(vec![Value::List(vec![Value::Bool(false)])]))]
    #[case::callback(Value::Callback(CallbackDescriptor {
        correlation_id: CorrelationId::from_bytes([3; 16]),
        member: "Progress".to_owned(),
        is_event: true,
    }))]
    fn test_value_round_trip(#[case] value: Value) {
        let mut buf = BytesMut::new();
        value.ser(&mut buf);
        assert_eq!(Value::try_deser(&mut buf.as_ref()).unwrap(), value);
    }

    #[rstest]
    fn test_value_invalid_tag() {
        assert!(Value::try_deser(&mut [42u8].as_slice()).is_err());
    }

    #[rstest]
    fn test_value_nesting_bomb_rejected() {
        // nothing but list tags announcing one element each
        let mut buf = BytesMut::new();
        for _ in 0..100 {
            buf.put_u8(ValueTag::List.into());
            buf.put_u8(1);
        }
        assert!(Value::try_deser(&mut buf.as_ref()).is_err());
    }

    #[rstest]
    fn test_call_body_round_trip() {
        let body = CallBody::new(
            "Add",
            vec![Value::I32(2), Value::I32(3)],
        );
        let bytes = body.to_bytes();
        assert_eq!(CallBody::try_deser(&mut bytes.as_slice()).unwrap(), body);
    }

    #[rstest]
    fn test_callback_descriptors_in_argument_order() {
        let first = CallbackDescriptor {
            correlation_id: CorrelationId::from_bytes([1; 16]),
            member: "OnProgress".to_owned(),
            is_event: false,
        };
        let second = CallbackDescriptor {
            correlation_id: CorrelationId::from_bytes([2; 16]),
            member: "Completed".to_owned(),
            is_event: true,
        };
        let body = CallBody::new(
            "StartJob",
            vec![
                Value::Str("job-1".to_owned()),
                Value::Callback(first.clone()),
                Value::I32(9),
                Value::Callback(second.clone()),
            ],
        );

        assert_eq!(body.callback_descriptors(), vec![first, second]);
    }
}
