use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use uuid::Uuid;

/// Matches a request to its response. Every call in flight on a transport has
///  its own correlation id, and a response carries the id of the request it
///  answers - that is the only thing connecting the two envelopes.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub const WIRE_LEN: usize = 16;

    pub fn new_unique() -> CorrelationId {
        CorrelationId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> CorrelationId {
        CorrelationId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<CorrelationId> {
        Some(CorrelationId(Uuid::from_slice(bytes).ok()?))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CorrelationId> {
        Ok(CorrelationId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
