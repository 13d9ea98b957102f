use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_bool, put_bytes, put_string, try_get_bool, try_get_bytes, try_get_string};

/// Header keys this crate reads and writes. The header map is open - hosting
///  layers may add their own keys - but these are the ones the core gives
///  meaning to.
pub mod keys {
    /// interface name the call is addressed at
    pub const TARGET: &str = "target";
    /// object identifier within the target - the wired callback's correlation
    ///  id for callback invocations, empty for a component's default instance
    pub const OBJECT: &str = "object";
    /// role of the envelope, see [super::MessageKind]
    pub const KIND: &str = "kind";
    /// error-detail flag: when set on a request, fault responses carry their
    ///  full detail text instead of just the fault kind
    pub const DIAGNOSTICS: &str = "diag";
    /// 16-byte session id, the call-scoped context of a dispatched call
    pub const SESSION: &str = "session";
    /// opaque ambient-transaction token, passed through and never interpreted
    pub const TRANSACTION: &str = "txn";
}

/// Role of an envelope on the wire. Requests and callback requests are
///  dispatched, responses and faults complete a waiter, the rest are the
///  session protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Fault = 2,
    CallbackRequest = 3,
    Logon = 4,
    Logoff = 5,
    Heartbeat = 6,
}

impl MessageKind {
    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Fault)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum HeaderTag {
    Bool = 0,
    I64 = 1,
    Str = 2,
    Bytes = 3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    fn tag(&self) -> HeaderTag {
        match self {
            HeaderValue::Bool(_) => HeaderTag::Bool,
            HeaderValue::I64(_) => HeaderTag::I64,
            HeaderValue::Str(_) => HeaderTag::Str,
            HeaderValue::Bytes(_) => HeaderTag::Bytes,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag().into());
        match self {
            HeaderValue::Bool(value) => put_bool(buf, *value),
            HeaderValue::I64(value) => buf.put_i64_varint(*value),
            HeaderValue::Str(value) => put_string(buf, value),
            HeaderValue::Bytes(value) => put_bytes(buf, value),
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HeaderValue> {
        let tag = HeaderTag::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid header value tag: {}", e))?;
        match tag {
            HeaderTag::Bool => Ok(HeaderValue::Bool(try_get_bool(buf)?)),
            HeaderTag::I64 => Ok(HeaderValue::I64(buf.try_get_i64_varint()?)),
            HeaderTag::Str => Ok(HeaderValue::Str(try_get_string(buf)?)),
            HeaderTag::Bytes => Ok(HeaderValue::Bytes(try_get_bytes(buf)?)),
        }
    }
}

/// The envelope's string -> value mapping. Insertion order is preserved on
///  the wire, and lookups scan linearly - header maps are a handful of
///  entries, never big.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeaderMap {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap { entries: Vec::new() }
    }

    /// sets `key`, replacing an existing entry in place so its position in
    ///  the ordering is kept
    pub fn set(&mut self, key: &str, value: HeaderValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(HeaderValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(HeaderValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(HeaderValue::I64(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(HeaderValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.entries.len());
        for (key, value) in &self.entries {
            put_string(buf, key);
            value.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HeaderMap> {
        let num_entries = buf.try_get_usize_varint()?;
        let mut entries = Vec::with_capacity(num_entries.min(32));
        for _ in 0..num_entries {
            let key = try_get_string(buf)?;
            let value = HeaderValue::try_deser(buf)?;
            entries.push((key, value));
        }
        Ok(HeaderMap { entries })
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    fn sample_map() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.set(keys::KIND, HeaderValue::I64(MessageKind::Request as i64));
        headers.set(keys::TARGET, HeaderValue::Str("ICalc".to_owned()));
        headers.set(keys::DIAGNOSTICS, HeaderValue::Bool(true));
        headers.set(keys::SESSION, HeaderValue::Bytes(vec![7u8; 16]));
        headers
    }

    #[rstest]
    fn test_round_trip_preserves_order() {
        let headers = sample_map();
        let mut buf = BytesMut::new();
        headers.ser(&mut buf);

        let read_back = HeaderMap::try_deser(&mut buf.as_ref()).unwrap();
        assert_eq!(read_back, headers);

        let keys_in_order: Vec<&str> = read_back.iter().map(|(k, _)| k).collect();
        assert_eq!(keys_in_order, vec![keys::KIND, keys::TARGET, keys::DIAGNOSTICS, keys::SESSION]);
    }

    #[rstest]
    fn test_set_replaces_in_place() {
        let mut headers = sample_map();
        headers.set(keys::TARGET, HeaderValue::Str("IOther".to_owned()));

        assert_eq!(headers.len(), 4);
        assert_eq!(headers.get_str(keys::TARGET), Some("IOther"));
        let keys_in_order: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys_in_order[1], keys::TARGET);
    }

    #[rstest]
    fn test_typed_accessors_reject_wrong_type() {
        let headers = sample_map();
        assert_eq!(headers.get_str(keys::DIAGNOSTICS), None);
        assert_eq!(headers.get_bool(keys::TARGET), None);
        assert_eq!(headers.get_bytes(keys::KIND), None);
        assert_eq!(headers.get_i64(keys::SESSION), None);
    }

    #[rstest]
    #[case::truncated_key(b"\x01\x05ab".as_slice())]
    #[case::truncated_value(b"\x01\x01a\x02\x09xx".as_slice())]
    #[case::invalid_tag(b"\x01\x01a\x0c".as_slice())]
    fn test_deser_malformed(#[case] mut buf: &[u8]) {
        assert!(HeaderMap::try_deser(&mut buf).is_err());
    }
}
