use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf::try_get_u32_le;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::header::{keys, HeaderMap, HeaderValue, MessageKind};

/// One complete RPC message unit: correlation id, header map, opaque body.
///  See the module documentation in [crate::wire] for the byte layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, correlation_id: CorrelationId, body: Vec<u8>) -> Envelope {
        let mut headers = HeaderMap::new();
        headers.set(keys::KIND, HeaderValue::I64(u8::from(kind) as i64));
        Envelope {
            correlation_id,
            headers,
            body,
        }
    }

    /// a response or fault answering `request`, carrying its correlation id
    pub fn reply_to(request: &Envelope, kind: MessageKind, body: Vec<u8>) -> Envelope {
        Envelope::new(kind, request.correlation_id, body)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        let raw = self.headers.get_i64(keys::KIND)?;
        MessageKind::try_from(u8::try_from(raw).ok()?).ok()
    }

    pub fn with_header(mut self, key: &str, value: HeaderValue) -> Envelope {
        self.headers.set(key, value);
        self
    }

    pub fn diagnostics(&self) -> bool {
        self.headers.get_bool(keys::DIAGNOSTICS).unwrap_or(false)
    }

    pub fn write(&self, buf: &mut BytesMut) {
        self.correlation_id.ser(buf);

        let mut header_block = BytesMut::new();
        self.headers.ser(&mut header_block);

        buf.put_u32_le(header_block.len() as u32);
        buf.put_slice(&header_block);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Strict decoding of one envelope from an in-memory buffer. Any missing
    ///  byte is a framing fault; the caller decides what that means for the
    ///  connection the bytes came from.
    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Envelope> {
        let correlation_id = CorrelationId::try_deser(buf)
            .map_err(|e| anyhow!("short read in correlation id: {}", e))?;

        let header_len = try_get_u32_le(buf)? as usize;
        if buf.remaining() < header_len {
            bail!(
                "header block truncated: {} bytes announced, {} available",
                header_len,
                buf.remaining()
            );
        }
        let mut header_block = buf.copy_to_bytes(header_len);
        let headers = HeaderMap::try_deser(&mut header_block)?;
        if header_block.has_remaining() {
            bail!("{} trailing bytes after the header entries", header_block.remaining());
        }

        let body_len = try_get_u32_le(buf)? as usize;
        if buf.remaining() < body_len {
            bail!(
                "body truncated: {} bytes announced, {} available",
                body_len,
                buf.remaining()
            );
        }
        let mut body = vec![0u8; body_len];
        buf.copy_to_slice(&mut body);

        Ok(Envelope {
            correlation_id,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope::new(MessageKind::Request, CorrelationId::new_unique(), vec![1, 2, 3])
            .with_header(keys::TARGET, HeaderValue::Str("ICalc".to_owned()))
            .with_header(keys::DIAGNOSTICS, HeaderValue::Bool(true))
    }

    #[rstest]
    #[case::with_body(vec![1,2,3,4,5])]
    #[case::empty_body(vec![])]
    fn test_encode_decode_round_trip(#[case] body: Vec<u8>) {
        let envelope = Envelope::new(MessageKind::Response, CorrelationId::new_unique(), body)
            .with_header(keys::SESSION, HeaderValue::Bytes(vec![9u8; 16]));

        let mut buf = BytesMut::new();
        envelope.write(&mut buf);
        let read_back = Envelope::try_read(&mut buf.as_ref()).unwrap();
        assert_eq!(read_back, envelope);
    }

    #[rstest]
    fn test_lengths_are_little_endian() {
        let envelope = Envelope {
            correlation_id: CorrelationId::from_bytes([0xaa; 16]),
            headers: HeaderMap::new(),
            body: vec![0xbb; 3],
        };

        let mut buf = BytesMut::new();
        envelope.write(&mut buf);

        // 16 id bytes, header length 1 (just the varint entry count 0), body length 3
        assert_eq!(&buf.as_ref()[..16], &[0xaa; 16]);
        assert_eq!(&buf.as_ref()[16..20], &[1, 0, 0, 0]);
        assert_eq!(buf.as_ref()[20], 0);
        assert_eq!(&buf.as_ref()[21..25], &[3, 0, 0, 0]);
        assert_eq!(&buf.as_ref()[25..], &[0xbb; 3]);
    }

    #[rstest]
    fn test_kind_round_trip() {
        assert_eq!(sample_envelope().kind(), Some(MessageKind::Request));
    }

    #[rstest]
    fn test_reply_keeps_correlation_id() {
        let request = sample_envelope();
        let reply = Envelope::reply_to(&request, MessageKind::Response, vec![]);
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.kind(), Some(MessageKind::Response));
    }

    #[rstest]
    #[case::id_short(8)]
    #[case::header_len_short(18)]
    #[case::header_block_short(21)]
    fn test_truncated_is_framing_fault(#[case] cut: usize) {
        let mut buf = BytesMut::new();
        sample_envelope().write(&mut buf);

        let truncated = &buf.as_ref()[..cut];
        assert!(Envelope::try_read(&mut &truncated[..]).is_err());
    }

    #[rstest]
    fn test_truncated_body_is_framing_fault() {
        let mut buf = BytesMut::new();
        sample_envelope().write(&mut buf);

        let truncated = &buf.as_ref()[..buf.len() - 1];
        assert!(Envelope::try_read(&mut &truncated[..]).is_err());
    }

    #[rstest]
    fn test_trailing_header_bytes_rejected() {
        let envelope = sample_envelope();
        let mut buf = BytesMut::new();
        envelope.correlation_id.ser(&mut buf);

        let mut header_block = BytesMut::new();
        envelope.headers.ser(&mut header_block);
        header_block.put_u8(0xff); // junk after the last entry

        buf.put_u32_le(header_block.len() as u32);
        buf.put_slice(&header_block);
        buf.put_u32_le(0);

        assert!(Envelope::try_read(&mut buf.as_ref()).is_err());
    }
}
