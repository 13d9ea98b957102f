use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf::{put_string, try_get_string};
use crate::wire::envelope::Envelope;
use crate::wire::header::MessageKind;

/// Wire discriminant of a [Fault].
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FaultKind {
    ConnectionClosed = 0,
    Framing = 1,
    Encoding = 2,
    MissingName = 3,
    UnknownInterface = 4,
    MethodNotFound = 5,
    MissingContext = 6,
    InvalidSession = 7,
    AuthenticationFailed = 8,
    Canceled = 9,
    Target = 10,
    DuplicateConnection = 11,
}

/// The typed failure a call resolves to.
///
/// Connection-fatal: [Fault::ConnectionClosed] and [Fault::Framing] - every
///  waiter on the affected connection completes with them and the connection
///  is dropped from the registry. [Fault::DuplicateConnection] never reaches
///  a caller; the registry redirects to the surviving connection instead.
///  Everything else answers exactly the one call it belongs to, and only
///  [Fault::InvalidSession] may trigger the client pipeline's single
///  transparent re-login.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("framing fault: {0}")]
    Framing(String),
    #[error("malformed call encoding: {0}")]
    Encoding(String),
    #[error("missing interface or method name")]
    MissingName,
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("missing call context")]
    MissingContext,
    #[error("invalid session")]
    InvalidSession,
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("call canceled: {0}")]
    Canceled(String),
    #[error("target fault: {0}")]
    Target(String),
    #[error("duplicate connection")]
    DuplicateConnection,
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::ConnectionClosed => FaultKind::ConnectionClosed,
            Fault::Framing(_) => FaultKind::Framing,
            Fault::Encoding(_) => FaultKind::Encoding,
            Fault::MissingName => FaultKind::MissingName,
            Fault::UnknownInterface(_) => FaultKind::UnknownInterface,
            Fault::MethodNotFound(_) => FaultKind::MethodNotFound,
            Fault::MissingContext => FaultKind::MissingContext,
            Fault::InvalidSession => FaultKind::InvalidSession,
            Fault::AuthenticationFailed(_) => FaultKind::AuthenticationFailed,
            Fault::Canceled(_) => FaultKind::Canceled,
            Fault::Target(_) => FaultKind::Target,
            Fault::DuplicateConnection => FaultKind::DuplicateConnection,
        }
    }

    fn detail(&self) -> &str {
        match self {
            Fault::Framing(detail)
            | Fault::Encoding(detail)
            | Fault::UnknownInterface(detail)
            | Fault::MethodNotFound(detail)
            | Fault::AuthenticationFailed(detail)
            | Fault::Canceled(detail)
            | Fault::Target(detail) => detail,
            _ => "",
        }
    }

    fn with_detail(kind: FaultKind, detail: String) -> Fault {
        match kind {
            FaultKind::ConnectionClosed => Fault::ConnectionClosed,
            FaultKind::Framing => Fault::Framing(detail),
            FaultKind::Encoding => Fault::Encoding(detail),
            FaultKind::MissingName => Fault::MissingName,
            FaultKind::UnknownInterface => Fault::UnknownInterface(detail),
            FaultKind::MethodNotFound => Fault::MethodNotFound(detail),
            FaultKind::MissingContext => Fault::MissingContext,
            FaultKind::InvalidSession => Fault::InvalidSession,
            FaultKind::AuthenticationFailed => Fault::AuthenticationFailed(detail),
            FaultKind::Canceled => Fault::Canceled(detail),
            FaultKind::Target => Fault::Target(detail),
            FaultKind::DuplicateConnection => Fault::DuplicateConnection,
        }
    }

    /// `include_detail` is the request's diagnostics flag: without it the
    ///  detail text stays on the server
    pub fn ser(&self, buf: &mut impl BufMut, include_detail: bool) {
        buf.put_u8(self.kind().into());
        put_string(buf, if include_detail { self.detail() } else { "" });
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Fault> {
        let kind = FaultKind::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid fault kind: {}", e))?;
        let detail = try_get_string(buf)?;
        Ok(Fault::with_detail(kind, detail))
    }

    /// a fault envelope answering `request`, honoring its diagnostics flag
    pub fn to_reply(&self, request: &Envelope) -> Envelope {
        let mut body = bytes::BytesMut::new();
        self.ser(&mut body, request.diagnostics());
        Envelope::reply_to(request, MessageKind::Fault, body.to_vec())
    }

    /// decodes the fault out of a fault-kind envelope's body
    pub fn from_reply(envelope: &Envelope) -> Fault {
        match Fault::try_deser(&mut envelope.body.as_slice()) {
            Ok(fault) => fault,
            Err(e) => Fault::Encoding(format!("undecodable fault body: {}", e)),
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;
    use crate::wire::correlation_id::CorrelationId;
    use crate::wire::header::{keys, HeaderValue};

    #[rstest]
    #[case::connection_closed(Fault::ConnectionClosed)]
    #[case::framing(Fault::Framing("3 of 16 bytes".to_owned()))]
    #[case::unknown_interface(Fault::UnknownInterface("IMissing".to_owned()))]
    #[case::method_not_found(Fault::MethodNotFound("Mul/2".to_owned()))]
    #[case::missing_context(Fault::MissingContext)]
    #[case::invalid_session(Fault::InvalidSession)]
    #[case::target(Fault::Target("division by zero".to_owned()))]
    fn test_fault_round_trip(#[case] fault: Fault) {
        let mut buf = BytesMut::new();
        fault.ser(&mut buf, true);
        assert_eq!(Fault::try_deser(&mut buf.as_ref()).unwrap(), fault);
    }

    #[rstest]
    fn test_detail_suppressed_without_diagnostics() {
        let fault = Fault::Target("sensitive internals".to_owned());
        let mut buf = BytesMut::new();
        fault.ser(&mut buf, false);

        let read_back = Fault::try_deser(&mut buf.as_ref()).unwrap();
        assert_eq!(read_back, Fault::Target(String::new()));
    }

    #[rstest]
    #[case::with_diagnostics(true, "boom")]
    #[case::without_diagnostics(false, "")]
    fn test_reply_honors_diagnostics_flag(#[case] diag: bool, #[case] expected_detail: &str) {
        let request = Envelope::new(MessageKind::Request, CorrelationId::new_unique(), vec![])
            .with_header(keys::DIAGNOSTICS, HeaderValue::Bool(diag));

        let reply = Fault::Target("boom".to_owned()).to_reply(&request);
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.kind(), Some(MessageKind::Fault));
        assert_eq!(Fault::from_reply(&reply), Fault::Target(expected_detail.to_owned()));
    }
}
