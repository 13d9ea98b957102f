use tracing::trace;

use crate::session::{Session, SessionId};
use crate::wire::descriptor::ChannelId;
use crate::wire::header::{keys, HeaderMap, HeaderValue};

/// The call-scoped context a caller attaches to every outgoing call: its
///  session id and, optionally, an opaque ambient-transaction token. Read by
///  the dispatcher to resolve the session, discarded after the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub session_id: SessionId,
    pub transaction: Option<Vec<u8>>,
}

impl CallContext {
    pub fn new(session_id: SessionId) -> CallContext {
        CallContext {
            session_id,
            transaction: None,
        }
    }

    pub fn with_transaction(mut self, token: Vec<u8>) -> CallContext {
        self.transaction = Some(token);
        self
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<CallContext> {
        let session_id = SessionId::from_slice(headers.get_bytes(keys::SESSION)?)?;
        let transaction = headers.get_bytes(keys::TRANSACTION).map(|t| t.to_vec());
        Some(CallContext {
            session_id,
            transaction,
        })
    }

    pub fn apply_to(&self, headers: &mut HeaderMap) {
        headers.set(
            keys::SESSION,
            HeaderValue::Bytes(self.session_id.as_bytes().to_vec()),
        );
        if let Some(token) = &self.transaction {
            headers.set(keys::TRANSACTION, HeaderValue::Bytes(token.clone()));
        }
    }
}

/// The ambient session for one dispatched call's duration, handed to the
///  invoked method as an explicit value.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: Session,
    pub transaction: Option<Vec<u8>>,
    /// channel identity of the calling peer
    pub peer: ChannelId,
}

/// Lifecycle bracket around an invocation that carries a transaction token.
///  The core never interprets the token: the scope is opened before the
///  invocation, completed only on success, and always disposed.
pub struct TransactionScope {
    token: Vec<u8>,
    completed: bool,
}

impl TransactionScope {
    pub fn open(token: Vec<u8>) -> TransactionScope {
        trace!(token_len = token.len(), "opening transaction scope");
        TransactionScope {
            token,
            completed: false,
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        trace!(completed = self.completed, "disposing transaction scope");
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_context_header_round_trip() {
        let context = CallContext::new(SessionId::new_unique()).with_transaction(vec![1, 2, 3]);

        let mut headers = HeaderMap::new();
        context.apply_to(&mut headers);

        assert_eq!(CallContext::from_headers(&headers), Some(context));
    }

    #[rstest]
    fn test_context_without_transaction() {
        let context = CallContext::new(SessionId::new_unique());

        let mut headers = HeaderMap::new();
        context.apply_to(&mut headers);

        let read_back = CallContext::from_headers(&headers).unwrap();
        assert_eq!(read_back.transaction, None);
    }

    #[rstest]
    fn test_missing_session_means_no_context() {
        let headers = HeaderMap::new();
        assert_eq!(CallContext::from_headers(&headers), None);
    }

    #[rstest]
    fn test_malformed_session_id_means_no_context() {
        let mut headers = HeaderMap::new();
        headers.set(keys::SESSION, HeaderValue::Bytes(vec![1, 2, 3]));
        assert_eq!(CallContext::from_headers(&headers), None);
    }

    #[rstest]
    fn test_transaction_scope_lifecycle() {
        let mut scope = TransactionScope::open(vec![9, 9]);
        assert_eq!(scope.token(), &[9, 9]);
        assert!(!scope.is_completed());

        scope.complete();
        assert!(scope.is_completed());
    }
}
