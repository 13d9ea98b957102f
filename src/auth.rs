use async_trait::async_trait;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
#[cfg(test)] use mockall::automock;

use crate::util::buf::{put_string, try_get_string};

/// What a client presents at logon: an ordered list of named entries
///  ("name", "password", a token, a domain - whatever the configured
///  provider expects). The core ships them to the server verbatim and never
///  interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    entries: Vec<(String, String)>,
}

impl Credentials {
    pub fn new() -> Credentials {
        Credentials { entries: Vec::new() }
    }

    pub fn with_entry(mut self, key: &str, value: &str) -> Credentials {
        self.entries.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.entries.len());
        for (key, value) in &self.entries {
            put_string(buf, key);
            put_string(buf, value);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Credentials> {
        let num_entries = buf.try_get_usize_varint()?;
        let mut entries = Vec::with_capacity(num_entries.min(16));
        for _ in 0..num_entries {
            let key = try_get_string(buf)?;
            let value = try_get_string(buf)?;
            entries.push((key, value));
        }
        Ok(Credentials { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub success: bool,
    pub identity: Option<String>,
    pub error_message: Option<String>,
}

impl AuthOutcome {
    pub fn granted(identity: &str) -> AuthOutcome {
        AuthOutcome {
            success: true,
            identity: Some(identity.to_owned()),
            error_message: None,
        }
    }

    pub fn denied(error_message: &str) -> AuthOutcome {
        AuthOutcome {
            success: false,
            identity: None,
            error_message: Some(error_message.to_owned()),
        }
    }
}

/// The authentication provider the dispatcher consumes at logon.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    async fn authenticate(&self, credentials: &Credentials) -> AuthOutcome;
}

/// Grants every logon. The identity is the "name" credential entry if
///  present, for hosts that want sessions but no access control.
#[derive(Debug, Default)]
pub struct NullAuthProvider;

#[async_trait]
impl AuthProvider for NullAuthProvider {
    async fn authenticate(&self, credentials: &Credentials) -> AuthOutcome {
        AuthOutcome::granted(credentials.get("name").unwrap_or("anonymous"))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(Credentials::new())]
    #[case::name_password(Credentials::new().with_entry("name", "alice").with_entry("password", "s3cret"))]
    fn test_credentials_round_trip(#[case] credentials: Credentials) {
        let bytes = credentials.to_bytes();
        assert_eq!(Credentials::try_deser(&mut bytes.as_slice()).unwrap(), credentials);
    }

    #[rstest]
    fn test_credentials_lookup() {
        let credentials = Credentials::new().with_entry("name", "alice");
        assert_eq!(credentials.get("name"), Some("alice"));
        assert_eq!(credentials.get("password"), None);
    }

    #[tokio::test]
    async fn test_null_provider_grants_with_name() {
        let outcome = NullAuthProvider
            .authenticate(&Credentials::new().with_entry("name", "alice"))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_null_provider_grants_anonymous() {
        let outcome = NullAuthProvider.authenticate(&Credentials::new()).await;
        assert!(outcome.success);
        assert_eq!(outcome.identity.as_deref(), Some("anonymous"));
    }
}
