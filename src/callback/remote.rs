use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::fault::Fault;
use crate::transport::connection::Connection;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::envelope::Envelope;
use crate::wire::header::{keys, HeaderValue, MessageKind};
use crate::wire::value::{CallBody, CallbackDescriptor, Value};

/// A callback held by the other side, invokable as if it were local.
///  Invoking it forwards the arguments over the connection the descriptor
///  arrived on and returns the callable's result.
///
/// Once detached - explicitly after a per-call invocation, or implicitly
///  because an invocation failed - the adapter refuses further calls instead
///  of hammering a broken remote.
#[derive(Clone)]
pub struct RemoteCallback {
    inner: Arc<RemoteCallbackInner>,
}

struct RemoteCallbackInner {
    connection: Arc<Connection>,
    descriptor: CallbackDescriptor,
    detached: AtomicBool,
}

impl RemoteCallback {
    pub fn descriptor(&self) -> &CallbackDescriptor {
        &self.inner.descriptor
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.inner.descriptor.correlation_id
    }

    pub fn is_event(&self) -> bool {
        self.inner.descriptor.is_event
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    pub fn detach(&self) {
        if !self.inner.detached.swap(true, Ordering::AcqRel) {
            debug!(member = %self.inner.descriptor.member, "callback adapter detached");
        }
    }

    /// Invokes the bridged callback and returns its result. Any failure -
    ///  transport fault or the callable raising - detaches the adapter
    ///  before it propagates.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value, Fault> {
        if self.is_detached() {
            return Err(Fault::Canceled(format!(
                "callback adapter for '{}' is detached",
                self.inner.descriptor.member
            )));
        }

        let call = CallBody::new(&self.inner.descriptor.member, args);
        let envelope = Envelope::new(
            MessageKind::CallbackRequest,
            CorrelationId::new_unique(),
            call.to_bytes(),
        )
        .with_header(
            keys::TARGET,
            HeaderValue::Str(self.inner.descriptor.member.clone()),
        )
        .with_header(
            keys::OBJECT,
            HeaderValue::Bytes(self.inner.descriptor.correlation_id.as_bytes().to_vec()),
        );

        let outcome = match self.inner.connection.request(envelope).await {
            Ok(reply) => match reply.kind() {
                Some(MessageKind::Fault) => Err(Fault::from_reply(&reply)),
                _ => Value::try_deser(&mut reply.body.as_slice())
                    .map_err(|e| Fault::Encoding(format!("undecodable callback result: {}", e))),
            },
            Err(fault) => Err(fault),
        };

        if let Err(fault) = &outcome {
            // unsubscribe on failure: never invoke a broken remote again
            warn!(member = %self.inner.descriptor.member, "bridged callback failed, detaching: {}", fault);
            self.detach();
        }
        outcome
    }

    /// Event form of [RemoteCallback::invoke]: the subscriber's return value
    ///  is discarded.
    pub async fn raise(&self, args: Vec<Value>) -> Result<(), Fault> {
        self.invoke(args).await.map(|_| ())
    }
}

impl std::fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RemoteCallback{{member:{}, id:{:?}, detached:{}}}",
            self.inner.descriptor.member,
            self.inner.descriptor.correlation_id,
            self.is_detached()
        )
    }
}

/// The shape of one callback-bearing member, built once and reused for every
///  wiring of that member.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemberAdapter {
    pub interface: String,
    pub member: String,
    pub is_event: bool,
}

impl MemberAdapter {
    /// Bridges `descriptor` - arrived over `connection` - into an invokable
    ///  adapter.
    pub fn bind(&self, connection: Arc<Connection>, descriptor: CallbackDescriptor) -> RemoteCallback {
        RemoteCallback {
            inner: Arc::new(RemoteCallbackInner {
                connection,
                descriptor,
                detached: AtomicBool::new(false),
            }),
        }
    }
}

/// Adapter cache, keyed by (interface, member). The shape of a member never
///  changes after the first wiring, so one lookup builds it and every later
///  wiring reuses it.
pub struct CallbackWiring {
    adapters: Mutex<FxHashMap<(String, String), Arc<MemberAdapter>>>,
}

impl Default for CallbackWiring {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackWiring {
    pub fn new() -> CallbackWiring {
        CallbackWiring {
            adapters: Mutex::new(Default::default()),
        }
    }

    pub fn adapter(&self, interface: &str, member: &str, is_event: bool) -> Arc<MemberAdapter> {
        let mut adapters = self.adapters.lock().unwrap();
        adapters
            .entry((interface.to_owned(), member.to_owned()))
            .or_insert_with(|| {
                Arc::new(MemberAdapter {
                    interface: interface.to_owned(),
                    member: member.to_owned(),
                    is_event,
                })
            })
            .clone()
    }

    pub fn cached_adapters(&self) -> usize {
        self.adapters.lock().unwrap().len()
    }
}
