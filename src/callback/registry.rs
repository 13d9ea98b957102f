use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::fault::Fault;
use crate::transport::connection::Connection;
use crate::transport::endpoint::InboundHandler;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::envelope::Envelope;
use crate::wire::header::{keys, MessageKind};
use crate::wire::value::{CallBody, CallbackDescriptor, Value};

pub type LocalCallback = Arc<dyn Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync>;

/// The calling side's half of the wiring: the callables it passed out, keyed
///  by the correlation id their descriptors carry. Entries live until the
///  owner unregisters them - when a per-call component instance is discarded
///  or a subscriber unsubscribes.
pub struct CallbackRegistry {
    callbacks: Mutex<FxHashMap<CorrelationId, LocalCallback>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry {
            callbacks: Mutex::new(Default::default()),
        }
    }

    /// Parks `callback` and returns the descriptor to send in its place.
    pub fn register(
        &self,
        member: &str,
        is_event: bool,
        callback: impl Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    ) -> CallbackDescriptor {
        let descriptor = CallbackDescriptor {
            correlation_id: CorrelationId::new_unique(),
            member: member.to_owned(),
            is_event,
        };
        self.callbacks
            .lock()
            .unwrap()
            .insert(descriptor.correlation_id, Arc::new(callback));
        descriptor
    }

    pub fn unregister(&self, id: CorrelationId) -> bool {
        self.callbacks.lock().unwrap().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().unwrap().is_empty()
    }

    pub fn invoke(&self, id: CorrelationId, args: Vec<Value>) -> Result<Value, Fault> {
        let callback = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks.get(&id).cloned()
        };
        match callback {
            Some(callback) => callback(args),
            None => Err(Fault::MethodNotFound(format!(
                "no callback registered for {:?}",
                id
            ))),
        }
    }
}

/// Inbound side of a pure caller: routes callback requests arriving over its
///  own outbound connections into the registry. Anything else addressed at
///  it is answered with a fault - a client hosts no components.
pub struct CallbackHost {
    registry: Arc<CallbackRegistry>,
}

impl CallbackHost {
    pub fn new(registry: Arc<CallbackRegistry>) -> CallbackHost {
        CallbackHost { registry }
    }
}

#[async_trait]
impl InboundHandler for CallbackHost {
    async fn on_envelope(&self, _connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
        match envelope.kind() {
            Some(MessageKind::CallbackRequest) => {
                let id = envelope
                    .headers
                    .get_bytes(keys::OBJECT)
                    .and_then(CorrelationId::from_slice);
                let Some(id) = id else {
                    return Some(
                        Fault::Encoding("callback request without a callback id".to_owned())
                            .to_reply(&envelope),
                    );
                };

                let call = match CallBody::try_deser(&mut envelope.body.as_slice()) {
                    Ok(call) => call,
                    Err(e) => {
                        return Some(
                            Fault::Encoding(format!("undecodable callback body: {}", e))
                                .to_reply(&envelope),
                        )
                    }
                };

                match self.registry.invoke(id, call.args) {
                    Ok(value) => {
                        let mut body = bytes::BytesMut::new();
                        value.ser(&mut body);
                        Some(Envelope::reply_to(&envelope, MessageKind::Response, body.to_vec()))
                    }
                    Err(fault) => Some(fault.to_reply(&envelope)),
                }
            }
            Some(MessageKind::Request) => {
                let target = envelope.headers.get_str(keys::TARGET).unwrap_or("").to_owned();
                Some(Fault::UnknownInterface(target).to_reply(&envelope))
            }
            other => {
                warn!("unexpected envelope kind {:?} at a pure caller - dropping", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_register_invoke_unregister() {
        let registry = CallbackRegistry::new();
        let descriptor = registry.register("OnProgress", false, |args| {
            match args.first() {
                Some(Value::I32(n)) => Ok(Value::I32(n + 1)),
                _ => Ok(Value::Null),
            }
        });
        assert_eq!(descriptor.member, "OnProgress");
        assert_eq!(registry.len(), 1);

        let result = registry.invoke(descriptor.correlation_id, vec![Value::I32(41)]);
        assert_eq!(result, Ok(Value::I32(42)));

        assert!(registry.unregister(descriptor.correlation_id));
        assert!(registry
            .invoke(descriptor.correlation_id, vec![])
            .is_err());
    }

    #[rstest]
    fn test_invoke_unknown_id_faults() {
        let registry = CallbackRegistry::new();
        let result = registry.invoke(CorrelationId::new_unique(), vec![]);
        assert!(matches!(result, Err(Fault::MethodNotFound(_))));
    }

    #[rstest]
    fn test_callback_error_propagates() {
        let registry = CallbackRegistry::new();
        let descriptor = registry.register("Failing", false, |_| {
            Err(Fault::Target("subscriber raised".to_owned()))
        });

        let result = registry.invoke(descriptor.correlation_id, vec![]);
        assert_eq!(result, Err(Fault::Target("subscriber raised".to_owned())));
    }
}
