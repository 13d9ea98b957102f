use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::callback::remote::RemoteCallback;
use crate::fault::Fault;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::value::Value;

/// An event member of a shared-activation component: subscriptions outlive
///  the call that wired them, until the subscriber unsubscribes or its
///  adapter breaks.
///
/// Raising walks the subscribers one by one. A subscriber whose bridged
///  callback fails has already detached its adapter (see
///  [RemoteCallback::invoke]); it is dropped from the source and the fault
///  is surfaced to the raising code - without affecting delivery to the
///  remaining subscribers.
pub struct EventSource {
    member: String,
    subscribers: Mutex<FxHashMap<CorrelationId, RemoteCallback>>,
}

impl EventSource {
    pub fn new(member: &str) -> EventSource {
        EventSource {
            member: member.to_owned(),
            subscribers: Mutex::new(Default::default()),
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Wires `callback` in; its correlation id is the subscription handle.
    pub fn subscribe(&self, callback: RemoteCallback) -> CorrelationId {
        let id = callback.correlation_id();
        debug!(member = %self.member, subscription = ?id, "subscribed");
        self.subscribers.lock().unwrap().insert(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: CorrelationId) -> bool {
        let removed = self.subscribers.lock().unwrap().remove(&id);
        if let Some(callback) = &removed {
            callback.detach();
            debug!(member = %self.member, subscription = ?id, "unsubscribed");
        }
        removed.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Raises the event to every subscriber. Returns the subscriptions that
    ///  failed, with their faults, after dropping them from the source.
    pub async fn raise(&self, args: Vec<Value>) -> Vec<(CorrelationId, Fault)> {
        let subscribers: Vec<(CorrelationId, RemoteCallback)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.iter().map(|(id, cb)| (*id, cb.clone())).collect()
        };

        let mut failed = Vec::new();
        for (id, callback) in subscribers {
            if let Err(fault) = callback.raise(args.clone()).await {
                warn!(member = %self.member, subscription = ?id, "event delivery failed: {}", fault);
                self.subscribers.lock().unwrap().remove(&id);
                failed.push((id, fault));
            }
        }
        failed
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EventSource{{member:{}, subscribers:{}}}",
            self.member,
            self.subscriber_count()
        )
    }
}
