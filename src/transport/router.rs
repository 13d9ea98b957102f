use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::fault::Fault;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::descriptor::ChannelId;
use crate::wire::envelope::Envelope;

/// What an inbound envelope is matched by: the correlation id of the call it
///  answers, or - exactly once per fresh connection - the peer's channel
///  identity, claiming the first inbound call on a connection the local side
///  opened.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CorrelationKey {
    Call(CorrelationId),
    Channel(ChannelId),
}

/// A parked consumer for one key: a handle the reader signals (the awaiting
///  task blocks on it), or a continuation the reader invokes directly.
///  Continuations must not assume they run on the caller's original task.
enum Waiter {
    Handle(oneshot::Sender<Result<Envelope, Fault>>),
    Continuation(Box<dyn FnOnce(Result<Envelope, Fault>) + Send>),
}

impl Waiter {
    fn complete(self, result: Result<Envelope, Fault>) {
        match self {
            Waiter::Handle(sender) => {
                // the awaiting task may have given up; that is its business
                let _ = sender.send(result);
            }
            Waiter::Continuation(f) => f(result),
        }
    }
}

struct RouterState {
    waiters: FxHashMap<CorrelationKey, Waiter>,
    /// envelopes that arrived before any waiter registered for their key,
    ///  newest on top
    stashed: FxHashMap<CorrelationKey, Vec<Envelope>>,
    /// set once the connection is gone; late awaits fail fast with this
    closed: Option<Fault>,
}

/// Matches inbound envelopes to outstanding waiters per connection.
///
/// Precedence is fixed: an envelope that already arrived wins over a freshly
///  registered waiter - [CorrelationRouter::begin_await] pops the stash
///  before it parks anything. Both sides of that race hold the router lock,
///  so an offer and an await for the same key always serialize one way or
///  the other.
pub struct CorrelationRouter {
    state: Mutex<RouterState>,
}

impl Default for CorrelationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRouter {
    pub fn new() -> CorrelationRouter {
        CorrelationRouter {
            state: Mutex::new(RouterState {
                waiters: Default::default(),
                stashed: Default::default(),
                closed: None,
            }),
        }
    }

    /// Registers interest in `key` and returns the pending reply. If a
    ///  matching envelope is already stashed it completes immediately.
    pub fn begin_await(&self, key: CorrelationKey) -> PendingReply {
        let mut state = self.state.lock().unwrap();

        if let Some(envelope) = pop_stashed(&mut state.stashed, key) {
            return PendingReply::ready(Ok(envelope));
        }
        if let Some(fault) = &state.closed {
            return PendingReply::ready(Err(fault.clone()));
        }

        let (sender, receiver) = oneshot::channel();
        if state.waiters.insert(key, Waiter::Handle(sender)).is_some() {
            // a correlation id never names two calls in flight at once, so
            //  this is a caller bug; the first waiter is gone for good
            warn!("replacing existing waiter for {:?}", key);
        }
        PendingReply::waiting(receiver)
    }

    /// Continuation form of [CorrelationRouter::begin_await]: `continuation`
    ///  runs inline on whatever task completes the key.
    pub fn begin_await_with(
        &self,
        key: CorrelationKey,
        continuation: impl FnOnce(Result<Envelope, Fault>) + Send + 'static,
    ) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            if let Some(envelope) = pop_stashed(&mut state.stashed, key) {
                Ok(envelope)
            }
            else if let Some(fault) = &state.closed {
                Err(fault.clone())
            }
            else {
                if state
                    .waiters
                    .insert(key, Waiter::Continuation(Box::new(continuation)))
                    .is_some()
                {
                    warn!("replacing existing waiter for {:?}", key);
                }
                return;
            }
        };
        // invoked outside the lock - the continuation may re-enter the router
        continuation(ready);
    }

    /// Hands an inbound envelope to the waiter for `key`, or stashes it
    ///  until one registers.
    pub fn offer(&self, key: CorrelationKey, envelope: Envelope) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.remove(&key) {
                Some(waiter) => waiter,
                None => {
                    debug!("no waiter for {:?} yet - stashing", key);
                    state.stashed.entry(key).or_default().push(envelope);
                    return;
                }
            }
        };
        // completed outside the lock: a continuation may re-enter the router
        waiter.complete(Ok(envelope));
    }

    /// Completes every outstanding waiter with `fault` and fails all future
    ///  awaits the same way. Stashed envelopes are dropped - nobody will
    ///  claim them on a dead connection.
    pub fn fail_all(&self, fault: Fault) {
        let waiters: Vec<Waiter> = {
            let mut state = self.state.lock().unwrap();
            state.closed = Some(fault.clone());
            state.stashed.clear();
            state.waiters.drain().map(|(_, w)| w).collect()
        };
        for waiter in waiters {
            waiter.complete(Err(fault.clone()));
        }
    }

    pub fn outstanding_waiters(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    pub fn stashed_envelopes(&self) -> usize {
        self.state.lock().unwrap().stashed.values().map(Vec::len).sum()
    }
}

fn pop_stashed(
    stashed: &mut FxHashMap<CorrelationKey, Vec<Envelope>>,
    key: CorrelationKey,
) -> Option<Envelope> {
    let stack = stashed.get_mut(&key)?;
    let envelope = stack.pop();
    if stack.is_empty() {
        stashed.remove(&key);
    }
    envelope
}

/// The reply side of one awaited key. Completes with the matching envelope,
///  or with the fault that took the connection down.
pub struct PendingReply {
    inner: PendingReplyInner,
}

enum PendingReplyInner {
    Ready(Option<Result<Envelope, Fault>>),
    Waiting(oneshot::Receiver<Result<Envelope, Fault>>),
}

impl PendingReply {
    fn ready(result: Result<Envelope, Fault>) -> PendingReply {
        PendingReply {
            inner: PendingReplyInner::Ready(Some(result)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Result<Envelope, Fault>>) -> PendingReply {
        PendingReply {
            inner: PendingReplyInner::Waiting(receiver),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Envelope, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingReplyInner::Ready(result) => {
                Poll::Ready(result.take().expect("pending reply polled after completion"))
            }
            PendingReplyInner::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Fault::ConnectionClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::wire::header::MessageKind;

    fn envelope(id: CorrelationId) -> Envelope {
        Envelope::new(MessageKind::Response, id, vec![])
    }

    fn call_key(seed: u8) -> CorrelationKey {
        CorrelationKey::Call(CorrelationId::from_bytes([seed; 16]))
    }

    #[tokio::test]
    async fn test_offer_completes_registered_waiter() {
        let router = CorrelationRouter::new();
        let id = CorrelationId::new_unique();

        let pending = router.begin_await(CorrelationKey::Call(id));
        router.offer(CorrelationKey::Call(id), envelope(id));

        assert_eq!(pending.await.unwrap().correlation_id, id);
        assert_eq!(router.outstanding_waiters(), 0);
    }

    #[tokio::test]
    async fn test_stashed_envelope_wins_over_fresh_waiter() {
        let router = CorrelationRouter::new();
        let id = CorrelationId::new_unique();

        // arrives before anyone awaits - the first inbound message on a
        //  fresh connection can precede the code about to await it
        router.offer(CorrelationKey::Call(id), envelope(id));
        assert_eq!(router.stashed_envelopes(), 1);

        let received = router.begin_await(CorrelationKey::Call(id)).await.unwrap();
        assert_eq!(received.correlation_id, id);
        assert_eq!(router.stashed_envelopes(), 0);
        assert_eq!(router.outstanding_waiters(), 0);
    }

    #[tokio::test]
    async fn test_stash_pops_newest_first() {
        let router = CorrelationRouter::new();
        let key = call_key(1);

        let mut first = envelope(CorrelationId::from_bytes([1; 16]));
        first.body = vec![1];
        let mut second = envelope(CorrelationId::from_bytes([1; 16]));
        second.body = vec![2];

        router.offer(key, first);
        router.offer(key, second);

        assert_eq!(router.begin_await(key).await.unwrap().body, vec![2]);
        assert_eq!(router.begin_await(key).await.unwrap().body, vec![1]);
    }

    #[tokio::test]
    async fn test_channel_key_claims_envelope() {
        let router = CorrelationRouter::new();
        let channel = ChannelId::new_unique();

        let pending = router.begin_await(CorrelationKey::Channel(channel));
        router.offer(
            CorrelationKey::Channel(channel),
            envelope(CorrelationId::new_unique()),
        );

        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_continuation_runs_inline_on_offer() {
        let router = CorrelationRouter::new();
        let id = CorrelationId::new_unique();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        router.begin_await_with(CorrelationKey::Call(id), move |result| {
            assert!(result.is_ok());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        router.offer(CorrelationKey::Call(id), envelope(id));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continuation_fires_immediately_for_stashed() {
        let router = CorrelationRouter::new();
        let id = CorrelationId::new_unique();
        let fired = Arc::new(AtomicUsize::new(0));

        router.offer(CorrelationKey::Call(id), envelope(id));

        let fired_clone = fired.clone();
        router.begin_await_with(CorrelationKey::Call(id), move |result| {
            assert!(result.is_ok());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_all_completes_waiters_and_future_awaits() {
        let router = CorrelationRouter::new();

        let pending = router.begin_await(call_key(1));
        router.fail_all(Fault::ConnectionClosed);

        assert_eq!(pending.await, Err(Fault::ConnectionClosed));
        // late awaits fail fast instead of hanging on a dead connection
        assert_eq!(router.begin_await(call_key(2)).await, Err(Fault::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_reply() {
        let router = CorrelationRouter::new();
        let id = CorrelationId::new_unique();

        let pending = router.begin_await(CorrelationKey::Call(id));
        drop(pending);

        // completing into the dropped handle must not panic
        router.offer(CorrelationKey::Call(id), envelope(id));
    }

    #[rstest]
    #[case::four_tasks(4)]
    #[case::sixteen_tasks(16)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_offer_await_races(#[case] num_keys: u8) {
        // offer and begin_await race per key; whichever side loses the lock
        //  race, exactly one envelope must reach exactly one awaiter
        let router = Arc::new(CorrelationRouter::new());

        let mut tasks = Vec::new();
        for seed in 0..num_keys {
            let id = CorrelationId::from_bytes([seed; 16]);

            let offer_router = router.clone();
            tasks.push(tokio::spawn(async move {
                offer_router.offer(CorrelationKey::Call(id), envelope(id));
            }));

            let await_router = router.clone();
            tasks.push(tokio::spawn(async move {
                let received = await_router
                    .begin_await(CorrelationKey::Call(id))
                    .await
                    .unwrap();
                assert_eq!(received.correlation_id, id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(router.outstanding_waiters(), 0);
        assert_eq!(router.stashed_envelopes(), 0);
    }
}
