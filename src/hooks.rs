use crate::fault::Fault;
use crate::session::SessionId;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::value::{CallbackDescriptor, Value};

/// What a before-invoke hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    /// short-circuits the call before any component code runs
    Cancel(String),
}

/// Notifications the core raises around an invocation, on both sides of the
///  wire. All methods default to no-ops so collaborators implement only what
///  they care about. After-invoke is best-effort notification: it cannot
///  alter an already-obtained result.
pub trait InvocationHooks: Send + Sync + 'static {
    fn before_invoke(
        &self,
        _tracking_id: CorrelationId,
        _interface: &str,
        _descriptors: &[CallbackDescriptor],
        _method: &str,
        _args: &[Value],
    ) -> HookDecision {
        HookDecision::Proceed
    }

    fn after_invoke(
        &self,
        _tracking_id: CorrelationId,
        _interface: &str,
        _method: &str,
        _return_value: &Value,
    ) {
    }

    /// fired when a call does not complete normally: a pre-invoke
    ///  cancellation, or the target method raising
    fn invoke_canceled(&self, _tracking_id: CorrelationId, _fault: &Fault) {}

    /// server side: a client's heartbeat renewed `session`
    fn heartbeat_received(&self, _session: SessionId) {}
}
