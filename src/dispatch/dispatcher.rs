use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthProvider, Credentials};
use crate::callback::remote::CallbackWiring;
use crate::dispatch::catalog::{Activation, CallArg, ComponentCatalog};
use crate::dispatch::context::{CallContext, SessionContext, TransactionScope};
use crate::fault::Fault;
use crate::hooks::{HookDecision, InvocationHooks};
use crate::session::{Session, SessionStore};
use crate::transport::connection::Connection;
use crate::transport::endpoint::InboundHandler;
use crate::wire::envelope::Envelope;
use crate::wire::header::{keys, MessageKind};
use crate::wire::value::{CallBody, Value, ValueKind};

/// Progression of one dispatched call, for tracing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum DispatchState {
    Received,
    SessionValidated,
    ResultObtained,
    Faulted,
    Responded,
}

/// The server role of the invocation pipeline: resolves a registration by
///  interface name, applies activation policy, validates the caller's
///  session, wires supplied callbacks, invokes the target method, unwires,
///  and packages the result or fault. Also answers the session protocol
///  (logon / logoff / heartbeat) on the same transport.
pub struct ServerDispatcher {
    catalog: Arc<ComponentCatalog>,
    sessions: Arc<dyn SessionStore>,
    auth: Arc<dyn AuthProvider>,
    hooks: Vec<Arc<dyn InvocationHooks>>,
    wiring: CallbackWiring,
}

impl ServerDispatcher {
    pub fn new(
        catalog: Arc<ComponentCatalog>,
        sessions: Arc<dyn SessionStore>,
        auth: Arc<dyn AuthProvider>,
    ) -> ServerDispatcher {
        ServerDispatcher {
            catalog,
            sessions,
            auth,
            hooks: Vec::new(),
            wiring: CallbackWiring::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn InvocationHooks>) -> ServerDispatcher {
        self.hooks.push(hook);
        self
    }

    pub fn catalog(&self) -> &Arc<ComponentCatalog> {
        &self.catalog
    }

    fn notify_canceled(&self, envelope: &Envelope, fault: &Fault) {
        for hook in &self.hooks {
            hook.invoke_canceled(envelope.correlation_id, fault);
        }
    }

    async fn dispatch_call(&self, connection: &Arc<Connection>, envelope: Envelope) -> Envelope {
        trace!(state = ?DispatchState::Received, correlation_id = ?envelope.correlation_id, "call received");

        let reply = match self.run_call(connection, &envelope).await {
            Ok(value) => {
                trace!(state = ?DispatchState::ResultObtained, "call succeeded");
                let mut body = bytes::BytesMut::new();
                value.ser(&mut body);
                Envelope::reply_to(&envelope, MessageKind::Response, body.to_vec())
            }
            Err(fault) => {
                debug!(state = ?DispatchState::Faulted, "call faulted: {}", fault);
                fault.to_reply(&envelope)
            }
        };
        trace!(state = ?DispatchState::Responded, correlation_id = ?reply.correlation_id, "responding");
        reply
    }

    async fn run_call(&self, connection: &Arc<Connection>, envelope: &Envelope) -> Result<Value, Fault> {
        let tracking_id = envelope.correlation_id;

        let interface = envelope
            .headers
            .get_str(keys::TARGET)
            .filter(|t| !t.is_empty())
            .ok_or(Fault::MissingName)?
            .to_owned();
        let call = CallBody::try_deser(&mut envelope.body.as_slice())
            .map_err(|e| Fault::Encoding(format!("undecodable call body: {}", e)))?;
        if call.method.is_empty() {
            return Err(Fault::MissingName);
        }

        let descriptors = call.callback_descriptors();
        for hook in &self.hooks {
            if let HookDecision::Cancel(reason) =
                hook.before_invoke(tracking_id, &interface, &descriptors, &call.method, &call.args)
            {
                let fault = Fault::Canceled(reason);
                self.notify_canceled(envelope, &fault);
                return Err(fault);
            }
        }

        let registration = self
            .catalog
            .get_registration(&interface)
            .ok_or_else(|| Fault::UnknownInterface(interface.clone()))?;
        let instance = registration.instance();

        let context = CallContext::from_headers(&envelope.headers).ok_or(Fault::MissingContext)?;
        let mut session = self
            .sessions
            .get(context.session_id)
            .await
            .ok_or(Fault::InvalidSession)?;
        session.renew();
        self.sessions.store(session.clone()).await;
        trace!(state = ?DispatchState::SessionValidated, session = ?session.id, "session renewed");

        let scope = SessionContext {
            session,
            transaction: context.transaction.clone(),
            peer: connection.peer().channel_id,
        };

        // callbacks among the arguments become adapters bound to the calling
        //  connection
        let mut wired = Vec::new();
        let args: Vec<CallArg> = call
            .args
            .iter()
            .cloned()
            .map(|value| match value {
                Value::Callback(descriptor) => {
                    let adapter =
                        self.wiring
                            .adapter(&interface, &descriptor.member, descriptor.is_event);
                    let callback = adapter.bind(connection.clone(), descriptor);
                    wired.push(callback.clone());
                    CallArg::Callback(callback)
                }
                value => CallArg::Value(value),
            })
            .collect();

        let result: Result<Value, Fault> = {
            let mut transaction_scope = context.transaction.clone().map(TransactionScope::open);

            let invoked = async {
                let kinds: Vec<ValueKind> = args.iter().map(CallArg::kind).collect();
                let method = registration.methods().resolve(&call.method, &kinds).ok_or_else(|| {
                    Fault::MethodNotFound(format!(
                        "{}::{} with argument kinds {:?}",
                        interface, call.method, kinds
                    ))
                })?;
                method.invoke(instance, args, scope).await
            }
            .await;

            // the scope completes only on success and is disposed either way
            if invoked.is_ok() {
                if let Some(scope) = transaction_scope.as_mut() {
                    scope.complete();
                }
            }
            invoked
        };

        // guaranteed cleanup: a per-call instance is discarded, so its
        //  wiring goes with it, success or not
        if registration.activation() == Activation::PerCall {
            for callback in &wired {
                callback.detach();
            }
        }

        match result {
            Ok(value) => {
                for hook in &self.hooks {
                    hook.after_invoke(tracking_id, &interface, &call.method, &value);
                }
                Ok(value)
            }
            Err(fault) => {
                // a raising target is reported, then re-raised - never
                //  swallowed
                self.notify_canceled(envelope, &fault);
                Err(fault)
            }
        }
    }

    async fn handle_logon(&self, connection: &Arc<Connection>, envelope: &Envelope) -> Envelope {
        let credentials = match Credentials::try_deser(&mut envelope.body.as_slice()) {
            Ok(credentials) => credentials,
            Err(e) => {
                return Fault::Encoding(format!("undecodable credentials: {}", e)).to_reply(envelope)
            }
        };

        let outcome = self.auth.authenticate(&credentials).await;
        if !outcome.success {
            let message = outcome.error_message.unwrap_or_else(|| "access denied".to_owned());
            debug!("logon denied: {}", message);
            return Fault::AuthenticationFailed(message).to_reply(envelope);
        }

        let identity = outcome.identity.unwrap_or_else(|| "anonymous".to_owned());
        let session = Session::new(&identity, connection.remote_addresses().first().copied());
        let session_id = session.id;
        self.sessions.store(session).await;
        info!(identity = %identity, session = ?session_id, "logon");

        let mut body = bytes::BytesMut::new();
        session_id.ser(&mut body);
        Envelope::reply_to(envelope, MessageKind::Response, body.to_vec())
    }

    async fn handle_logoff(&self, envelope: &Envelope) -> Envelope {
        let Some(context) = CallContext::from_headers(&envelope.headers) else {
            return Fault::MissingContext.to_reply(envelope);
        };

        self.sessions.remove(context.session_id).await;
        debug!(session = ?context.session_id, "logoff");

        let mut body = bytes::BytesMut::new();
        Value::Null.ser(&mut body);
        Envelope::reply_to(envelope, MessageKind::Response, body.to_vec())
    }

    async fn handle_heartbeat(&self, envelope: &Envelope) -> Envelope {
        let Some(context) = CallContext::from_headers(&envelope.headers) else {
            return Fault::MissingContext.to_reply(envelope);
        };

        let Some(mut session) = self.sessions.get(context.session_id).await else {
            return Fault::InvalidSession.to_reply(envelope);
        };
        session.renew();
        self.sessions.store(session).await;

        for hook in &self.hooks {
            hook.heartbeat_received(context.session_id);
        }
        trace!(session = ?context.session_id, "heartbeat");

        let mut body = bytes::BytesMut::new();
        Value::Null.ser(&mut body);
        Envelope::reply_to(envelope, MessageKind::Response, body.to_vec())
    }
}

#[async_trait]
impl InboundHandler for ServerDispatcher {
    async fn on_envelope(&self, connection: &Arc<Connection>, envelope: Envelope) -> Option<Envelope> {
        match envelope.kind() {
            Some(MessageKind::Request) => Some(self.dispatch_call(connection, envelope).await),
            Some(MessageKind::Logon) => Some(self.handle_logon(connection, &envelope).await),
            Some(MessageKind::Logoff) => Some(self.handle_logoff(&envelope).await),
            Some(MessageKind::Heartbeat) => Some(self.handle_heartbeat(&envelope).await),
            Some(MessageKind::CallbackRequest) => Some(
                Fault::MethodNotFound("no callback host at this endpoint".to_owned())
                    .to_reply(&envelope),
            ),
            other => {
                warn!("unexpected envelope kind {:?} at the dispatcher - dropping", other);
                None
            }
        }
    }
}
