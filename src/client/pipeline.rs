use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::callback::registry::{CallbackHost, CallbackRegistry};
use crate::config::CoreConfig;
use crate::dispatch::context::CallContext;
use crate::fault::Fault;
use crate::hooks::{HookDecision, InvocationHooks};
use crate::session::SessionId;
use crate::transport::endpoint::Endpoint;
use crate::wire::correlation_id::CorrelationId;
use crate::wire::envelope::Envelope;
use crate::wire::header::{keys, HeaderValue, MessageKind};
use crate::wire::value::{CallBody, Value};

struct ClientState {
    session: Option<SessionId>,
    /// kept for the transparent re-login after an expired session
    credentials: Option<Credentials>,
}

/// The client invocation pipeline: attaches the call-scoped context, raises
///  the local pre-invoke hook, ships the envelope over the duplex transport
///  and resolves the matching response.
///
/// On an invalid-session fault with auto-relogin enabled, the pipeline
///  re-authenticates with its cached credentials and retries the call
///  exactly once; the caller never observes the intermediate fault.
pub struct ClientPipeline {
    endpoint: Arc<Endpoint>,
    server_addr: SocketAddr,
    callbacks: Arc<CallbackRegistry>,
    hooks: Vec<Arc<dyn InvocationHooks>>,
    config: CoreConfig,
    state: tokio::sync::Mutex<ClientState>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClientPipeline {
    pub fn new(server_addr: SocketAddr, config: CoreConfig) -> ClientPipeline {
        let callbacks = Arc::new(CallbackRegistry::new());
        let endpoint = Endpoint::client(Arc::new(CallbackHost::new(callbacks.clone())), config.clone());
        ClientPipeline {
            endpoint,
            server_addr,
            callbacks,
            hooks: Vec::new(),
            config,
            state: tokio::sync::Mutex::new(ClientState {
                session: None,
                credentials: None,
            }),
            heartbeat_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn InvocationHooks>) -> ClientPipeline {
        self.hooks.push(hook);
        self
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub async fn session(&self) -> Option<SessionId> {
        self.state.lock().await.session
    }

    /// Authenticates against the server and makes the issued session the
    ///  pipeline's ambient session. The credentials are cached for
    ///  auto-relogin.
    pub async fn logon(&self, credentials: Credentials) -> Result<SessionId, Fault> {
        let envelope = Envelope::new(
            MessageKind::Logon,
            CorrelationId::new_unique(),
            credentials.to_bytes(),
        )
        .with_header(keys::DIAGNOSTICS, HeaderValue::Bool(self.config.diagnostics));

        let reply = self.endpoint.request(self.server_addr, envelope).await?;
        if reply.kind() == Some(MessageKind::Fault) {
            return Err(Fault::from_reply(&reply));
        }

        let session = SessionId::try_deser(&mut reply.body.as_slice())
            .map_err(|e| Fault::Encoding(format!("undecodable session id: {}", e)))?;

        let mut state = self.state.lock().await;
        state.session = Some(session);
        state.credentials = Some(credentials);
        info!(session = ?session, "logged on");
        Ok(session)
    }

    /// Ends the ambient session on the server and forgets it locally.
    pub async fn logoff(&self) -> Result<(), Fault> {
        let session = {
            let mut state = self.state.lock().await;
            state.credentials = None;
            state.session.take()
        };
        let Some(session) = session else {
            return Ok(());
        };

        let mut envelope = Envelope::new(MessageKind::Logoff, CorrelationId::new_unique(), vec![]);
        CallContext::new(session).apply_to(&mut envelope.headers);

        let reply = self.endpoint.request(self.server_addr, envelope).await?;
        if reply.kind() == Some(MessageKind::Fault) {
            return Err(Fault::from_reply(&reply));
        }
        debug!(session = ?session, "logged off");
        Ok(())
    }

    /// Invokes `interface::method` on the server and returns its result.
    pub async fn call(&self, interface: &str, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        self.call_with_context(interface, method, args, None).await
    }

    /// [ClientPipeline::call] with an opaque ambient-transaction token that
    ///  travels in the call-scoped context.
    pub async fn call_with_transaction(
        &self,
        interface: &str,
        method: &str,
        args: Vec<Value>,
        transaction: Vec<u8>,
    ) -> Result<Value, Fault> {
        self.call_with_context(interface, method, args, Some(transaction)).await
    }

    async fn call_with_context(
        &self,
        interface: &str,
        method: &str,
        args: Vec<Value>,
        transaction: Option<Vec<u8>>,
    ) -> Result<Value, Fault> {
        let session = self.state.lock().await.session.ok_or(Fault::MissingContext)?;

        match self
            .send_call(interface, method, args.clone(), transaction.clone(), session)
            .await
        {
            Err(Fault::InvalidSession) if self.config.auto_relogin => {
                let credentials = self.state.lock().await.credentials.clone();
                let Some(credentials) = credentials else {
                    return Err(Fault::InvalidSession);
                };
                // transparent re-login, then exactly one retry
                debug!("session expired - re-authenticating and retrying once");
                let session = self.logon(credentials).await?;
                self.send_call(interface, method, args, transaction, session).await
            }
            outcome => outcome,
        }
    }

    async fn send_call(
        &self,
        interface: &str,
        method: &str,
        args: Vec<Value>,
        transaction: Option<Vec<u8>>,
        session: SessionId,
    ) -> Result<Value, Fault> {
        let tracking_id = CorrelationId::new_unique();
        let descriptors = CallBody::new(method, args.clone()).callback_descriptors();

        // the local pre-invoke hook may cancel before anything is sent
        for hook in &self.hooks {
            if let HookDecision::Cancel(reason) =
                hook.before_invoke(tracking_id, interface, &descriptors, method, &args)
            {
                let fault = Fault::Canceled(reason);
                for hook in &self.hooks {
                    hook.invoke_canceled(tracking_id, &fault);
                }
                return Err(fault);
            }
        }

        let body = CallBody::new(method, args).to_bytes();
        let mut envelope = Envelope::new(MessageKind::Request, tracking_id, body)
            .with_header(keys::TARGET, HeaderValue::Str(interface.to_owned()))
            .with_header(keys::OBJECT, HeaderValue::Str(String::new()))
            .with_header(keys::DIAGNOSTICS, HeaderValue::Bool(self.config.diagnostics));
        let mut context = CallContext::new(session);
        if let Some(token) = transaction {
            context = context.with_transaction(token);
        }
        context.apply_to(&mut envelope.headers);

        let reply = self.endpoint.request(self.server_addr, envelope).await?;
        if reply.kind() == Some(MessageKind::Fault) {
            return Err(Fault::from_reply(&reply));
        }

        let value = Value::try_deser(&mut reply.body.as_slice())
            .map_err(|e| Fault::Encoding(format!("undecodable result: {}", e)))?;
        for hook in &self.hooks {
            hook.after_invoke(tracking_id, interface, method, &value);
        }
        Ok(value)
    }

    /// Registers a local callback and returns the argument value carrying
    ///  its descriptor. The callable stays here; the server gets an adapter.
    pub fn callback_arg(
        &self,
        member: &str,
        callback: impl Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    ) -> Value {
        Value::Callback(self.callbacks.register(member, false, callback))
    }

    /// Like [ClientPipeline::callback_arg], marked as an event subscription.
    pub fn event_arg(
        &self,
        member: &str,
        callback: impl Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    ) -> Value {
        Value::Callback(self.callbacks.register(member, true, callback))
    }

    /// A (connection, interface) handle for repeated calls.
    pub fn remote_object(self: &Arc<Self>, interface: &str) -> crate::client::proxy::RemoteObject {
        crate::client::proxy::RemoteObject::new(self.clone(), interface)
    }

    /// Renews the ambient session once. A transport fault here is how a
    ///  broken connection is detected between calls; it is reported through
    ///  the invoke-canceled hook and surfaced to the caller.
    pub async fn heartbeat_once(&self) -> Result<(), Fault> {
        let Some(session) = self.state.lock().await.session else {
            return Ok(());
        };

        let mut envelope = Envelope::new(MessageKind::Heartbeat, CorrelationId::new_unique(), vec![]);
        CallContext::new(session).apply_to(&mut envelope.headers);

        let outcome = match self.endpoint.request(self.server_addr, envelope).await {
            Ok(reply) if reply.kind() == Some(MessageKind::Fault) => Err(Fault::from_reply(&reply)),
            Ok(_) => Ok(()),
            Err(fault) => Err(fault),
        };

        if let Err(fault) = &outcome {
            warn!("heartbeat failed: {}", fault);
            if matches!(fault, Fault::ConnectionClosed | Fault::Framing(_)) {
                let tracking_id = CorrelationId::new_unique();
                for hook in &self.hooks {
                    hook.invoke_canceled(tracking_id, fault);
                }
            }
        }
        outcome
    }

    /// Starts the periodic heartbeat task at the configured interval.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let pipeline = self.clone();
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if pipeline.heartbeat_once().await.is_err() {
                    // keep ticking: the next call or heartbeat re-dials
                }
            }
        });

        let previous = self.heartbeat_task.lock().unwrap().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the heartbeat and closes every connection this pipeline holds.
    pub async fn shutdown(&self) {
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        self.endpoint.shutdown().await;
    }
}
