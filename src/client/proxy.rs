use std::sync::Arc;

use crate::client::pipeline::ClientPipeline;
use crate::fault::Fault;
use crate::wire::value::Value;

/// A remote component as seen from the client: nothing but the pipeline's
///  connection and an interface name used to route envelopes. No distributed
///  object identity, no leases.
#[derive(Clone)]
pub struct RemoteObject {
    pipeline: Arc<ClientPipeline>,
    interface: String,
}

impl RemoteObject {
    pub(crate) fn new(pipeline: Arc<ClientPipeline>, interface: &str) -> RemoteObject {
        RemoteObject {
            pipeline,
            interface: interface.to_owned(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        self.pipeline.call(&self.interface, method, args).await
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteObject{{interface:{}}}", self.interface)
    }
}
