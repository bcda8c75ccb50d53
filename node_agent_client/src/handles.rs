//! Blocking handles over the RPC client.
//!
//! `RemoteHostClient` connects to a host's node agent; the handles it hands
//! out share its runtime and address one remote process or listenable by id.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tarpc::client::RpcError;
use tarpc::context::{self, Context};
use thiserror::Error;
use tokio::runtime;
use url::Url;

use node_agent_common::{
    NodeError, OutputPolicy, ProcessDescription, ProcessId, ProcessStatus,
    RemoteHostServiceClient, RemoteListenableConfig,
};

use crate::client::build_client;

/// Deadline for calls that may block until a process exits.
const LONG_CALL: Duration = Duration::from_secs(24 * 60 * 60);
/// Covers a destroy that escalates to SIGKILL.
const DESTROY_CALL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Unable to connect: {0}")]
    Connect(String),
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl ClientError {
    /// The host-side error, if the call reached the host.
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            ClientError::Node(e) => Some(e),
            _ => None,
        }
    }
}

fn context_with_deadline(timeout: Duration) -> Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + timeout;
    ctx
}

#[derive(Clone)]
pub struct RemoteHostClient {
    tokio_runtime: Arc<runtime::Runtime>,
    client: RemoteHostServiceClient,
}

impl RemoteHostClient {
    pub fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let tokio_runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let client = tokio_runtime
            .block_on(build_client((host, port)))
            .map_err(|e| ClientError::Connect(format!("{}:{}: {}", host, port, e)))?;
        Ok(Self {
            tokio_runtime: Arc::new(tokio_runtime),
            client,
        })
    }

    fn call<F, R>(&self, fut: F) -> Result<R, ClientError>
    where
        F: Future<Output = Result<R, RpcError>>,
    {
        Ok(self.tokio_runtime.block_on(fut)?)
    }

    fn run_in_runtime<F, R>(&self, fut: F) -> Result<R, ClientError>
    where
        F: Future<Output = Result<Result<R, NodeError>, RpcError>>,
    {
        Ok(self.tokio_runtime.block_on(fut)??)
    }

    /// Milliseconds on the host clock.
    pub fn ping(&self) -> Result<u64, ClientError> {
        self.call(self.client.ping(context::current()))
    }

    pub fn create_remote_process(
        &self,
        description: ProcessDescription,
        config: RemoteListenableConfig,
    ) -> Result<RemoteProcessHandle, ClientError> {
        let id = self.run_in_runtime(self.client.create_remote_process(
            context::current(),
            description,
            config,
        ))?;
        Ok(self.process_handle(id))
    }

    /// Exit value of the killed process, or `EXIT_UNAVAILABLE`.
    pub fn kill_remote_process(&self, name: &str) -> Result<i32, ClientError> {
        self.call(
            self.client
                .kill_remote_process(context_with_deadline(DESTROY_CALL), name.to_string()),
        )
    }

    pub fn get_process_description(
        &self,
        name: &str,
    ) -> Result<Option<ProcessDescription>, ClientError> {
        self.call(
            self.client
                .get_process_description(context::current(), name.to_string()),
        )
    }

    pub fn get_remote_process(&self, name: &str) -> Result<Option<RemoteProcessHandle>, ClientError> {
        let id = self.call(
            self.client
                .get_remote_process(context::current(), name.to_string()),
        )?;
        Ok(id.map(|id| self.process_handle(id)))
    }

    pub fn list_process_descriptions(
        &self,
        group: Option<&str>,
    ) -> Result<Vec<ProcessDescription>, ClientError> {
        self.call(
            self.client
                .list_process_descriptions(context::current(), group.map(str::to_string)),
        )
    }

    fn process_handle(&self, id: ProcessId) -> RemoteProcessHandle {
        RemoteProcessHandle {
            host: self.clone(),
            id,
        }
    }
}

/// A process running under a remote node agent.
#[derive(Clone)]
pub struct RemoteProcessHandle {
    host: RemoteHostClient,
    id: ProcessId,
}

impl RemoteProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn is_alive(&self) -> Result<bool, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.is_alive(context::current(), self.id))
    }

    pub fn exit_value(&self) -> Result<i32, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.exit_value(context::current(), self.id))
    }

    /// Block until destroyed or `timeout` passes; `EXIT_UNAVAILABLE` while alive.
    pub fn wait_for(&self, timeout: Option<Duration>) -> Result<i32, ClientError> {
        let h = &self.host;
        let deadline = timeout.map_or(LONG_CALL, |t| t + Duration::from_secs(10));
        let millis = timeout.map(|t| t.as_millis() as u64);
        h.run_in_runtime(
            h.client
                .wait_for(context_with_deadline(deadline), self.id, millis),
        )
    }

    pub fn destroy(&self) -> Result<i32, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.destroy(context_with_deadline(DESTROY_CALL), self.id))
    }

    pub fn dump_threads(&self) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.dump_threads(context::current(), self.id))
    }

    pub fn list_processes(&self, show_all: bool) -> Result<Vec<ProcessStatus>, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.list_processes(context::current(), self.id, show_all))
    }

    /// Drop the host's record of this destroyed process.
    pub fn release(self) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.release_process(context::current(), self.id))
    }

    pub fn remote_listenable(&self) -> RemoteListenableHandle {
        RemoteListenableHandle {
            host: self.host.clone(),
            id: self.id,
        }
    }
}

/// Output fan-out of a remote process. Listeners are registered by URL.
#[derive(Clone)]
pub struct RemoteListenableHandle {
    host: RemoteHostClient,
    id: ProcessId,
}

impl RemoteListenableHandle {
    pub fn list(&self) -> Result<Vec<String>, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.list_listeners(context::current(), self.id))
    }

    pub fn add_listener(&self, url: &Url) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.add_url_listener(context::current(), self.id, url.clone()))
    }

    pub fn remove_listener(&self, url: &Url) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(
            h.client
                .remove_url_listener(context::current(), self.id, url.clone()),
        )
    }

    pub fn output_policy(&self) -> Result<OutputPolicy, ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.get_output_policy(context::current(), self.id))
    }

    pub fn set_output_policy(&self, policy: OutputPolicy) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.set_output_policy(context::current(), self.id, policy))
    }

    pub fn flush_output(&self) -> Result<(), ClientError> {
        let h = &self.host;
        h.run_in_runtime(h.client.flush_output(context::current(), self.id))
    }
}
