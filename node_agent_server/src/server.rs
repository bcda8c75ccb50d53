use std::future::{ready, Future, Ready};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{future, StreamExt};
use tarpc::context::Context;
use tarpc::server::incoming::Incoming;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Json;
use tracing::{debug, error, info};
use url::Url;

use node_agent_common::{
    NodeError, OutputPolicy, ProcessDescription, ProcessId, ProcessStatus,
    RemoteHostService, RemoteListenableConfig,
};

use crate::process::RemoteProcess;
use crate::state::ProcessManager;

type BlockingFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Run `f` on the blocking pool; `on_panic` stands in if it panics.
fn run_blocking<T, F>(f: F, on_panic: T) -> BlockingFut<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Box::pin(async move {
        tokio::task::spawn_blocking(f).await.unwrap_or_else(|e| {
            error!(error = %e, "Blocking task failed");
            on_panic
        })
    })
}

macro_rules! check_process {
    ($state:expr, $proc_id:expr) => {
        match $state.process($proc_id) {
            Ok(process) => process,
            Err(e) => return ready(Err(e)),
        }
    };
}

#[derive(Clone)]
pub struct NodeAgentServer {
    peer: SocketAddr,
    state: Arc<ProcessManager>,
}

impl NodeAgentServer {
    pub fn new(peer: SocketAddr, state: Arc<ProcessManager>) -> Self {
        Self { peer, state }
    }

    fn blocking_on_process<T, F>(&self, proc_id: ProcessId, f: F) -> BlockingFut<Result<T, NodeError>>
    where
        F: FnOnce(RemoteProcess) -> Result<T, NodeError> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state.clone();
        run_blocking(move || f(state.process(proc_id)?), Err(NodeError::Unknown))
    }
}

#[tarpc::server]
impl RemoteHostService for NodeAgentServer {
    type PingFut = Ready<u64>;
    fn ping(self, _: Context) -> Self::PingFut {
        ready(self.state.ping())
    }

    type CreateRemoteProcessFut = BlockingFut<Result<ProcessId, NodeError>>;
    fn create_remote_process(
        self,
        _: Context,
        description: ProcessDescription,
        config: RemoteListenableConfig,
    ) -> Self::CreateRemoteProcessFut {
        debug!(peer = %self.peer, %description, "Create requested");
        let state = self.state;
        run_blocking(
            move || {
                state
                    .create_remote_process(description, &config, None)
                    .map(|(id, _)| id)
            },
            Err(NodeError::Unknown),
        )
    }

    type KillRemoteProcessFut = BlockingFut<i32>;
    fn kill_remote_process(self, _: Context, name: String) -> Self::KillRemoteProcessFut {
        let state = self.state;
        run_blocking(
            move || state.kill_remote_process(&name),
            node_agent_common::EXIT_UNAVAILABLE,
        )
    }

    type GetProcessDescriptionFut = Ready<Option<ProcessDescription>>;
    fn get_process_description(self, _: Context, name: String) -> Self::GetProcessDescriptionFut {
        ready(self.state.get_process_description(&name))
    }

    type GetRemoteProcessFut = BlockingFut<Option<ProcessId>>;
    fn get_remote_process(self, _: Context, name: String) -> Self::GetRemoteProcessFut {
        let state = self.state;
        run_blocking(
            move || state.get_remote_process(&name).map(|(id, _)| id),
            None,
        )
    }

    type ListProcessDescriptionsFut = Ready<Vec<ProcessDescription>>;
    fn list_process_descriptions(
        self,
        _: Context,
        group: Option<String>,
    ) -> Self::ListProcessDescriptionsFut {
        ready(self.state.list_process_descriptions(group.as_deref()))
    }

    type ReleaseProcessFut = Ready<Result<(), NodeError>>;
    fn release_process(self, _: Context, proc_id: ProcessId) -> Self::ReleaseProcessFut {
        ready(self.state.release_process(proc_id))
    }

    type IsAliveFut = Ready<Result<bool, NodeError>>;
    fn is_alive(self, _: Context, proc_id: ProcessId) -> Self::IsAliveFut {
        let process = check_process!(self.state, proc_id);
        ready(Ok(process.is_alive()))
    }

    type ExitValueFut = Ready<Result<i32, NodeError>>;
    fn exit_value(self, _: Context, proc_id: ProcessId) -> Self::ExitValueFut {
        let process = check_process!(self.state, proc_id);
        ready(Ok(process.exit_value()))
    }

    type WaitForFut = BlockingFut<Result<i32, NodeError>>;
    fn wait_for(self, _: Context, proc_id: ProcessId, millis: Option<u64>) -> Self::WaitForFut {
        self.blocking_on_process(proc_id, move |process| {
            Ok(process.wait_for(millis.map(Duration::from_millis)))
        })
    }

    type DestroyFut = BlockingFut<Result<i32, NodeError>>;
    fn destroy(self, _: Context, proc_id: ProcessId) -> Self::DestroyFut {
        self.blocking_on_process(proc_id, |process| Ok(process.destroy()))
    }

    type DumpThreadsFut = Ready<Result<(), NodeError>>;
    fn dump_threads(self, _: Context, proc_id: ProcessId) -> Self::DumpThreadsFut {
        let process = check_process!(self.state, proc_id);
        ready(process.dump_threads())
    }

    type ListProcessesFut = BlockingFut<Result<Vec<ProcessStatus>, NodeError>>;
    fn list_processes(
        self,
        _: Context,
        proc_id: ProcessId,
        show_all: bool,
    ) -> Self::ListProcessesFut {
        self.blocking_on_process(proc_id, move |process| process.list_processes(show_all))
    }

    type ListListenersFut = Ready<Result<Vec<String>, NodeError>>;
    fn list_listeners(self, _: Context, proc_id: ProcessId) -> Self::ListListenersFut {
        let process = check_process!(self.state, proc_id);
        ready(Ok(process.remote_listenable().list()))
    }

    type AddUrlListenerFut = Ready<Result<(), NodeError>>;
    fn add_url_listener(self, _: Context, proc_id: ProcessId, url: Url) -> Self::AddUrlListenerFut {
        let process = check_process!(self.state, proc_id);
        ready(process.remote_listenable().add_url_listener(&url))
    }

    type RemoveUrlListenerFut = BlockingFut<Result<(), NodeError>>;
    fn remove_url_listener(
        self,
        _: Context,
        proc_id: ProcessId,
        url: Url,
    ) -> Self::RemoveUrlListenerFut {
        self.blocking_on_process(proc_id, move |process| {
            process.remote_listenable().remove_url_listener(&url)
        })
    }

    type GetOutputPolicyFut = Ready<Result<OutputPolicy, NodeError>>;
    fn get_output_policy(self, _: Context, proc_id: ProcessId) -> Self::GetOutputPolicyFut {
        let process = check_process!(self.state, proc_id);
        ready(Ok(process.remote_listenable().output_policy()))
    }

    type SetOutputPolicyFut = BlockingFut<Result<(), NodeError>>;
    fn set_output_policy(
        self,
        _: Context,
        proc_id: ProcessId,
        policy: OutputPolicy,
    ) -> Self::SetOutputPolicyFut {
        self.blocking_on_process(proc_id, move |process| {
            process.remote_listenable().set_output_policy(policy)
        })
    }

    type FlushOutputFut = BlockingFut<Result<(), NodeError>>;
    fn flush_output(self, _: Context, proc_id: ProcessId) -> Self::FlushOutputFut {
        self.blocking_on_process(proc_id, |process| process.remote_listenable().flush_output())
    }
}

/// Bind the RPC service; the returned future serves connections until dropped.
pub async fn listen(
    addr: SocketAddr,
    state: Arc<ProcessManager>,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let mut listener = tarpc::serde_transport::tcp::listen(addr, Json::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();
    info!(addr = %local_addr, "Listening");

    let serve = listener
        .filter_map(|r| future::ready(r.ok()))
        .map(BaseChannel::with_defaults)
        .max_channels_per_key(16, |t| format!("{:?}", t.transport().peer_addr().map(|a| a.ip()).ok()))
        .map(move |channel| {
            let peer = channel
                .transport()
                .peer_addr()
                .unwrap_or(local_addr);
            debug!(peer = %peer, "Client connected");
            let server = NodeAgentServer::new(peer, state.clone());
            channel.execute(server.serve())
        })
        .buffer_unordered(64)
        .for_each(|_| async {});
    Ok((local_addr, serve))
}
