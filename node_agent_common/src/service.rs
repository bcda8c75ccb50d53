use crate::node_error::NodeError;
use crate::{
    OutputPolicy, ProcessDescription, ProcessId, ProcessStatus, RemoteListenableConfig,
};
use url::Url;

#[tarpc::service]
pub trait RemoteHostService {
    // Host
    /// Current time in milliseconds on the host.
    async fn ping() -> u64;

    async fn create_remote_process(
        description: ProcessDescription,
        config: RemoteListenableConfig,
    ) -> Result<ProcessId, NodeError>;

    /// Exit value of the killed process, or `EXIT_UNAVAILABLE` for an unknown name.
    async fn kill_remote_process(name: String) -> i32;

    async fn get_process_description(name: String) -> Option<ProcessDescription>;

    async fn get_remote_process(name: String) -> Option<ProcessId>;

    async fn list_process_descriptions(group: Option<String>) -> Vec<ProcessDescription>;

    /// Forget a process handle; its name may already be reused.
    async fn release_process(proc_id: ProcessId) -> Result<(), NodeError>;

    // Process
    async fn is_alive(proc_id: ProcessId) -> Result<bool, NodeError>;

    async fn exit_value(proc_id: ProcessId) -> Result<i32, NodeError>;

    /// Block until the process is destroyed, or for at most `millis`.
    async fn wait_for(proc_id: ProcessId, millis: Option<u64>) -> Result<i32, NodeError>;

    async fn destroy(proc_id: ProcessId) -> Result<i32, NodeError>;

    async fn dump_threads(proc_id: ProcessId) -> Result<(), NodeError>;

    async fn list_processes(
        proc_id: ProcessId,
        show_all: bool,
    ) -> Result<Vec<ProcessStatus>, NodeError>;

    // Output listeners
    // In-process listener objects can't cross the wire, so remote clients
    // register a URL served by a `UrlListener`.
    async fn list_listeners(proc_id: ProcessId) -> Result<Vec<String>, NodeError>;

    async fn add_url_listener(proc_id: ProcessId, url: Url) -> Result<(), NodeError>;

    async fn remove_url_listener(proc_id: ProcessId, url: Url) -> Result<(), NodeError>;

    async fn get_output_policy(proc_id: ProcessId) -> Result<OutputPolicy, NodeError>;

    async fn set_output_policy(proc_id: ProcessId, policy: OutputPolicy) -> Result<(), NodeError>;

    async fn flush_output(proc_id: ProcessId) -> Result<(), NodeError>;
}
