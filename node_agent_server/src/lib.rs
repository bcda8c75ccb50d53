pub mod config;
pub mod launch;
pub mod listenable;
pub mod process;
pub mod server;
pub mod state;
pub mod system;
pub mod url_output;
mod util;

pub use config::{ServerConfig, SupervisorConfig};
pub use listenable::RemoteListenable;
pub use process::RemoteProcess;
pub use server::{listen, NodeAgentServer};
pub use state::ProcessManager;
