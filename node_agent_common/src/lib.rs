mod dual_stream_buffer;
mod listener;
mod node_error;
mod output_bundle;
mod service;
mod types;
pub mod wire;

pub use dual_stream_buffer::*;
pub use listener::*;
pub use node_error::*;
pub use output_bundle::*;
pub use service::*;
pub use types::*;
