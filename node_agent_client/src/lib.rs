mod client;
mod handles;
mod url_listener;

pub use client::build_client;
pub use handles::{ClientError, RemoteHostClient, RemoteListenableHandle, RemoteProcessHandle};
pub use url_listener::UrlListener;
