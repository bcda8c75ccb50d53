//! Receives pushed output from remote hosts and routes it to local listeners.
//!
//! A remote process is given a URL `http://<host>:<port>/<id>`; the host
//! connects back, names the id on its request line, and streams frames.
//! Each frame is routed by looking the id up again, so a listener replaced
//! under the same id takes over the stream at the next frame.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use url::Url;

use node_agent_common::wire::{self, PushFrame};
use node_agent_common::{NodeError, OutputListener};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

type Listeners = Mutex<HashMap<String, Arc<dyn OutputListener>>>;

struct Shared {
    port: u16,
    running: AtomicBool,
    listeners: Listeners,
}

impl Shared {
    fn listener(&self, id: &str) -> Option<Arc<dyn OutputListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

pub struct UrlListener {
    host: String,
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UrlListener {
    /// A listener advertising this machine's hostname.
    pub fn new(port: u16) -> Result<Self, NodeError> {
        let host = hostname::get()
            .map_err(NodeError::from)?
            .to_string_lossy()
            .into_owned();
        Self::with_host(port, host)
    }

    /// A listener advertising `host` in the URLs it hands out.
    pub fn with_host(port: u16, host: impl Into<String>) -> Result<Self, NodeError> {
        if port == 0 {
            return Err(NodeError::InvalidArgument(format!("Bad port: {}", port)));
        }
        Ok(Self {
            host: host.into(),
            shared: Arc::new(Shared {
                port,
                running: AtomicBool::new(false),
                listeners: Mutex::new(HashMap::new()),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Bind the port and accept connections on a background thread.
    pub fn start(&self) -> Result<(), NodeError> {
        let mut accept_thread = self.accept_thread.lock()?;
        if self.is_running() {
            return Err(NodeError::InvalidArgument(format!(
                "Listener on port {} is already running",
                self.port()
            )));
        }
        if let Some(stale) = accept_thread.take() {
            let _ = stale.join();
        }

        let socket = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port())))?;
        socket.set_nonblocking(true)?;
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("URL listener for server ({})", self.port()))
            .spawn(move || accept_loop(socket, shared));
        match spawned {
            Ok(handle) => {
                *accept_thread = Some(handle);
                info!(port = self.port(), "URL listener started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stop accepting; connections already open drain on their own threads.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn url_for(&self, id: &str) -> Result<Url, NodeError> {
        if id.is_empty() || id.contains('/') {
            return Err(NodeError::InvalidArgument(format!(
                "Listener id must be a non-empty path segment: {:?}",
                id
            )));
        }
        let url = format!("http://{}:{}/{}", self.host, self.port(), id);
        Url::parse(&url).map_err(|e| NodeError::InvalidArgument(format!("{}: {}", url, e)))
    }

    /// Register `listener` under `id` and return the URL remote hosts push to.
    /// An existing registration is an error unless `replace` is set.
    pub fn add_listener(
        &self,
        id: &str,
        listener: Arc<dyn OutputListener>,
        replace: bool,
    ) -> Result<Url, NodeError> {
        let url = self.url_for(id)?;
        let mut listeners = self.shared.listeners.lock()?;
        if listeners.contains_key(id) && !replace {
            return Err(NodeError::DuplicateListener(id.to_string()));
        }
        if listeners.insert(id.to_string(), listener).is_some() {
            debug!(listener = %id, "Replaced listener");
        }
        Ok(url)
    }

    pub fn remove_listener(&self, id: &str) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }
}

impl Drop for UrlListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(socket: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match socket.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                let spawned = thread::Builder::new()
                    .name(format!("URL listener connection ({})", peer))
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &shared) {
                            warn!(peer = %peer, error = %e, "Push connection failed");
                        }
                    });
                if let Err(e) = spawned {
                    error!(error = %e, "Unable to handle push connection");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(port = shared.port, error = %e, "URL listener failed, halting");
                shared.running.store(false, Ordering::Release);
                break;
            }
        }
    }
    debug!(port = shared.port, "URL listener stopped");
}

fn handle_connection(stream: TcpStream, shared: &Shared) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream);

    let mut request = String::new();
    reader.read_line(&mut request)?;
    let id = match wire::parse_request_line(&request) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, "Draining push stream without a listener id");
            None
        }
    };
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let frames = serde_json::Deserializer::from_reader(reader).into_iter::<Option<PushFrame>>();
    for frame in frames {
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e.into()),
        };
        let Some(listener) = id.as_deref().and_then(|id| shared.listener(id)) else {
            debug!(listener = ?id, "No listener for pushed frame");
            continue;
        };
        let result = match &frame {
            PushFrame::Bundle(bundle) => listener.handle_output_bundle(bundle),
            PushFrame::Heartbeat(heartbeat) => listener.handle_heartbeat(heartbeat),
        };
        if let Err(e) = result {
            warn!(listener = ?id, error = %e, "Listener failed");
        }
    }
    Ok(())
}
