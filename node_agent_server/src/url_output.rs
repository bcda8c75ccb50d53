use std::io::{BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{debug, warn};
use url::Url;

use node_agent_common::wire::{self, Heartbeat};
use node_agent_common::{NodeError, OutputBundle, OutputListener};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

enum Connection {
    Idle,
    Open(BufWriter<TcpStream>),
    Closed,
}

/// Pushes output to a remote `UrlListener`.
///
/// The connection is opened on the first push and kept for the life of the
/// registration; `close` ends the stream with the end marker. Pushes after
/// `close` are dropped.
pub struct UrlOutputListener {
    url: Url,
    stream: Mutex<Connection>,
}

impl UrlOutputListener {
    pub fn new(url: Url) -> Result<Self, NodeError> {
        if url.host_str().is_none() || url.port_or_known_default().is_none() {
            return Err(NodeError::InvalidArgument(format!(
                "Listener URL needs a host and port: {}",
                url
            )));
        }
        Ok(Self {
            url,
            stream: Mutex::new(Connection::Idle),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn connect(&self) -> anyhow::Result<BufWriter<TcpStream>> {
        let addrs = self.url.socket_addrs(|| None)?;
        let addr = addrs
            .first()
            .ok_or_else(|| anyhow!("{} resolves to no address", self.url))?;
        let stream = TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)
            .with_context(|| format!("connecting to {}", self.url))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let mut writer = BufWriter::new(stream);
        writer.write_all(wire::request_header(self.url.path()).as_bytes())?;
        debug!(url = %self.url, "Connected output listener");
        Ok(writer)
    }

    fn send<F>(&self, write: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut BufWriter<TcpStream>) -> Result<(), NodeError>,
    {
        let mut conn = self.stream.lock().map_err(|_| anyhow!(NodeError::LockError))?;
        if let Connection::Idle = *conn {
            *conn = Connection::Open(self.connect()?);
        }
        let Connection::Open(writer) = &mut *conn else {
            debug!(url = %self.url, "Dropping push to closed output listener");
            return Ok(());
        };
        let result = write(writer).map_err(anyhow::Error::from).and_then(|_| {
            writer.flush()?;
            Ok(())
        });
        if result.is_err() {
            // a broken stream is not resumable mid-frame
            *conn = Connection::Idle;
        }
        result
    }

    /// Send the end marker and drop the connection, if one was opened.
    pub fn close(&self) {
        let Ok(mut conn) = self.stream.lock() else {
            return;
        };
        if let Connection::Open(mut writer) = std::mem::replace(&mut *conn, Connection::Closed) {
            if let Err(e) = wire::write_end(&mut writer) {
                warn!(url = %self.url, error = %e, "Unable to close output stream");
            }
            if let Ok(stream) = writer.into_inner() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl OutputListener for UrlOutputListener {
    fn handle_output_bundle(&self, bundle: &OutputBundle) -> anyhow::Result<()> {
        self.send(|w| wire::write_bundle(w, bundle))
    }

    fn handle_output_bundles(&self, bundles: &[OutputBundle]) -> anyhow::Result<()> {
        self.send(|w| bundles.iter().try_for_each(|b| wire::write_bundle(w, b)))
    }

    fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> anyhow::Result<()> {
        self.send(|w| wire::write_heartbeat(w, heartbeat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_agent_common::wire::PushFrame;
    use node_agent_common::Channel;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    #[test]
    fn test_pushes_header_frames_and_end_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut blank = String::new();
            reader.read_line(&mut blank).unwrap();
            let frames: Vec<Option<PushFrame>> = serde_json::Deserializer::from_reader(reader)
                .into_iter()
                .collect::<Result<_, _>>()
                .unwrap();
            (request, blank, frames)
        });

        let url = Url::parse(&format!("http://127.0.0.1:{}/console", port)).unwrap();
        let out = UrlOutputListener::new(url).unwrap();
        let mut bundle = OutputBundle::with_timestamp("node", 1);
        bundle.append_output(Channel::Out, b"hello");
        out.handle_output_bundles(&[bundle.clone()]).unwrap();
        out.handle_heartbeat(&Heartbeat {
            name: "node".into(),
            timestamp: 2,
        })
        .unwrap();
        out.close();

        let (request, blank, frames) = reader.join().unwrap();
        assert_eq!(request, "PUT /console HTTP/1.0\r\n");
        assert_eq!(blank, "\r\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Some(PushFrame::Bundle(bundle)));
        assert!(matches!(frames[1], Some(PushFrame::Heartbeat(_))));
        assert_eq!(frames[2], None);
    }

    #[test]
    fn test_push_after_close_does_not_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{}/console", port)).unwrap();
        let out = UrlOutputListener::new(url).unwrap();
        let heartbeat = Heartbeat {
            name: "node".into(),
            timestamp: 1,
        };

        out.handle_heartbeat(&heartbeat).unwrap();
        let (stream, _) = listener.accept().unwrap();
        out.close();
        let frames: Vec<Option<PushFrame>> = {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            reader.read_line(&mut line).unwrap();
            serde_json::Deserializer::from_reader(reader)
                .into_iter()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(frames.last(), Some(&None));

        out.handle_heartbeat(&heartbeat).unwrap();
        out.handle_output_bundle(&OutputBundle::new("node")).unwrap();
        out.close();

        listener.set_nonblocking(true).unwrap();
        let second = listener.accept();
        assert!(matches!(second, Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock));
    }

    #[test]
    fn test_close_before_first_push() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{}/idle", port)).unwrap();
        let out = UrlOutputListener::new(url).unwrap();
        out.close();
        out.handle_output_bundle(&OutputBundle::new("node")).unwrap();

        listener.set_nonblocking(true).unwrap();
        assert!(listener.accept().is_err());
    }

    #[test]
    fn test_unreachable_consumer_fails_push() {
        let port = {
            let socket = TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{}/gone", port)).unwrap();
        let out = UrlOutputListener::new(url).unwrap();
        assert!(out
            .handle_output_bundle(&OutputBundle::new("node"))
            .is_err());
    }

    #[test]
    fn test_url_needs_host() {
        assert!(UrlOutputListener::new(Url::parse("file:///tmp/x").unwrap()).is_err());
    }
}
