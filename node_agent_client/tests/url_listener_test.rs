mod common;

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use common::{free_port, wait_until, Recorder};
use node_agent_client::UrlListener;
use node_agent_common::wire;
use node_agent_common::{Channel, NodeError, OutputBundle};

fn push(port: u16, path: &str, bundles: &[OutputBundle]) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(wire::request_header(path).as_bytes())
        .unwrap();
    for bundle in bundles {
        wire::write_bundle(&mut stream, bundle).unwrap();
    }
    wire::write_end(&mut stream).unwrap();
}

fn bundle(text: &str) -> OutputBundle {
    let mut bundle = OutputBundle::new("node");
    bundle.append_output(Channel::Out, text.as_bytes());
    bundle
}

fn started() -> UrlListener {
    let listener = UrlListener::with_host(free_port(), "127.0.0.1").unwrap();
    listener.start().unwrap();
    listener
}

#[test]
fn test_routes_frames_by_id() {
    let listener = started();
    let console = Arc::new(Recorder::default());
    let url = listener.add_listener("console", console.clone(), false).unwrap();
    assert_eq!(url.path(), "/console");

    push(listener.port(), "/nobody", &[bundle("lost")]);
    push(listener.port(), url.path(), &[bundle("one"), bundle("two")]);

    assert!(wait_until(|| console.bundles().len() == 2));
    assert_eq!(console.channel(Channel::Out), "onetwo");
}

#[test]
fn test_duplicate_id_needs_replace() {
    let listener = started();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    listener.add_listener("ui", first.clone(), false).unwrap();
    assert_eq!(
        listener.add_listener("ui", second.clone(), false).err(),
        Some(NodeError::DuplicateListener("ui".to_string()))
    );
    listener.add_listener("ui", second.clone(), true).unwrap();

    push(listener.port(), "/ui", &[bundle("x")]);
    assert!(wait_until(|| second.bundles().len() == 1));
    assert!(first.bundles().is_empty());

    assert!(listener.remove_listener("ui"));
    assert!(!listener.remove_listener("ui"));
}

#[test]
fn test_start_stop() {
    let listener = started();
    assert!(listener.is_running());
    assert!(listener.start().is_err());
    listener.stop();
    assert!(!listener.is_running());
    listener.start().unwrap();
    assert!(listener.is_running());
}
