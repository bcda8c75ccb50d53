//! Push-delivery socket format.
//!
//! A pushing host opens a TCP connection and sends a one-line request
//! header, `PUT /<listener-id> HTTP/1.0`, optional header lines, and a blank
//! line. What follows is a stream of JSON values, each an
//! `Option<PushFrame>`; a `null` marks the end of the stream.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{NodeError, OutputBundle};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PushFrame {
    Bundle(OutputBundle),
    Heartbeat(Heartbeat),
}

pub fn request_header(path: &str) -> String {
    format!("PUT {} HTTP/1.0\r\n\r\n", path)
}

/// Listener id named by a request line such as `PUT /console HTTP/1.0`.
pub fn parse_request_line(line: &str) -> Result<String, NodeError> {
    let mut parts = line.split_whitespace();
    let path = match (parts.next(), parts.next()) {
        (Some(_method), Some(path)) => path,
        _ => {
            return Err(NodeError::ProtocolError(format!(
                "Malformed request line: {:?}",
                line.trim_end()
            )))
        }
    };
    let path = path.strip_prefix('/').unwrap_or(path);
    let id = path.rsplit('/').next().unwrap_or(path);
    if id.is_empty() {
        return Err(NodeError::ProtocolError(format!(
            "Missing listener id in {:?}",
            line.trim_end()
        )));
    }
    Ok(id.to_string())
}

// Serializes exactly like `PushFrame` without cloning the payload.
#[derive(Serialize)]
enum PushFrameRef<'a> {
    Bundle(&'a OutputBundle),
    Heartbeat(&'a Heartbeat),
}

fn write_frame<W: Write>(writer: &mut W, frame: PushFrameRef<'_>) -> Result<(), NodeError> {
    serde_json::to_writer(&mut *writer, &Some(frame))?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub fn write_bundle<W: Write>(writer: &mut W, bundle: &OutputBundle) -> Result<(), NodeError> {
    write_frame(writer, PushFrameRef::Bundle(bundle))
}

pub fn write_heartbeat<W: Write>(writer: &mut W, heartbeat: &Heartbeat) -> Result<(), NodeError> {
    write_frame(writer, PushFrameRef::Heartbeat(heartbeat))
}

pub fn write_end<W: Write>(writer: &mut W) -> Result<(), NodeError> {
    serde_json::to_writer(&mut *writer, &None::<PushFrame>)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
