//! Wire protocol: one JSON object per TCP connection.
//!
//! Every message is a single serde-tagged object written on an otherwise
//! unused connection; the sender closes its write side to delimit the
//! frame. Receive frames are capped at [`MAX_FRAME_BYTES`]. Unknown JSON
//! fields are ignored so peers can evolve independently.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Maximum size of a received frame.
pub const MAX_FRAME_BYTES: usize = 4096;

/// Decode failure for an incoming frame.
///
/// Transport failures (connect/send/recv) stay `std::io::Error`; this type
/// covers only what arrives but cannot be understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection without sending any data.
    #[error("connection closed before a frame arrived")]
    Eof,
    /// The peer sent more than [`MAX_FRAME_BYTES`] bytes.
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,
    /// Socket read failed mid-frame.
    #[error("failed to read frame")]
    Recv(#[source] std::io::Error),
    /// Unparseable JSON, missing required field, bad UUID, or unknown type.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// A protocol message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client asks the coordinator to accept a new task.
    SubmitTask { task: TaskSubmission },
    /// Coordinator hands a task to a worker. Emitted only; the coordinator
    /// never accepts this kind on its own listener.
    NewTask { task: TaskDescriptor },
    /// Worker reports a finished task on a fresh connection.
    TaskCompleted { task_id: Uuid, worker_id: Uuid },
    /// Worker asserts liveness and reports its synthetic load.
    ///
    /// `listen_port` is the port of the worker's own listening socket; the
    /// coordinator cannot learn it from the inbound connection, so the
    /// first heartbeat from an unknown id doubles as registration at
    /// (peer IP, listen_port).
    Heartbeat {
        worker_id: Uuid,
        load: f32,
        listen_port: u16,
    },
    /// Client asks whether a task has completed.
    CheckStatus { task_id: Uuid },
}

/// Task fields accepted on `submit_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Client-chosen id; generated by the coordinator when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub data: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Task fields carried on `new_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: Uuid,
    pub name: String,
    pub data: String,
    pub priority: i32,
}

/// Reply to `check_status`, written back on the same socket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub completed: bool,
}

fn default_priority() -> i32 {
    1
}

/// Read one frame from the stream: accumulate until the peer closes its
/// write side (or the cap is hit), then parse a single JSON object.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Message, ProtocolError> {
    let buf = read_raw(stream).await?;
    decode(&buf)
}

/// Decode a complete frame buffer into a [`Message`].
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(buf).map_err(ProtocolError::Malformed)
}

async fn read_raw(stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; MAX_FRAME_BYTES];
    let mut total = 0;

    loop {
        let n = stream
            .read(&mut buf[total..])
            .await
            .map_err(ProtocolError::Recv)?;
        if n == 0 {
            break;
        }
        total += n;
        if total == MAX_FRAME_BYTES {
            // The buffer is full; anything further is over the cap.
            let mut probe = [0u8; 1];
            let extra = stream.read(&mut probe).await.map_err(ProtocolError::Recv)?;
            if extra > 0 {
                return Err(ProtocolError::FrameTooLarge);
            }
            break;
        }
    }

    if total == 0 {
        return Err(ProtocolError::Eof);
    }
    buf.truncate(total);
    Ok(buf)
}

/// Write one frame to the stream and close the write side to delimit it.
pub async fn write_frame(stream: &mut TcpStream, message: &Message) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(message).map_err(std::io::Error::other)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Connect to `addr`, send one frame, and close the connection.
pub async fn send_message(addr: SocketAddr, message: &Message) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, message).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_task_decodes_with_defaults() {
        let raw = br#"{"type":"submit_task","task":{"name":"A","data":"payload"}}"#;
        let msg = decode(raw).expect("should decode");
        match msg {
            Message::SubmitTask { task } => {
                assert!(task.id.is_none());
                assert_eq!(task.name, "A");
                assert_eq!(task.data, "payload");
                assert_eq!(task.priority, 1, "priority defaults to 1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = br#"{"type":"heartbeat","worker_id":"9f2c1a34-5b6d-4e7f-8a9b-0c1d2e3f4a5b","load":0.25,"listen_port":9001,"hostname":"ignored"}"#;
        let msg = decode(raw).expect("should decode despite extra field");
        match msg {
            Message::Heartbeat {
                load, listen_port, ..
            } => {
                assert!((load - 0.25).abs() < f32::EPSILON);
                assert_eq!(listen_port, 9001);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_malformed() {
        let raw = br#"{"type":"resize_cluster","nodes":3}"#;
        let err = decode(raw).expect_err("unknown type should fail");
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn bad_uuid_is_malformed() {
        let raw = br#"{"type":"task_completed","task_id":"not-a-uuid","worker_id":"also-bad"}"#;
        let err = decode(raw).expect_err("bad uuid should fail");
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn missing_field_is_malformed() {
        let raw = br#"{"type":"submit_task","task":{"name":"A"}}"#;
        let err = decode(raw).expect_err("missing data field should fail");
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn new_task_roundtrip() {
        let msg = Message::NewTask {
            task: TaskDescriptor {
                id: Uuid::new_v4(),
                name: "ImageResizing".into(),
                data: "resize product images".into(),
                priority: 4,
            },
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn wire_tag_is_snake_case() {
        let msg = Message::CheckStatus {
            task_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"check_status""#), "got: {json}");
    }
}
