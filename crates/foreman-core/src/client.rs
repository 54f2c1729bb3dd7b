//! Thin submission client: JSON-over-TCP, one connection per call.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::protocol::{self, Message, StatusReply, TaskSubmission};

/// Submit a task and return its id.
///
/// The id is minted client-side so the caller can poll for it without a
/// response channel.
pub async fn submit_task(
    addr: SocketAddr,
    name: &str,
    data: &str,
    priority: i32,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let frame = Message::SubmitTask {
        task: TaskSubmission {
            id: Some(id),
            name: name.to_owned(),
            data: data.to_owned(),
            priority,
        },
    };
    protocol::send_message(addr, &frame)
        .await
        .with_context(|| format!("failed to submit task to {addr}"))?;
    Ok(id)
}

/// Ask the coordinator whether a task has completed.
pub async fn check_status(addr: SocketAddr, task_id: Uuid) -> Result<bool> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let frame = Message::CheckStatus { task_id };
    protocol::write_frame(&mut stream, &frame)
        .await
        .context("failed to send status check")?;

    let mut buf = Vec::with_capacity(256);
    stream
        .read_to_end(&mut buf)
        .await
        .context("failed to read status reply")?;

    let reply: StatusReply =
        serde_json::from_slice(&buf).context("malformed status reply")?;
    Ok(reply.completed)
}
