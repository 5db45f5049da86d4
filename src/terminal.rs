//! Raw command-line passthrough over a WebSocket.
//!
//! Each inbound text frame is one shell command line. Its output goes back verbatim to the
//! same socket only; nothing is broadcast, accumulated or stored.
use std::collections::VecDeque;

use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tracing::{info, warn};

use crate::runner::{run_command, ChunkSink, CommandSpec};

pub async fn terminal_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(run_terminal)
}

/// Commands run one at a time in arrival order. Closing the socket kills the running one.
async fn run_terminal(socket: WebSocket) {
    info!("terminal connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut queued = VecDeque::new();

    loop {
        let line = match queued.pop_front() {
            Some(line) => line,
            None => match next_line(&mut ws_receiver).await {
                Some(line) => line,
                None => break,
            },
        };

        let mut sink = SocketSink {
            sender: &mut ws_sender,
            open: true,
        };
        let finished = tokio::select! {
            _ = execute_line(&line, &mut sink) => true,
            _ = queue_until_closed(&mut ws_receiver, &mut queued) => false,
        };
        if !finished {
            info!(command = %line, "terminal closed mid-command, command killed");
            break;
        }
        if !sink.open {
            break;
        }
    }
    info!("terminal disconnected");
}

/// Next text frame, or `None` once the client has gone away.
async fn next_line(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "terminal socket error");
                return None;
            }
        }
    }
    None
}

/// Hold lines typed while a command runs; resolves when the client goes away.
async fn queue_until_closed(
    receiver: &mut SplitStream<WebSocket>,
    queued: &mut VecDeque<String>,
) {
    while let Some(line) = next_line(receiver).await {
        queued.push_back(line);
    }
}

/// Run one command line through the shell, streaming into `sink`.
///
/// Blank lines are ignored and return `None`.
pub async fn execute_line<S: ChunkSink + ?Sized>(line: &str, sink: &mut S) -> Option<i32> {
    if line.trim().is_empty() {
        return None;
    }
    info!(command = line, "executing terminal command");
    Some(run_command(&CommandSpec::shell(line), sink).await)
}

struct SocketSink<'a> {
    sender: &'a mut SplitSink<WebSocket, Message>,
    open: bool,
}

#[async_trait]
impl ChunkSink for SocketSink<'_> {
    async fn on_chunk(&mut self, text: String) {
        if !self.open {
            return;
        }
        if self.sender.send(Message::Text(text.into())).await.is_err() {
            self.open = false;
        }
    }
}
