//! Shared helpers for gateway integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use tg_protocol::{Instruction, InstructionCodec};

/// How the fake daemon treats each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Complete the handshake, send one `sync`, then record client traffic
    Serve,
    /// Answer `select` with an `error` instruction
    Reject,
    /// Complete the handshake, then never send anything again
    Silent,
}

/// A scripted stand-in for a Guacamole backend daemon
pub struct FakeGuacd {
    pub addr: SocketAddr,
    /// Every instruction received, across all connections, in order
    pub received: mpsc::UnboundedReceiver<Instruction>,
}

impl FakeGuacd {
    /// Start listening on an ephemeral port
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut sessions = 0u32;
            while let Ok((stream, _)) = listener.accept().await {
                sessions += 1;
                let session_id = format!("$session-{}", sessions);
                tokio::spawn(serve(Framed::new(stream, InstructionCodec::new()), behavior, session_id, tx.clone()));
            }
        });

        Self { addr, received }
    }

    /// Wait for the next instruction with the given opcode
    pub async fn next(&mut self, opcode: &str) -> Instruction {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let instruction = self.received.recv().await.expect("fake daemon stopped");
                if instruction.is(opcode) {
                    return instruction;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", opcode))
    }
}

async fn serve(
    mut framed: Framed<tokio::net::TcpStream, InstructionCodec>,
    behavior: Behavior,
    session_id: String,
    received: mpsc::UnboundedSender<Instruction>,
) {
    // select
    let Some(Ok(select)) = framed.next().await else { return };
    let _ = received.send(select);

    if behavior == Behavior::Reject {
        let _ = framed.send(Instruction::error("Unsupported protocol", "519")).await;
        return;
    }

    let args = Instruction::new("args", ["VERSION_1_5_0", "hostname", "port", "username"]);
    if framed.send(args).await.is_err() {
        return;
    }

    // size, audio, video, image, [timezone], connect
    while let Some(Ok(instruction)) = framed.next().await {
        let done = instruction.is("connect");
        let _ = received.send(instruction);
        if done {
            break;
        }
    }

    if framed.send(Instruction::new("ready", [session_id.as_str()])).await.is_err() {
        return;
    }

    if behavior == Behavior::Serve {
        let _ = framed.send(Instruction::new("sync", ["1700000000"])).await;
    }

    while let Some(Ok(instruction)) = framed.next().await {
        let _ = received.send(instruction);
    }
}

/// Percent-encode a base64 token for use in a query string
pub fn query_escape(token: &str) -> String {
    token
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}
