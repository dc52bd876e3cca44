//! Firehose subscription client.
//!
//! Maintains one long-lived websocket connection to the repo-commit stream
//! and yields an ordered sequence of [`CommitEvent`]s. A client instance is
//! not restartable: on any stream-level failure it is discarded and a new one
//! is constructed with the last-acknowledged cursor.
//!
//! # Failure taxonomy
//!
//! - upstream overload (HTTP 503 on handshake, or any close/error text
//!   containing `503`): the caller backs off for the long cool-down;
//! - everything else: the caller reconnects after the short delay;
//! - retirement ("complete") is decided by the coordinator, never by the
//!   stream itself.

pub mod car;
pub mod cbor;
pub mod frame;

pub use frame::{CommitEvent, Frame, OpAction, RepoOp};

use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection attempt or stream ended, from the reconnect policy's
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Upstream overload signal; reconnect only after the long cool-down.
    Overload,
    /// Generic failure; reconnect after the short delay.
    Other,
}

/// Classify a stream-level error. The overload signal has been observed in
/// several shapes (handshake status, close reason, error text), so any
/// mention of 503 counts.
pub fn classify_disconnect(err: &Error) -> DisconnectKind {
    if let Error::WebSocket(tokio_tungstenite::tungstenite::Error::Http(resp)) = err {
        if resp.status().as_u16() == 503 {
            return DisconnectKind::Overload;
        }
    }
    if err.to_string().contains("503") {
        return DisconnectKind::Overload;
    }
    DisconnectKind::Other
}

/// One live subscription to the firehose.
pub struct FirehoseClient {
    read: SplitStream<WsStream>,
    write: SplitSink<WsStream, Message>,
    heartbeat: tokio::time::Interval,
}

impl FirehoseClient {
    /// Open a connection, resuming from `cursor` when given (a `None` cursor
    /// means "start live").
    pub async fn connect(
        service: &str,
        cursor: Option<u64>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let url = match cursor {
            Some(c) => format!("{service}/xrpc/com.atproto.sync.subscribeRepos?cursor={c}"),
            None => format!("{service}/xrpc/com.atproto.sync.subscribeRepos"),
        };

        let (stream, _response) = connect_async(&url).await?;
        let (write, read) = stream.split();

        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        Ok(Self {
            read,
            write,
            heartbeat,
        })
    }

    /// Pull the next commit event, skipping frames we do not consume and
    /// applying the malformed-message policy. Returns `Ok(None)` when the
    /// upstream closed the connection without an error of its own.
    pub async fn next_commit(&mut self) -> Result<Option<CommitEvent>> {
        loop {
            tokio::select! {
                _ = self.heartbeat.tick() => {
                    // Liveness ping; also flushes any pending pong replies.
                    self.write.send(Message::Ping(Bytes::new())).await?;
                }
                msg = self.read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(None),
                    };
                    match msg {
                        Message::Binary(data) => match frame::decode_frame(&data) {
                            Ok(Frame::Commit(evt)) => return Ok(Some(evt)),
                            Ok(Frame::Skip) => {}
                            // Framing artifacts of the wire codec are a known
                            // benign case; skip without noise.
                            Err(Error::Car(_)) => {}
                            Err(err @ Error::ErrorFrame { .. }) => return Err(err),
                            Err(err) => {
                                tracing::warn!("skipped invalid message: {err}");
                            }
                        },
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_default();
                            if reason.is_empty() {
                                return Ok(None);
                            }
                            return Err(Error::Frame(format!("connection closed: {reason}")));
                        }
                        // Text frames and ping/pong carry nothing we need.
                        _ => {}
                    }
                }
            }
        }
    }

    /// Close the connection politely. Errors are ignored; the connection is
    /// being discarded either way.
    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
