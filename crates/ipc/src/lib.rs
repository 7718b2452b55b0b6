#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Message kinds and the newline-delimited JSON transport exchanged between
//! the master and a worker over the worker's piped stdin/stdout. A worker is
//! a re-exec'd child process rather than a forked one, so this plays the role
//! of a parent-child IPC channel over a regular OS pipe.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// All the errors that can occur while exchanging IPC messages.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The underlying line transport failed.
    #[error("ipc transport error (reason: {0})")]
    Transport(#[from] LinesCodecError),

    /// A message could not be serialized or deserialized.
    #[error("ipc codec error (reason: {0})")]
    Codec(#[from] serde_json::Error),

    /// The channel was closed by the peer.
    #[error("ipc channel closed")]
    Closed,
}

/// A snapshot of a single rate-limit counter, as reported by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// The accumulated value for the current window.
    pub value: u64,
    /// All the limits observed for this key during the window.
    pub limits: Vec<u64>,
}

/// Messages sent from the master to a worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToWorker {
    /// The initial (or reloaded) effective configuration.
    Config {
        /// The serialized configuration document.
        config: serde_json::Value,
    },
    /// A broadcast of the master's current block decisions.
    RatelimiterBlocks {
        /// Map from rate-limit key to the current block value.
        blocks: HashMap<String, u64>,
    },
    /// Notifies the worker that a client address was routed to it by the
    /// sticky dispatcher. The accepted socket itself is proxied by the
    /// master rather than handed over as a raw file descriptor (see
    /// DESIGN.md); this message carries only the routing decision.
    StickyBalance {
        /// The peer address that was routed to this worker.
        peer_addr: String,
    },
}

/// Messages sent from a worker to the master.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToMaster {
    /// Sent once, after the Service Host has finished starting all services.
    StartupFinished {
        /// A serializable summary of the services' startup return values.
        summary: serde_json::Value,
    },
    /// Sent periodically to prove liveness to the heartbeat monitor.
    Heartbeat,
    /// An opaque status payload, kept only for diagnostics on death.
    ServiceStatus {
        /// The opaque status payload.
        status: serde_json::Value,
    },
    /// A drained snapshot of the worker's local rate-limit counters.
    RatelimiterCounters {
        /// Map from rate-limit key to its drained counter.
        counters: HashMap<String, CounterSnapshot>,
    },
}

/// A framed writer for one message direction.
pub struct IpcWriter<W, M> {
    framed: FramedWrite<W, LinesCodec>,
    _marker: std::marker::PhantomData<M>,
}

impl<W, M> IpcWriter<W, M>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    /// Wraps an async writer (typically a child's stdin, or the master's own
    /// stdin in the degenerate single-process case) into an IPC writer.
    pub fn new(writer: W) -> Self {
        Self {
            framed: FramedWrite::new(writer, LinesCodec::new()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Sends a message as a single JSON line. Send failures are the caller's
    /// to decide whether to swallow; the exit/heartbeat machinery is what
    /// ultimately reacts to a dead peer, not this call.
    pub async fn send(&mut self, message: &M) -> Result<(), Error> {
        let line = serde_json::to_string(message)?;
        self.framed.send(line).await?;
        Ok(())
    }
}

/// A framed reader for one message direction.
pub struct IpcReader<R, M> {
    framed: FramedRead<R, LinesCodec>,
    _marker: std::marker::PhantomData<M>,
}

impl<R, M> IpcReader<R, M>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    /// Wraps an async reader into an IPC reader.
    pub fn new(reader: R) -> Self {
        Self {
            framed: FramedRead::new(reader, LinesCodec::new()),
            _marker: std::marker::PhantomData,
        }
    }

    /// Reads and decodes the next message, or `Err(Error::Closed)` once the
    /// peer has gone away.
    pub async fn recv(&mut self) -> Result<M, Error> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(err)) => Err(err.into()),
            None => Err(Error::Closed),
        }
    }
}
