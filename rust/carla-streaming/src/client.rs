//! The consumer side: subscribe over TCP, then read frames out of shared
//! memory.
//!
//! One subscription is a task driving this state machine:
//!
//! ```text
//! Connecting → SendingId → AwaitingName → Streaming
//!      ▲                                     │
//!      └──────────── Reconnecting ◄──────────┘   (any error, 1s backoff)
//! ```
//!
//! `Stopped` is reachable from every state. Each attempt owns its socket and
//! reader; nothing is shared across reconnects except the token, the
//! callback, and the buffer pool.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carla_shm::ShmChannelReader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::pool::{Buffer, BufferPool};
use crate::token::Token;

/// Fixed delay between subscription attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the channel name the server may send.
const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Connecting,
    SendingId,
    AwaitingName,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Handle to a running subscription. Dropping it stops the subscription.
pub struct ClientReader {
    stop: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ClientReader {
    /// Subscribe to the stream `token` names and deliver every observed
    /// frame to `callback` as a pooled buffer, in publish order (gaps
    /// allowed — the channel is latest-value).
    ///
    /// Must be called within a tokio runtime; the subscription runs on a
    /// spawned task and keeps retrying until stopped.
    pub fn subscribe<F>(token: Token, callback: F) -> ClientReader
    where
        F: FnMut(Buffer) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(token, callback, stop.clone(), stop_rx));
        ClientReader {
            stop,
            stop_tx,
            task: Some(task),
        }
    }

    /// Stop the subscription. Socket operations and the backoff timer are
    /// cancelled immediately; a reader blocked on the shared-memory wait
    /// unblocks at the next publish or within one wait slice.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
    }

    /// Stop and wait for the subscription task to finish.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            // The task never panics on its own; a join error only happens on
            // runtime teardown.
            let _ = task.await;
        }
    }
}

impl Drop for ClientReader {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<F>(
    token: Token,
    mut callback: F,
    stop: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
) where
    F: FnMut(Buffer) + Send + 'static,
{
    let pool = BufferPool::new();
    loop {
        match attempt(&token, &mut callback, &stop, &mut stop_rx, &pool).await {
            Ok(()) => {
                tracing::debug!(%token, state = ?ReaderState::Stopped, "subscription stopped");
                return;
            }
            Err(e) => {
                tracing::debug!(
                    %token,
                    error = %e,
                    state = ?ReaderState::Reconnecting,
                    "subscription failed, retrying"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            _ = stop_rx.changed() => {
                tracing::debug!(%token, state = ?ReaderState::Stopped, "subscription stopped");
                return;
            }
        }
    }
}

/// One subscription attempt, from connect to the first error. Returns `Ok`
/// only when stopped.
async fn attempt<F>(
    token: &Token,
    callback: &mut F,
    stop: &Arc<AtomicBool>,
    stop_rx: &mut watch::Receiver<bool>,
    pool: &BufferPool,
) -> Result<(), StreamError>
where
    F: FnMut(Buffer) + Send + 'static,
{
    tracing::debug!(%token, state = ?ReaderState::Connecting, "connecting");
    let mut stream = tokio::select! {
        connected = TcpStream::connect(token.endpoint()) => connected?,
        _ = stop_rx.changed() => return Ok(()),
    };
    stream.set_nodelay(true)?;

    tracing::debug!(%token, state = ?ReaderState::SendingId, "sending stream id");
    let id_bytes = token.stream_id().get().to_le_bytes();
    tokio::select! {
        written = stream.write_all(&id_bytes) => written?,
        _ = stop_rx.changed() => return Ok(()),
    }

    tracing::debug!(%token, state = ?ReaderState::AwaitingName, "awaiting channel name");
    let name = tokio::select! {
        name = read_name(&mut stream) => name?,
        _ = stop_rx.changed() => return Ok(()),
    };

    tracing::debug!(%token, name = %name, state = ?ReaderState::Streaming, "streaming");
    let mut reader = ShmChannelReader::open(&name)?;

    // `stream` stays open for the rest of the attempt: closing it is how the
    // server learns we are gone.
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let stop_flag = stop.clone();
        let buffer_pool = pool.clone();
        let blocked = tokio::task::spawn_blocking(move || {
            let mut buffer = buffer_pool.pop();
            let delivered = reader.read_frame_until(
                || stop_flag.load(Ordering::Acquire),
                |bytes| buffer.copy_from(bytes),
            )?;
            Ok::<_, StreamError>((reader, delivered.then_some(buffer)))
        })
        .await;

        let (returned, delivered) = match blocked {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e),
            Err(join_error) => return Err(StreamError::Transport(io::Error::other(join_error))),
        };
        reader = returned;

        match delivered {
            Some(buffer) => callback(buffer),
            None => return Ok(()), // cancelled
        }
    }
}

/// Read the NUL-terminated channel name off the handshake socket.
async fn read_name(stream: &mut TcpStream) -> Result<String, StreamError> {
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(StreamError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before sending the channel name",
            )));
        }
        if byte[0] == 0 {
            break;
        }
        if name.len() >= MAX_NAME_LEN {
            return Err(StreamError::Transport(io::Error::new(
                io::ErrorKind::InvalidData,
                "channel name exceeds maximum length",
            )));
        }
        name.push(byte[0]);
    }
    String::from_utf8(name).map_err(|_| {
        StreamError::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            "channel name is not valid ASCII",
        ))
    })
}
