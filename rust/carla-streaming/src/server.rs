//! The TCP subscription endpoint.
//!
//! Subscribing is a three-step handshake and then silence:
//!
//! 1. client connects
//! 2. client sends the stream id, 8 bytes little-endian
//! 3. server attaches a session and replies with the NUL-terminated
//!    shared-memory name
//!
//! No payload ever crosses the socket; it stays open only so the server
//! notices the peer going away and can detach the session.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::broadcaster::StreamBroadcaster;
use crate::error::StreamError;
use crate::session::Session;
use crate::token::Token;
use crate::types::StreamId;

/// Registry of the streams a server endpoint serves.
#[derive(Default)]
pub struct StreamMap {
    streams: Mutex<HashMap<StreamId, Arc<StreamBroadcaster>>>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the broadcaster for `id`, or return the existing one.
    pub fn make_stream(&self, id: StreamId) -> Arc<StreamBroadcaster> {
        self.streams
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(StreamBroadcaster::new(id)))
            .clone()
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<StreamBroadcaster>> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    /// Unregister a stream, clearing its subscribers.
    pub fn remove(&self, id: StreamId) {
        if let Some(broadcaster) = self.streams.lock().unwrap().remove(&id) {
            broadcaster.clear_all();
        }
    }

    /// Clear every stream's subscribers and empty the registry.
    pub fn clear(&self) {
        let drained: Vec<_> = self.streams.lock().unwrap().drain().collect();
        for (_, broadcaster) in drained {
            broadcaster.clear_all();
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accepts subscriber connections and routes them to their stream's
/// broadcaster.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    streams: Arc<StreamMap>,
    shutdown: Notify,
}

impl Server {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "streaming server listening");
        Ok(Self {
            listener,
            local_addr,
            streams: Arc::new(StreamMap::new()),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn streams(&self) -> &Arc<StreamMap> {
        &self.streams
    }

    /// Create (or fetch) the broadcaster producers publish into.
    pub fn make_stream(&self, id: StreamId) -> Arc<StreamBroadcaster> {
        self.streams.make_stream(id)
    }

    /// The token a client needs to subscribe to `id` on this endpoint.
    pub fn token_for(&self, id: StreamId) -> Token {
        Token::new(id, self.local_addr)
    }

    /// Stop an in-flight [`run`](Self::run).
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Accept subscribers until [`shutdown`](Self::shutdown) is called or the
    /// future is dropped. Each connection gets its own task that performs the
    /// handshake and then waits for the peer to go away.
    pub async fn run(&self) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::debug!(local_addr = %self.local_addr, "server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let streams = self.streams.clone();
                    let port = self.local_addr.port();
                    tokio::spawn(async move {
                        if let Err(e) = handle_subscriber(stream, peer, port, streams).await {
                            tracing::debug!(%peer, error = %e, "subscriber connection ended");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    port: u16,
    streams: Arc<StreamMap>,
) -> Result<(), StreamError> {
    stream.set_nodelay(true)?;

    let mut id_bytes = [0u8; 8];
    stream.read_exact(&mut id_bytes).await?;
    let stream_id = StreamId::new(u64::from_le_bytes(id_bytes));

    let Some(broadcaster) = streams.get(stream_id) else {
        tracing::debug!(%stream_id, %peer, "subscribe for unknown stream");
        return Ok(());
    };

    let (mut read_half, write_half) = stream.into_split();
    let session = Session::new(stream_id, port, write_half);
    broadcaster.attach(session.clone())?;
    tracing::debug!(%stream_id, %peer, "subscriber attached");

    // Steady state carries no bytes client-to-server; EOF or an error is the
    // disconnect signal. Stray bytes are ignored.
    let mut scratch = [0u8; 64];
    loop {
        match read_half.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    broadcaster.detach(&session);
    tracing::debug!(%stream_id, %peer, "subscriber detached");
    Ok(())
}
