//! Server-side subscriber sessions.

use std::io;
use std::sync::{Arc, Mutex};

use carla_shm::ShmChannel;
use tokio::net::tcp::OwnedWriteHalf;

use crate::types::StreamId;

/// One subscriber's connection to a stream, as the broadcaster sees it.
///
/// A session's only active duty is delivering the channel name during
/// attachment; after that it exists so the broadcaster can count it, and so
/// its lifetime keeps the channel reachable. It never carries payload bytes.
pub struct Session {
    stream_id: StreamId,
    port: u16,
    writer: Mutex<OwnedWriteHalf>,
    channel: Mutex<Option<Arc<ShmChannel>>>,
}

impl Session {
    /// `port` is the server endpoint port the peer connected to; it becomes
    /// part of the channel name.
    pub fn new(stream_id: StreamId, port: u16, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            port,
            writer: Mutex::new(writer),
            channel: Mutex::new(None),
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send `bytes` on the socket. Used once, at attach time, to deliver the
    /// NUL-terminated channel name. The peer has just connected and has an
    /// empty receive buffer, so a short write that still reports `WouldBlock`
    /// is treated as a failed attach rather than awaited.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let writer = self.writer.lock().unwrap();
        let mut written = 0;
        while written < bytes.len() {
            match writer.try_write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pin the channel so its name stays reachable while this session lives.
    pub fn set_channel(&self, channel: Arc<ShmChannel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    /// Drop the channel reference; called when the broadcaster detaches the
    /// session so teardown is not deferred to whoever still holds the Arc.
    pub(crate) fn clear_channel(&self) {
        *self.channel.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("stream_id", &self.stream_id)
            .field("port", &self.port)
            .finish()
    }
}
