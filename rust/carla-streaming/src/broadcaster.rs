//! Per-stream fan-out: the session registry and the publish path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use carla_shm::ShmChannel;

use crate::error::StreamError;
use crate::frame::Frame;
use crate::session::Session;
use crate::types::{channel_name, StreamId};

struct Inner {
    sessions: Vec<Arc<Session>>,
    channel: Option<Arc<ShmChannel>>,
}

/// Tracks the subscribers of a single stream and fans every published frame
/// out to them through one shared-memory channel.
///
/// State machine on the subscriber count:
/// - 0 → 1: create the channel, send its name, install the fast-path session
/// - 1 → n: send the name, clear the fast path
/// - n → 1: reinstall the fast path
/// - 1 → 0: clear the fast path, destroy the channel
pub struct StreamBroadcaster {
    stream_id: StreamId,
    /// Set iff exactly one session is attached. Written only under the
    /// registry lock, read lock-free on the hot path.
    fast_session: ArcSwapOption<Session>,
    subscriber_count: AtomicUsize,
    inner: Mutex<Inner>,
}

/// Point-in-time view of a broadcaster's registry, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterSnapshot {
    pub sessions: usize,
    pub fast_path: bool,
    pub channel: bool,
}

impl StreamBroadcaster {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            fast_session: ArcSwapOption::empty(),
            subscriber_count: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                sessions: Vec::new(),
                channel: None,
            }),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Add a subscriber. The first subscriber brings the channel into
    /// existence; every subscriber is sent the channel name, NUL-terminated,
    /// before being counted.
    ///
    /// On error nothing is retained: the session is not added, and a channel
    /// created for it is destroyed again.
    pub fn attach(&self, session: Arc<Session>) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().unwrap();

        let channel = if let Some(channel) = &inner.channel {
            channel.clone()
        } else {
            let name = channel_name(session.port(), self.stream_id);
            let channel = Arc::new(ShmChannel::create(&name).map_err(StreamError::Shm)?);
            tracing::debug!(stream_id = %self.stream_id, name = %name, "created channel for first subscriber");
            inner.channel = Some(channel.clone());
            channel
        };

        session.set_channel(channel.clone());

        let mut name_bytes = channel.name().as_bytes().to_vec();
        name_bytes.push(0);
        if let Err(e) = session.write(&name_bytes) {
            session.clear_channel();
            if inner.sessions.is_empty() {
                inner.channel = None;
            }
            return Err(StreamError::Transport(e));
        }

        inner.sessions.push(session);
        self.refresh_fast_path(&inner);
        tracing::debug!(
            stream_id = %self.stream_id,
            sessions = inner.sessions.len(),
            "attached session"
        );
        Ok(())
    }

    /// Remove a subscriber. Unknown sessions are ignored. The last detach
    /// destroys the channel, unlinking its named objects.
    pub fn detach(&self, session: &Arc<Session>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.is_empty() {
            return;
        }
        inner.sessions.retain(|s| {
            if Arc::ptr_eq(s, session) {
                s.clear_channel();
                false
            } else {
                true
            }
        });
        if inner.sessions.is_empty() {
            inner.channel = None;
        }
        self.refresh_fast_path(&inner);
        tracing::debug!(
            stream_id = %self.stream_id,
            sessions = inner.sessions.len(),
            "detached session"
        );
    }

    /// Drop every subscriber and the channel.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for session in inner.sessions.drain(..) {
            session.clear_channel();
        }
        inner.channel = None;
        self.refresh_fast_path(&inner);
        tracing::debug!(stream_id = %self.stream_id, "cleared all sessions");
    }

    /// Deliver one frame to every attached subscriber. With no subscribers
    /// this is a no-op; a failing shared-memory write is logged and dropped —
    /// the stream is lossy and the next publish starts fresh.
    pub fn publish(&self, frame: &Frame) {
        let channel = self.inner.lock().unwrap().channel.clone();
        let Some(channel) = channel else {
            return;
        };
        if let Err(e) = channel.write_frame(frame.payload_buffers()) {
            tracing::warn!(
                stream_id = %self.stream_id,
                error = %e,
                "dropping frame after publish failure"
            );
        }
    }

    /// True iff at least one session is attached. Lock-free.
    pub fn any_subscribers(&self) -> bool {
        self.subscriber_count.load(Ordering::Acquire) > 0
    }

    /// The single attached session, when there is exactly one. Lock-free.
    pub fn fast_session(&self) -> Option<Arc<Session>> {
        self.fast_session.load_full()
    }

    pub fn snapshot(&self) -> BroadcasterSnapshot {
        let inner = self.inner.lock().unwrap();
        BroadcasterSnapshot {
            sessions: inner.sessions.len(),
            fast_path: self.fast_session.load().is_some(),
            channel: inner.channel.is_some(),
        }
    }

    fn refresh_fast_path(&self, inner: &Inner) {
        self.subscriber_count
            .store(inner.sessions.len(), Ordering::Release);
        if inner.sessions.len() == 1 {
            self.fast_session.store(Some(inner.sessions[0].clone()));
        } else {
            self.fast_session.store(None);
        }
    }
}

impl std::fmt::Debug for StreamBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("StreamBroadcaster")
            .field("stream_id", &self.stream_id)
            .field("sessions", &snapshot.sessions)
            .field("fast_path", &snapshot.fast_path)
            .finish()
    }
}
