use std::io;

use carla_shm::ShmError;

/// Errors from the streaming layer.
#[derive(Debug)]
pub enum StreamError {
    /// TCP connect/read/write failed.
    Transport(io::Error),
    /// The shared-memory channel failed (naming, mapping, or writer gone).
    Shm(ShmError),
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::Transport(e)
    }
}

impl From<ShmError> for StreamError {
    fn from(e: ShmError) -> Self {
        StreamError::Shm(e)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transport(e) => write!(f, "transport error: {e}"),
            StreamError::Shm(e) => write!(f, "shared memory error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Transport(e) => Some(e),
            StreamError::Shm(e) => Some(e),
        }
    }
}
