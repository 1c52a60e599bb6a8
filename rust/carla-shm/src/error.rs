use std::io;

/// Errors from the shared-memory layer.
#[derive(Debug)]
pub enum ShmError {
    /// The OS rejected a shared-memory object name (create or open).
    Naming {
        /// The object name as handed to `shm_open`.
        name: String,
        source: io::Error,
    },
    /// Truncating or mapping the region failed.
    Mapping(io::Error),
    /// The named objects disappeared while a reader was waiting — the writer
    /// destroyed the channel (or crashed and a new writer replaced it).
    Shutdown,
}

impl ShmError {
    pub(crate) fn naming(name: impl Into<String>, source: io::Error) -> Self {
        ShmError::Naming {
            name: name.into(),
            source,
        }
    }
}

impl From<io::Error> for ShmError {
    fn from(e: io::Error) -> Self {
        ShmError::Mapping(e)
    }
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShmError::Naming { name, source } => {
                write!(f, "shared memory object {name:?}: {source}")
            }
            ShmError::Mapping(e) => write!(f, "mapping failed: {e}"),
            ShmError::Shutdown => write!(f, "named objects removed while waiting"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::Naming { source, .. } => Some(source),
            ShmError::Mapping(e) => Some(e),
            ShmError::Shutdown => None,
        }
    }
}
