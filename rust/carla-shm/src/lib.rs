//! Cross-process primitives for the carla-stream transport.
//!
//! This crate provides the shared-memory half of the transport: named POSIX
//! shared-memory objects, a futex-backed named reader/writer lock with an
//! associated condition generation, and [`ShmChannel`] — a single-slot
//! latest-value channel carrying one frame at a time from a writer process to
//! any number of reader processes.
//!
//! # Architecture
//!
//! A channel named `base` owns three OS objects in the POSIX shm namespace:
//!
//! ```text
//! ┌──────────────────────┐
//! │ "{base}"             │  header (payload_size, sequence_id) + payload
//! ├──────────────────────┤
//! │ "{base}_mutex"       │  one futex word: reader/writer lock
//! ├──────────────────────┤
//! │ "{base}_condition"   │  one futex word: notify generation
//! └──────────────────────┘
//! ```
//!
//! The writer publishes under the exclusive lock and bumps the generation;
//! readers park on the generation word under the shared lock and copy the
//! payload out before releasing it. A reader that falls behind observes only
//! the most recent frame, never a torn one.
//!
//! Linux-only: the wakeup path is the futex syscall on words mapped
//! `MAP_SHARED`.

pub mod channel;
pub mod error;
pub mod object;
pub mod sync;

pub use channel::{ChannelHeader, ShmChannel, ShmChannelReader, HEADER_SIZE};
pub use error::ShmError;
pub use object::{ShmMapping, ShmObject};
pub use sync::{ExclusiveGuard, NamedSync, SharedGuard};
