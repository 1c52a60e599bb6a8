//! The single-slot latest-value frame channel.
//!
//! A channel named `base` is one shared region laid out as
//! `ChannelHeader` followed by the current frame's payload, plus the
//! [`NamedSync`] primitives keyed by the same base name. The writer side
//! ([`ShmChannel`]) owns the region and the names; readers
//! ([`ShmChannelReader`]) map it read-only and copy payloads out under the
//! shared lock.
//!
//! The region only ever grows. The header's `payload_size` is authoritative
//! for how many bytes of the region are the current frame; `sequence_id`
//! ticks once per publish and is what readers park on.

use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ShmError;
use crate::object::{ShmMapping, ShmObject};
use crate::sync::NamedSync;

/// Fixed-layout header at offset 0 of the region.
#[repr(C)]
pub struct ChannelHeader {
    /// Number of valid payload bytes following the header.
    pub payload_size: AtomicU64,
    /// Bumped by the writer on every publish; wraps.
    pub sequence_id: AtomicU64,
}

/// Header size in bytes; the payload starts at this offset.
pub const HEADER_SIZE: usize = size_of::<ChannelHeader>();

const _: () = assert!(HEADER_SIZE == 16);

// ── writer ─────────────────────────────────────────────────────────────────

struct WriterState {
    object: ShmObject,
    mapping: ShmMapping,
}

impl WriterState {
    #[inline]
    fn header(&self) -> &ChannelHeader {
        // SAFETY: the mapping is always at least HEADER_SIZE bytes and
        // page-aligned; the header fields are atomics.
        unsafe { &*(self.mapping.ptr() as *const ChannelHeader) }
    }
}

/// Writer handle: owns the named region and sync objects, removes them on
/// drop.
pub struct ShmChannel {
    name: String,
    sync: NamedSync,
    state: Mutex<WriterState>,
}

impl ShmChannel {
    /// Create the channel named `name`, clearing any stale objects a crashed
    /// writer may have left behind first.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        ShmObject::unlink(name);
        NamedSync::destroy_named(name);

        let object = ShmObject::create(name).map_err(|e| ShmError::naming(name, e))?;
        let sync = NamedSync::create_or_open(name)?;

        // Materialize the header. Pages added by ftruncate read as zeroes,
        // which is exactly the initial header state.
        object.grow(HEADER_SIZE as u64).map_err(ShmError::Mapping)?;
        let mapping = ShmMapping::map_rw(&object, HEADER_SIZE).map_err(ShmError::Mapping)?;

        tracing::debug!(name, "created shm channel");
        Ok(Self {
            name: name.to_string(),
            sync,
            state: Mutex::new(WriterState { object, mapping }),
        })
    }

    /// The base name readers open.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grow the region so it can hold `payload_size` payload bytes and
    /// record that size in the header. The region never shrinks.
    pub fn resize(&self, payload_size: u64) -> Result<(), ShmError> {
        let mut state = self.state.lock().unwrap();
        self.resize_locked(&mut state, payload_size)
    }

    fn resize_locked(&self, state: &mut WriterState, payload_size: u64) -> Result<(), ShmError> {
        let needed = HEADER_SIZE as u64 + payload_size;
        let held = self.sync.lock_exclusive();
        if needed > state.mapping.len() as u64 {
            state.object.grow(needed).map_err(ShmError::Mapping)?;
            state.mapping =
                ShmMapping::map_rw(&state.object, needed as usize).map_err(ShmError::Mapping)?;
            tracing::trace!(name = %self.name, size = needed, "grew shm region");
        }
        state.header().payload_size.store(payload_size, Ordering::Release);
        drop(held);
        Ok(())
    }

    /// Publish one frame: the concatenation of `buffers`, in order.
    ///
    /// Grows the region if needed, then under the exclusive lock bumps the
    /// sequence, copies the bytes, and wakes every reader.
    pub fn write_frame<B: AsRef<[u8]>>(&self, buffers: &[B]) -> Result<(), ShmError> {
        let total: u64 = buffers.iter().map(|b| b.as_ref().len() as u64).sum();

        let mut state = self.state.lock().unwrap();
        self.resize_locked(&mut state, total)?;

        let held = self.sync.lock_exclusive();
        state.header().sequence_id.fetch_add(1, Ordering::Release);
        let mut offset = HEADER_SIZE;
        for buffer in buffers {
            let bytes = buffer.as_ref();
            // SAFETY: resize_locked guaranteed the mapping covers
            // HEADER_SIZE + total bytes; offsets stay within that.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    state.mapping.ptr().add(offset),
                    bytes.len(),
                );
            }
            offset += bytes.len();
        }
        self.sync.notify_all(&held);
        drop(held);
        Ok(())
    }

    /// Current sequence counter.
    pub fn sequence_id(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.header().sequence_id.load(Ordering::Acquire)
    }

    /// OS-level size of the region in bytes.
    pub fn region_size(&self) -> Result<u64, ShmError> {
        let state = self.state.lock().unwrap();
        state.object.size().map_err(ShmError::Mapping)
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "destroying shm channel");
        ShmObject::unlink(&self.name);
        NamedSync::destroy_named(&self.name);
    }
}

// ── reader ─────────────────────────────────────────────────────────────────

/// Reader handle: maps the region read-only and delivers each new frame to a
/// caller-supplied closure. Dropping a reader leaves the named objects alone;
/// they belong to the writer.
pub struct ShmChannelReader {
    name: String,
    sync: NamedSync,
    object: ShmObject,
    mapping: ShmMapping,
    last_sequence: u64,
}

impl ShmChannelReader {
    /// Open the channel named `name`. Frames published before the open are
    /// not replayed: the reader starts at the current sequence.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        // Region first: if the name does not exist there is no channel, and
        // we must not conjure sync words for it.
        let object = ShmObject::open_ro(name).map_err(|e| ShmError::naming(name, e))?;
        let sync = NamedSync::create_or_open(name)?;
        let size = object.size().map_err(ShmError::Mapping)?;
        if (size as usize) < HEADER_SIZE {
            return Err(ShmError::Mapping(io::Error::new(
                io::ErrorKind::InvalidData,
                "shm region smaller than its header",
            )));
        }
        let mapping = ShmMapping::map_ro(&object, size as usize).map_err(ShmError::Mapping)?;

        let last_sequence = {
            let _held = sync.lock_shared();
            // SAFETY: mapping covers at least the header.
            let header = unsafe { &*(mapping.ptr() as *const ChannelHeader) };
            header.sequence_id.load(Ordering::Acquire)
        };

        tracing::debug!(name, last_sequence, "opened shm channel");
        Ok(Self {
            name: name.to_string(),
            sync,
            object,
            mapping,
            last_sequence,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence of the last frame this reader observed.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Block until the writer publishes a frame newer than the last one this
    /// reader observed, then run `f` on the payload bytes. `f` runs under the
    /// shared lock; the slice is only valid for its duration, so copy out.
    pub fn read_frame<F: FnOnce(&[u8])>(&mut self, f: F) -> Result<(), ShmError> {
        self.read_frame_until(|| false, f).map(|_| ())
    }

    /// Like [`read_frame`](Self::read_frame), but `cancelled` is polled once
    /// per wait slice; returns `Ok(false)` without running `f` if it reported
    /// true before a new frame arrived.
    pub fn read_frame_until<C, F>(&mut self, cancelled: C, f: F) -> Result<bool, ShmError>
    where
        C: FnMut() -> bool,
        F: FnOnce(&[u8]),
    {
        let guard = self.sync.lock_shared();

        let header_ptr = self.mapping.ptr() as *const ChannelHeader;
        let last = self.last_sequence;
        // SAFETY: the header lives at offset 0 of every mapping of this
        // region, and this reader's mapping outlives the wait.
        let predicate = move || unsafe { (*header_ptr).sequence_id.load(Ordering::Acquire) } != last;

        let Some(guard) = self.sync.wait_shared(guard, predicate, cancelled)? else {
            return Ok(false);
        };

        // The writer may have grown the region since we mapped it; take a
        // fresh view before touching the payload. Safe under the shared
        // lock: payload_size cannot change while we hold it.
        let header = unsafe { &*(self.mapping.ptr() as *const ChannelHeader) };
        let payload_size = header.payload_size.load(Ordering::Acquire) as usize;
        if HEADER_SIZE + payload_size > self.mapping.len() {
            let size = self.object.size().map_err(ShmError::Mapping)?;
            self.mapping =
                ShmMapping::map_ro(&self.object, size as usize).map_err(ShmError::Mapping)?;
            tracing::trace!(name = %self.name, size, "remapped shm region");
        }

        let header = unsafe { &*(self.mapping.ptr() as *const ChannelHeader) };
        self.last_sequence = header.sequence_id.load(Ordering::Acquire);

        // SAFETY: the mapping covers HEADER_SIZE + payload_size bytes and
        // the writer is locked out while we hold the shared guard.
        let payload =
            unsafe { std::slice::from_raw_parts(self.mapping.ptr().add(HEADER_SIZE), payload_size) };
        f(payload);

        drop(guard);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn unique(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "carla_chan_{}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            tag
        )
    }

    #[test]
    fn header_is_two_words() {
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn create_starts_empty() {
        let name = unique("fresh");
        let channel = ShmChannel::create(&name).unwrap();
        assert_eq!(channel.sequence_id(), 0);
        assert_eq!(channel.region_size().unwrap(), HEADER_SIZE as u64);
    }

    #[test]
    fn publish_bumps_sequence_by_one() {
        let name = unique("seq");
        let channel = ShmChannel::create(&name).unwrap();

        channel.write_frame(&[&[1u8, 2, 3][..]]).unwrap();
        assert_eq!(channel.sequence_id(), 1);

        channel.write_frame(&[&[4u8][..], &[5u8, 6][..]]).unwrap();
        assert_eq!(channel.sequence_id(), 2);
    }

    #[test]
    fn reader_sees_frames_published_after_open() {
        let name = unique("order");
        let channel = ShmChannel::create(&name).unwrap();
        let mut reader = ShmChannelReader::open(&name).unwrap();

        channel.write_frame(&[&[0xAAu8, 0xBB][..]]).unwrap();

        let mut seen = Vec::new();
        reader.read_frame(|bytes| seen.extend_from_slice(bytes)).unwrap();
        assert_eq!(seen, vec![0xAA, 0xBB]);
        assert_eq!(reader.last_sequence(), 1);
    }

    #[test]
    fn empty_payload_is_observable() {
        let name = unique("empty");
        let channel = ShmChannel::create(&name).unwrap();
        let mut reader = ShmChannelReader::open(&name).unwrap();

        channel.write_frame::<&[u8]>(&[]).unwrap();

        let mut size = None;
        reader.read_frame(|bytes| size = Some(bytes.len())).unwrap();
        assert_eq!(size, Some(0));
    }

    #[test]
    fn multiple_buffers_concatenate_in_order() {
        let name = unique("concat");
        let channel = ShmChannel::create(&name).unwrap();
        let mut reader = ShmChannelReader::open(&name).unwrap();

        channel
            .write_frame(&[&[1u8][..], &[2u8, 3][..], &[4u8, 5, 6][..]])
            .unwrap();

        let mut seen = Vec::new();
        reader.read_frame(|bytes| seen.extend_from_slice(bytes)).unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn region_grows_monotonically() {
        let name = unique("grow");
        let channel = ShmChannel::create(&name).unwrap();
        let mut reader = ShmChannelReader::open(&name).unwrap();

        channel.write_frame(&[vec![0x02u8; 4096]]).unwrap();
        let grown = channel.region_size().unwrap();
        assert_eq!(grown, (HEADER_SIZE + 4096) as u64);

        let mut len = None;
        reader.read_frame(|bytes| len = Some(bytes.len())).unwrap();
        assert_eq!(len, Some(4096));

        // A smaller frame leaves the region alone; the header says how much
        // of it is live.
        channel.write_frame(&[&[0x03u8][..]]).unwrap();
        assert_eq!(channel.region_size().unwrap(), grown);

        let mut seen = Vec::new();
        reader.read_frame(|bytes| seen.extend_from_slice(bytes)).unwrap();
        assert_eq!(seen, vec![0x03]);
    }

    #[test]
    fn destroy_removes_all_named_objects() {
        let name = unique("teardown");
        let channel = ShmChannel::create(&name).unwrap();
        channel.write_frame(&[&[1u8][..]]).unwrap();
        drop(channel);

        assert!(ShmObject::open_ro(&name).is_err());
        assert!(ShmObject::open_ro(&format!("{name}_mutex")).is_err());
        assert!(ShmObject::open_ro(&format!("{name}_condition")).is_err());

        // The name is immediately reusable.
        let again = ShmChannel::create(&name).unwrap();
        assert_eq!(again.sequence_id(), 0);
    }

    #[test]
    fn cancelled_read_returns_false() {
        let name = unique("cancel");
        let _channel = ShmChannel::create(&name).unwrap();
        let mut reader = ShmChannelReader::open(&name).unwrap();

        let delivered = reader.read_frame_until(|| true, |_| panic!("no frame")).unwrap();
        assert!(!delivered);
    }
}
