//! Named cross-process reader/writer lock with an associated condition.
//!
//! A [`NamedSync`] keyed by `base` owns two 4-byte futex words, each in its
//! own shm object: `"{base}_mutex"` encodes the lock (writer bit + reader
//! count) and `"{base}_condition"` a monotonically increasing notify
//! generation. Any process that opens the same base name shares the
//! primitives.
//!
//! Waits are sliced: a parked waiter wakes at least once per second to
//! re-check cancellation and to probe whether the named objects still exist,
//! so readers do not hang forever on a channel whose writer died.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::ShmError;
use crate::object::{ShmMapping, ShmObject};

/// Writer bit in the lock word; the low 31 bits count shared holders.
const WRITER: u32 = 1 << 31;

/// Longest uninterrupted park. Cancellation and writer-death detection
/// latency are bounded by this.
const WAIT_SLICE: Duration = Duration::from_secs(1);

fn mutex_name(base: &str) -> String {
    format!("{base}_mutex")
}

fn condition_name(base: &str) -> String {
    format!("{base}_condition")
}

// ── futex ──────────────────────────────────────────────────────────────────

enum WaitResult {
    Woken,
    TimedOut,
}

/// Park on `word` while it still reads `expected`. Shared (non-private)
/// futex: the word lives in memory mapped by several processes.
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> WaitResult {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        )
    };
    if ret == 0 {
        return WaitResult::Woken;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ETIMEDOUT) => WaitResult::TimedOut,
        // EAGAIN: the word changed before we parked. EINTR: signal. Either
        // way the caller re-checks its condition.
        _ => WaitResult::Woken,
    }
}

/// Wake every process parked on `word`.
fn futex_wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, libc::INT_MAX);
    }
}

// ── sync words ─────────────────────────────────────────────────────────────

/// One futex word in its own named shm object.
struct SyncWord {
    object: ShmObject,
    mapping: ShmMapping,
}

impl SyncWord {
    fn create_or_open(name: &str) -> Result<Self, ShmError> {
        let object = ShmObject::create(name).map_err(|e| ShmError::naming(name, e))?;
        // Fresh objects have size 0; growing is idempotent, so two processes
        // racing through here both end up with a 4-byte zeroed word.
        object
            .grow(std::mem::size_of::<u32>() as u64)
            .map_err(ShmError::Mapping)?;
        let mapping =
            ShmMapping::map_rw(&object, std::mem::size_of::<u32>()).map_err(ShmError::Mapping)?;
        Ok(Self { object, mapping })
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        // SAFETY: the mapping is at least 4 bytes, page-aligned, and shared
        // mappings of shm objects are plain memory.
        unsafe { &*(self.mapping.ptr() as *const AtomicU32) }
    }
}

// ── NamedSync ──────────────────────────────────────────────────────────────

/// Named reader/writer lock plus condition generation, shared across
/// processes by string name.
pub struct NamedSync {
    base: String,
    mutex: SyncWord,
    cond: SyncWord,
}

impl NamedSync {
    /// Open the primitives for `base`, creating them if needed. Idempotent:
    /// every process naming the same base shares the same words.
    pub fn create_or_open(base: &str) -> Result<Self, ShmError> {
        let mutex = SyncWord::create_or_open(&mutex_name(base))?;
        let cond = SyncWord::create_or_open(&condition_name(base))?;
        Ok(Self {
            base: base.to_string(),
            mutex,
            cond,
        })
    }

    /// Acquire exclusive ownership; released when the guard drops.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        let word = self.mutex.word();
        loop {
            match word.compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return ExclusiveGuard { lock: self },
                Err(current) => {
                    futex_wait(word, current, WAIT_SLICE);
                }
            }
        }
    }

    /// Acquire shared ownership; multiple holders coexist, writers are
    /// blocked out until the count drains.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        let word = self.mutex.word();
        loop {
            let current = word.load(Ordering::Relaxed);
            if current & WRITER == 0 {
                if word
                    .compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return SharedGuard { lock: self };
                }
            } else {
                futex_wait(word, current, WAIT_SLICE);
            }
        }
    }

    /// Wake every waiter on the condition. Callers hold the exclusive lock,
    /// which is what makes the generation bump and the data it publishes
    /// indivisible from the waiters' point of view.
    pub fn notify_all(&self, _held: &ExclusiveGuard<'_>) {
        self.cond.word().fetch_add(1, Ordering::Release);
        futex_wake_all(self.cond.word());
    }

    /// Release the shared lock, park until a notify is observed and
    /// `predicate` holds, then return the reacquired shared guard.
    ///
    /// `predicate` is only ever evaluated while the shared lock is held.
    /// Returns `Ok(None)` if `cancelled` reported true before the predicate
    /// was satisfied, and [`ShmError::Shutdown`] if the named objects
    /// disappeared (or were replaced) while waiting.
    pub fn wait_shared<'a, P, C>(
        &'a self,
        guard: SharedGuard<'a>,
        mut predicate: P,
        mut cancelled: C,
    ) -> Result<Option<SharedGuard<'a>>, ShmError>
    where
        P: FnMut() -> bool,
        C: FnMut() -> bool,
    {
        let mut guard = guard;
        loop {
            if predicate() {
                return Ok(Some(guard));
            }
            if cancelled() {
                return Ok(None);
            }

            // Sample the generation before releasing the lock: a notify that
            // lands in between bumps the word first, so the wait below
            // returns immediately instead of missing it.
            let generation = self.cond.word().load(Ordering::Acquire);
            drop(guard);

            if let WaitResult::TimedOut = futex_wait(self.cond.word(), generation, WAIT_SLICE) {
                if !self.alive()? {
                    return Err(ShmError::Shutdown);
                }
            }

            guard = self.lock_shared();
        }
    }

    /// True while the named objects this handle opened still back the name.
    fn alive(&self) -> Result<bool, ShmError> {
        let name = mutex_name(&self.base);
        match ShmObject::open_rw(&name) {
            Ok(fresh) => {
                let ours = self.mutex.object.identity().map_err(ShmError::Mapping)?;
                let theirs = fresh.identity().map_err(ShmError::Mapping)?;
                Ok(ours == theirs)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShmError::naming(name, e)),
        }
    }

    /// Remove the named objects for `base`. Idempotent; waiters notice
    /// within one wait slice.
    pub fn destroy_named(base: &str) {
        ShmObject::unlink(&mutex_name(base));
        ShmObject::unlink(&condition_name(base));
    }
}

/// RAII exclusive ownership of a [`NamedSync`].
pub struct ExclusiveGuard<'a> {
    lock: &'a NamedSync,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let word = self.lock.mutex.word();
        word.store(0, Ordering::Release);
        futex_wake_all(word);
    }
}

/// RAII shared ownership of a [`NamedSync`].
pub struct SharedGuard<'a> {
    lock: &'a NamedSync,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let word = self.lock.mutex.word();
        if word.fetch_sub(1, Ordering::Release) == 1 {
            // Last reader out; a writer may be parked.
            futex_wake_all(word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn unique(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "carla_sync_{}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            tag
        )
    }

    struct Cleanup(String);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            NamedSync::destroy_named(&self.0);
        }
    }

    #[test]
    fn shared_holders_coexist() {
        let base = unique("shared");
        let _c = Cleanup(base.clone());
        let sync = NamedSync::create_or_open(&base).unwrap();

        let a = sync.lock_shared();
        let b = sync.lock_shared();
        drop(a);
        drop(b);
    }

    #[test]
    fn exclusive_excludes_shared() {
        let base = unique("excl");
        let _c = Cleanup(base.clone());
        let sync = Arc::new(NamedSync::create_or_open(&base).unwrap());

        let exclusive = sync.lock_exclusive();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let sync = sync.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let _shared = sync.lock_shared();
                acquired.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(100));
        // The flag can only flip once the shared lock is held, which the
        // exclusive guard forbids.
        assert!(!acquired.load(Ordering::Acquire));

        drop(exclusive);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::Acquire));
    }

    #[test]
    fn notify_wakes_waiter_when_predicate_holds() {
        let base = unique("notify");
        let _c = Cleanup(base.clone());
        let sync = Arc::new(NamedSync::create_or_open(&base).unwrap());
        let published = Arc::new(AtomicU32::new(0));

        let handle = {
            let sync = sync.clone();
            let published = published.clone();
            thread::spawn(move || {
                let guard = sync.lock_shared();
                let guard = sync
                    .wait_shared(guard, || published.load(Ordering::Acquire) == 7, || false)
                    .unwrap();
                assert!(guard.is_some());
            })
        };

        thread::sleep(Duration::from_millis(50));
        {
            let held = sync.lock_exclusive();
            published.store(7, Ordering::Release);
            sync.notify_all(&held);
        }
        handle.join().unwrap();
    }

    #[test]
    fn cancelled_wait_returns_none() {
        let base = unique("cancel");
        let _c = Cleanup(base.clone());
        let sync = NamedSync::create_or_open(&base).unwrap();

        let guard = sync.lock_shared();
        let outcome = sync.wait_shared(guard, || false, || true).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn destroyed_names_surface_as_shutdown() {
        let base = unique("shutdown");
        let sync = Arc::new(NamedSync::create_or_open(&base).unwrap());

        let handle = {
            let sync = sync.clone();
            thread::spawn(move || {
                let guard = sync.lock_shared();
                sync.wait_shared(guard, || false, || false)
                    .map(|outcome| outcome.is_some())
            })
        };

        thread::sleep(Duration::from_millis(50));
        NamedSync::destroy_named(&base);

        match handle.join().unwrap() {
            Err(ShmError::Shutdown) => {}
            other => panic!("expected Shutdown, got {other:?}"),
        }
    }

    #[test]
    fn destroy_is_idempotent() {
        let base = unique("idem");
        NamedSync::destroy_named(&base);
        let _sync = NamedSync::create_or_open(&base).unwrap();
        NamedSync::destroy_named(&base);
        NamedSync::destroy_named(&base);
    }
}
