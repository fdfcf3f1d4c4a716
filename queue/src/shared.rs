//! Counters and locks visible to every process sharing a queue.
//!
//! Under [`StartMethod::Fork`] the block lives in an anonymous shared
//! mapping created before any child is forked, so parent and children update
//! the same atomics. Otherwise it is an ordinary heap allocation.
//!
//! Waiters block on a process-local condvar and re-check the shared value
//! every poll interval, which is how releases made by other processes are
//! observed.

use std::{
    io,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use hyperprocess_common::{Context, StartMethod};

#[repr(C)]
struct SharedBlock {
    /// Free capacity slots
    permits:    AtomicI64,
    /// Items put and not yet taken
    size:       AtomicI64,
    /// Items put and not yet marked done
    unfinished: AtomicI64,
    /// Held by the single active reader
    rlock:      AtomicU32,
    /// Held while writing a frame
    wlock:      AtomicU32,
}

impl SharedBlock {
    fn new(permits: usize) -> Self {
        Self {
            permits:    AtomicI64::new(permits as i64),
            size:       AtomicI64::new(0),
            unfinished: AtomicI64::new(0),
            rlock:      AtomicU32::new(0),
            wlock:      AtomicU32::new(0),
        }
    }
}

enum Storage {
    Heap(Box<SharedBlock>),
    #[cfg(unix)]
    Mapped(std::ptr::NonNull<SharedBlock>),
}

/// Handle on a shared block plus the local wakeup machinery
pub(crate) struct SharedState {
    storage:       Storage,
    local:         Mutex<()>,
    changed:       Condvar,
    poll_interval: Duration,
}

// SAFETY: the mapped block only holds atomics and stays mapped for the
// lifetime of this value.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    pub(crate) fn new(ctx: &Context, permits: usize) -> io::Result<Self> {
        let storage = match ctx.start_method {
            StartMethod::Fork => map_shared(permits)?,
            StartMethod::Thread => Storage::Heap(Box::new(SharedBlock::new(permits))),
        };

        Ok(Self {
            storage,
            local: Mutex::new(()),
            changed: Condvar::new(),
            poll_interval: ctx.poll_interval,
        })
    }

    fn block(&self) -> &SharedBlock {
        match &self.storage {
            Storage::Heap(block) => &**block,
            // SAFETY: the mapping is valid and initialized until `drop`.
            #[cfg(unix)]
            Storage::Mapped(ptr) => unsafe { ptr.as_ref() },
        }
    }

    fn notify(&self) {
        let _guard = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }

    /// Block until `ready` returns true or `deadline` passes
    pub(crate) fn wait_until<F>(&self, mut ready: F, deadline: Option<Instant>) -> bool
    where
        F: FnMut(&SharedState) -> bool,
    {
        let mut guard: MutexGuard<'_, ()> =
            self.local.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if ready(self) {
                return true;
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            guard = self
                .changed
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn size(&self) -> i64 {
        self.block().size.load(Ordering::SeqCst)
    }

    pub(crate) fn add_size(&self, delta: i64) -> i64 {
        self.block().size.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub(crate) fn permits(&self) -> i64 {
        self.block().permits.load(Ordering::SeqCst)
    }

    pub(crate) fn try_acquire_permit(&self) -> bool {
        decrement_if_positive(&self.block().permits)
    }

    pub(crate) fn acquire_permit(&self, deadline: Option<Instant>) -> bool {
        self.wait_until(|state| state.try_acquire_permit(), deadline)
    }

    pub(crate) fn release_permit(&self) {
        self.block().permits.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    pub(crate) fn unfinished(&self) -> i64 {
        self.block().unfinished.load(Ordering::SeqCst)
    }

    pub(crate) fn add_unfinished(&self) {
        self.block().unfinished.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the unfinished counter; false if it was already zero
    pub(crate) fn finish_one(&self) -> bool {
        let done = decrement_if_positive(&self.block().unfinished);
        if done {
            self.notify();
        }
        done
    }

    pub(crate) fn wait_all_finished(&self, deadline: Option<Instant>) -> bool {
        self.wait_until(|state| state.unfinished() == 0, deadline)
    }

    pub(crate) fn lock_read(&self, deadline: Option<Instant>) -> Option<SharedLockGuard<'_>> {
        self.lock(&self.block().rlock, deadline)
    }

    pub(crate) fn lock_write(&self, deadline: Option<Instant>) -> Option<SharedLockGuard<'_>> {
        self.lock(&self.block().wlock, deadline)
    }

    fn lock<'a>(
        &'a self,
        flag: &'a AtomicU32,
        deadline: Option<Instant>,
    ) -> Option<SharedLockGuard<'a>> {
        let acquired = self.wait_until(
            |_| {
                flag.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            },
            deadline,
        );
        acquired.then_some(SharedLockGuard { state: self, flag })
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Storage::Mapped(ptr) = self.storage {
            // SAFETY: `ptr` came from `mmap` with this exact length and is
            // not used after this point.
            let rc = unsafe {
                libc::munmap(ptr.as_ptr().cast(), std::mem::size_of::<SharedBlock>())
            };
            if rc != 0 {
                tracing::warn!("Failed to unmap queue state: {}", io::Error::last_os_error());
            }
        }
    }
}

/// Releases a shared lock when dropped
pub(crate) struct SharedLockGuard<'a> {
    state: &'a SharedState,
    flag:  &'a AtomicU32,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(0, Ordering::Release);
        self.state.notify();
    }
}

fn decrement_if_positive(value: &AtomicI64) -> bool {
    value
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1))
        .is_ok()
}

#[cfg(unix)]
fn map_shared(permits: usize) -> io::Result<Storage> {
    // SAFETY: anonymous mapping with no address hint; the result is checked
    // before use.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<SharedBlock>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let block = ptr.cast::<SharedBlock>();
    // SAFETY: the mapping is page-aligned, writable and large enough.
    unsafe { block.write(SharedBlock::new(permits)) };
    std::ptr::NonNull::new(block)
        .map(Storage::Mapped)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

#[cfg(not(unix))]
fn map_shared(_permits: usize) -> io::Result<Storage> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-shared queue state requires fork",
    ))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn state(method: StartMethod, permits: usize) -> SharedState {
        SharedState::new(&Context::with_start_method(method), permits).unwrap()
    }

    #[test]
    fn permits_run_out_and_come_back() {
        let state = state(StartMethod::Thread, 2);
        assert!(state.try_acquire_permit());
        assert!(state.try_acquire_permit());
        assert!(!state.try_acquire_permit());

        let start = Instant::now();
        assert!(!state.acquire_permit(Some(start + Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));

        state.release_permit();
        assert!(state.acquire_permit(Some(Instant::now())));
    }

    #[test]
    fn unfinished_never_goes_negative() {
        let state = state(StartMethod::Thread, 0);
        assert!(!state.finish_one());
        state.add_unfinished();
        assert!(state.finish_one());
        assert!(!state.finish_one());
        assert_eq!(state.unfinished(), 0);
    }

    #[test]
    fn lock_excludes_until_guard_drops() {
        let state = Arc::new(state(StartMethod::Thread, 0));
        let guard = state.lock_read(None).unwrap();
        assert!(state.lock_read(Some(Instant::now())).is_none());

        let waiter = {
            let state = state.clone();
            thread::spawn(move || state.lock_read(None).is_some())
        };
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn mapped_block_is_shared_with_forked_child() {
        let state = state(StartMethod::Fork, 0);

        // SAFETY: the child only touches atomics and exits immediately.
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                state.add_size(5);
                unsafe { libc::_exit(0) }
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
            }
        }
        assert_eq!(state.size(), 5);
    }
}
