//! Epoch-based reclamation
//!
//! Readers traverse neighbor lists without locks; writers that unlink a list
//! hand it here instead of freeing it. A pointer retired at epoch `e` is
//! physically freed only once the global epoch has reached `e + 2`, which
//! requires every reader pinned at or before `e` to have unpinned.
//!
//! The manager is process-wide. Each thread lazily registers a participant
//! slot on first touch; a thread-local handle flushes pending retirements and
//! deregisters the slot when the thread exits. Retirements are batched
//! thread-locally and spilled into epoch-indexed global buckets.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Retired pointers live in `epoch % 3` buckets; with a two-epoch grace
/// window, three buckets never mix reclaimable and unreclaimable entries
/// from the same slot.
const EPOCH_BUCKETS: usize = 3;

/// Local retirements are spilled to the global buckets at this batch size,
/// and at half this size when the thread unpins.
const LOCAL_BATCH_THRESHOLD: usize = 64;

struct Retired {
    ptr: *mut (),
    deleter: unsafe fn(*mut ()),
    retire_epoch: u64,
}

// Retired pointers are owned exclusively by the reclamation protocol once
// enqueued; the deleter is the only remaining access path.
unsafe impl Send for Retired {}

#[repr(align(64))]
struct Participant {
    local_epoch: AtomicU64,
    pin_count: AtomicU32,
    active: AtomicBool,
}

impl Participant {
    fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(0),
            pin_count: AtomicU32::new(0),
            active: AtomicBool::new(false),
        }
    }
}

struct EbrManager {
    global_epoch: AtomicU64,
    participants: Mutex<Vec<Arc<Participant>>>,
    retired: Mutex<[Vec<Retired>; EPOCH_BUCKETS]>,
}

impl EbrManager {
    fn new() -> Self {
        Self {
            global_epoch: AtomicU64::new(1),
            participants: Mutex::new(Vec::new()),
            retired: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
        }
    }

    fn register(&self) -> Arc<Participant> {
        let participant = Arc::new(Participant::new());
        self.participants.lock().push(participant.clone());
        participant
    }

    fn deregister(&self, participant: &Arc<Participant>) {
        let mut participants = self.participants.lock();
        participants.retain(|p| !Arc::ptr_eq(p, participant));
    }

    fn spill(&self, batch: &mut Vec<Retired>) {
        if batch.is_empty() {
            return;
        }
        let mut retired = self.retired.lock();
        for node in batch.drain(..) {
            retired[(node.retire_epoch % EPOCH_BUCKETS as u64) as usize].push(node);
        }
    }

    /// Advances the global epoch if every active participant has observed it,
    /// then frees whatever the two-epoch grace window has released.
    fn try_advance_and_reclaim(&self) {
        let observed = self.global_epoch.load(Ordering::Acquire);
        if self.can_advance(observed) {
            let _ = self.global_epoch.compare_exchange(
                observed,
                observed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        let current = self.global_epoch.load(Ordering::Acquire);
        if current < 2 {
            return;
        }
        self.reclaim_bucket(current - 2);
    }

    fn can_advance(&self, observed: u64) -> bool {
        // Pairs with the fence in pin().
        std::sync::atomic::fence(Ordering::SeqCst);
        let participants = self.participants.lock();
        participants.iter().all(|p| {
            !p.active.load(Ordering::Acquire) || p.local_epoch.load(Ordering::Acquire) == observed
        })
    }

    fn reclaim_bucket(&self, safe_epoch: u64) {
        let mut retired = self.retired.lock();
        let bucket = &mut retired[(safe_epoch % EPOCH_BUCKETS as u64) as usize];
        if bucket.is_empty() {
            return;
        }
        let drained = std::mem::take(bucket);
        for node in drained {
            if node.retire_epoch <= safe_epoch {
                unsafe { (node.deleter)(node.ptr) };
            } else {
                bucket.push(node);
            }
        }
    }

    fn reclaim_all(&self) {
        let mut retired = self.retired.lock();
        for bucket in retired.iter_mut() {
            for node in bucket.drain(..) {
                unsafe { (node.deleter)(node.ptr) };
            }
        }
    }
}

impl Drop for EbrManager {
    fn drop(&mut self) {
        // Best-effort teardown; no readers can remain at this point.
        self.reclaim_all();
    }
}

static MANAGER: Lazy<EbrManager> = Lazy::new(EbrManager::new);

struct ThreadSlot {
    participant: Arc<Participant>,
    local_retired: RefCell<Vec<Retired>>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            participant: MANAGER.register(),
            local_retired: RefCell::new(Vec::with_capacity(LOCAL_BATCH_THRESHOLD)),
        }
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        MANAGER.spill(&mut self.local_retired.borrow_mut());
        MANAGER.deregister(&self.participant);
        MANAGER.try_advance_and_reclaim();
    }
}

thread_local! {
    static SLOT: ThreadSlot = ThreadSlot::new();
}

/// Read-side critical section. Holding a `Guard` pins the current thread's
/// epoch; any pointer reachable while pinned stays valid until the guard (and
/// every nested guard) is dropped.
pub struct Guard {
    // Guards are tied to the pinning thread.
    _not_send: PhantomData<*mut ()>,
}

/// Enters a read-side critical section. Nesting is supported: only the
/// outermost pin publishes the epoch and only the outermost unpin clears the
/// active flag.
pub fn pin() -> Guard {
    SLOT.with(|slot| {
        let p = &slot.participant;
        let prev = p.pin_count.load(Ordering::Relaxed);
        if prev == 0 {
            let epoch = MANAGER.global_epoch.load(Ordering::Acquire);
            p.local_epoch.store(epoch, Ordering::Release);
            p.active.store(true, Ordering::Release);
            // Pairs with the fence in can_advance: the pin must be globally
            // visible before this thread dereferences any shared pointer.
            std::sync::atomic::fence(Ordering::SeqCst);
        }
        p.pin_count.store(prev + 1, Ordering::Relaxed);
    });
    Guard {
        _not_send: PhantomData,
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        // try_with: guard drops during thread teardown must not panic.
        let _ = SLOT.try_with(|slot| {
            let p = &slot.participant;
            let prev = p.pin_count.load(Ordering::Relaxed);
            if prev <= 1 {
                p.pin_count.store(0, Ordering::Relaxed);
                p.active.store(false, Ordering::Release);
                if slot.local_retired.borrow().len() >= LOCAL_BATCH_THRESHOLD / 2 {
                    MANAGER.spill(&mut slot.local_retired.borrow_mut());
                }
            } else {
                p.pin_count.store(prev - 1, Ordering::Relaxed);
            }
        });
    }
}

/// Defers dropping a boxed value until no pinned reader can still observe it.
pub fn defer_drop<T: Send + 'static>(value: Box<T>) {
    unsafe fn drop_box<T>(ptr: *mut ()) {
        drop(Box::from_raw(ptr as *mut T));
    }
    unsafe { defer(Box::into_raw(value) as *mut (), drop_box::<T>) }
}

/// Enqueues `ptr` with a custom deleter, stamped with the current epoch.
///
/// # Safety
/// `ptr` must remain valid until `deleter` runs, and `deleter` must be the
/// sole remaining owner of the allocation.
pub unsafe fn defer(ptr: *mut (), deleter: unsafe fn(*mut ())) {
    if ptr.is_null() {
        return;
    }
    let retire_epoch = MANAGER.global_epoch.load(Ordering::Acquire);
    let spilled = SLOT.try_with(|slot| {
        let mut local = slot.local_retired.borrow_mut();
        local.push(Retired {
            ptr,
            deleter,
            retire_epoch,
        });
        if local.len() >= LOCAL_BATCH_THRESHOLD {
            MANAGER.spill(&mut local);
            true
        } else {
            false
        }
    });
    match spilled {
        Ok(true) => MANAGER.try_advance_and_reclaim(),
        Ok(false) => {}
        // Thread-local storage already torn down: hand straight to the
        // global buckets.
        Err(_) => {
            MANAGER.spill(&mut vec![Retired {
                ptr,
                deleter,
                retire_epoch,
            }]);
            MANAGER.try_advance_and_reclaim();
        }
    }
}

/// Explicit progress request: spill local retirements and attempt an epoch
/// advance plus reclamation pass.
pub fn collect() {
    let _ = SLOT.try_with(|slot| {
        MANAGER.spill(&mut slot.local_retired.borrow_mut());
    });
    MANAGER.try_advance_and_reclaim();
}

pub fn current_epoch() -> u64 {
    MANAGER.global_epoch.load(Ordering::Acquire)
}
