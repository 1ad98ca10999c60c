//! The paired submission/completion queue fabric of the bridge co-processor.
//!
//! Many independent logical channels time-share one DMA region and one
//! completion interrupt. Each channel is a submission queue (host → device
//! descriptor ring) paired with a completion queue (device → host completion
//! ring, possibly shared by several submission queues). The fabric owns:
//!
//! * queue lifecycle: DMA-coherent ring allocation, QID assignment, teardown;
//! * ring arithmetic and backpressure: counted reservations that block on a
//!   space-available condition, a ring that never fills completely
//!   (`(tail + 1) % el_count == head` is full);
//! * doorbell discipline: the doorbell write is preceded by a release fence
//!   that publishes the slot contents to the device;
//! * completion routing: the completion interrupt walks every live
//!   completion queue, validates each entry against the target submission
//!   queue's expected completion index, and hands it to the queue's
//!   callback.
//!
//! Producer operations (`reserve_submission`) may block; the completion-drain
//! path never does — it takes short mutexes and signals condition variables.
//! Lock order is completion-drain first, then the queue table (released
//! before any queue lock), then one submission queue's state.

#[macro_use] extern crate log;

pub mod descriptors;

#[cfg(test)]
mod test;

pub use descriptors::{QueueMemcfg, RawCompletion, Submission, COMPLETION_FLAG_PENDING};

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use zerocopy::AsBytes;

use bridge_platform::{alloc_coherent_or_log, CoherentBuffer, DmaAddress, Platform};
use bridge_types::{Error, Qid, MAX_QUEUE_COUNT};

/// Base of the per-QID doorbell register array in the DMA register window.
pub const DOORBELL_BASE: u64 = 0x44000;

/// Byte offset of the doorbell register of queue `qid`.
pub fn doorbell_offset(qid: Qid) -> u64 {
    DOORBELL_BASE + 4 * qid as u64
}

/// The payload of one routed completion, as handed to a submission queue's
/// callback through [`SubmissionQueue::next_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionData {
    pub status: u16,
    pub data_size: u64,
    pub result: u64,
}

/// Per-queue completion callback. Invoked from the completion-drain path with
/// the queue borrowed for the duration of the call; it must not block, and it
/// is expected to call [`SubmissionQueue::notify_submission_complete`] once
/// per entry it consumes.
pub type CompletionCallback = Box<dyn Fn(&SubmissionQueue) + Send + Sync>;

/// A completion queue: a DMA-coherent ring the device writes completion
/// entries into, drained by the completion interrupt.
pub struct CompletionQueue {
    qid: Qid,
    el_count: usize,
    ring_ptr: *mut RawCompletion,
    ring_dma: DmaAddress,
    ring_len: usize,
    /// Next entry to inspect; single consumer, modular arithmetic.
    index: Mutex<usize>,
    ring: Mutex<Option<CoherentBuffer>>,
    platform: Arc<dyn Platform>,
}

// The raw ring pointer aliases device-shared coherent memory owned by `ring`;
// host-side access is confined to the single drain path.
unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn el_count(&self) -> usize {
        self.el_count
    }

    /// Device address of the ring memory.
    pub fn ring_dma(&self) -> DmaAddress {
        self.ring_dma
    }

    /// Builds the registration descriptor for this ring, paired with the
    /// given interrupt vector.
    pub fn memcfg(&self, vector: u16) -> QueueMemcfg {
        QueueMemcfg {
            qid: self.qid,
            el_count: self.el_count as u16,
            vector_or_cq: vector,
            _pad: 0,
            addr: self.ring_dma.value(),
            length: self.ring_len as u64,
        }
    }

    fn entry_ptr(&self, index: usize) -> *mut RawCompletion {
        debug_assert!(index < self.el_count);
        unsafe { self.ring_ptr.add(index) }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if let Some(buf) = self.ring.get_mut().unwrap().take() {
            self.platform.free_coherent(buf);
        }
    }
}

struct SqState {
    /// Oldest in-flight slot.
    head: usize,
    /// Next slot to hand out.
    tail: usize,
    /// Reservations granted but not yet turned into submissions.
    reserved: usize,
    /// The completion index the device must report next.
    expected_completion_index: usize,
    /// Routed but not yet consumed completion payloads, oldest first.
    completions: std::collections::VecDeque<CompletionData>,
    draining: bool,
    desynced: bool,
}

/// A submission queue: a DMA-coherent descriptor ring the host fills and the
/// device consumes, with completions routed back through the paired
/// completion queue.
pub struct SubmissionQueue {
    qid: Qid,
    cq_qid: Qid,
    el_size: usize,
    el_count: usize,
    ring_base: *mut u8,
    ring_dma: DmaAddress,
    ring_len: usize,
    state: Mutex<SqState>,
    space_avail: Condvar,
    callback: CompletionCallback,
    ring: Mutex<Option<CoherentBuffer>>,
    platform: Arc<dyn Platform>,
}

// Same aliasing story as the completion queue; slot handles are only written
// between a granted reservation and the matching doorbell.
unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

/// A handle to one reserved descriptor slot. Fill it, then publish it with
/// [`SubmissionQueue::submit_to_device`].
pub struct SubmissionSlot<'a> {
    sq: &'a SubmissionQueue,
    index: usize,
}

impl<'a> SubmissionSlot<'a> {
    /// Ring index of this slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copies a descriptor into the slot. The descriptor type must not be
    /// larger than the queue's element size.
    pub fn write<T: AsBytes>(&self, value: &T) {
        let bytes = value.as_bytes();
        assert!(bytes.len() <= self.sq.el_size, "descriptor larger than queue element");
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.sq.slot_ptr(self.index),
                bytes.len(),
            );
        }
    }

    /// Raw access to the slot for descriptor types built in place.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.sq.slot_ptr(self.index)
    }
}

impl SubmissionQueue {
    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// QID of the paired completion queue.
    pub fn cq_qid(&self) -> Qid {
        self.cq_qid
    }

    pub fn el_size(&self) -> usize {
        self.el_size
    }

    pub fn el_count(&self) -> usize {
        self.el_count
    }

    /// Device address of the ring memory.
    pub fn ring_dma(&self) -> DmaAddress {
        self.ring_dma
    }

    /// Current head (oldest in-flight slot). Event-stream consumers use this
    /// to find the record matching the completion being processed.
    pub fn head_index(&self) -> usize {
        self.state.lock().unwrap().head
    }

    /// Number of submissions currently in flight.
    pub fn in_flight(&self) -> usize {
        let state = self.state.lock().unwrap();
        (self.el_count + state.tail - state.head) % self.el_count
    }

    /// Builds the registration descriptor for this ring, paired with its
    /// completion queue.
    pub fn memcfg(&self) -> QueueMemcfg {
        QueueMemcfg {
            qid: self.qid,
            el_count: self.el_count as u16,
            vector_or_cq: self.cq_qid,
            _pad: 0,
            addr: self.ring_dma.value(),
            length: self.ring_len as u64,
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.el_count);
        unsafe { self.ring_base.add(index * self.el_size) }
    }

    /// Reserves one descriptor slot, blocking up to `timeout` for space.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` is a non-blocking try.
    /// Every granted reservation must be matched by a
    /// [`next_submission`](Self::next_submission) or a
    /// [`cancel_submission_reservation`](Self::cancel_submission_reservation).
    ///
    /// Fails with [`Error::NoSpace`] on expiry, [`Error::Busy`] once the
    /// queue is draining, [`Error::Aborted`] if teardown starts while the
    /// caller is parked, and [`Error::ProtocolDesync`] on a dead queue.
    pub fn reserve_submission(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.desynced {
                return Err(Error::ProtocolDesync);
            }
            if state.draining {
                return Err(Error::Busy);
            }
            let in_flight = (self.el_count + state.tail - state.head) % self.el_count;
            if in_flight + state.reserved < self.el_count - 1 {
                state.reserved += 1;
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::NoSpace);
                    }
                    let (guard, _) = self
                        .space_avail
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
                None => {
                    state = self.space_avail.wait(state).unwrap();
                }
            }
            if state.draining {
                return Err(Error::Aborted);
            }
        }
    }

    /// Releases a reservation that will not be submitted.
    pub fn cancel_submission_reservation(&self) {
        let mut state = self.state.lock().unwrap();
        if state.reserved == 0 {
            error!("bridge_queue: cancel without reservation on qid {}", self.qid);
            return;
        }
        state.reserved -= 1;
        self.space_avail.notify_all();
    }

    /// Turns one granted reservation into the slot at `tail` and advances
    /// `tail`. Callers serialize their fill-and-submit sections per queue;
    /// batch producers may take several slots before one
    /// [`submit_to_device`](Self::submit_to_device).
    pub fn next_submission(&self) -> SubmissionSlot {
        let mut state = self.state.lock().unwrap();
        if state.reserved == 0 {
            error!("bridge_queue: submission without reservation on qid {}", self.qid);
        } else {
            state.reserved -= 1;
        }
        let index = state.tail;
        state.tail = (state.tail + 1) % self.el_count;
        SubmissionSlot { sq: self, index }
    }

    /// Publishes every filled slot to the device: a release fence, then one
    /// doorbell write carrying the current `tail`.
    pub fn submit_to_device(&self) {
        let tail = self.state.lock().unwrap().tail;
        fence(Ordering::Release);
        self.platform.dma_write32(doorbell_offset(self.qid), tail as u32);
    }

    /// Peeks the oldest routed-but-unconsumed completion. Callback-side
    /// consumption: pair each returned entry with one
    /// [`notify_submission_complete`](Self::notify_submission_complete).
    pub fn next_completion(&self) -> Option<CompletionData> {
        self.state.lock().unwrap().completions.front().copied()
    }

    /// Retires the oldest completion: advances `head` and the expected
    /// completion index (both modulo the element count) and wakes one space
    /// waiter.
    pub fn notify_submission_complete(&self) {
        let mut state = self.state.lock().unwrap();
        if state.completions.pop_front().is_none() {
            error!("bridge_queue: notify without completion on qid {}", self.qid);
            return;
        }
        state.head = (state.head + 1) % self.el_count;
        state.expected_completion_index =
            (state.expected_completion_index + 1) % self.el_count;
        // notify_all: both space waiters and a drain waiter may be parked.
        self.space_avail.notify_all();
    }

    /// Starts teardown: refuses new reservations and aborts parked ones.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.draining = true;
        self.space_avail.notify_all();
    }

    /// Drops the in-flight submissions of a queue the device no longer owns.
    /// Only valid after the queue has been unregistered from the device; the
    /// event-queue teardown path uses this because its pre-posted
    /// submissions can never complete.
    pub fn discard_outstanding(&self) {
        let mut state = self.state.lock().unwrap();
        let dropped = (self.el_count + state.tail - state.head) % self.el_count;
        if dropped > 0 {
            warn!("bridge_queue: discarding {} in-flight submissions on qid {}", dropped, self.qid);
        }
        state.head = state.tail;
        state.completions.clear();
        self.space_avail.notify_all();
    }

    /// True once the queue has been marked dead by a completion-index
    /// mismatch.
    pub fn is_desynced(&self) -> bool {
        self.state.lock().unwrap().desynced
    }

    /// Blocks until every in-flight submission has completed and every
    /// reservation is resolved.
    fn wait_drained(&self) {
        let mut state = self.state.lock().unwrap();
        while !(state.head == state.tail && state.reserved == 0) && !state.desynced {
            state = self.space_avail.wait(state).unwrap();
        }
    }

    /// Routes one validated completion entry into this queue. Runs on the
    /// drain path.
    fn deliver(&self, entry: &RawCompletion) {
        {
            let mut state = self.state.lock().unwrap();
            if state.desynced {
                error!(
                    "bridge_queue: dropping completion for desynced qid {} (index {})",
                    self.qid, entry.completion_index
                );
                return;
            }
            if state.head == state.tail {
                error!(
                    "bridge_queue: completion for idle qid {} dropped (index {})",
                    self.qid, entry.completion_index
                );
                return;
            }
            if entry.completion_index as usize != state.expected_completion_index {
                state.desynced = true;
                error!(
                    "bridge_queue: completion index mismatch on qid {}: expected {}, got {}",
                    self.qid, state.expected_completion_index, entry.completion_index
                );
                // Parked reservers must observe the dead queue.
                self.space_avail.notify_all();
                return;
            }
            state.completions.push_back(CompletionData {
                status: entry.status,
                data_size: entry.data_size,
                result: entry.result,
            });
        }
        (self.callback)(self);
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        if let Some(buf) = self.ring.get_mut().unwrap().take() {
            self.platform.free_coherent(buf);
        }
    }
}

enum QueueEntry {
    Cq(Arc<CompletionQueue>),
    Sq(Arc<SubmissionQueue>),
}

/// The per-device queue table and completion router.
pub struct QueueFabric {
    platform: Arc<dyn Platform>,
    queues: Mutex<Vec<Option<QueueEntry>>>,
}

impl QueueFabric {
    pub fn new(platform: Arc<dyn Platform>) -> QueueFabric {
        let mut queues = Vec::with_capacity(MAX_QUEUE_COUNT);
        queues.resize_with(MAX_QUEUE_COUNT, || None);
        QueueFabric { platform, queues: Mutex::new(queues) }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    fn assign_qid(queues: &[Option<QueueEntry>]) -> Result<Qid, Error> {
        queues
            .iter()
            .position(|entry| entry.is_none())
            .map(|qid| qid as Qid)
            .ok_or(Error::NoSpace)
    }

    /// Creates a completion queue of `el_count` entries on a fresh QID.
    /// The ring is zeroed; no entry is pending.
    pub fn create_cq(&self, el_count: u16) -> Result<Arc<CompletionQueue>, Error> {
        let size = el_count as usize * core::mem::size_of::<RawCompletion>();
        let buf = alloc_coherent_or_log(&*self.platform, size, "completion ring")
            .ok_or(Error::MappingFailed)?;
        let mut queues = self.queues.lock().unwrap();
        let qid = match Self::assign_qid(&queues) {
            Ok(qid) => qid,
            Err(e) => {
                self.platform.free_coherent(buf);
                return Err(e);
            }
        };
        let cq = Arc::new(CompletionQueue {
            qid,
            el_count: el_count as usize,
            ring_ptr: buf.as_ptr() as *mut RawCompletion,
            ring_dma: buf.dma_address(),
            ring_len: size,
            index: Mutex::new(0),
            ring: Mutex::new(Some(buf)),
            platform: self.platform.clone(),
        });
        queues[qid as usize] = Some(QueueEntry::Cq(cq.clone()));
        Ok(cq)
    }

    /// Creates a submission queue of `el_count` slots of `el_size` bytes,
    /// paired with `cq`, on a fresh QID. `callback` runs on the drain path
    /// once per routed completion.
    pub fn create_sq(
        &self,
        cq: &Arc<CompletionQueue>,
        el_size: usize,
        el_count: u16,
        callback: CompletionCallback,
    ) -> Result<Arc<SubmissionQueue>, Error> {
        let size = el_size * el_count as usize;
        let buf = alloc_coherent_or_log(&*self.platform, size, "submission ring")
            .ok_or(Error::MappingFailed)?;
        let mut queues = self.queues.lock().unwrap();
        let qid = match Self::assign_qid(&queues) {
            Ok(qid) => qid,
            Err(e) => {
                self.platform.free_coherent(buf);
                return Err(e);
            }
        };
        let sq = Arc::new(SubmissionQueue {
            qid,
            cq_qid: cq.qid(),
            el_size,
            el_count: el_count as usize,
            ring_base: buf.as_ptr(),
            ring_dma: buf.dma_address(),
            ring_len: size,
            state: Mutex::new(SqState {
                head: 0,
                tail: 0,
                reserved: 0,
                expected_completion_index: 0,
                completions: std::collections::VecDeque::new(),
                draining: false,
                desynced: false,
            }),
            space_avail: Condvar::new(),
            callback,
            ring: Mutex::new(Some(buf)),
            platform: self.platform.clone(),
        });
        queues[qid as usize] = Some(QueueEntry::Sq(sq.clone()));
        Ok(sq)
    }

    /// Tears a submission queue down: no new reservations, wait for drain,
    /// drop the table entry. The coherent ring is freed when the last
    /// reference goes away. Destroying an undrained queue parks the caller
    /// until the device finishes.
    pub fn destroy_sq(&self, sq: &Arc<SubmissionQueue>) {
        sq.shutdown();
        sq.wait_drained();
        let mut queues = self.queues.lock().unwrap();
        match queues[sq.qid() as usize] {
            Some(QueueEntry::Sq(_)) => queues[sq.qid() as usize] = None,
            _ => error!("bridge_queue: destroy of unknown sq qid {}", sq.qid()),
        }
    }

    /// Drops a completion queue from the table. Submission queues paired
    /// with it must already be gone.
    pub fn destroy_cq(&self, cq: &Arc<CompletionQueue>) {
        let mut queues = self.queues.lock().unwrap();
        match queues[cq.qid() as usize] {
            Some(QueueEntry::Cq(_)) => queues[cq.qid() as usize] = None,
            _ => error!("bridge_queue: destroy of unknown cq qid {}", cq.qid()),
        }
    }

    fn lookup_sq(&self, qid: u16) -> Option<Arc<SubmissionQueue>> {
        let queues = self.queues.lock().unwrap();
        match queues.get(qid as usize) {
            Some(Some(QueueEntry::Sq(sq))) => Some(sq.clone()),
            _ => None,
        }
    }

    /// Drains one completion queue: scans entries at `index` while their
    /// pending flag is set, routes each to its target submission queue, and
    /// publishes the new consumer index on the CQ doorbell.
    pub fn handle_completions(&self, cq: &CompletionQueue) {
        let mut index = cq.index.lock().unwrap();
        let mut drained = false;
        loop {
            let entry_ptr = cq.entry_ptr(*index);
            let flags = unsafe { read_volatile(addr_of!((*entry_ptr).flags)) };
            if flags & COMPLETION_FLAG_PENDING == 0 {
                break;
            }
            // The pending flag is read before the rest of the entry.
            fence(Ordering::Acquire);
            let entry = unsafe { read_volatile(entry_ptr) };

            match self.lookup_sq(entry.qid) {
                Some(sq) => sq.deliver(&entry),
                None => error!(
                    "bridge_queue: completion for unknown qid {} dropped (cq {})",
                    entry.qid, cq.qid
                ),
            }

            unsafe { write_volatile(addr_of_mut!((*entry_ptr).flags), 0) };
            fence(Ordering::Release);
            *index = (*index + 1) % cq.el_count;
            drained = true;
        }
        if drained {
            self.platform.dma_write32(doorbell_offset(cq.qid), *index as u32);
        }
    }

    /// The DMA interrupt entry point: walks every live completion queue.
    pub fn handle_completion_interrupt(&self) {
        let cqs: Vec<Arc<CompletionQueue>> = {
            let queues = self.queues.lock().unwrap();
            queues
                .iter()
                .filter_map(|entry| match entry {
                    Some(QueueEntry::Cq(cq)) => Some(cq.clone()),
                    _ => None,
                })
                .collect()
        };
        for cq in cqs {
            self.handle_completions(&cq);
        }
    }
}
