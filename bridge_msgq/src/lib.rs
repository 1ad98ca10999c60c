//! Client-facing asymmetric queue pairs of the bridge co-processor.
//!
//! Higher subsystems (the virtual USB host, the audio transport) talk to the
//! device through named channels built from two ring flavours over the queue
//! fabric:
//!
//! * a [`MessageQueue`]: a host → device stream. The host copies a fixed-size
//!   record into a coherent ring and submits a one-descriptor submission
//!   pointing at it; the ring slot is reclaimed when the completion bumps
//!   the queue head.
//! * an [`EventQueue`]: a device → host stream. The host pre-posts `P`
//!   submissions, each pointing at a free record slot; every completion
//!   hands the filled record to a client callback and a fresh submission is
//!   posted in its place, keeping `P` in flight at steady state.
//!
//! Both register their ring with the device by ASCII name through the
//! command dispatcher. The record type is the client's fixed-size wire
//! struct; the transport treats it as opaque bytes.
//!
//! [`CommandQueue`](command::CommandQueue) layers request/reply semantics
//! over one message queue plus the client's event delivery.

#[macro_use] extern crate log;

pub mod command;


pub use command::CommandQueue;

use core::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use zerocopy::{AsBytes, FromBytes};

use bridge_cmdq::CommandDispatcher;
use bridge_platform::{alloc_coherent_or_log, CoherentBuffer, DmaAddress, Platform};
use bridge_queue::{CompletionQueue, QueueFabric, Submission, SubmissionQueue};
use bridge_types::Error;

/// The bound a channel record type must satisfy: a plain fixed-size wire
/// struct.
pub trait Record: AsBytes + FromBytes + Copy + Send + Sync + 'static {}
impl<T: AsBytes + FromBytes + Copy + Send + Sync + 'static> Record for T {}

/// A coherent ring of `count` fixed-size records shared with the device.
struct RecordRing<R: Record> {
    base: *mut u8,
    dma: DmaAddress,
    count: usize,
    buf: Mutex<Option<CoherentBuffer>>,
    platform: Arc<dyn Platform>,
    _marker: PhantomData<R>,
}

unsafe impl<R: Record> Send for RecordRing<R> {}
unsafe impl<R: Record> Sync for RecordRing<R> {}

impl<R: Record> RecordRing<R> {
    fn new(platform: &Arc<dyn Platform>, count: usize) -> Result<RecordRing<R>, Error> {
        let size = count * core::mem::size_of::<R>();
        let buf = alloc_coherent_or_log(&**platform, size, "record ring")
            .ok_or(Error::MappingFailed)?;
        Ok(RecordRing {
            base: buf.as_ptr(),
            dma: buf.dma_address(),
            count,
            buf: Mutex::new(Some(buf)),
            platform: platform.clone(),
            _marker: PhantomData,
        })
    }

    fn el_size(&self) -> usize {
        core::mem::size_of::<R>()
    }

    fn record_dma(&self, index: usize) -> DmaAddress {
        debug_assert!(index < self.count);
        DmaAddress(self.dma.value() + (index * self.el_size()) as u64)
    }

    fn write(&self, index: usize, record: &R) {
        debug_assert!(index < self.count);
        unsafe {
            core::ptr::copy_nonoverlapping(
                record.as_bytes().as_ptr(),
                self.base.add(index * self.el_size()),
                self.el_size(),
            );
        }
    }

    fn read(&self, index: usize) -> R {
        debug_assert!(index < self.count);
        unsafe { core::ptr::read_volatile(self.base.add(index * self.el_size()) as *const R) }
    }
}

impl<R: Record> Drop for RecordRing<R> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.get_mut().unwrap().take() {
            self.platform.free_coherent(buf);
        }
    }
}

/// A host → device record stream. See the crate docs.
pub struct MessageQueue<R: Record> {
    sq: Arc<SubmissionQueue>,
    ring: Arc<RecordRing<R>>,
    producer: Mutex<()>,
}

/// A granted message slot: the reservation is held and the producer side is
/// locked until the token is sent.
pub struct MessageToken<'a, R: Record> {
    mq: &'a MessageQueue<R>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a, R: Record> MessageToken<'a, R> {
    /// Copies `record` into the ring, submits the one-descriptor submission
    /// pointing at it, and rings the doorbell. Never blocks.
    pub fn send(self, record: &R) {
        let slot = self.mq.sq.next_submission();
        let index = slot.index();
        self.mq.ring.write(index, record);
        let mut sub = Submission::default();
        sub.set_single(self.mq.ring.record_dma(index), self.mq.ring.el_size() as u64);
        slot.write(&sub);
        self.mq.sq.submit_to_device();
    }
}

impl<R: Record> MessageQueue<R> {
    /// Creates the queue and registers its ring with the device under
    /// `name`.
    pub fn create(
        fabric: &QueueFabric,
        cmdq: &CommandDispatcher,
        cq: &Arc<CompletionQueue>,
        name: &str,
        el_count: u16,
        timeout: Option<Duration>,
    ) -> Result<MessageQueue<R>, Error> {
        let ring = Arc::new(RecordRing::new(fabric.platform(), el_count as usize)?);
        // Message completions carry no payload; consuming them reclaims the
        // ring slot.
        let sq = fabric.create_sq(
            cq,
            core::mem::size_of::<Submission>(),
            el_count,
            Box::new(|sq| {
                while sq.next_completion().is_some() {
                    sq.notify_submission_complete();
                }
            }),
        )?;
        if let Err(e) = cmdq.register_memory_queue(&sq.memcfg(), name, false, timeout) {
            fabric.destroy_sq(&sq);
            return Err(e);
        }
        Ok(MessageQueue { sq, ring, producer: Mutex::new(()) })
    }

    /// The underlying submission queue.
    pub fn sq(&self) -> &Arc<SubmissionQueue> {
        &self.sq
    }

    /// Reserves a message slot, blocking up to `timeout` for ring space, and
    /// locks the producer side until the returned token is sent.
    pub fn prepare(&self, timeout: Option<Duration>) -> Result<MessageToken<R>, Error> {
        self.sq.reserve_submission(timeout)?;
        Ok(MessageToken { mq: self, _guard: self.producer.lock().unwrap() })
    }

    /// Reserves, fills and submits one record.
    pub fn send(&self, record: &R, timeout: Option<Duration>) -> Result<(), Error> {
        let token = self.prepare(timeout)?;
        token.send(record);
        Ok(())
    }

    /// Unregisters the ring from the device and tears the queue down once
    /// every in-flight message has completed.
    pub fn destroy(
        self,
        fabric: &QueueFabric,
        cmdq: &CommandDispatcher,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        cmdq.unregister_memory_queue(self.sq.qid(), timeout)?;
        fabric.destroy_sq(&self.sq);
        Ok(())
    }
}

/// A device → host record stream with a steady-state pool of pre-posted
/// submissions. See the crate docs.
pub struct EventQueue<R: Record> {
    sq: Arc<SubmissionQueue>,
    ring: Arc<RecordRing<R>>,
}

impl<R: Record> EventQueue<R> {
    /// Creates the queue, registers it with the device under `name`, and
    /// pre-posts `pending` submissions (clamped to the ring's usable
    /// capacity). `callback` runs on the completion-drain path with each
    /// filled record; it must not block.
    pub fn create<F>(
        fabric: &QueueFabric,
        cmdq: &CommandDispatcher,
        cq: &Arc<CompletionQueue>,
        name: &str,
        el_count: u16,
        pending: usize,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<EventQueue<R>, Error>
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        let ring = Arc::new(RecordRing::<R>::new(fabric.platform(), el_count as usize)?);
        let cb_ring = ring.clone();
        let sq = fabric.create_sq(
            cq,
            core::mem::size_of::<Submission>(),
            el_count,
            Box::new(move |sq| {
                let mut consumed = 0;
                while sq.next_completion().is_some() {
                    // The completed submission is the one at head, and its
                    // record slot index equals the head by construction.
                    let record = cb_ring.read(sq.head_index());
                    callback(&record);
                    sq.notify_submission_complete();
                    consumed += 1;
                }
                // Keep the pool at steady state: one fresh submission per
                // consumed event, one doorbell for the batch.
                post_pending(sq, &cb_ring, consumed);
            }),
        )?;
        if let Err(e) = cmdq.register_memory_queue(&sq.memcfg(), name, true, timeout) {
            fabric.destroy_sq(&sq);
            return Err(e);
        }

        let pending = pending.min(el_count as usize - 1);
        post_pending(&sq, &ring, pending);
        Ok(EventQueue { sq, ring })
    }

    /// The underlying submission queue.
    pub fn sq(&self) -> &Arc<SubmissionQueue> {
        &self.sq
    }

    /// Unregisters the ring and tears the queue down. The pre-posted
    /// submissions can no longer complete once the device has dropped the
    /// queue, so they are discarded rather than drained.
    pub fn destroy(
        self,
        fabric: &QueueFabric,
        cmdq: &CommandDispatcher,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        debug!(
            "bridge_msgq: tearing down event queue qid {} ({} record slots)",
            self.sq.qid(),
            self.ring.count
        );
        cmdq.unregister_memory_queue(self.sq.qid(), timeout)?;
        self.sq.shutdown();
        self.sq.discard_outstanding();
        fabric.destroy_sq(&self.sq);
        Ok(())
    }
}

/// Posts `count` fresh submissions, each pointing at the record slot that
/// shares its ring index, and rings the doorbell once for the batch.
fn post_pending<R: Record>(sq: &SubmissionQueue, ring: &RecordRing<R>, count: usize) {
    let mut posted = 0;
    for _ in 0..count {
        if let Err(e) = sq.reserve_submission(Some(Duration::ZERO)) {
            error!("bridge_msgq: failed to post event submission on qid {}: {}", sq.qid(), e);
            break;
        }
        let slot = sq.next_submission();
        let mut sub = Submission::default();
        sub.set_single(ring.record_dma(slot.index()), ring.el_size() as u64);
        slot.write(&sub);
        posted += 1;
    }
    if posted > 0 {
        sq.submit_to_device();
    }
}
