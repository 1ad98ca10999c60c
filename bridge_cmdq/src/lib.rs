//! The synchronous command dispatcher of the bridge co-processor.
//!
//! One submission/completion pair — the bootstrap pair registered over the
//! mailbox — is dedicated to short fixed-size admin commands: registering,
//! unregistering and flushing the memory queues every other channel rides
//! on. Each command occupies one 64-byte ring slot; each caller parks on a
//! completion owned by its slot until the device answers, and slot order
//! equals completion order (a device guarantee), so results are paired with
//! callers purely by ring index.
//!
//! Backpressure is the fabric's counted reservation: a caller that finds the
//! ring full waits on the queue's space-available condition up to its
//! timeout. The drain-path callback writes the caller's result placeholder,
//! frees the slot, and wakes exactly one waiter per freed slot.

#[macro_use] extern crate log;


use static_assertions::const_assert_eq;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use zerocopy::{AsBytes, FromBytes};

use bridge_queue::{CompletionData, CompletionQueue, QueueFabric, QueueMemcfg, SubmissionQueue};
use bridge_types::{CompletionStatus, Error, Qid};

/// Command opcode: publish a memory queue to the device.
pub const CMD_REGISTER_MEMORY_QUEUE: u16 = 0x1;
/// Command opcode: withdraw a memory queue from the device.
pub const CMD_UNREGISTER_MEMORY_QUEUE: u16 = 0x2;
/// Command opcode: flush a memory queue's device-side state.
pub const CMD_FLUSH_MEMORY_QUEUE: u16 = 0x3;

/// Command flag: the queue being registered is written by the device
/// (device → host).
pub const CMD_FLAG_FROM_DEVICE: u16 = 0x1;

/// Size of one admin command slot.
pub const COMMAND_FRAME_SIZE: usize = 64;

/// Longest queue name the command frame carries.
pub const MAX_QUEUE_NAME_LEN: usize = 32;

/// The 64-byte admin command frame.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct CommandFrame {
    pub cmd: u16,
    pub flags: u16,
    pub qid: u16,
    pub el_count: u16,
    pub vector_or_cq: u16,
    pub name_len: u16,
    pub name: [u8; MAX_QUEUE_NAME_LEN],
    pub _pad: u32,
    /// Device address of the ring memory being registered.
    pub addr: u64,
    /// Length of the ring memory in bytes.
    pub length: u64,
}

const_assert_eq!(core::mem::size_of::<CommandFrame>(), COMMAND_FRAME_SIZE);

impl Default for CommandFrame {
    fn default() -> Self {
        CommandFrame {
            cmd: 0,
            flags: 0,
            qid: 0,
            el_count: 0,
            vector_or_cq: 0,
            name_len: 0,
            name: [0; MAX_QUEUE_NAME_LEN],
            _pad: 0,
            addr: 0,
            length: 0,
        }
    }
}

impl CommandFrame {
    fn with_name(mut self, name: &str) -> CommandFrame {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_QUEUE_NAME_LEN {
            warn!("bridge_cmdq: queue name {:?} truncated to {} bytes", name, MAX_QUEUE_NAME_LEN);
        }
        let len = bytes.len().min(MAX_QUEUE_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len as u16;
        self
    }
}

/// The completion a parked caller waits on; filled by the drain path.
struct SlotCompletion {
    result: Mutex<Option<CompletionData>>,
    cond: Condvar,
}

impl SlotCompletion {
    fn new() -> SlotCompletion {
        SlotCompletion { result: Mutex::new(None), cond: Condvar::new() }
    }

    fn fill(&self, data: CompletionData) {
        *self.result.lock().unwrap() = Some(data);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<CompletionData> {
        let mut result = self.result.lock().unwrap();
        match timeout {
            None => {
                while result.is_none() {
                    result = self.cond.wait(result).unwrap();
                }
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while result.is_none() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self.cond.wait_timeout(result, deadline - now).unwrap();
                    result = guard;
                }
            }
        }
        result.take()
    }
}

struct DispatchState {
    /// One result placeholder per ring slot, present while a caller is
    /// parked on that slot.
    results: Vec<Option<Arc<SlotCompletion>>>,
}

/// The command dispatcher, layered on the bootstrap submission queue.
pub struct CommandDispatcher {
    sq: Arc<SubmissionQueue>,
    state: Arc<Mutex<DispatchState>>,
}

impl CommandDispatcher {
    /// Builds the dispatcher on a fresh submission queue of `el_count`
    /// 64-byte slots paired with `cq`. The queue's completion callback is
    /// the dispatcher's result-delivery path.
    pub fn new(
        fabric: &QueueFabric,
        cq: &Arc<CompletionQueue>,
        el_count: u16,
    ) -> Result<CommandDispatcher, Error> {
        let state = Arc::new(Mutex::new(DispatchState {
            results: vec![None; el_count as usize],
        }));
        let cb_state = state.clone();
        let sq = fabric.create_sq(
            cq,
            COMMAND_FRAME_SIZE,
            el_count,
            Box::new(move |sq| {
                while let Some(c) = sq.next_completion() {
                    let head = sq.head_index();
                    let waiter = cb_state.lock().unwrap().results[head].take();
                    match waiter {
                        Some(w) => w.fill(c),
                        // The submission existed but no caller is parked on
                        // it; consume the slot so the ring stays in sync.
                        None => error!(
                            "bridge_cmdq: completion for empty slot {} on qid {} dropped",
                            head,
                            sq.qid()
                        ),
                    }
                    sq.notify_submission_complete();
                }
            }),
        )?;
        Ok(CommandDispatcher { sq, state })
    }

    /// The submission queue the dispatcher owns.
    pub fn sq(&self) -> &Arc<SubmissionQueue> {
        &self.sq
    }

    /// Sends one command frame and parks the caller until the device's
    /// completion for its slot arrives.
    fn execute(&self, frame: &CommandFrame, timeout: Option<Duration>) -> Result<CompletionData, Error> {
        self.sq.reserve_submission(timeout)?;
        let waiter = Arc::new(SlotCompletion::new());
        {
            // One lock covers placeholder recording, the frame write and the
            // doorbell, so slot order equals doorbell order across callers.
            let mut state = self.state.lock().unwrap();
            let slot = self.sq.next_submission();
            if state.results[slot.index()].is_some() {
                error!("bridge_cmdq: slot {} reused while a caller is parked on it", slot.index());
            }
            state.results[slot.index()] = Some(waiter.clone());
            slot.write(frame);
            self.sq.submit_to_device();
        }
        match waiter.wait(timeout) {
            Some(c) => {
                CompletionStatus::into_result(c.status)?;
                Ok(c)
            }
            // The slot completes whenever the device answers; the abandoned
            // placeholder soaks up the late result.
            None => Err(Error::Timeout),
        }
    }

    /// Publishes a memory queue to the device under an ASCII name.
    pub fn register_memory_queue(
        &self,
        memcfg: &QueueMemcfg,
        name: &str,
        from_device: bool,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let frame = CommandFrame {
            cmd: CMD_REGISTER_MEMORY_QUEUE,
            flags: if from_device { CMD_FLAG_FROM_DEVICE } else { 0 },
            qid: memcfg.qid,
            el_count: memcfg.el_count,
            vector_or_cq: memcfg.vector_or_cq,
            addr: memcfg.addr,
            length: memcfg.length,
            ..Default::default()
        }
        .with_name(name);
        self.execute(&frame, timeout).map(|_| ())
    }

    /// Withdraws a memory queue from the device.
    pub fn unregister_memory_queue(&self, qid: Qid, timeout: Option<Duration>) -> Result<(), Error> {
        let frame = CommandFrame {
            cmd: CMD_UNREGISTER_MEMORY_QUEUE,
            qid,
            ..Default::default()
        };
        self.execute(&frame, timeout).map(|_| ())
    }

    /// Flushes a memory queue's device-side state.
    pub fn flush_memory_queue(&self, qid: Qid, timeout: Option<Duration>) -> Result<(), Error> {
        let frame = CommandFrame {
            cmd: CMD_FLUSH_MEMORY_QUEUE,
            qid,
            ..Default::default()
        };
        self.execute(&frame, timeout).map(|_| ())
    }
}
