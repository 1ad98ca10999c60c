//! The single-flight register mailbox of the bridge co-processor.
//!
//! The mailbox is a doorbell-grade channel used exactly twice in the life of
//! a device: to negotiate the firmware protocol version and to register the
//! bootstrap command queue pair. One 64-bit message is in flight at a time,
//! enforced by an atomic slot; the reply arrives over a dedicated interrupt
//! that the platform routes to [`Mailbox::handle_interrupt`].
//!
//! Payloads pack a 6-bit message type over a 58-bit value; the codec lives in
//! [`encode_message`] / [`message_type`] / [`message_value`] with explicit
//! width constants rather than being scattered over call sites.

#[macro_use] extern crate log;


use bit_field::BitField;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bridge_platform::Platform;
use bridge_types::Error;

/// Offset of the four-word send window in the mailbox register window.
pub const REG_MB_SEND: u64 = 0x208;
/// Offset of the four-word reply window in the mailbox register window.
pub const REG_MB_REPLY: u64 = 0x204;
/// Offset of the reply counter register.
pub const REG_MB_REPLY_COUNT: u64 = 0x42;

/// Number of bits of the payload carrying the message type.
pub const MSG_TYPE_BITS: usize = 6;
/// Number of bits of the payload carrying the message value.
pub const MSG_VALUE_BITS: u8 = 58;

/// Message type: register the bootstrap command submission queue (to-device).
pub const MSG_REGISTER_COMMAND_SQ: u8 = 0x7;
/// Message type: register the bootstrap command completion queue (to-device).
pub const MSG_REGISTER_COMMAND_CQ: u8 = 0x8;
/// Message type: acknowledgement of a command queue registration (to-host).
pub const MSG_REGISTER_COMMAND_QUEUE_REPLY: u8 = 0xA;
/// Message type: firmware protocol version handshake (both directions).
pub const MSG_SET_FW_PROTOCOL_VERSION: u8 = 0xC;

/// Packs a (type, value) pair into the 64-bit wire payload.
pub fn encode_message(msg_type: u8, value: u64) -> u64 {
    let mut msg = 0u64;
    msg.set_bits(MSG_VALUE_BITS..64u8, msg_type as u64);
    msg.set_bits(0..MSG_VALUE_BITS, value & ((1 << MSG_VALUE_BITS) - 1));
    msg
}

/// Extracts the 6-bit message type from a wire payload.
pub fn message_type(msg: u64) -> u8 {
    msg.get_bits(MSG_VALUE_BITS..64u8) as u8
}

/// Extracts the 58-bit value from a wire payload.
pub fn message_value(msg: u64) -> u64 {
    msg.get_bits(0..MSG_VALUE_BITS)
}

/// A one-shot completion: reset, then completed exactly once per use.
/// Completing before the waiter arrives is fine; the waiter checks the flag
/// under the lock.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Completion {
        Completion { done: Mutex::new(false), cond: Condvar::new() }
    }

    fn reset(&self) {
        *self.done.lock().unwrap() = false;
    }

    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Waits until completed or until `timeout` elapses (`None` waits
    /// forever). Returns false on expiry.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock().unwrap();
        match timeout {
            None => {
                while !*done {
                    done = self.cond.wait(done).unwrap();
                }
                true
            }
            Some(limit) => {
                let deadline = std::time::Instant::now() + limit;
                while !*done {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(done, deadline - now).unwrap();
                    done = guard;
                }
                true
            }
        }
    }
}

/// The mailbox channel of one device instance.
pub struct Mailbox {
    platform: Arc<dyn Platform>,
    taken: AtomicBool,
    completion: Completion,
    last_received: Mutex<u64>,
}

impl Mailbox {
    pub fn new(platform: Arc<dyn Platform>) -> Mailbox {
        Mailbox {
            platform,
            taken: AtomicBool::new(false),
            completion: Completion::new(),
            last_received: Mutex::new(0),
        }
    }

    /// Sends one message and blocks for the device's reply.
    ///
    /// Fails fast with [`Error::Busy`] if another send is in flight, without
    /// touching any register. `timeout` of `None` waits forever; expiry
    /// returns [`Error::Timeout`] and releases the slot.
    pub fn send(&self, msg: u64, timeout: Option<Duration>) -> Result<u64, Error> {
        if self.taken.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(Error::Busy);
        }
        self.completion.reset();

        debug!("bridge_mailbox: send {:#x}", msg);
        self.platform.mailbox_write32(REG_MB_SEND, msg as u32);
        self.platform.mailbox_write32(REG_MB_SEND + 4, (msg >> 32) as u32);
        self.platform.mailbox_write32(REG_MB_SEND + 8, 0);
        self.platform.mailbox_write32(REG_MB_SEND + 12, 0);

        if !self.completion.wait(timeout) {
            warn!("bridge_mailbox: send {:#x} timed out", msg);
            self.taken.store(false, Ordering::Release);
            return Err(Error::Timeout);
        }
        let reply = *self.last_received.lock().unwrap();
        debug!("bridge_mailbox: reply {:#x}", reply);
        self.taken.store(false, Ordering::Release);
        Ok(reply)
    }

    /// The mailbox-reply interrupt entry point.
    ///
    /// Drains however many replies the counter register reports, keeps the
    /// last, and wakes the sender only if at least one reply was present.
    /// Returns whether a reply was drained; a spurious interrupt is reported
    /// as `false` and signals nothing.
    pub fn handle_interrupt(&self) -> bool {
        let count = self.platform.mailbox_read32(REG_MB_REPLY_COUNT);
        if count == 0 {
            debug!("bridge_mailbox: spurious reply interrupt");
            return false;
        }
        let mut last = 0u64;
        for _ in 0..count {
            let lo = self.platform.mailbox_read32(REG_MB_REPLY);
            let hi = self.platform.mailbox_read32(REG_MB_REPLY + 4);
            self.platform.mailbox_read32(REG_MB_REPLY + 8);
            self.platform.mailbox_read32(REG_MB_REPLY + 12);
            last = (hi as u64) << 32 | lo as u64;
        }
        // Store the payload before signalling, never the reverse.
        *self.last_received.lock().unwrap() = last;
        self.completion.complete();
        true
    }
}
