//! Request/reply semantics over a message queue and the client's event
//! delivery.
//!
//! A caller writes a request record, files an in-flight entry with a
//! response placeholder in a FIFO list, and parks on it. The client's event
//! handler recognises reply events and feeds them to
//! [`CommandQueue::deliver_completion`], which pairs each reply with the
//! oldest in-flight entry — the device answers requests in order. Teardown
//! delivers a synthetic [`Error::Aborted`] to every parked caller.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bridge_types::Error;

use crate::{MessageQueue, Record};

/// The placeholder one parked caller waits on.
struct ReplyWaiter<R: Record> {
    reply: Mutex<Option<Result<R, Error>>>,
    cond: Condvar,
}

impl<R: Record> ReplyWaiter<R> {
    fn new() -> ReplyWaiter<R> {
        ReplyWaiter { reply: Mutex::new(None), cond: Condvar::new() }
    }

    fn fill(&self, value: Result<R, Error>) {
        *self.reply.lock().unwrap() = Some(value);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<Result<R, Error>> {
        let mut reply = self.reply.lock().unwrap();
        match timeout {
            None => {
                while reply.is_none() {
                    reply = self.cond.wait(reply).unwrap();
                }
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while reply.is_none() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self.cond.wait_timeout(reply, deadline - now).unwrap();
                    reply = guard;
                }
            }
        }
        reply.take()
    }

    /// Takes the reply if it has already been delivered.
    fn try_take(&self) -> Option<Result<R, Error>> {
        self.reply.lock().unwrap().take()
    }
}

/// A synchronous command channel over one message queue. Replies arrive as
/// events on the client's event queue and are handed in through
/// [`deliver_completion`](Self::deliver_completion).
pub struct CommandQueue<R: Record> {
    mq: MessageQueue<R>,
    /// Oldest caller first; held only for short deterministic operations.
    in_flight: spin::Mutex<VecDeque<Arc<ReplyWaiter<R>>>>,
}

impl<R: Record> CommandQueue<R> {
    /// Wraps a message queue into a command channel.
    pub fn new(mq: MessageQueue<R>) -> CommandQueue<R> {
        CommandQueue { mq, in_flight: spin::Mutex::new(VecDeque::new()) }
    }

    /// The wrapped message queue.
    pub fn message_queue(&self) -> &MessageQueue<R> {
        &self.mq
    }

    /// Number of callers currently parked.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Sends `request` and parks the caller until the matching reply event
    /// is delivered, the timeout expires, or the channel is destroyed.
    pub fn execute(&self, request: &R, timeout: Option<Duration>) -> Result<R, Error> {
        // Reserve the message slot first: the reservation may block, and the
        // in-flight list lock must not be held across that.
        let token = self.mq.prepare(timeout)?;
        let waiter = Arc::new(ReplyWaiter::new());
        {
            // List order must equal send order, so the entry is filed and
            // the message submitted under one lock.
            let mut list = self.in_flight.lock();
            list.push_back(waiter.clone());
            token.send(request);
        }

        match waiter.wait(timeout) {
            Some(result) => result,
            None => {
                let mut list = self.in_flight.lock();
                if let Some(pos) = list.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                    let _ = list.remove(pos);
                    return Err(Error::Timeout);
                }
                drop(list);
                // A completion raced the timeout and already took the entry;
                // the reply is filled under the list lock, so it is visible
                // by now.
                match waiter.try_take() {
                    Some(result) => result,
                    None => Err(Error::Timeout),
                }
            }
        }
    }

    /// Pairs one reply event with the oldest in-flight entry. An event with
    /// no caller parked is a protocol error: logged and dropped.
    pub fn deliver_completion(&self, event: &R) {
        let mut list = self.in_flight.lock();
        match list.pop_front() {
            // Filled under the lock so a racing timeout observes either the
            // entry or the reply.
            Some(waiter) => waiter.fill(Ok(*event)),
            None => {
                error!(
                    "bridge_msgq: reply event with no in-flight entry on qid {} dropped",
                    self.mq.sq().qid()
                );
            }
        }
    }

    /// Tears the channel down: delivers a synthetic `Aborted` to every
    /// parked caller and leaves the in-flight list empty. Safe to call more
    /// than once.
    pub fn destroy(&self) {
        let mut list = self.in_flight.lock();
        while let Some(waiter) = list.pop_front() {
            waiter.fill(Err(Error::Aborted));
        }
    }

    /// Unwraps the channel for message-queue teardown once no caller can
    /// reach it anymore.
    pub fn into_message_queue(self) -> MessageQueue<R> {
        self.destroy();
        self.mq
    }
}
