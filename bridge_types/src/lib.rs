//! Shared types for the bridge co-processor transport runtime.
//!
//! The important items are:
//! * [`Error`]: the single tagged error value used across every layer of the
//!   transport, replacing the mixed errno / null pointer / sentinel
//!   conventions of comparable drivers.
//! * [`CompletionStatus`]: the status codes the device reports in completion
//!   entries.
//! * [`Qid`]: the 16-bit queue identifier space shared by submission and
//!   completion queues.

use core::fmt;
use num_enum::TryFromPrimitive;

/// A queue identifier, assigned at queue creation.
///
/// `0` is reserved for the bootstrap completion queue and `1` for the
/// bootstrap submission queue; all other values are handed out by the fabric.
pub type Qid = u16;

/// The bootstrap (command) completion queue id.
pub const BOOTSTRAP_CQ_QID: Qid = 0;
/// The bootstrap (command) submission queue id.
pub const BOOTSTRAP_SQ_QID: Qid = 1;

/// Maximum number of queues addressable on one device instance.
pub const MAX_QUEUE_COUNT: usize = 0x100;

/// Errors that can be returned from transport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The single-flight resource (mailbox slot) is already held, or the
    /// queue is shutting down and refuses new work.
    Busy,
    /// A submission reservation could not be satisfied before the timeout.
    NoSpace,
    /// A command did not complete within the caller's deadline.
    Timeout,
    /// The device and host disagree about protocol state: a completion index
    /// mismatch, an unknown target queue, or a mailbox reply of the wrong
    /// type. Fatal for the affected queue.
    ProtocolDesync,
    /// The command reached the device but the device returned a non-zero
    /// status word, carried here verbatim.
    DeviceStatus(u16),
    /// A DMA mapping returned the sentinel error value, or a scatter/gather
    /// mapping produced fewer entries than requested.
    MappingFailed,
    /// The queue or channel was torn down while the caller was parked on it.
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "resource busy"),
            Error::NoSpace => write!(f, "no submission space"),
            Error::Timeout => write!(f, "timed out"),
            Error::ProtocolDesync => write!(f, "protocol desync"),
            Error::DeviceStatus(code) => write!(f, "device status {:#x}", code),
            Error::MappingFailed => write!(f, "DMA mapping failed"),
            Error::Aborted => write!(f, "aborted by teardown"),
        }
    }
}

impl std::error::Error for Error {}

/// Status codes the device writes into the `status` field of a completion
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum CompletionStatus {
    Success = 0,
    Error = 1,
    Aborted = 2,
    NoSpace = 3,
    Overrun = 4,
}

impl CompletionStatus {
    /// Interprets a raw device status word as a transport result.
    ///
    /// `Success` maps to `Ok(())`; everything else, including status codes
    /// this driver does not know about, is surfaced verbatim as
    /// [`Error::DeviceStatus`].
    pub fn into_result(raw: u16) -> Result<(), Error> {
        match CompletionStatus::try_from_primitive(raw) {
            Ok(CompletionStatus::Success) => Ok(()),
            _ => Err(Error::DeviceStatus(raw)),
        }
    }
}
