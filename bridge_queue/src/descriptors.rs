//! Device-visible descriptor layouts shared by every queue on the DMA fabric.
//!
//! All three structs cross the host/device boundary and their offsets are
//! part of the device contract, so each carries a size assertion and explicit
//! padding where the natural layout would insert any.

use bridge_platform::DmaAddress;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

/// High bit of [`RawCompletion::flags`]: the device has written this entry
/// and the host has not consumed it yet.
pub const COMPLETION_FLAG_PENDING: u16 = 0x8000;

/// A completion entry as the device writes it into a completion ring.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct RawCompletion {
    /// Number of bytes the device transferred for this submission.
    pub data_size: u64,
    /// Operation-defined 64-bit result.
    pub result: u64,
    /// QID of the submission queue this entry completes.
    pub qid: u16,
    /// Index of the completed submission within that queue.
    pub completion_index: u16,
    /// Device status code, see `bridge_types::CompletionStatus`.
    pub status: u16,
    /// Flag word; only [`COMPLETION_FLAG_PENDING`] is defined.
    pub flags: u16,
}

const_assert_eq!(core::mem::size_of::<RawCompletion>(), 24);

/// The memory configuration descriptor that publishes one ring to the device:
/// where the ring lives, how many elements it has, and which completion queue
/// (for a submission queue) or interrupt vector (for a completion queue) is
/// paired with it.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct QueueMemcfg {
    pub qid: u16,
    pub el_count: u16,
    pub vector_or_cq: u16,
    pub _pad: u16,
    /// Device address of the ring memory.
    pub addr: u64,
    /// Length of the ring memory in bytes.
    pub length: u64,
}

const_assert_eq!(core::mem::size_of::<QueueMemcfg>(), 24);

/// A generic submission descriptor: one DMA target, either a single mapped
/// range or the head of a segment-list chain.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Submission {
    /// Device address of a single mapped range, zero when a segment list is
    /// used instead.
    pub addr: u64,
    /// Transfer length in bytes (total data size for segment lists).
    pub length: u64,
    /// Device address of the first segment-list page, zero for single-range
    /// submissions.
    pub segl_addr: u64,
    /// Byte length of the first segment-list page chunk.
    pub segl_length: u64,
}

const_assert_eq!(core::mem::size_of::<Submission>(), 32);

impl Submission {
    /// Points this submission at one contiguous mapped range.
    pub fn set_single(&mut self, addr: DmaAddress, length: u64) {
        self.addr = addr.value();
        self.length = length;
        self.segl_addr = 0;
        self.segl_length = 0;
    }

    /// Points this submission at a mapped segment-list chain.
    pub fn set_segment_list(&mut self, segl_addr: DmaAddress, segl_length: u64, data_size: u64) {
        self.addr = 0;
        self.length = data_size;
        self.segl_addr = segl_addr.value();
        self.segl_length = segl_length;
    }
}
