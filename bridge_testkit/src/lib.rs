//! A scriptable [`Platform`] implementation backing the transport test suite.
//!
//! [`MockPlatform`] plays the device end of the platform adapter contract:
//! * the mailbox window records sent messages, serves scripted replies from a
//!   hardware-style FIFO, and can invoke a responder hook the moment a send
//!   completes;
//! * the DMA window records every write, with doorbell writes decodable per
//!   QID and in order (the ordering assertions of the doorbell tests are
//!   built on this log);
//! * coherent allocations and streaming mappings are backed by real host
//!   memory with stable fake device addresses, and the test can look any
//!   device address back up to host memory to read or corrupt what the
//!   "device" would see;
//! * the page allocator hands out physically consecutive pages from an arena
//!   (or deliberately non-consecutive ones), and `map_single` can be told to
//!   fail at the n-th call, driving the segment-list folding and unwind
//!   tests.

#[macro_use] extern crate log;

use std::alloc::{alloc_zeroed, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Mutex;

use bridge_platform::{CoherentBuffer, DmaAddress, DmaDirection, Platform};

/// Device-side view of the mailbox send window (four 32-bit words).
pub const MB_SEND_BASE: u64 = 0x208;
/// Device-side view of the mailbox reply window (four 32-bit words).
pub const MB_REPLY_BASE: u64 = 0x204;
/// Device-side view of the mailbox reply counter register.
pub const MB_REPLY_COUNT: u64 = 0x42;
/// Base of the per-QID doorbell register array in the DMA window.
pub const DOORBELL_BASE: u64 = 0x44000;

/// Fake device-address base for coherent allocations.
const COHERENT_DMA_BASE: u64 = 0x1000_0000;
/// Fake device-address base for streaming mappings.
const STREAMING_DMA_BASE: u64 = 0x8000_0000;

/// One recorded streaming mapping.
#[derive(Debug, Clone)]
pub struct MapRecord {
    pub dma: DmaAddress,
    pub host: *const u8,
    pub len: usize,
    pub dir: DmaDirection,
    pub unmapped: bool,
}

#[derive(Debug, Clone)]
struct CoherentRecord {
    dma: u64,
    host: *mut u8,
    len: usize,
    freed: bool,
}

struct Inner {
    // Mailbox.
    mailbox_send_words: [u32; 4],
    sent_mailbox: Vec<u64>,
    pending_replies: VecDeque<u64>,
    mailbox_write_count: usize,

    // DMA window.
    dma_regs: std::collections::BTreeMap<u64, u32>,
    dma_writes: Vec<(u64, u32)>,

    // Memory.
    coherent: Vec<CoherentRecord>,
    next_coherent_dma: u64,
    mappings: Vec<MapRecord>,
    next_streaming_dma: u64,
    map_calls: usize,
    fail_map_at: Option<usize>,

    // Page arena.
    arena: *mut u8,
    arena_pages: usize,
    next_page: usize,
    allocated_page_count: isize,
    freed_page_count: isize,
    noncontiguous_pages: bool,
}

// Raw pointers in the records all point at leaked host memory owned by the
// mock for its whole lifetime.
unsafe impl Send for Inner {}

type MailboxResponder = Box<dyn Fn(u64) + Send + Sync>;

/// The mock platform. See the crate docs for what it simulates.
pub struct MockPlatform {
    inner: Mutex<Inner>,
    responder: Mutex<Option<MailboxResponder>>,
    page_size: usize,
}

impl MockPlatform {
    /// Creates a mock with a 4 KiB page size and a 512-page arena.
    pub fn new() -> MockPlatform {
        MockPlatform::with_page_size(0x1000, 512)
    }

    /// Creates a mock with an explicit page size (the mapper treats page
    /// size as a platform parameter, and so do the tests).
    pub fn with_page_size(page_size: usize, arena_pages: usize) -> MockPlatform {
        let layout = Layout::from_size_align(page_size * arena_pages, page_size)
            .expect("bad arena layout");
        let arena = unsafe { alloc_zeroed(layout) };
        assert!(!arena.is_null(), "arena allocation failed");
        MockPlatform {
            inner: Mutex::new(Inner {
                mailbox_send_words: [0; 4],
                sent_mailbox: Vec::new(),
                pending_replies: VecDeque::new(),
                mailbox_write_count: 0,
                dma_regs: std::collections::BTreeMap::new(),
                dma_writes: Vec::new(),
                coherent: Vec::new(),
                next_coherent_dma: COHERENT_DMA_BASE,
                mappings: Vec::new(),
                next_streaming_dma: STREAMING_DMA_BASE,
                map_calls: 0,
                fail_map_at: None,
                arena,
                arena_pages,
                next_page: 0,
                allocated_page_count: 0,
                freed_page_count: 0,
                noncontiguous_pages: false,
            }),
            responder: Mutex::new(None),
            page_size,
        }
    }

    /// Installs a hook invoked (outside all mock locks) with each complete
    /// 64-bit mailbox message the moment its fourth word is written.
    /// The hook typically pushes a reply and fires the mailbox interrupt.
    pub fn set_mailbox_responder<F>(&self, f: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Queues a mailbox reply in the device's reply FIFO.
    pub fn push_mailbox_reply(&self, reply: u64) {
        self.inner.lock().unwrap().pending_replies.push_back(reply);
    }

    /// All 64-bit messages sent over the mailbox so far, in order.
    pub fn sent_mailbox_messages(&self) -> Vec<u64> {
        self.inner.lock().unwrap().sent_mailbox.clone()
    }

    /// Number of 32-bit writes the host has made to the mailbox window.
    pub fn mailbox_write_count(&self) -> usize {
        self.inner.lock().unwrap().mailbox_write_count
    }

    /// Every write to the DMA register window, in order.
    pub fn dma_write_log(&self) -> Vec<(u64, u32)> {
        self.inner.lock().unwrap().dma_writes.clone()
    }

    /// Doorbell writes decoded as `(qid, value)`, in order.
    pub fn doorbell_writes(&self) -> Vec<(u16, u32)> {
        self.inner
            .lock()
            .unwrap()
            .dma_writes
            .iter()
            .filter(|(off, _)| *off >= DOORBELL_BASE)
            .map(|(off, val)| (((off - DOORBELL_BASE) / 4) as u16, *val))
            .collect()
    }

    /// Looks a device address inside a live coherent allocation back up to
    /// host memory, so a test can play the device against a ring.
    pub fn coherent_host_ptr(&self, dma: DmaAddress) -> Option<*mut u8> {
        let inner = self.inner.lock().unwrap();
        for rec in inner.coherent.iter() {
            if !rec.freed && dma.value() >= rec.dma && dma.value() < rec.dma + rec.len as u64 {
                let off = (dma.value() - rec.dma) as usize;
                return Some(unsafe { rec.host.add(off) });
            }
        }
        None
    }

    /// Number of coherent allocations not yet freed.
    pub fn live_coherent_allocations(&self) -> usize {
        self.inner.lock().unwrap().coherent.iter().filter(|r| !r.freed).count()
    }

    /// Looks a streaming-mapped device address up to host memory.
    pub fn mapped_host_ptr(&self, dma: DmaAddress) -> Option<*const u8> {
        let inner = self.inner.lock().unwrap();
        for rec in inner.mappings.iter() {
            if !rec.unmapped
                && dma.value() >= rec.dma.value()
                && dma.value() < rec.dma.value() + rec.len as u64
            {
                let off = (dma.value() - rec.dma.value()) as usize;
                return Some(unsafe { rec.host.add(off) });
            }
        }
        None
    }

    /// Every streaming mapping made so far, including torn-down ones.
    pub fn map_records(&self) -> Vec<MapRecord> {
        self.inner.lock().unwrap().mappings.clone()
    }

    /// Number of streaming mappings still active.
    pub fn active_mappings(&self) -> usize {
        self.inner.lock().unwrap().mappings.iter().filter(|r| !r.unmapped).count()
    }

    /// Number of pages handed out and not yet returned. Gap pages skipped by
    /// the non-contiguous mode do not count as handed out.
    pub fn outstanding_pages(&self) -> isize {
        let inner = self.inner.lock().unwrap();
        inner.allocated_page_count - inner.freed_page_count
    }

    /// Makes the `n`-th `map_single` call (1-based, counted from now) fail
    /// with the sentinel.
    pub fn fail_map_at(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        let base = inner.map_calls;
        inner.fail_map_at = Some(base + n);
    }

    /// Makes the page allocator skip a page between allocations, so no two
    /// consecutive returns are physically adjacent.
    pub fn set_noncontiguous_pages(&self, on: bool) {
        self.inner.lock().unwrap().noncontiguous_pages = on;
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        MockPlatform::new()
    }
}

impl Platform for MockPlatform {
    fn mailbox_read32(&self, offset: u64) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if offset == MB_REPLY_COUNT {
            return inner.pending_replies.len() as u32;
        }
        let rel = offset.wrapping_sub(MB_REPLY_BASE);
        match rel {
            0 => inner.pending_replies.front().map(|v| *v as u32).unwrap_or(0),
            4 => inner.pending_replies.front().map(|v| (*v >> 32) as u32).unwrap_or(0),
            8 => 0,
            12 => {
                // Fourth read retires the FIFO head, like the hardware does.
                inner.pending_replies.pop_front();
                0
            }
            _ => {
                debug!("bridge_testkit: unexpected mailbox read at {:#x}", offset);
                0
            }
        }
    }

    fn mailbox_write32(&self, offset: u64, value: u32) {
        let completed = {
            let mut inner = self.inner.lock().unwrap();
            inner.mailbox_write_count += 1;
            let rel = offset.wrapping_sub(MB_SEND_BASE);
            match rel {
                0 | 4 | 8 => {
                    inner.mailbox_send_words[(rel / 4) as usize] = value;
                    None
                }
                12 => {
                    inner.mailbox_send_words[3] = value;
                    let msg = (inner.mailbox_send_words[1] as u64) << 32
                        | inner.mailbox_send_words[0] as u64;
                    inner.sent_mailbox.push(msg);
                    Some(msg)
                }
                _ => {
                    debug!("bridge_testkit: unexpected mailbox write at {:#x}", offset);
                    None
                }
            }
        };
        if let Some(msg) = completed {
            // Outside the inner lock: the responder is free to push a reply
            // and fire the interrupt path synchronously.
            if let Some(hook) = self.responder.lock().unwrap().as_ref() {
                hook(msg);
            }
        }
    }

    fn dma_read32(&self, offset: u64) -> u32 {
        *self.inner.lock().unwrap().dma_regs.get(&offset).unwrap_or(&0)
    }

    fn dma_write32(&self, offset: u64, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.dma_regs.insert(offset, value);
        inner.dma_writes.push((offset, value));
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_coherent(&self, size: usize) -> Option<CoherentBuffer> {
        let mut inner = self.inner.lock().unwrap();
        let mem = vec![0u8; size].into_boxed_slice();
        let host = Box::leak(mem).as_mut_ptr();
        let dma = inner.next_coherent_dma;
        inner.next_coherent_dma += ((size as u64) + 0xFFF) & !0xFFF;
        inner.coherent.push(CoherentRecord { dma, host, len: size, freed: false });
        Some(unsafe {
            CoherentBuffer::from_raw_parts(NonNull::new_unchecked(host), size, DmaAddress(dma))
        })
    }

    fn free_coherent(&self, buf: CoherentBuffer) {
        let mut inner = self.inner.lock().unwrap();
        for rec in inner.coherent.iter_mut() {
            if rec.dma == buf.dma_address().value() {
                assert!(!rec.freed, "double free of coherent buffer at {}", buf.dma_address());
                rec.freed = true;
                return;
            }
        }
        panic!("free of unknown coherent buffer at {}", buf.dma_address());
    }

    fn alloc_page(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.noncontiguous_pages && inner.next_page + 1 < inner.arena_pages {
            inner.next_page += 1;
        }
        if inner.next_page >= inner.arena_pages {
            return None;
        }
        let ptr = unsafe { inner.arena.add(inner.next_page * self.page_size) };
        inner.next_page += 1;
        inner.allocated_page_count += 1;
        NonNull::new(ptr)
    }

    fn free_page(&self, _page: NonNull<u8>) {
        self.inner.lock().unwrap().freed_page_count += 1;
    }

    fn map_single(&self, ptr: *const u8, len: usize, dir: DmaDirection) -> DmaAddress {
        let mut inner = self.inner.lock().unwrap();
        inner.map_calls += 1;
        if inner.fail_map_at == Some(inner.map_calls) {
            return DmaAddress::MAPPING_ERROR;
        }
        let dma = DmaAddress(inner.next_streaming_dma);
        inner.next_streaming_dma += ((len as u64) + 0xFFF) & !0xFFF;
        inner.mappings.push(MapRecord { dma, host: ptr, len, dir, unmapped: false });
        dma
    }

    fn unmap_single(&self, addr: DmaAddress, len: usize, dir: DmaDirection) {
        let mut inner = self.inner.lock().unwrap();
        for rec in inner.mappings.iter_mut() {
            if rec.dma == addr && !rec.unmapped {
                assert_eq!(rec.len, len, "unmap length mismatch for {}", addr);
                assert_eq!(rec.dir, dir, "unmap direction mismatch for {}", addr);
                rec.unmapped = true;
                return;
            }
        }
        panic!("unmap of unknown mapping at {}", addr);
    }
}
