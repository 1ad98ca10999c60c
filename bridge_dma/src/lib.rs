//! The segment-list DMA mapper of the bridge co-processor transport.
//!
//! Large transfers reach the device as a linked chain of *segment-list
//! pages*: each page starts with a [`SegmentListHeader`] naming how many
//! packed `(addr, length)` elements follow, the total transfer size, and the
//! device address of the next page in the chain (zero on the last one).
//!
//! Mapping proceeds in three steps:
//! 1. the input buffer becomes a scatter/gather list of per-page ranges
//!    (or one range, for physically contiguous memory);
//! 2. every range is mapped for streaming DMA in the caller's direction —
//!    any sentinel return unwinds the whole map;
//! 3. the mapped `(addr, length)` pairs are packed into segment-list pages
//!    from the platform page allocator, the pages are mapped to-device, and
//!    the chain's next pointers are threaded.
//!
//! When the page allocator returns a page physically adjacent to the
//! previous one, the mapper extends the current segment-list page instead of
//! starting a new header, so one header can cover several pages of elements.
//!
//! Failure anywhere unwinds completely: no segment-list page stays allocated
//! or mapped and the scatter list is unmapped before the error is returned.

#[macro_use] extern crate log;


use core::ptr::NonNull;
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

use bridge_platform::{DmaAddress, DmaDirection, Platform};
use bridge_types::Error;

/// The header at the start of every segment-list page chain entry.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SegmentListHeader {
    /// Number of elements written under this header.
    pub element_count: u32,
    pub _reserved: u32,
    /// Total bytes described by this header's elements.
    pub data_size: u64,
    /// Device address of the next chain entry, zero on the last.
    pub next_segl_addr: u64,
    /// Byte length of the next chain entry, zero on the last.
    pub next_segl_length: u64,
}

const_assert_eq!(core::mem::size_of::<SegmentListHeader>(), 32);

/// One packed scatter element: a device address and its length.
#[derive(FromBytes, AsBytes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SegmentListElement {
    pub addr: u64,
    pub length: u64,
}

const_assert_eq!(core::mem::size_of::<SegmentListElement>(), 16);

/// One scatter/gather range of the input buffer.
#[derive(Debug, Clone, Copy)]
struct SgEntry {
    ptr: *const u8,
    len: usize,
    dma: DmaAddress,
}

/// One chain entry: `page_count` physically consecutive host pages holding a
/// header plus packed elements.
#[derive(Debug)]
pub struct SegListChunk {
    first_page: NonNull<u8>,
    page_count: usize,
    element_count: u32,
    data_size: u64,
    dma: DmaAddress,
}

impl SegListChunk {
    /// Host pointer to the chunk's header page.
    pub fn as_ptr(&self) -> *const u8 {
        self.first_page.as_ptr()
    }

    /// Number of physically consecutive pages folded into this chunk.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Device address of the chunk, valid once the buffer is fully mapped.
    pub fn dma_address(&self) -> DmaAddress {
        self.dma
    }
}

/// A fully mapped DMA buffer: the scatter list of the input memory plus the
/// mapped segment-list chain describing it to the device.
///
/// Dropping the buffer unwinds everything: the chain is unmapped and freed,
/// then the scatter list is unmapped in its original direction.
pub struct DmaBuffer {
    platform: Arc<dyn Platform>,
    direction: DmaDirection,
    sg: Vec<SgEntry>,
    chunks: Vec<SegListChunk>,
    data_size: u64,
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("direction", &self.direction)
            .field("sg", &self.sg)
            .field("chunks", &self.chunks)
            .field("data_size", &self.data_size)
            .finish()
    }
}

// The raw pointers reference caller-owned buffer memory and mapper-owned
// segment-list pages, both pinned for the lifetime of the mapping.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Total bytes of buffer data described by the mapping.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Device address of the first segment-list chain entry.
    pub fn segment_list_addr(&self) -> DmaAddress {
        self.chunks[0].dma
    }

    /// Byte length of the first segment-list chain entry.
    pub fn segment_list_length(&self) -> u64 {
        (self.chunks[0].page_count * self.platform.page_size()) as u64
    }

    /// The mapped chain entries, first to last.
    pub fn chunks(&self) -> &[SegListChunk] {
        &self.chunks
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let page_size = self.platform.page_size();
        for chunk in &self.chunks {
            if !chunk.dma.is_error() {
                self.platform
                    .unmap_single(chunk.dma, chunk.page_count * page_size, DmaDirection::ToDevice);
            }
            free_chunk_pages(&*self.platform, chunk, page_size);
        }
        for entry in &self.sg {
            self.platform.unmap_single(entry.dma, entry.len, self.direction);
        }
    }
}

/// Explicit unmap; equivalent to dropping the buffer.
pub fn unmap_dma_buffer(buf: DmaBuffer) {
    drop(buf);
}

/// Maps a physically contiguous (kernel-style) buffer: one scatter entry
/// covering the whole range.
///
/// # Safety
/// `ptr..ptr+len` must stay valid and pinned until the returned buffer is
/// dropped; the device reads or writes it per `dir` for as long as a
/// submission references the mapping.
pub unsafe fn map_dma_buffer_km(
    platform: &Arc<dyn Platform>,
    ptr: *const u8,
    len: usize,
    dir: DmaDirection,
) -> Result<DmaBuffer, Error> {
    let sg = vec![SgEntry { ptr, len, dma: DmaAddress::MAPPING_ERROR }];
    map_dma_buffer(platform, sg, dir)
}

/// Maps a virtually contiguous buffer backed by individually pinned pages:
/// one scatter entry per page, honoring the start offset within the first
/// page.
///
/// # Safety
/// Same contract as [`map_dma_buffer_km`].
pub unsafe fn map_dma_buffer_vm(
    platform: &Arc<dyn Platform>,
    ptr: *const u8,
    len: usize,
    dir: DmaDirection,
) -> Result<DmaBuffer, Error> {
    let page_size = platform.page_size();
    let mut sg = Vec::new();
    let mut offset = 0usize;
    while offset < len {
        let page_off = (ptr as usize + offset) % page_size;
        let chunk = (page_size - page_off).min(len - offset);
        sg.push(SgEntry {
            ptr: ptr.add(offset),
            len: chunk,
            dma: DmaAddress::MAPPING_ERROR,
        });
        offset += chunk;
    }
    map_dma_buffer(platform, sg, dir)
}

fn map_dma_buffer(
    platform: &Arc<dyn Platform>,
    mut sg: Vec<SgEntry>,
    dir: DmaDirection,
) -> Result<DmaBuffer, Error> {
    // Map the scatter list; the mapped count must equal the nominal count.
    for i in 0..sg.len() {
        let dma = platform.map_single(sg[i].ptr, sg[i].len, dir);
        if dma.is_error() {
            error!(
                "bridge_dma: scatter list mapping failed at entry {} of {}",
                i,
                sg.len()
            );
            for entry in &sg[..i] {
                platform.unmap_single(entry.dma, entry.len, dir);
            }
            return Err(Error::MappingFailed);
        }
        sg[i].dma = dma;
    }

    match map_segment_list(platform, &sg) {
        Ok((chunks, data_size)) => Ok(DmaBuffer {
            platform: platform.clone(),
            direction: dir,
            sg,
            chunks,
            data_size,
        }),
        Err(e) => {
            for entry in &sg {
                platform.unmap_single(entry.dma, entry.len, dir);
            }
            Err(e)
        }
    }
}

fn free_chunk_pages(platform: &dyn Platform, chunk: &SegListChunk, page_size: usize) {
    for i in 0..chunk.page_count {
        let page = unsafe { chunk.first_page.as_ptr().add(i * page_size) };
        platform.free_page(NonNull::new(page).unwrap());
    }
}

/// Packs the mapped scatter entries into a chain of segment-list pages,
/// folding physically consecutive pages, then maps every chunk to-device and
/// threads the next pointers.
fn map_segment_list(
    platform: &Arc<dyn Platform>,
    sg: &[SgEntry],
) -> Result<(Vec<SegListChunk>, u64), Error> {
    let page_size = platform.page_size();
    let header_size = core::mem::size_of::<SegmentListHeader>();
    let element_size = core::mem::size_of::<SegmentListElement>();
    let elements_per_page = (page_size - header_size) / element_size;
    let elements_per_additional_page = page_size / element_size;

    let mut chunks: Vec<SegListChunk> = Vec::new();
    let mut capacity = 0usize;
    let mut written = 0usize;
    let mut prev_page: Option<*mut u8> = None;
    let mut total = 0u64;

    let unwind = |chunks: &[SegListChunk]| {
        for chunk in chunks {
            free_chunk_pages(&**platform, chunk, page_size);
        }
    };

    for entry in sg {
        if written == capacity {
            let page = match platform.alloc_page() {
                Some(page) => page.as_ptr(),
                None => {
                    error!("bridge_dma: segment list page allocation failed");
                    unwind(&chunks);
                    return Err(Error::MappingFailed);
                }
            };
            let folded = prev_page
                .map(|prev| page as usize == prev as usize + page_size)
                .unwrap_or(false);
            if folded {
                let chunk = chunks.last_mut().unwrap();
                chunk.page_count += 1;
                capacity += elements_per_additional_page;
            } else {
                unsafe {
                    core::ptr::write_bytes(page, 0, header_size);
                }
                chunks.push(SegListChunk {
                    first_page: NonNull::new(page).unwrap(),
                    page_count: 1,
                    element_count: 0,
                    data_size: 0,
                    dma: DmaAddress::MAPPING_ERROR,
                });
                capacity = elements_per_page;
                written = 0;
            }
            prev_page = Some(page);
        }

        let chunk = chunks.last_mut().unwrap();
        unsafe {
            let el = chunk
                .first_page
                .as_ptr()
                .add(header_size + written * element_size) as *mut SegmentListElement;
            core::ptr::write(el, SegmentListElement {
                addr: entry.dma.value(),
                length: entry.len as u64,
            });
        }
        written += 1;
        chunk.element_count += 1;
        chunk.data_size += entry.len as u64;
        total += entry.len as u64;
    }

    // Map each chunk to-device and thread the chain. Headers are filled
    // first so the mapping publishes complete pages.
    for chunk in chunks.iter() {
        unsafe {
            let header = chunk.first_page.as_ptr() as *mut SegmentListHeader;
            (*header).element_count = chunk.element_count;
            (*header).data_size = chunk.data_size;
            (*header).next_segl_addr = 0;
            (*header).next_segl_length = 0;
        }
    }
    for i in 0..chunks.len() {
        let dma = platform.map_single(
            chunks[i].first_page.as_ptr(),
            chunks[i].page_count * page_size,
            DmaDirection::ToDevice,
        );
        if dma.is_error() {
            error!("bridge_dma: segment list page mapping failed at chunk {}", i);
            for mapped in &chunks[..i] {
                platform.unmap_single(
                    mapped.dma,
                    mapped.page_count * page_size,
                    DmaDirection::ToDevice,
                );
            }
            unwind(&chunks);
            return Err(Error::MappingFailed);
        }
        chunks[i].dma = dma;
        if i > 0 {
            unsafe {
                let prev_header = chunks[i - 1].first_page.as_ptr() as *mut SegmentListHeader;
                (*prev_header).next_segl_addr = dma.value();
                (*prev_header).next_segl_length = (chunks[i].page_count * page_size) as u64;
            }
        }
    }

    Ok((chunks, total))
}
