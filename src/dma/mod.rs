//! DMA-capable memory
//!
//! The bus never hands a buffer to the transfer engine that the engine's DMA
//! cannot reach. Buffers that fail the check are replaced by temporaries from
//! the [`DmaHeap`] for the duration of one transfer.

pub(crate) mod staging;

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::slice;

/// Allocator for memory the transfer engine's DMA can reach.
///
/// All functions are associated functions: the heap is a property of the chip,
/// not of one bus instance.
pub trait DmaHeap {
    /// Alignment, in bytes, required for buffers handed to DMA.
    const ALIGN: usize = 4;

    /// Whether `len` bytes at `ptr` live in DMA-capable memory.
    ///
    /// Alignment is checked separately against [`DmaHeap::ALIGN`].
    fn is_dma_capable(ptr: *const u8, len: usize) -> bool;

    /// Allocate `len` bytes of DMA-capable memory aligned to [`DmaHeap::ALIGN`].
    ///
    /// Must not block; returns `None` when the memory is exhausted.
    fn allocate(len: usize) -> Option<NonNull<u8>>;

    /// Free memory returned by [`DmaHeap::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must come from one earlier call to `allocate` that was not freed yet.
    unsafe fn free(ptr: NonNull<u8>, len: usize);
}

/// Heap for buses without DMA: every buffer is acceptable, nothing can be allocated.
///
/// A bus configured without DMA never asks for temporaries, so this is only a placeholder.
pub struct NoDma;

impl DmaHeap for NoDma {
    const ALIGN: usize = 1;

    fn is_dma_capable(_ptr: *const u8, _len: usize) -> bool {
        true
    }

    fn allocate(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(_ptr: NonNull<u8>, _len: usize) {}
}

/// Whether `len` bytes at `ptr` can be handed to DMA as they are.
pub(crate) fn is_usable<D: DmaHeap>(ptr: *const u8, len: usize) -> bool {
    ptr as usize % D::ALIGN == 0 && D::is_dma_capable(ptr, len)
}

/// Temporary DMA buffer, freed on drop.
pub(crate) struct DmaBuffer<D: DmaHeap> {
    ptr: NonNull<u8>,
    len: usize,
    _heap: PhantomData<D>,
}

// SAFETY: the buffer is exclusively owned, the heap functions take no shared state from the caller.
unsafe impl<D: DmaHeap> Send for DmaBuffer<D> {}

impl<D: DmaHeap> DmaBuffer<D> {
    /// Allocate at least `len` bytes, rounded up to the DMA alignment.
    pub(crate) fn alloc(len: usize) -> Option<Self> {
        let len = len.next_multiple_of(D::ALIGN.max(1)).max(D::ALIGN.max(1));
        let ptr = D::allocate(len)?;
        // SAFETY: `allocate` returned `len` writable bytes.
        unsafe { ptr.as_ptr().write_bytes(0, len) };
        trace!("allocated {} byte DMA buffer", len);
        Some(Self {
            ptr,
            len,
            _heap: PhantomData,
        })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes were allocated for this buffer and are owned by it.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `len` bytes were allocated for this buffer and are owned by it.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<D: DmaHeap> Drop for DmaBuffer<D> {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from `D::allocate` in `alloc` and are freed exactly once here.
        unsafe { D::free(self.ptr, self.len) }
    }
}
