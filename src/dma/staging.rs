//! Staging of transaction buffers for DMA

use core::ptr;

use super::{is_usable, DmaBuffer, DmaHeap};
use crate::spi::{Error, RxBuffer, Transaction, TxBuffer};

/// Where one side of a staged transaction reads from or writes to.
pub(crate) enum Staged<D: DmaHeap> {
    /// The side has no data phase.
    None,
    /// The transaction's inline data area.
    Inline,
    /// The caller's buffer, usable as it is.
    Borrowed,
    /// Temporary DMA buffer owned by the bus until the transaction is uninstalled.
    Owned(DmaBuffer<D>),
}

impl<D: DmaHeap> Staged<D> {
    #[cfg(test)]
    pub(crate) fn is_temporary(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

/// A transaction together with the buffers the transfer engine will use for it.
pub(crate) struct PrivateDescriptor<'d, D: DmaHeap> {
    trans: Transaction<'d>,
    tx: Staged<D>,
    rx: Staged<D>,
    dma: bool,
    /// Per-device submission number, used to match results to submissions.
    pub(crate) seq: u32,
}

impl<'d, D: DmaHeap> PrivateDescriptor<'d, D> {
    /// Resolve the buffers of `trans`, allocating DMA temporaries where the caller's buffers
    /// can't be used.
    ///
    /// On failure nothing stays allocated.
    pub(crate) fn setup(trans: Transaction<'d>, dma_required: bool) -> Result<Self, Error> {
        let rx = match trans.rx() {
            RxBuffer::None => Staged::None,
            RxBuffer::Inline(_) => Staged::Inline,
            RxBuffer::Buffer(buf) => {
                let len = trans.rx_bytes();
                if dma_required && !is_usable::<D>(buf.as_ptr(), len) {
                    trace!("rx buffer not DMA capable, staging {} bytes", len);
                    match DmaBuffer::alloc(len) {
                        Some(tmp) => Staged::Owned(tmp),
                        None => {
                            warn!("no DMA memory for {} byte rx buffer", len);
                            return Err(Error::NoMem);
                        }
                    }
                } else {
                    Staged::Borrowed
                }
            }
        };

        let tx = match trans.tx() {
            TxBuffer::None => Staged::None,
            TxBuffer::Inline(_) => Staged::Inline,
            TxBuffer::Buffer(data) => {
                let len = trans.tx_bytes().min(data.len());
                if dma_required && !is_usable::<D>(data.as_ptr(), len) {
                    trace!("tx buffer not DMA capable, staging {} bytes", len);
                    // `rx` is dropped, and its temporary freed, on the error path.
                    let Some(mut tmp) = DmaBuffer::alloc(len) else {
                        warn!("no DMA memory for {} byte tx buffer", len);
                        return Err(Error::NoMem);
                    };
                    tmp.as_mut_slice()[..len].copy_from_slice(&data[..len]);
                    Staged::Owned(tmp)
                } else {
                    Staged::Borrowed
                }
            }
        };

        Ok(Self {
            trans,
            tx,
            rx,
            dma: dma_required,
            seq: 0,
        })
    }

    /// Release the staging buffers and hand the transaction back.
    ///
    /// Data received into a temporary is copied to the caller's storage first.
    pub(crate) fn uninstall(self) -> Transaction<'d> {
        let Self { mut trans, tx, rx, .. } = self;
        drop(tx);

        if let Staged::Owned(tmp) = rx {
            let len = trans.rx_bytes();
            match trans.rx_mut() {
                RxBuffer::Inline(data) => {
                    let n = len.min(data.0.len());
                    data.0[..n].copy_from_slice(&tmp.as_slice()[..n]);
                }
                RxBuffer::Buffer(buf) => {
                    let n = len.min(buf.len());
                    buf[..n].copy_from_slice(&tmp.as_slice()[..n]);
                }
                RxBuffer::None => {}
            }
        }

        trans
    }

    pub(crate) fn trans(&self) -> &Transaction<'d> {
        &self.trans
    }

    /// Whether the transfer moves data through DMA.
    pub(crate) fn uses_dma(&self) -> bool {
        self.dma && (self.trans.has_tx() || self.trans.has_rx())
    }

    pub(crate) fn tx_ptr(&self) -> *const u8 {
        match (&self.tx, self.trans.tx()) {
            (Staged::Owned(tmp), _) => tmp.as_ptr(),
            (Staged::Inline, TxBuffer::Inline(data)) => data.0.as_ptr(),
            (Staged::Borrowed, TxBuffer::Buffer(buf)) => buf.as_ptr(),
            _ => ptr::null(),
        }
    }

    /// The returned pointer stays valid while the descriptor is not moved.
    pub(crate) fn rx_ptr(&mut self) -> *mut u8 {
        match (&mut self.rx, self.trans.rx_mut()) {
            (Staged::Owned(tmp), _) => tmp.as_mut_ptr(),
            (Staged::Inline, RxBuffer::Inline(data)) => data.0.as_mut_ptr(),
            (Staged::Borrowed, RxBuffer::Buffer(buf)) => buf.as_mut_ptr(),
            _ => ptr::null_mut(),
        }
    }

    #[cfg(test)]
    pub(crate) fn staging(&self) -> (&Staged<D>, &Staged<D>) {
        (&self.tx, &self.rx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use core::cell::{Cell, RefCell};
    use core::ptr::NonNull;
    use std::alloc::{alloc, dealloc, Layout};
    use std::vec::Vec;

    use super::*;

    std::thread_local! {
        static LIVE: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
        static BUDGET: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    /// Heap whose only DMA-capable memory is what it allocated itself.
    pub(crate) struct ExtRamHeap;

    impl ExtRamHeap {
        pub(crate) fn live() -> usize {
            LIVE.with(|l| l.borrow().len())
        }

        pub(crate) fn set_budget(n: usize) {
            BUDGET.with(|b| b.set(n));
        }
    }

    impl DmaHeap for ExtRamHeap {
        fn is_dma_capable(ptr: *const u8, _len: usize) -> bool {
            LIVE.with(|l| l.borrow().iter().any(|&(p, _)| p == ptr as usize))
        }

        fn allocate(len: usize) -> Option<NonNull<u8>> {
            if BUDGET.with(|b| b.get()) == 0 {
                return None;
            }
            BUDGET.with(|b| b.set(b.get() - 1));
            // SAFETY: non-zero size, valid alignment.
            let ptr = NonNull::new(unsafe { alloc(Layout::from_size_align(len, 4).unwrap()) })?;
            LIVE.with(|l| l.borrow_mut().push((ptr.as_ptr() as usize, len)));
            Some(ptr)
        }

        unsafe fn free(ptr: NonNull<u8>, len: usize) {
            LIVE.with(|l| {
                let mut l = l.borrow_mut();
                let pos = l.iter().position(|&e| e == (ptr.as_ptr() as usize, len)).unwrap();
                l.swap_remove(pos);
            });
            dealloc(ptr.as_ptr(), Layout::from_size_align(len, 4).unwrap());
        }
    }

    /// Heap where all memory is DMA capable.
    pub(crate) struct InternalHeap;

    impl DmaHeap for InternalHeap {
        fn is_dma_capable(_ptr: *const u8, _len: usize) -> bool {
            true
        }

        fn allocate(len: usize) -> Option<NonNull<u8>> {
            ExtRamHeap::allocate(len)
        }

        unsafe fn free(ptr: NonNull<u8>, len: usize) {
            ExtRamHeap::free(ptr, len)
        }
    }

    #[repr(C, align(4))]
    struct Aligned([u8; 36]);

    #[test]
    fn usable_buffers_are_borrowed() {
        let tx = Aligned([0x11; 36]);
        let mut rx = Aligned([0; 36]);
        let trans = Transaction::transfer(&tx.0[..32], &mut rx.0[..32]);

        let desc = PrivateDescriptor::<InternalHeap>::setup(trans, true).unwrap();
        assert!(matches!(desc.staging(), (Staged::Borrowed, Staged::Borrowed)));
        assert_eq!(desc.tx_ptr(), tx.0.as_ptr());
        assert_eq!(ExtRamHeap::live(), 0);
        desc.uninstall();
    }

    #[test]
    fn misaligned_buffer_gets_a_temporary() {
        let tx = Aligned([0x5a; 36]);
        let trans = Transaction::write(&tx.0[1..9]);

        let desc = PrivateDescriptor::<InternalHeap>::setup(trans, true).unwrap();
        assert!(desc.staging().0.is_temporary());
        assert_eq!(ExtRamHeap::live(), 1);
        // The temporary holds the data before anything else touches it.
        let staged = unsafe { core::slice::from_raw_parts(desc.tx_ptr(), 8) };
        assert_eq!(staged, &[0x5a; 8]);

        desc.uninstall();
        assert_eq!(ExtRamHeap::live(), 0);
    }

    #[test]
    fn no_staging_without_dma() {
        let tx = Aligned([0; 36]);
        let trans = Transaction::write(&tx.0[1..9]);

        let desc = PrivateDescriptor::<ExtRamHeap>::setup(trans, false).unwrap();
        assert!(matches!(desc.staging(), (Staged::Borrowed, Staged::None)));
        assert!(!desc.uses_dma());
        assert_eq!(ExtRamHeap::live(), 0);
    }

    #[test]
    fn inline_data_is_never_staged() {
        let trans = Transaction::new().with_tx_data([1, 2, 3, 4], 32).with_rx_data(32);

        let mut desc = PrivateDescriptor::<ExtRamHeap>::setup(trans, true).unwrap();
        assert!(matches!(desc.staging(), (Staged::Inline, Staged::Inline)));
        unsafe { desc.rx_ptr().copy_from(desc.tx_ptr(), 4) };

        let trans = desc.uninstall();
        assert_eq!(trans.rx_data(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn received_data_is_copied_back_from_temporary() {
        let mut rx = [0xee_u8; 40];
        let mut trans = Transaction::read(&mut rx);
        trans.rx_length = 200;

        let mut desc = PrivateDescriptor::<ExtRamHeap>::setup(trans, true).unwrap();
        assert!(desc.staging().1.is_temporary());
        assert_eq!(ExtRamHeap::live(), 1);

        // Hardware fills the staged buffer.
        let pattern: Vec<u8> = (0..25).collect();
        unsafe { desc.rx_ptr().copy_from(pattern.as_ptr(), 25) };

        let trans = desc.uninstall();
        assert_eq!(ExtRamHeap::live(), 0);
        let rx = trans.into_rx_buffer().unwrap();
        assert_eq!(&rx[..25], &pattern[..]);
        assert!(rx[25..].iter().all(|&b| b == 0xee));
    }

    #[test]
    fn failed_tx_allocation_releases_rx_temporary() {
        let tx = [1_u8; 16];
        let mut rx = [0_u8; 16];
        let trans = Transaction::transfer(&tx, &mut rx);

        ExtRamHeap::set_budget(1);
        let res = PrivateDescriptor::<ExtRamHeap>::setup(trans, true);
        ExtRamHeap::set_budget(usize::MAX);

        assert_eq!(res.err(), Some(Error::NoMem));
        assert_eq!(ExtRamHeap::live(), 0);
    }
}
