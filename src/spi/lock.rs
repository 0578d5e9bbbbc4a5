//! Bus arbitration
//!
//! One [`BusLock`] per bus decides which device may drive the bus and whether the
//! bus interrupt is armed. Two kinds of users compete for the bus:
//!
//! - the interrupt handler ("background"), servicing queued transactions of any
//!   device with a pending request,
//! - one task at a time holding an acquisition, for polling transfers or a
//!   long-lived exclusive lock.
//!
//! While a device is the acquirer, the background only services that device.
//! Ownership changes hands through the interrupt handler: a released bus with
//! waiting acquirers or pending requests re-arms the interrupt, and the handler
//! promotes the next acquirer once it has retired the transfer in flight.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Poll, Waker};

use embassy_hal_internal::drop::OnDrop;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::waitqueue::WakerRegistration;

use super::config::MAX_DEVICES;
use super::engine::InterruptControl;
use super::{Error, Result};

const fn bit(dev: usize) -> u32 {
    1 << dev
}

struct LockState {
    /// Registered devices.
    registered: u32,
    /// Devices with queued work waiting for the background.
    bg_req: u32,
    /// Devices waiting in `acquire`.
    acq_wait: u32,
    acquirer: Option<usize>,
    /// Device whose configuration is in the controller.
    configured: Option<usize>,
    /// Interrupt armed, the background owns the bus.
    bg_active: bool,
    /// The background started a transfer that is not retired yet.
    in_flight: bool,
    wakers: [WakerRegistration; MAX_DEVICES],
}

pub(crate) struct BusLock<I: InterruptControl> {
    irq: I,
    state: Mutex<CriticalSectionRawMutex, RefCell<LockState>>,
}

impl<I: InterruptControl> BusLock<I> {
    pub(crate) fn new(irq: I) -> Self {
        Self {
            irq,
            state: Mutex::new(RefCell::new(LockState {
                registered: 0,
                bg_req: 0,
                acq_wait: 0,
                acquirer: None,
                configured: None,
                bg_active: false,
                in_flight: false,
                wakers: [const { WakerRegistration::new() }; MAX_DEVICES],
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut LockState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// Take the lowest free slot among the first `cs_count`.
    pub(crate) fn register(&self, cs_count: usize) -> Result<usize> {
        self.with(|s| {
            let slots = cs_count.min(MAX_DEVICES);
            let free = !s.registered & (bit(slots) - 1);
            if free == 0 {
                return Err(Error::NotFound);
            }
            let dev = free.trailing_zeros() as usize;
            s.registered |= bit(dev);
            if s.configured == Some(dev) {
                s.configured = None;
            }
            Ok(dev)
        })
    }

    /// Free `dev`'s slot. Returns whether no device is left, in which case the interrupt is off.
    pub(crate) fn unregister(&self, dev: usize) -> Result<bool> {
        self.with(|s| {
            if s.bg_req & bit(dev) != 0 || s.acq_wait & bit(dev) != 0 || s.acquirer == Some(dev) {
                return Err(Error::InvalidState);
            }
            s.registered &= !bit(dev);
            if s.configured == Some(dev) {
                s.configured = None;
            }
            let last = s.registered == 0;
            if last && !s.bg_active {
                self.irq.disable();
            }
            Ok(last)
        })
    }

    /// Mark `dev` as having queued work, arming the interrupt if the background may run it.
    pub(crate) fn request_background(&self, dev: usize) {
        self.with(|s| {
            s.bg_req |= bit(dev);
            if !s.bg_active && (s.acquirer.is_none() || s.acquirer == Some(dev)) {
                s.bg_active = true;
                self.irq.enable();
            }
        })
    }

    pub(crate) fn acquiring_device(&self) -> Option<usize> {
        self.with(|s| s.acquirer)
    }

    pub(crate) fn check_device_request(&self, dev: usize) -> bool {
        self.with(|s| s.bg_req & bit(dev) != 0)
    }

    pub(crate) fn clear_device_request(&self, dev: usize) {
        self.with(|s| s.bg_req &= !bit(dev))
    }

    /// Next device with a request, round-robin starting after the last configured device.
    pub(crate) fn next_request(&self) -> Option<usize> {
        self.with(|s| {
            let start = s.configured.unwrap_or(MAX_DEVICES - 1);
            (1..=MAX_DEVICES)
                .map(|i| (start + i) % MAX_DEVICES)
                .find(|&dev| s.bg_req & bit(dev) != 0)
        })
    }

    /// Whether `dev`'s configuration must be written before its next transfer.
    ///
    /// Returns true once after another device used the controller.
    pub(crate) fn touch(&self, dev: usize) -> bool {
        self.with(|s| s.configured.replace(dev) != Some(dev))
    }

    #[cfg(test)]
    pub(crate) fn is_bg_active(&self) -> bool {
        self.with(|s| s.bg_active)
    }

    /// Become the acquirer, waiting until no other device holds the bus and the
    /// background is idle. Dropping the future withdraws the request.
    ///
    /// A grant belongs to the slot, not to the caller: callers serialize per device.
    pub(crate) async fn acquire(&self, dev: usize) -> Result<()> {
        let cancel = OnDrop::new(|| self.withdraw(dev));

        poll_fn(|cx| {
            self.with(|s| {
                if s.acquirer == Some(dev) && !s.bg_active {
                    return Poll::Ready(());
                }
                if s.acquirer.is_none() && !s.bg_active {
                    s.acquirer = Some(dev);
                    s.acq_wait &= !bit(dev);
                    return Poll::Ready(());
                }
                if s.acquirer != Some(dev) {
                    s.acq_wait |= bit(dev);
                }
                s.wakers[dev].register(cx.waker());
                Poll::Pending
            })
        })
        .await;

        cancel.defuse();
        debug!("device {} acquired the bus", dev);
        Ok(())
    }

    /// A pending acquisition was dropped. If the bus was handed over meanwhile, give it back.
    fn withdraw(&self, dev: usize) {
        let granted = self.with(|s| {
            s.acq_wait &= !bit(dev);
            s.acquirer == Some(dev)
        });
        if granted {
            self.acquire_end(dev);
        }
    }

    /// Give up the acquisition and let the background hand the bus on.
    pub(crate) fn acquire_end(&self, dev: usize) {
        self.with(|s| {
            debug_assert!(s.acquirer == Some(dev));
            s.acquirer = None;
            // A task of `dev` parked in `poll_bg_done` re-checks its acquisition.
            s.wakers[dev].wake();
            if !s.bg_active && (s.bg_req != 0 || s.acq_wait != 0) {
                s.bg_active = true;
                self.irq.enable();
            }
        });
        debug!("device {} released the bus", dev);
    }

    /// Whether the background has no transfer running or pending. If it has, `waker` is
    /// woken when it quiesces with `dev` as the acquirer, or when `dev` releases the bus.
    pub(crate) fn poll_bg_done(&self, dev: usize, waker: &Waker) -> bool {
        self.with(|s| {
            if !s.bg_active {
                return true;
            }
            s.wakers[dev].register(waker);
            false
        })
    }

    /// Interrupt entry. Returns true when there is no transfer to retire.
    pub(crate) fn bg_entry(&self) -> bool {
        self.with(|s| !core::mem::replace(&mut s.in_flight, false))
    }

    /// Hand the bus to the lowest waiting acquirer once nobody holds it.
    ///
    /// Returns true if an acquirer was promoted.
    pub(crate) fn bg_promote_waiter(&self) -> bool {
        self.with(|s| {
            if s.acquirer.is_some() || s.acq_wait == 0 {
                return false;
            }
            let dev = s.acq_wait.trailing_zeros() as usize;
            s.acq_wait &= !bit(dev);
            s.acquirer = Some(dev);
            trace!("bus handed over to device {}", dev);
            true
        })
    }

    /// Interrupt exit.
    ///
    /// Returns true when the handler is done: either a transfer was started, or there is
    /// nothing left for the background and the interrupt has been disabled. Returns false
    /// when work showed up meanwhile and the handler should select again. `resume` is set
    /// when the bus went idle while a device holds the acquisition.
    pub(crate) fn bg_exit(&self, dispatched: bool, resume: &mut bool) -> bool {
        self.with(|s| {
            if dispatched {
                s.in_flight = true;
                return true;
            }
            let pending = match s.acquirer {
                Some(dev) => s.bg_req & bit(dev) != 0,
                None => s.bg_req != 0 || s.acq_wait != 0,
            };
            if pending {
                return false;
            }
            s.bg_active = false;
            self.irq.disable();
            if s.acquirer.is_some() {
                *resume = true;
            }
            true
        })
    }

    /// Wake the acquirer waiting for the background to go idle.
    pub(crate) fn resume_acquirer(&self) {
        self.with(|s| {
            if let Some(dev) = s.acquirer {
                s.wakers[dev].wake();
            }
        })
    }
}
