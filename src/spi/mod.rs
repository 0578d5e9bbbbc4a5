//! Shared SPI bus
//!
//! A [`SpiBus`] owns one SPI controller and arbitrates it between up to
//! [`MAX_DEVICES`] registered [`SpiDevice`]s. Devices either queue transactions
//! that the bus interrupt handler runs in the background, or run polling
//! transactions from their own task while holding the bus.

mod config;
mod device;
mod engine;
mod error;
mod lock;
mod queue;
mod transaction;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

pub use self::config::*;
pub use self::device::SpiDevice;
pub use self::engine::*;
pub use self::error::{Error, Result};
use self::lock::BusLock;
use self::queue::TransQueue;
pub use self::transaction::*;
use crate::dma::staging::PrivateDescriptor;
use crate::dma::DmaHeap;

/// Rounds the interrupt handler may re-select before giving up and letting the
/// interrupt fire again.
pub const MAX_ISR_RETRIES: usize = 8;

/// Per-device state, owned by the bus.
pub(crate) struct DeviceRecord<'d, D: DmaHeap> {
    pub(crate) config: DeviceConfig<'d>,
    pub(crate) settings: DeviceSettings,
    pub(crate) trans_queue: TransQueue<PrivateDescriptor<'d, D>>,
    /// `None` when the device opted out of results.
    pub(crate) ret_queue: Option<TransQueue<(u32, Transaction<'d>)>>,
    /// Last submission number handed out.
    pub(crate) seq: u32,
}

impl<'d, D: DmaHeap> DeviceRecord<'d, D> {
    /// Resolve `desc` against the device defaults for the transfer engine.
    fn transfer(&self, desc: &mut PrivateDescriptor<'d, D>) -> Transfer {
        let settings = &self.settings;
        let half_duplex = self.config.is_half_duplex();
        let uses_dma = desc.uses_dma();
        let rx = desc.rx_ptr();
        let trans = desc.trans();
        let flags = trans.flags();

        let cmd_bits = if flags.contains(TransFlags::VARIABLE_CMD) {
            trans.command_bits
        } else {
            settings.command_bits
        };
        let addr_bits = if flags.contains(TransFlags::VARIABLE_ADDR) {
            trans.address_bits
        } else {
            settings.address_bits
        };
        let mut dummy_bits = if flags.contains(TransFlags::VARIABLE_DUMMY) {
            trans.dummy_bits
        } else {
            settings.dummy_bits
        };
        // Sampling compensation at high clock rates.
        if trans.has_rx() && !settings.flags.contains(DeviceFlags::NO_DUMMY) {
            dummy_bits = dummy_bits.saturating_add(settings.timing.timing_dummy);
        }

        Transfer {
            cs: settings.cs,
            flags,
            cmd: trans.cmd,
            cmd_bits,
            addr: trans.addr,
            addr_bits,
            dummy_bits,
            tx: desc.tx_ptr(),
            tx_bits: if half_duplex && !trans.has_tx() { 0 } else { trans.length },
            rx,
            rx_bits: if trans.has_rx() { trans.rx_length } else { 0 },
            lines: LineMode::from_flags(flags),
            cs_keep_active: flags.contains(TransFlags::CS_KEEP_ACTIVE),
            dma: uses_dma,
        }
    }
}

/// Mutable state of one bus, shared between tasks and the interrupt handler.
pub(crate) struct HostContext<'d, E: TransferEngine> {
    pub(crate) engine: E,
    pub(crate) devices: [Option<DeviceRecord<'d, E::Dma>>; MAX_DEVICES],
    /// Device whose CS is asserted, `None` when no transfer is in flight.
    pub(crate) cur_cs: Option<usize>,
    pub(crate) cur_trans: Option<PrivateDescriptor<'d, E::Dma>>,
    /// A polling transfer owns `cur_cs`/`cur_trans`.
    pub(crate) polling: bool,
    /// Slots with a task on its way to the acquisition, in `polling_start` or `acquire_bus`.
    /// The bus lock grants per slot, so at most one such task may exist per device.
    pub(crate) claimed: u32,
    /// Device holding a long-lived acquisition.
    pub(crate) acquiring: Option<usize>,
    /// Controller initialized.
    pub(crate) active: bool,
}

impl<'d, E: TransferEngine> HostContext<'d, E> {
    pub(crate) fn device(&self, slot: usize) -> &DeviceRecord<'d, E::Dma> {
        self.devices[slot].as_ref().unwrap_or_else(|| unregistered(slot))
    }

    pub(crate) fn device_mut(&mut self, slot: usize) -> &mut DeviceRecord<'d, E::Dma> {
        self.devices[slot].as_mut().unwrap_or_else(|| unregistered(slot))
    }

    /// Reserve the acquisition path of `slot` for the calling task.
    pub(crate) fn claim(&mut self, slot: usize) -> Result<()> {
        if self.claimed & (1 << slot) != 0 {
            return Err(Error::InvalidState);
        }
        self.claimed |= 1 << slot;
        Ok(())
    }

    pub(crate) fn unclaim(&mut self, slot: usize) {
        self.claimed &= !(1 << slot);
    }

    /// Program and start `desc` for `slot`.
    pub(crate) fn start(
        &mut self,
        slot: usize,
        desc: PrivateDescriptor<'d, E::Dma>,
        dirty: bool,
        workaround: Option<&dyn DmaWorkaround>,
    ) {
        debug_assert!(self.cur_cs.is_none());
        let Self {
            engine,
            devices,
            cur_cs,
            cur_trans,
            ..
        } = self;
        let rec = devices[slot].as_ref().unwrap_or_else(|| unregistered(slot));

        if dirty {
            engine.configure(&rec.settings);
        }
        if let Some(hooks) = rec.config.hooks {
            hooks.pre_transfer(desc.trans());
        }

        // Pointers into the inline data are taken once the descriptor sits in its slot.
        let desc = cur_trans.insert(desc);
        if desc.uses_dma() {
            if let Some(w) = workaround {
                w.before_transfer();
            }
        }
        let xfer = rec.transfer(desc);
        engine.program(&xfer);
        engine.start();
        *cur_cs = Some(slot);
    }

    /// Retire the transfer in flight: collect the result, release the staging buffers and
    /// run the completion hook.
    pub(crate) fn finish(&mut self, workaround: Option<&dyn DmaWorkaround>) -> (usize, u32, Transaction<'d>) {
        let (Some(slot), Some(desc)) = (self.cur_cs.take(), self.cur_trans.take()) else {
            panic!("no transfer in flight");
        };
        assert!(self.engine.is_done());
        self.engine.fetch_result();
        if desc.uses_dma() {
            if let Some(w) = workaround {
                w.after_transfer();
            }
        }

        let seq = desc.seq;
        let trans = desc.uninstall();
        if let Some(hooks) = self.device(slot).config.hooks {
            hooks.post_transfer(&trans);
        }
        (slot, seq, trans)
    }
}

#[cold]
fn unregistered(slot: usize) -> ! {
    panic!("device slot {} is not registered", slot)
}

/// Steps of one interrupt handler run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum IsrPhase {
    /// Collect the transfer that just finished.
    Retire,
    /// Pick the next device to service.
    Select,
    /// Check whether to stop, retry or quiesce.
    Exit { dispatched: bool },
}

/// One SPI controller shared by several devices.
pub struct SpiBus<'d, E: TransferEngine, I: InterruptControl> {
    lock: BusLock<I>,
    host: Mutex<CriticalSectionRawMutex, RefCell<HostContext<'d, E>>>,
    config: BusConfig<'d>,
}

impl<'d, E: TransferEngine, I: InterruptControl> SpiBus<'d, E, I> {
    /// Create a bus on `engine`. The controller is brought up when the first device is added.
    pub fn new(engine: E, irq: I, config: BusConfig<'d>) -> Self {
        irq.disable();
        Self {
            lock: BusLock::new(irq),
            host: Mutex::new(RefCell::new(HostContext {
                engine,
                devices: [const { None }; MAX_DEVICES],
                cur_cs: None,
                cur_trans: None,
                polling: false,
                claimed: 0,
                acquiring: None,
                active: false,
            })),
            config,
        }
    }

    /// Bus configuration.
    pub fn config(&self) -> &BusConfig<'d> {
        &self.config
    }

    /// Largest transfer in bytes.
    ///
    /// Without DMA a transfer is limited by the controller's data FIFO.
    pub fn max_transaction_len(&self) -> usize {
        if self.config.dma {
            self.config.max_transfer_sz
        } else {
            let fifo_len = self.with_host(|host| host.engine.capabilities().fifo_len);
            fifo_len.min(self.config.max_transfer_sz)
        }
    }

    /// Register a device. The configuration is checked and its clock timing computed up front.
    pub fn add_device<'b>(&'b self, config: DeviceConfig<'d>) -> Result<SpiDevice<'b, 'd, E, I>> {
        let slot = self.with_host(|host| {
            let caps = host.engine.capabilities();
            let slot = self.lock.register(caps.cs_count)?;
            let settings = match config.resolve(slot, &caps, |f, d, i| host.engine.clock_timing(f, d, i)) {
                Ok(s) => s,
                Err(e) => {
                    let _ = self.lock.unregister(slot);
                    return Err(e);
                }
            };

            if !host.active {
                debug!("bringing up SPI controller");
                host.engine.init();
                host.active = true;
            }
            host.engine.route_cs(
                slot,
                config.cs,
                config.flags.contains(DeviceFlags::POSITIVE_CS),
            );
            host.devices[slot] = Some(DeviceRecord {
                config,
                settings,
                trans_queue: TransQueue::new(config.queue_size),
                ret_queue: config.returns_results().then(|| TransQueue::new(config.queue_size)),
                seq: 0,
            });

            debug!(
                "device {} added: {} Hz requested, {} Hz actual",
                slot,
                config.clock_speed_hz,
                settings.timing.actual_freq
            );
            Ok(slot)
        })?;

        Ok(SpiDevice::new(self, slot))
    }

    /// Interrupt handler. Must be called from the controller's interrupt.
    ///
    /// Retires the finished transfer, then starts the next queued one or disables the
    /// interrupt once there is nothing left to do.
    pub fn on_interrupt(&self) {
        let workaround = self.config.workaround;
        let mut resume = false;

        self.with_host(|host| {
            let mut phase = if self.lock.bg_entry() {
                IsrPhase::Select
            } else {
                IsrPhase::Retire
            };
            let mut retries = 0;

            loop {
                phase = match phase {
                    IsrPhase::Retire => {
                        assert!(!host.polling, "background transfer retired during a polling transfer");
                        let (slot, seq, trans) = host.finish(workaround);
                        if let Some(ret) = host.device_mut(slot).ret_queue.as_mut() {
                            let pushed = ret.try_push((seq, trans)).is_ok();
                            assert!(pushed, "result queue overflow");
                        }
                        IsrPhase::Select
                    }
                    IsrPhase::Select => {
                        if self.lock.bg_promote_waiter() {
                            resume = true;
                        }
                        match self.select(host) {
                            Some((slot, desc)) => {
                                assert!(!host.polling, "background dispatch during a polling transfer");
                                trace!("dispatching transaction {} of device {}", desc.seq, slot);
                                host.start(slot, desc, self.lock.touch(slot), workaround);
                                IsrPhase::Exit { dispatched: true }
                            }
                            None => IsrPhase::Exit { dispatched: false },
                        }
                    }
                    IsrPhase::Exit { dispatched } => {
                        if self.lock.bg_exit(dispatched, &mut resume) {
                            break;
                        }
                        retries += 1;
                        if retries >= MAX_ISR_RETRIES {
                            warn!("SPI arbitration did not settle, leaving the interrupt armed");
                            break;
                        }
                        IsrPhase::Select
                    }
                };
            }
        });

        if resume {
            self.lock.resume_acquirer();
        }
    }

    /// Dequeue the next transaction the background may run.
    ///
    /// While a device holds the acquisition only its queue is considered. Devices whose
    /// result queue has no room are skipped until a result is collected.
    fn select(&self, host: &mut HostContext<'d, E>) -> Option<(usize, PrivateDescriptor<'d, E::Dma>)> {
        loop {
            let slot = match self.lock.acquiring_device() {
                Some(slot) if self.lock.check_device_request(slot) => slot,
                Some(_) => return None,
                None => self.lock.next_request()?,
            };
            let Some(rec) = host.devices[slot].as_mut() else {
                self.lock.clear_device_request(slot);
                continue;
            };
            if rec.ret_queue.as_ref().is_some_and(|q| q.is_full()) {
                self.lock.clear_device_request(slot);
                continue;
            }
            match rec.trans_queue.try_pop() {
                Some(desc) => return Some((slot, desc)),
                None => self.lock.clear_device_request(slot),
            }
        }
    }

    pub(crate) fn with_host<R>(&self, f: impl FnOnce(&mut HostContext<'d, E>) -> R) -> R {
        self.host.lock(|host| f(&mut host.borrow_mut()))
    }

    pub(crate) fn lock(&self) -> &BusLock<I> {
        &self.lock
    }
}
