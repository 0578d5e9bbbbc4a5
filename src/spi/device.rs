//! Registered device handle

use core::future::poll_fn;
use core::task::Poll;

use embassy_hal_internal::drop::OnDrop;
use embassy_time::Instant;

use super::config::{DeviceConfig, DeviceFlags, Wait};
use super::engine::{Capabilities, HalfDuplexDma, InterruptControl, TransferEngine};
use super::transaction::{RxBuffer, TransFlags, Transaction, TxBuffer};
use super::{Error, HostContext, Result, SpiBus};
use crate::dma::staging::PrivateDescriptor;

/// Check `trans` against the device and the bus before anything is queued or staged.
///
/// In full duplex a zero `rx_length` is filled in with `length`.
pub(crate) fn check_transaction(
    trans: &mut Transaction<'_>,
    config: &DeviceConfig<'_>,
    caps: &Capabilities,
    max_len: usize,
    dma: bool,
    long_lived: bool,
) -> Result<()> {
    let flags = trans.flags();
    let half_duplex = config.is_half_duplex();
    let max_bits = max_len * 8;

    if !half_duplex && trans.rx_length == 0 {
        trans.rx_length = trans.length;
    }

    if matches!(trans.tx(), TxBuffer::Inline(_)) && trans.length > 32 {
        return Err(Error::InvalidArg);
    }
    if matches!(trans.rx(), RxBuffer::Inline(_)) && trans.rx_length > 32 {
        return Err(Error::InvalidArg);
    }
    if trans.length > max_bits || trans.rx_length > max_bits {
        return Err(Error::InvalidArg);
    }
    if let TxBuffer::Buffer(buf) = trans.tx() {
        if buf.len() * 8 < trans.length {
            return Err(Error::InvalidArg);
        }
    }
    if let RxBuffer::Buffer(buf) = trans.rx() {
        if buf.len() * 8 < trans.rx_length {
            return Err(Error::InvalidArg);
        }
    }
    if !half_duplex && trans.rx_length > trans.length {
        return Err(Error::InvalidArg);
    }

    let line_modes = flags.intersection(TransFlags::LINE_MODES);
    if line_modes.bits().count_ones() > 1 {
        return Err(Error::InvalidArg);
    }
    if !line_modes.is_empty() && (!half_duplex || config.flags.contains(DeviceFlags::THREEWIRE)) {
        return Err(Error::InvalidArg);
    }
    if flags.contains(TransFlags::MODE_OCT) && !caps.octal {
        return Err(Error::InvalidArg);
    }
    if flags.intersects(TransFlags::MULTILINE_CMD | TransFlags::MULTILINE_ADDR) && line_modes.is_empty() {
        return Err(Error::InvalidArg);
    }

    if flags.contains(TransFlags::VARIABLE_CMD) && trans.command_bits > 32 {
        return Err(Error::InvalidArg);
    }
    if flags.contains(TransFlags::VARIABLE_ADDR) && trans.address_bits > 64 {
        return Err(Error::InvalidArg);
    }

    if trans.has_tx() && trans.length == 0 {
        return Err(Error::InvalidArg);
    }
    if half_duplex && trans.has_rx() && trans.rx_length == 0 {
        return Err(Error::InvalidArg);
    }

    // Full duplex clocks MOSI and MISO together, a dummy phase would shift one against the other.
    let dummy_bits = if flags.contains(TransFlags::VARIABLE_DUMMY) {
        trans.dummy_bits
    } else {
        config.dummy_bits
    };
    if !half_duplex && trans.has_tx() && trans.has_rx() && dummy_bits != 0 {
        return Err(Error::InvalidArg);
    }

    if half_duplex
        && dma
        && trans.has_tx()
        && trans.has_rx()
        && caps.half_duplex_dma == HalfDuplexDma::SinglePhase
    {
        return Err(Error::InvalidArg);
    }

    if flags.contains(TransFlags::CS_KEEP_ACTIVE) && !long_lived {
        return Err(Error::InvalidArg);
    }

    Ok(())
}

/// Handle of a device registered on a [`SpiBus`].
///
/// All methods take `&self`; a handle may be shared between tasks. Queued transactions
/// are serviced in submission order and their results come back in the same order.
pub struct SpiDevice<'b, 'd, E: TransferEngine, I: InterruptControl> {
    bus: &'b SpiBus<'d, E, I>,
    slot: usize,
}

impl<E: TransferEngine, I: InterruptControl> core::fmt::Debug for SpiDevice<'_, '_, E, I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpiDevice").field("slot", &self.slot).finish()
    }
}

impl<'b, 'd, E: TransferEngine, I: InterruptControl> SpiDevice<'b, 'd, E, I> {
    pub(crate) fn new(bus: &'b SpiBus<'d, E, I>, slot: usize) -> Self {
        Self { bus, slot }
    }

    /// Chip-select slot of this device.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Configuration the device was registered with.
    pub fn config(&self) -> DeviceConfig<'d> {
        self.bus.with_host(|host| host.device(self.slot).config)
    }

    /// Clock frequency actually produced for this device, in Hz.
    pub fn actual_freq(&self) -> u32 {
        self.bus.with_host(|host| host.device(self.slot).settings.timing.actual_freq)
    }

    /// Whether a polling transaction of this device is between start and end.
    pub fn is_polling(&self) -> bool {
        self.bus.with_host(|host| self.polling_here(host))
    }

    fn polling_here(&self, host: &HostContext<'d, E>) -> bool {
        host.polling && self.bus.lock().acquiring_device() == Some(self.slot)
    }

    /// Unregister the device.
    ///
    /// Fails with [`Error::InvalidState`] while the device has queued transactions,
    /// uncollected results, a transaction in flight or holds the bus. The handle is
    /// handed back in that case.
    pub fn remove(self) -> core::result::Result<(), (Self, Error)> {
        let res = self.bus.with_host(|host| {
            let rec = host.device(self.slot);
            let busy = !rec.trans_queue.is_empty()
                || rec.ret_queue.as_ref().is_some_and(|q| !q.is_empty())
                || host.cur_cs == Some(self.slot)
                || host.acquiring == Some(self.slot);
            if busy {
                return Err(Error::InvalidState);
            }
            let last = self.bus.lock().unregister(self.slot)?;

            let rec = host.devices[self.slot].take();
            let pin = rec.and_then(|rec| rec.config.cs);
            host.engine.release_cs(self.slot, pin);
            debug!("device {} removed", self.slot);

            if last && host.active {
                debug!("shutting down SPI controller");
                host.engine.deinit();
                host.active = false;
            }
            Ok(())
        });

        match res {
            Ok(()) => Ok(()),
            Err(e) => Err((self, e)),
        }
    }

    /// Validate `trans` and stage its buffers for the transfer engine.
    ///
    /// For a polling transaction the device's acquisition path is claimed as well; the
    /// caller releases the claim.
    fn prepare(&self, mut trans: Transaction<'d>, polling: bool) -> Result<(PrivateDescriptor<'d, E::Dma>, bool)> {
        let dma = self.bus.config().dma;
        let max_len = self.bus.max_transaction_len();

        let long_lived = self.bus.with_host(|host| {
            if self.polling_here(host) {
                return Err(Error::InvalidState);
            }
            let long_lived = match host.acquiring {
                Some(slot) if slot == self.slot => true,
                // Polling would need the bus another device holds.
                Some(_) if polling => return Err(Error::InvalidState),
                _ => false,
            };
            let caps = host.engine.capabilities();
            check_transaction(
                &mut trans,
                &host.device(self.slot).config,
                &caps,
                max_len,
                dma,
                long_lived,
            )?;
            if polling {
                host.claim(self.slot)?;
            }
            Ok(long_lived)
        })?;

        match PrivateDescriptor::setup(trans, dma) {
            Ok(desc) => Ok((desc, long_lived)),
            Err(e) => {
                if polling {
                    self.bus.with_host(|host| host.unclaim(self.slot));
                }
                Err(e)
            }
        }
    }

    /// Queue `trans` for the background, waiting at most `wait` for room in the queue.
    ///
    /// Fails with [`Error::InvalidState`] while this device runs a polling transaction.
    pub async fn queue_transaction(&self, trans: Transaction<'d>, wait: Wait) -> Result<()> {
        self.queue(trans, wait).await.map(|_| ())
    }

    async fn queue(&self, trans: Transaction<'d>, wait: Wait) -> Result<u32> {
        let (desc, _) = self.prepare(trans, false)?;
        let mut desc = Some(desc);

        wait.run(poll_fn(|cx| {
            self.bus.with_host(|host| {
                if self.polling_here(host) {
                    return Poll::Ready(Err(Error::InvalidState));
                }
                let rec = host.device_mut(self.slot);
                let Some(mut d) = desc.take() else {
                    return Poll::Ready(Err(Error::InvalidState));
                };
                rec.seq = rec.seq.wrapping_add(1);
                d.seq = rec.seq;
                match rec.trans_queue.try_push(d) {
                    Ok(()) => {
                        let seq = rec.seq;
                        self.bus.lock().request_background(self.slot);
                        Poll::Ready(Ok(seq))
                    }
                    Err(d) => {
                        desc = Some(d);
                        rec.trans_queue.register_push(cx.waker());
                        Poll::Pending
                    }
                }
            })
        }))
        .await
    }

    /// Wait at most `wait` for the oldest finished transaction of this device.
    ///
    /// Fails with [`Error::NotSupported`] if the device was registered with
    /// [`DeviceFlags::NO_RETURN_RESULT`].
    pub async fn get_result(&self, wait: Wait) -> Result<Transaction<'d>> {
        self.result(wait).await.map(|(_, trans)| trans)
    }

    async fn result(&self, wait: Wait) -> Result<(u32, Transaction<'d>)> {
        wait.run(poll_fn(|cx| {
            self.bus.with_host(|host| {
                let polling = self.polling_here(host);
                let rec = host.device_mut(self.slot);
                let Some(ret) = rec.ret_queue.as_mut() else {
                    return Poll::Ready(Err(Error::NotSupported));
                };
                match ret.try_pop() {
                    Some(done) => {
                        // The background may have skipped this device for lack of room.
                        // Mid-poll, `polling_end` re-requests instead.
                        if !polling && !rec.trans_queue.is_empty() {
                            self.bus.lock().request_background(self.slot);
                        }
                        Poll::Ready(Ok(done))
                    }
                    None => {
                        ret.register_pop(cx.waker());
                        Poll::Pending
                    }
                }
            })
        }))
        .await
    }

    /// Queue `trans` and wait for its result.
    ///
    /// Results of earlier queued transactions must have been collected first.
    pub async fn transmit(&self, trans: Transaction<'d>) -> Result<Transaction<'d>> {
        if !self.config().returns_results() {
            return Err(Error::NotSupported);
        }
        let seq = self.queue(trans, Wait::Forever).await?;
        let (done, trans) = self.result(Wait::Forever).await?;
        assert_eq!(seq, done, "got the result of another transaction");
        Ok(trans)
    }

    /// Start `trans` right away from this task, bypassing the queue.
    ///
    /// Waits at most `wait` for the bus. Fails with [`Error::InvalidState`] if this device
    /// already runs a polling transaction, another task of this device is starting one or
    /// acquiring the bus, another device holds the bus with [`SpiDevice::acquire_bus`], or
    /// the bus this device held was released before the transaction could start. Finish
    /// with [`SpiDevice::polling_end`].
    pub async fn polling_start(&self, trans: Transaction<'d>, wait: Wait) -> Result<()> {
        let (desc, long_lived) = self.prepare(trans, true)?;
        let claim = OnDrop::new(|| self.bus.with_host(|host| host.unclaim(self.slot)));
        let mut desc = Some(desc);
        let lock = self.bus.lock();
        let workaround = self.bus.config().workaround;

        wait.run(async {
            if !long_lived {
                lock.acquire(self.slot).await?;
            }
            let release = OnDrop::new(|| {
                if !long_lived {
                    lock.acquire_end(self.slot);
                }
            });

            poll_fn(|cx| {
                self.bus.with_host(|host| {
                    // Another task may have released the bus meanwhile.
                    if long_lived && host.acquiring != Some(self.slot) {
                        return Poll::Ready(Err(Error::InvalidState));
                    }
                    // Our own queued work may have re-armed the background meanwhile.
                    if !lock.poll_bg_done(self.slot, cx.waker()) {
                        return Poll::Pending;
                    }
                    if let Some(desc) = desc.take() {
                        host.unclaim(self.slot);
                        host.polling = true;
                        host.start(self.slot, desc, lock.touch(self.slot), workaround);
                    }
                    Poll::Ready(Ok(()))
                })
            })
            .await?;

            release.defuse();
            Ok(())
        })
        .await?;

        claim.defuse();
        Ok(())
    }

    /// Spin until the polling transaction is done, at most `wait`, and hand it back.
    ///
    /// On [`Error::Timeout`] the transaction stays in flight; call again to collect it.
    pub fn polling_end(&self, wait: Wait) -> Result<Transaction<'d>> {
        let deadline = wait.deadline();
        let workaround = self.bus.config().workaround;

        loop {
            let done = self.bus.with_host(|host| {
                if !(host.polling && host.cur_cs == Some(self.slot)) {
                    return Err(Error::InvalidState);
                }
                Ok(host.engine.is_done())
            })?;
            if done {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("polling transaction of device {} timed out", self.slot);
                return Err(Error::Timeout);
            }
        }

        let trans = self.bus.with_host(|host| {
            let lock = self.bus.lock();
            let (_, _, trans) = host.finish(workaround);
            host.polling = false;
            // Queued work held back while polling.
            if !host.device(self.slot).trans_queue.is_empty() {
                lock.request_background(self.slot);
            }
            if host.acquiring != Some(self.slot) {
                lock.acquire_end(self.slot);
            }
            trans
        });
        Ok(trans)
    }

    /// [`SpiDevice::polling_start`] and [`SpiDevice::polling_end`] without a time bound.
    pub async fn polling_transmit(&self, trans: Transaction<'d>) -> Result<Transaction<'d>> {
        self.polling_start(trans, Wait::Forever).await?;
        self.polling_end(Wait::Forever)
    }

    /// Hold the bus for this device until [`SpiDevice::release_bus`].
    ///
    /// Meanwhile other devices' queued transactions wait, and this device's polling
    /// transactions skip arbitration. Only [`Wait::Forever`] is supported, anything else
    /// fails with [`Error::InvalidArg`]. Fails with [`Error::InvalidState`] while another
    /// task of this device is acquiring the bus or starting a polling transaction.
    pub async fn acquire_bus(&self, wait: Wait) -> Result<()> {
        if wait != Wait::Forever {
            return Err(Error::InvalidArg);
        }
        self.bus.with_host(|host| {
            if host.acquiring == Some(self.slot) || self.polling_here(host) {
                return Err(Error::InvalidState);
            }
            host.claim(self.slot)
        })?;
        let claim = OnDrop::new(|| self.bus.with_host(|host| host.unclaim(self.slot)));

        let lock = self.bus.lock();
        lock.acquire(self.slot).await?;
        self.bus.with_host(|host| {
            host.unclaim(self.slot);
            host.acquiring = Some(self.slot);
            if lock.touch(self.slot) {
                let settings = host.device(self.slot).settings;
                host.engine.configure(&settings);
            }
        });
        claim.defuse();
        Ok(())
    }

    /// Give the bus back after [`SpiDevice::acquire_bus`].
    pub fn release_bus(&self) -> Result<()> {
        self.bus.with_host(|host| {
            if host.acquiring != Some(self.slot) || host.polling {
                return Err(Error::InvalidState);
            }
            host.acquiring = None;
            self.bus.lock().acquire_end(self.slot);
            Ok(())
        })
    }
}
