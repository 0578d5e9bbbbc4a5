#![allow(dead_code)]

use core::future::Future;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embassy_futures::yield_now;
use embassy_spi_bus::dma::DmaHeap;
use embassy_spi_bus::spi::{
    BusConfig, Capabilities, ClockTiming, DeviceSettings, DmaWorkaround, HalfDuplexDma, InterruptControl, SpiBus,
    Transaction, TransferEngine, TransferHooks, Transfer,
};

/// Source clock of the mock controller.
pub const SRC_CLK: u32 = 80_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init,
    Deinit,
    Route { cs: usize, pin: Option<u8>, active_high: bool },
    Release { cs: usize },
    Configure { cs: usize },
    Start { cs: usize, cmd: u32, tx_bits: usize, rx_bits: usize, rx: usize, dma: bool },
    Done { cs: usize },
}

/// State shared by the mock controller, its interrupt line and the test.
#[derive(Default)]
pub struct Shared {
    irq: AtomicBool,
    manual: AtomicBool,
    busy: AtomicBool,
    done: AtomicBool,
    events: Mutex<Vec<Event>>,
    fill: Mutex<Option<Vec<u8>>>,
}

impl Shared {
    pub fn irq_enabled(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    /// The interrupt would fire: it is enabled and the controller is idle or done.
    pub fn irq_pending(&self) -> bool {
        self.irq_enabled() && (!self.busy.load(Ordering::SeqCst) || self.done.load(Ordering::SeqCst))
    }

    /// Transfers only finish on [`Shared::complete`].
    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Received data comes from `pattern` instead of the transmitted data.
    pub fn fill_rx(&self, pattern: Vec<u8>) {
        *self.fill.lock().unwrap() = Some(pattern);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Chip-select slots in the order their transfers started.
    pub fn starts(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start { cs, .. } => Some(cs),
                _ => None,
            })
            .collect()
    }

    pub fn configures(&self, slot: usize) -> usize {
        self.events()
            .into_iter()
            .filter(|e| *e == Event::Configure { cs: slot })
            .count()
    }

    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

pub const CAPS: Capabilities = Capabilities {
    cs_count: 3,
    octal: true,
    half_duplex_dma: HalfDuplexDma::Unrestricted,
    fifo_len: 64,
};

/// Controller that loops MOSI back to MISO, or plays a fill pattern.
pub struct MockEngine<D> {
    shared: Arc<Shared>,
    caps: Capabilities,
    /// (cs, tx, rx, rx bytes) of the programmed transfer.
    xfer: Option<(usize, usize, usize, usize)>,
    _heap: PhantomData<fn() -> D>,
}

impl<D: DmaHeap> TransferEngine for MockEngine<D> {
    type Dma = D;

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn init(&mut self) {
        self.shared.push(Event::Init);
    }

    fn deinit(&mut self) {
        self.shared.push(Event::Deinit);
    }

    fn clock_timing(&self, freq_hz: u32, _duty_cycle: u16, _input_delay_ns: i32) -> Option<ClockTiming> {
        if freq_hz > SRC_CLK {
            return None;
        }
        let div = SRC_CLK.div_ceil(freq_hz);
        Some(ClockTiming {
            actual_freq: SRC_CLK / div,
            clock_reg: div,
            timing_dummy: u8::from(freq_hz > 26_000_000),
            timing_miso_delay: 0,
        })
    }

    fn route_cs(&mut self, cs: usize, pin: Option<u8>, active_high: bool) {
        self.shared.push(Event::Route { cs, pin, active_high });
    }

    fn release_cs(&mut self, cs: usize, _pin: Option<u8>) {
        self.shared.push(Event::Release { cs });
    }

    fn configure(&mut self, settings: &DeviceSettings) {
        self.shared.push(Event::Configure { cs: settings.cs });
    }

    fn program(&mut self, xfer: &Transfer) {
        assert!(
            !self.shared.busy.load(Ordering::SeqCst),
            "CS {} asserted while another transfer is on the bus",
            xfer.cs
        );
        self.xfer = Some((xfer.cs, xfer.tx as usize, xfer.rx as usize, xfer.rx_bits.div_ceil(8)));
        self.shared.push(Event::Start {
            cs: xfer.cs,
            cmd: xfer.cmd,
            tx_bits: xfer.tx_bits,
            rx_bits: xfer.rx_bits,
            rx: xfer.rx as usize,
            dma: xfer.dma,
        });
    }

    fn start(&mut self) {
        self.shared.busy.store(true, Ordering::SeqCst);
        self.shared.done.store(!self.shared.manual.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    fn fetch_result(&mut self) {
        let (cs, tx, rx, len) = self.xfer.take().expect("no transfer programmed");
        if rx != 0 {
            let rx = rx as *mut u8;
            match self.shared.fill.lock().unwrap().as_ref() {
                Some(pattern) => unsafe { rx.copy_from(pattern.as_ptr(), len.min(pattern.len())) },
                None if tx != 0 => unsafe { rx.copy_from(tx as *const u8, len) },
                None => {}
            }
        }
        self.shared.busy.store(false, Ordering::SeqCst);
        self.shared.done.store(false, Ordering::SeqCst);
        self.shared.push(Event::Done { cs });
    }
}

pub struct MockIrq(Arc<Shared>);

impl InterruptControl for MockIrq {
    fn enable(&self) {
        self.0.irq.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.0.irq.store(false, Ordering::SeqCst);
    }
}

std::thread_local! {
    static LIVE: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

/// DMA reaches all memory, at any alignment.
pub struct AnyRam;

impl DmaHeap for AnyRam {
    const ALIGN: usize = 1;

    fn is_dma_capable(_ptr: *const u8, _len: usize) -> bool {
        true
    }

    fn allocate(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(_ptr: NonNull<u8>, _len: usize) {}
}

/// DMA only reaches memory this heap handed out.
pub struct DmaRam;

impl DmaRam {
    pub fn live() -> usize {
        LIVE.with(|l| l.borrow().len())
    }
}

impl DmaHeap for DmaRam {
    fn is_dma_capable(ptr: *const u8, _len: usize) -> bool {
        LIVE.with(|l| l.borrow().iter().any(|&(p, _)| p == ptr as usize))
    }

    fn allocate(len: usize) -> Option<NonNull<u8>> {
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

pub type TestBus<'d, D = AnyRam> = SpiBus<'d, MockEngine<D>, MockIrq>;

pub fn bus<'d, D: DmaHeap>(config: BusConfig<'d>) -> (TestBus<'d, D>, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let engine = MockEngine {
        shared: shared.clone(),
        caps: CAPS,
        xfer: None,
        _heap: PhantomData,
    };
    let bus = SpiBus::new(engine, MockIrq(shared.clone()), config);
    (bus, shared)
}

/// Run the bus interrupt whenever it would fire.
pub async fn pump<D: DmaHeap>(bus: &TestBus<'_, D>, shared: &Shared) {
    loop {
        if shared.irq_pending() {
            bus.on_interrupt();
        }
        yield_now().await;
    }
}

/// Drive `f` to completion with the bus interrupt serviced alongside.
pub fn run<D: DmaHeap, F: Future>(bus: &TestBus<'_, D>, shared: &Shared, f: F) -> F::Output {
    block_on(async {
        match select(f, pump(bus, shared)).await {
            Either::First(out) => out,
            Either::Second(()) => unreachable!(),
        }
    })
}

/// Transaction tagged with `tag`, sending it as inline data.
pub fn tagged(tag: usize) -> Transaction<'static> {
    Transaction::new()
        .with_tx_data((tag as u32).to_le_bytes(), 32)
        .with_user(tag)
}

#[derive(Default)]
pub struct CountingHooks {
    pub pre: AtomicUsize,
    pub post: AtomicUsize,
    pub last_rx: Mutex<Vec<u8>>,
}

impl TransferHooks for CountingHooks {
    fn pre_transfer(&self, _trans: &Transaction<'_>) {
        self.pre.fetch_add(1, Ordering::SeqCst);
    }

    fn post_transfer(&self, trans: &Transaction<'_>) {
        self.post.fetch_add(1, Ordering::SeqCst);
        *self.last_rx.lock().unwrap() = trans.rx_data().unwrap_or_default().to_vec();
    }
}

#[derive(Default)]
pub struct CountingWorkaround {
    pub before: AtomicUsize,
    pub after: AtomicUsize,
}

impl DmaWorkaround for CountingWorkaround {
    fn before_transfer(&self) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn after_transfer(&self) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}
