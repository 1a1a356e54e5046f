//! Register level model of the CIU and a simulated platform for tests.

use super::*;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use embedded_hal::timer::{Cancel, CountDown};
use spin::Mutex;

const NREGS: usize = CiuReg::Data.offset() / 4 + 1;

/// Simulated monotonic time in microseconds.
#[derive(Clone, Default)]
pub struct SimClock(Arc<AtomicU64>);

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn advance_us(&self, us: u64) {
        self.0.fetch_add(us, Ordering::SeqCst);
    }
}

struct CiuModel {
    regs: [u32; NREGS],
    rx: VecDeque<u32>,
    tx: Vec<u32>,
    scheduled: Vec<(u64, IntStatus)>,
    stuck_start: bool,
    stuck_reset: bool,
    commands: Vec<(u32, u32)>,
}

impl CiuModel {
    fn get(&self, reg: CiuReg) -> u32 {
        self.regs[reg.offset() / 4]
    }

    fn set(&mut self, reg: CiuReg, val: u32) {
        self.regs[reg.offset() / 4] = val;
    }

    fn release_due(&mut self, now: u64) {
        let mut raised = 0;
        self.scheduled.retain(|(at, bits)| {
            if *at <= now {
                raised |= bits.bits();
                false
            } else {
                true
            }
        });
        let rint = self.get(CiuReg::Rintsts);
        self.set(CiuReg::Rintsts, rint | raised);
    }
}

/// The CIU as seen through its registers: W1C status, self clearing reset
/// and START bits, a receive FIFO fed by the test and a transmit sink.
#[derive(Clone)]
pub struct FakeCiu {
    model: Arc<Mutex<CiuModel>>,
    clock: SimClock,
}

impl FakeCiu {
    pub fn new(clock: SimClock) -> Self {
        Self {
            model: Arc::new(Mutex::new(CiuModel {
                regs: [0; NREGS],
                rx: VecDeque::new(),
                tx: Vec::new(),
                scheduled: Vec::new(),
                stuck_start: false,
                stuck_reset: false,
                commands: Vec::new(),
            })),
            clock,
        }
    }

    pub fn raise(&self, bits: IntStatus) {
        let mut m = self.model.lock();
        let rint = m.get(CiuReg::Rintsts);
        m.set(CiuReg::Rintsts, rint | bits.bits());
    }

    /// Raise `bits` once `ms` milliseconds have passed.
    pub fn raise_at(&self, ms: u64, bits: IntStatus) {
        let at = self.clock.now_us() + ms * 1000;
        self.model.lock().scheduled.push((at, bits));
    }

    pub fn raise_idmac(&self, bits: IdmacStatus) {
        let mut m = self.model.lock();
        let idsts = m.get(CiuReg::Idsts);
        m.set(CiuReg::Idsts, idsts | bits.bits());
    }

    pub fn push_rx(&self, words: &[u32]) {
        self.model.lock().rx.extend(words.iter().copied());
    }

    pub fn tx_words(&self) -> Vec<u32> {
        self.model.lock().tx.clone()
    }

    pub fn set_resp(&self, resp: [u32; 4]) {
        let mut m = self.model.lock();
        m.set(CiuReg::Resp0, resp[0]);
        m.set(CiuReg::Resp1, resp[1]);
        m.set(CiuReg::Resp2, resp[2]);
        m.set(CiuReg::Resp3, resp[3]);
    }

    pub fn set_stuck_start(&self, stuck: bool) {
        self.model.lock().stuck_start = stuck;
    }

    pub fn set_stuck_reset(&self, stuck: bool) {
        self.model.lock().stuck_reset = stuck;
    }

    /// Command words (START stripped) and arguments in issue order.
    pub fn commands(&self) -> Vec<(u32, u32)> {
        self.model.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.model.lock().commands.clear();
    }

    /// Raw register value, without side effects.
    pub fn peek(&self, reg: CiuReg) -> u32 {
        self.model.lock().get(reg)
    }

    pub fn irq_pending(&self) -> bool {
        self.release_due();
        let m = self.model.lock();
        m.get(CiuReg::Rintsts) & m.get(CiuReg::Intmask) != 0
            || m.get(CiuReg::Idsts) & m.get(CiuReg::Idinten) != 0
    }

    pub fn release_due(&self) {
        let now = self.clock.now_us();
        self.model.lock().release_due(now);
    }
}

impl CiuRegisters for FakeCiu {
    fn read(&self, reg: CiuReg) -> u32 {
        let now = self.clock.now_us();
        let mut m = self.model.lock();
        m.release_due(now);
        match reg {
            CiuReg::Status => {
                let count = m.rx.len() as u32;
                let mut status = StatusReg::from_bits_truncate(count << 17);
                if count == 0 {
                    status |= StatusReg::FIFO_EMPTY;
                }
                if count >= 32 {
                    status |= StatusReg::FIFO_FULL;
                }
                status.bits()
            }
            CiuReg::Data => m.rx.pop_front().unwrap_or(0),
            CiuReg::Mintsts => m.get(CiuReg::Rintsts) & m.get(CiuReg::Intmask),
            _ => m.get(reg),
        }
    }

    fn write(&self, reg: CiuReg, val: u32) {
        let mut m = self.model.lock();
        match reg {
            CiuReg::Rintsts | CiuReg::Idsts => {
                let cur = m.get(reg);
                m.set(reg, cur & !val);
            }
            CiuReg::Ctrl => {
                if val & CtrlReg::FIFO_RESET.bits() != 0 {
                    m.rx.clear();
                }
                let val = if m.stuck_reset {
                    val
                } else {
                    val & !CtrlReg::RESET_ALL.bits()
                };
                m.set(reg, val);
            }
            CiuReg::Bmod => m.set(reg, val & !BmodReg::SWR.bits()),
            CiuReg::Cmd => {
                let arg = m.get(CiuReg::Cmdarg);
                m.commands.push((val & !CmdReg::START.bits(), arg));
                let val = if m.stuck_start {
                    val
                } else {
                    val & !CmdReg::START.bits()
                };
                m.set(reg, val);
            }
            CiuReg::Data => m.tx.push(val),
            _ => m.set(reg, val),
        }
    }
}

pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

struct PlatformInner {
    clock: SimClock,
    ciu: Option<FakeCiu>,
    irq: Mutex<Option<IrqHandler>>,
    irq_masked: AtomicUsize,
    irq_deferred: AtomicBool,
    work: Mutex<Vec<Work>>,
    irq_enabled: AtomicBool,
    bus_locked: AtomicBool,
    queue_full: AtomicBool,
}

/// Platform whose idle loop advances the simulated clock and delivers the
/// CIU interrupt when an enabled status is pending. An interrupt raised
/// while masked by `irq_save` is held until the matching `irq_restore`.
#[derive(Clone)]
pub struct SimPlatform(Arc<PlatformInner>);

impl SimPlatform {
    pub fn new() -> Self {
        Self::build(SimClock::new(), None)
    }

    pub fn with_ciu(clock: SimClock, ciu: FakeCiu) -> Self {
        Self::build(clock, Some(ciu))
    }

    fn build(clock: SimClock, ciu: Option<FakeCiu>) -> Self {
        Self(Arc::new(PlatformInner {
            clock,
            ciu,
            irq: Mutex::new(None),
            irq_masked: AtomicUsize::new(0),
            irq_deferred: AtomicBool::new(false),
            work: Mutex::new(Vec::new()),
            irq_enabled: AtomicBool::new(false),
            bus_locked: AtomicBool::new(false),
            queue_full: AtomicBool::new(false),
        }))
    }

    pub fn set_irq_handler(&self, handler: IrqHandler) {
        *self.0.irq.lock() = Some(handler);
    }

    pub fn deliver_irq(&self) {
        if self.0.irq_masked.load(Ordering::SeqCst) > 0 {
            self.0.irq_deferred.store(true, Ordering::SeqCst);
            return;
        }
        let pending = match &self.0.ciu {
            Some(ciu) => ciu.irq_pending(),
            None => false,
        };
        if pending {
            let handler = self.0.irq.lock().clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    /// Run queued work items, returns how many ran.
    pub fn run_queued_work(&self) -> usize {
        let work: Vec<Work> = self.0.work.lock().drain(..).collect();
        for w in work.iter() {
            w();
        }
        work.len()
    }

    pub fn queued_work(&self) -> usize {
        self.0.work.lock().len()
    }

    pub fn set_queue_full(&self, full: bool) {
        self.0.queue_full.store(full, Ordering::SeqCst);
    }

    pub fn irq_enabled(&self) -> bool {
        self.0.irq_enabled.load(Ordering::SeqCst)
    }

    pub fn bus_locked(&self) -> bool {
        self.0.bus_locked.load(Ordering::SeqCst)
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn irq_save(&self) -> usize {
        self.0.irq_masked.fetch_add(1, Ordering::SeqCst)
    }

    fn irq_restore(&self, _flags: usize) {
        let was = self.0.irq_masked.fetch_sub(1, Ordering::SeqCst);
        if was == 1 && self.0.irq_deferred.swap(false, Ordering::SeqCst) {
            self.deliver_irq();
        }
    }

    fn now_us(&self) -> u64 {
        self.0.clock.advance_us(1);
        self.0.clock.now_us()
    }

    fn idle(&self) {
        self.0.clock.advance_us(1000);
        self.deliver_irq();
    }

    fn queue_work(&self, work: Work) -> SdResult {
        if self.0.queue_full.load(Ordering::SeqCst) {
            return Err(SdError::WorkQueue);
        }
        self.0.work.lock().push(work);
        Ok(())
    }

    fn enable_irq(&self) -> SdResult {
        self.0.irq_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn bus_lock(&self, lock: bool) {
        self.0.bus_locked.store(lock, Ordering::SeqCst);
    }
}

/// One shot countdown on the simulated clock.
pub struct SimTimer {
    clock: SimClock,
    deadline: Option<u64>,
    on_start: Option<Box<dyn Fn() + Send>>,
}

impl SimTimer {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            deadline: None,
            on_start: None,
        }
    }

    /// Run `hook` every time the timer is started, after arming it.
    pub fn with_start_hook(clock: SimClock, hook: Box<dyn Fn() + Send>) -> Self {
        Self {
            on_start: Some(hook),
            ..Self::new(clock)
        }
    }
}

impl CountDown for SimTimer {
    type Time = Millis;

    fn start<T>(&mut self, count: T)
    where
        T: Into<Self::Time>,
    {
        let Millis(ms) = count.into();
        self.deadline = Some(self.clock.now_us() + ms as u64 * 1000);
        if let Some(hook) = &self.on_start {
            hook();
        }
    }

    fn wait(&mut self) -> nb::Result<(), void::Void> {
        match self.deadline {
            Some(deadline) if self.clock.now_us() >= deadline => {
                self.deadline = None;
                Ok(())
            }
            _ => Err(nb::Error::WouldBlock),
        }
    }
}

impl Cancel for SimTimer {
    type Error = ();

    fn cancel(&mut self) -> Result<(), ()> {
        self.deadline.take().map(|_| ()).ok_or(())
    }
}
