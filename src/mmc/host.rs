use super::*;
use embedded_hal::timer::{Cancel, CountDown};
use spin::Mutex;

macro_rules! polling_reg_clear {
    ($host:expr, $reg:expr, $bits:expr, $timeout_us:expr, $err:expr) => {
        $host.polling($timeout_us, $err, || {
            if $host.regs.read($reg) & $bits.bits() != 0 {
                Err(nb::Error::WouldBlock)
            } else {
                Ok(())
            }
        })
    };
}

const MAX_BLOCK_SIZE: usize = 512;

bitflags::bitflags! {
    /* Join of the two completion sources of a DMA transfer */
    struct XfrFlags : u8 {
        const XFRDONE = 1 << 0;
        const DMADONE = 1 << 1;
        const ALLDONE = XfrFlags::XFRDONE.bits | XfrFlags::DMADONE.bits;
    }
}

#[derive(Debug)]
enum DataPath {
    Idle,
    FifoRecv(FifoCursor),
    FifoSend(FifoCursor),
    Dma,
}

struct HostState {
    /// Events the waiter is interested in
    wait_events: WaitEvents,
    /// Event that ended the wait
    wakeup: WaitEvents,
    wait_mask: IntStatus,
    xfr_mask: IntStatus,
    path: DataPath,
    xfr_flags: XfrFlags,
    widebus: bool,
    card_status: CardStatus,
    cb_events: MediaEvents,
    callback: Option<Work>,
    descs: DescriptorTable,
}

impl HostState {
    fn new() -> Self {
        Self {
            wait_events: WaitEvents::empty(),
            wakeup: WaitEvents::empty(),
            wait_mask: IntStatus::empty(),
            xfr_mask: IntStatus::empty(),
            path: DataPath::Idle,
            xfr_flags: XfrFlags::empty(),
            widebus: false,
            card_status: CardStatus::empty(),
            cb_events: MediaEvents::empty(),
            callback: None,
            descs: DescriptorTable::new(),
        }
    }

    fn dma_mode(&self) -> bool {
        matches!(self.path, DataPath::Dma)
    }
}

/// One CIU slot: command issue, response retrieval, data path and the
/// event wait shared between the caller thread and the interrupt handler.
pub struct SdmmcHost<C, P, T> {
    regs: C,
    platform: P,
    timer: Mutex<T>,
    config: HostConfig,
    sem: Semaphore,
    state: Mutex<HostState>,
}

impl<C, P, T> SdmmcHost<C, P, T>
where
    C: CiuRegisters,
    P: Platform,
    T: CountDown<Time = Millis> + Cancel,
{
    /// Nothing is touched until `reset`.
    pub fn new(regs: C, platform: P, timer: T, config: HostConfig) -> Self {
        Self {
            regs,
            platform,
            timer: Mutex::new(timer),
            config,
            sem: Semaphore::new(),
            state: Mutex::new(HostState::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn regs(&self) -> &C {
        &self.regs
    }

    /// Run `f` with local interrupts masked and the state locked.
    fn critical<R, F: FnOnce(&mut HostState) -> R>(&self, f: F) -> R {
        let flags = self.platform.irq_save();
        let ret = f(&mut self.state.lock());
        self.platform.irq_restore(flags);
        ret
    }

    fn polling<F>(&self, timeout_us: u64, timeout_ret: SdError, mut f: F) -> SdResult
    where
        F: FnMut() -> nb::Result<(), SdError>,
    {
        let deadline = self.platform.now_us() + timeout_us;
        loop {
            match f() {
                Ok(()) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {}
            }
            if self.platform.now_us() > deadline {
                return Err(timeout_ret);
            }
            core::hint::spin_loop();
        }
    }

    fn rint(&self) -> IntStatus {
        IntStatus::from_bits_truncate(self.regs.read(CiuReg::Rintsts))
    }

    fn ack(&self, bits: IntStatus) {
        self.regs.write(CiuReg::Rintsts, bits.bits());
    }

    fn update_intmask(&self, st: &HostState) {
        self.regs
            .write(CiuReg::Intmask, (st.wait_mask | st.xfr_mask).bits());
    }

    /// Sole writer of the wait interest, its wakeup and interrupt mask.
    fn config_wait_ints(
        &self,
        st: &mut HostState,
        mask: IntStatus,
        events: WaitEvents,
        wakeup: WaitEvents,
    ) {
        st.wait_events = events;
        st.wakeup = wakeup;
        st.wait_mask = mask;
        self.update_intmask(st);
    }

    fn config_xfr_ints(&self, st: &mut HostState, mask: IntStatus) {
        st.xfr_mask = mask;
        self.update_intmask(st);
    }

    /// Submit a raw command word and wait for the CIU to take it.
    fn ciu_sendcmd(&self, cmd: u32, arg: u32) -> SdResult {
        self.regs.write(CiuReg::Cmdarg, arg);
        self.regs.write(CiuReg::Cmd, CmdReg::START.bits() | cmd);
        polling_reg_clear!(
            self,
            CiuReg::Cmd,
            CmdReg::START,
            self.config.cmd_accept_timeout_us,
            SdError::SendFailure
        )
        .map_err(|e| {
            error!("[CMD] ciu did not accept {:#010x}", cmd);
            e
        })
    }

    fn update_clock(&self) -> SdResult {
        self.ciu_sendcmd((CmdReg::UPDATE_CLOCK | CmdReg::WAIT_PREV_DATA).bits(), 0)
    }

    fn set_clkdiv(&self, clkdiv: u32, enable: bool) -> SdResult {
        self.regs.write(CiuReg::Clkena, 0);
        self.regs.write(CiuReg::Clksrc, CLKSRC_DIV0);
        self.update_clock()?;
        self.regs.write(CiuReg::Clkdiv, clkdiv & 0xff);
        self.update_clock()?;
        if enable {
            self.regs.write(CiuReg::Clkena, CLKENA_ENABLE);
            self.update_clock()?;
        }
        Ok(())
    }

    /// Stop the internal DMA controller and fall back to CPU access.
    fn data_disable(&self) {
        self.regs.write(CiuReg::Idinten, 0);
        self.regs.modify(CiuReg::Bmod, |v| v & !BmodReg::DE.bits());
        self.regs.modify(CiuReg::Ctrl, |v| {
            v & !(CtrlReg::USE_INTERNAL_DMAC | CtrlReg::DMA_ENABLE).bits()
        });
    }

    pub fn reset(&self) -> SdResult {
        info!("[SDMMC] reset controller");
        self.regs.write(CiuReg::Bmod, BmodReg::SWR.bits());
        self.regs.write(CiuReg::Ctrl, CtrlReg::RESET_ALL.bits());
        polling_reg_clear!(
            self,
            CiuReg::Ctrl,
            CtrlReg::RESET_ALL,
            self.config.reset_timeout_us,
            SdError::ResetTimeout
        )?;
        let widebus = !self.config.width_d1_only;
        self.critical(|st| {
            let _ = self.timer.lock().cancel();
            st.wait_events = WaitEvents::empty();
            st.wakeup = WaitEvents::empty();
            st.wait_mask = IntStatus::empty();
            st.xfr_mask = IntStatus::empty();
            st.xfr_flags = XfrFlags::empty();
            st.path = DataPath::Idle;
            st.widebus = widebus;
        });
        self.sem.reset();

        let mut ctrl = CtrlReg::INT_ENABLE;
        if self.config.dma {
            ctrl |= CtrlReg::USE_INTERNAL_DMAC;
        }
        self.regs.write(CiuReg::Ctrl, ctrl.bits());
        self.regs.write(CiuReg::Intmask, 0);
        self.regs.write(CiuReg::Rintsts, IntStatus::all().bits());
        self.regs.write(CiuReg::Tmout, TMOUT_MAX);
        self.regs.write(
            CiuReg::Fifoth,
            (self.config.fifo_rx_watermark << FIFOTH_RX_WMARK_SHIFT)
                | (self.config.fifo_tx_watermark << FIFOTH_TX_WMARK_SHIFT),
        );
        self.regs.write(CiuReg::Idinten, 0);
        self.regs.write(CiuReg::Idsts, IdmacStatus::ALL.bits());
        if self.config.dma {
            self.regs.write(CiuReg::Bmod, BmodReg::DE.bits());
        } else {
            self.regs.write(CiuReg::Bmod, 0);
        }
        // card clock off, the divider latches on the next update
        self.regs.write(CiuReg::Clkena, 0);
        self.regs.write(CiuReg::Clksrc, CLKSRC_DIV0);
        Ok(())
    }

    pub fn status(&self) -> CardStatus {
        self.critical(|st| st.card_status)
    }

    pub fn set_widebus(&self, enable: bool) {
        let enable = if enable && self.config.width_d1_only {
            warn!("[SDMMC] 4 bit bus requested on a 1 bit slot");
            false
        } else {
            enable
        };
        self.critical(|st| st.widebus = enable);
    }

    pub fn set_clock(&self, rate: ClockRate) -> SdResult {
        let cfg = &self.config;
        let (clkdiv, ctype) = match rate {
            ClockRate::Disabled => {
                info!("[SDMMC] clock disabled");
                self.regs.write(CiuReg::Clkena, 0);
                return self.update_clock();
            }
            ClockRate::IdMode => (cfg.clkdiv_init, CTYPE_WIDTH1),
            ClockRate::MmcTransfer => (cfg.clkdiv_mmc_xfr, CTYPE_WIDTH1),
            ClockRate::SdTransfer4Bit if !cfg.width_d1_only => {
                (cfg.clkdiv_sd_wide_xfr, CTYPE_WIDTH4)
            }
            ClockRate::SdTransfer4Bit | ClockRate::SdTransfer1Bit => (cfg.clkdiv_sd_xfr, CTYPE_WIDTH1),
        };
        info!("[SDMMC] clock {:?}, clkdiv {}", rate, clkdiv);
        self.regs.write(CiuReg::Ctype, ctype);
        self.set_clkdiv(clkdiv, true)
    }

    pub fn attach(&self) -> SdResult {
        info!("[SDMMC] attach interrupt");
        self.regs.write(CiuReg::Intmask, 0);
        self.regs.write(CiuReg::Rintsts, IntStatus::all().bits());
        self.regs
            .modify(CiuReg::Ctrl, |v| v | CtrlReg::INT_ENABLE.bits());
        self.platform.enable_irq()
    }

    pub fn lock(&self, lock: bool) {
        self.platform.bus_lock(lock);
    }

    pub fn send_cmd(&self, cmd: Command, arg: u32) -> SdResult {
        let mut regval = CmdReg::empty();
        if cmd.index() == 0 {
            regval |= CmdReg::SEND_INIT;
        }
        match cmd.direction() {
            DataDirection::Write => regval |= CmdReg::DATA_EXPECTED | CmdReg::WRITE,
            DataDirection::Read => regval |= CmdReg::DATA_EXPECTED,
            DataDirection::None => {}
        }
        match cmd.response_type() {
            Some(ResponseType::None) => {}
            Some(ResponseType::R1b) => {
                regval |= CmdReg::SHORT_RESPONSE | CmdReg::CHECK_CRC | CmdReg::WAIT_PREV_DATA
            }
            Some(ResponseType::R1) | Some(ResponseType::R6) | Some(ResponseType::R7) => {
                regval |= CmdReg::SHORT_RESPONSE | CmdReg::CHECK_CRC
            }
            Some(ResponseType::R3) | Some(ResponseType::R4) | Some(ResponseType::R5) => {
                regval |= CmdReg::SHORT_RESPONSE
            }
            Some(ResponseType::R2) => regval |= CmdReg::LONG | CmdReg::CHECK_CRC,
            None => {
                error!("[CMD] bad response type in {:#x}", cmd.raw());
                return Err(SdError::UnsupportedResponse);
            }
        }
        if cmd.is_stop() {
            regval |= CmdReg::STOP_ABORT;
        }
        debug!(
            "[CMD] SEND CMD{} arg {:#010x} regval {:#010x}",
            cmd.index(),
            arg,
            regval.bits() | cmd.index()
        );
        self.ack(IntStatus::all());
        self.ciu_sendcmd(regval.bits() | cmd.index(), arg)
    }

    /// Busy poll for the end of the command phase.
    pub fn wait_response(&self, cmd: Command) -> SdResult {
        let timeout_us = match cmd.response_type() {
            Some(ResponseType::None) | Some(ResponseType::R3) | Some(ResponseType::R7) => {
                self.config.short_response_timeout_us
            }
            Some(ResponseType::R1)
            | Some(ResponseType::R1b)
            | Some(ResponseType::R2)
            | Some(ResponseType::R6) => self.config.long_response_timeout_us,
            Some(ResponseType::R4) | Some(ResponseType::R5) | None => {
                return Err(SdError::UnsupportedResponse)
            }
        };
        self.polling(timeout_us, SdError::ResponseTimeout, || {
            if self.rint().contains(IntStatus::CDONE) {
                Ok(())
            } else {
                Err(nb::Error::WouldBlock)
            }
        })
        .map_err(|e| {
            error!(
                "[CMD] timeout CMD{} RINTSTS {:#x}",
                cmd.index(),
                self.rint().bits()
            );
            e
        })?;
        // RTO and RCRC stay latched for the response readers
        self.ack(IntStatus::CDONE);
        Ok(())
    }

    pub fn receive_response(&self, shape: ResponseShape, cmd: Command) -> SdResult<Response> {
        match shape {
            ResponseShape::ShortCrc => self.recv_short_crc(cmd).map(Response::Short),
            ResponseShape::Long => self.recv_long(cmd).map(Response::Long),
            ResponseShape::Short => self.recv_short(cmd).map(Response::Short),
            ResponseShape::NotImplemented => self.recv_not_impl(cmd).map(Response::Short),
        }
    }

    fn check_response_type(&self, cmd: Command, allowed: &[ResponseType]) -> SdResult {
        if cfg!(debug_assertions) {
            match cmd.response_type() {
                Some(resp) if allowed.contains(&resp) => {}
                _ => {
                    error!("[CMD] wrong response for CMD {:#x}", cmd.raw());
                    return Err(SdError::WrongResponseType);
                }
            }
        }
        Ok(())
    }

    /// R1, R1b and R6.
    pub fn recv_short_crc(&self, cmd: Command) -> SdResult<u32> {
        self.check_response_type(
            cmd,
            &[ResponseType::R1, ResponseType::R1b, ResponseType::R6],
        )?;
        let rint = self.rint();
        let resp = self.regs.read(CiuReg::Resp0);
        let ret = if rint.contains(IntStatus::RTO) {
            error!("[CMD] CMD{} response timeout {:#x}", cmd.index(), rint.bits());
            Err(SdError::ResponseTimeout)
        } else if rint.contains(IntStatus::RCRC) {
            error!("[CMD] CMD{} response crc failure {:#x}", cmd.index(), rint.bits());
            Err(SdError::ResponseCrc(Response::Short(resp)))
        } else {
            debug!("[CMD] CMD{} R {:#010x}", cmd.index(), resp);
            Ok(resp)
        };
        self.ack(IntStatus::all());
        ret
    }

    /// R2, most significant word first.
    pub fn recv_long(&self, cmd: Command) -> SdResult<[u32; 4]> {
        self.check_response_type(cmd, &[ResponseType::R2])?;
        let rint = self.rint();
        let ret = if rint.contains(IntStatus::RTO) {
            error!("[CMD] CMD{} response timeout {:#x}", cmd.index(), rint.bits());
            Err(SdError::ResponseTimeout)
        } else {
            let resp = [
                self.regs.read(CiuReg::Resp3),
                self.regs.read(CiuReg::Resp2),
                self.regs.read(CiuReg::Resp1),
                self.regs.read(CiuReg::Resp0),
            ];
            if rint.contains(IntStatus::RCRC) {
                error!("[CMD] CMD{} response crc failure {:#x}", cmd.index(), rint.bits());
                Err(SdError::ResponseCrc(Response::Long(resp)))
            } else {
                debug!("[CMD] CMD{} R {:x?}", cmd.index(), resp);
                Ok(resp)
            }
        };
        self.ack(IntStatus::RESP_DONE_MASK);
        ret
    }

    /// R3 and R7, a CRC error is expected here and ignored.
    pub fn recv_short(&self, cmd: Command) -> SdResult<u32> {
        self.check_response_type(cmd, &[ResponseType::R3, ResponseType::R7])?;
        let rint = self.rint();
        let ret = if rint.contains(IntStatus::RTO) {
            error!("[CMD] CMD{} response timeout {:#x}", cmd.index(), rint.bits());
            Err(SdError::ResponseTimeout)
        } else {
            let resp = self.regs.read(CiuReg::Resp0);
            debug!("[CMD] CMD{} R {:#010x}", cmd.index(), resp);
            Ok(resp)
        };
        self.ack(IntStatus::all());
        ret
    }

    pub fn recv_not_impl(&self, cmd: Command) -> SdResult<u32> {
        debug!("[CMD] CMD{} response not implemented", cmd.index());
        Err(SdError::UnsupportedResponse)
    }

    fn check_buffer(buf: usize, len: usize) -> SdResult {
        if buf == 0 || len == 0 || buf & 0x3 != 0 || len > u32::MAX as usize {
            error!("[DATA] bad buffer {:#x}, len {}", buf, len);
            return Err(SdError::InvalidParam);
        }
        Ok(())
    }

    fn fifo_setup(&self, path: DataPath, len: usize, mask: IntStatus) {
        self.data_disable();
        self.regs
            .write(CiuReg::Blksiz, len.min(MAX_BLOCK_SIZE) as u32);
        self.regs.write(CiuReg::Bytcnt, len as u32);
        self.critical(|st| {
            st.path = path;
            st.xfr_flags = XfrFlags::empty();
            self.config_xfr_ints(st, mask);
        });
    }

    /// Arm an interrupt driven read into `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes until the transfer
    /// ends, is cancelled, or the host is reset.
    pub unsafe fn recv_setup(&self, buf: *mut u8, len: usize) -> SdResult {
        Self::check_buffer(buf as usize, len)?;
        debug!("[DATA] recv setup {} bytes", len);
        let cursor = FifoCursor::new(buf, len);
        self.fifo_setup(DataPath::FifoRecv(cursor), len, IntStatus::RECV_MASK);
        Ok(())
    }

    /// Arm an interrupt driven write from `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `len` bytes until the transfer ends,
    /// is cancelled, or the host is reset.
    pub unsafe fn send_setup(&self, buf: *const u8, len: usize) -> SdResult {
        Self::check_buffer(buf as usize, len)?;
        debug!("[DATA] send setup {} bytes", len);
        let cursor = FifoCursor::new(buf as *mut u8, len);
        self.fifo_setup(DataPath::FifoSend(cursor), len, IntStatus::SEND_MASK);
        Ok(())
    }

    pub fn cancel(&self) {
        debug!("[DATA] cancel");
        let dma = self.critical(|st| {
            st.xfr_mask = IntStatus::empty();
            self.config_wait_ints(st, IntStatus::empty(), WaitEvents::empty(), WaitEvents::empty());
            st.xfr_flags = XfrFlags::empty();
            let dma = st.dma_mode();
            st.path = DataPath::Idle;
            let _ = self.timer.lock().cancel();
            dma
        });
        self.ack(IntStatus::all());
        if dma {
            self.dma_stop();
        }
    }

    pub fn wait_enable(&self, events: WaitEvents) {
        let mut mask = IntStatus::empty();
        if events.contains(WaitEvents::CMDDONE) {
            mask |= IntStatus::CMD_DONE_MASK;
        }
        if events.contains(WaitEvents::RESPONSEDONE) {
            mask |= IntStatus::RESP_DONE_MASK;
        }
        // TRANSFERDONE is signalled by the transfer path, it has no mask of its own
        self.critical(|st| {
            self.config_wait_ints(st, IntStatus::empty(), WaitEvents::empty(), WaitEvents::empty());
            self.sem.reset();
            self.config_wait_ints(st, mask, events, WaitEvents::empty());
        });
    }

    /// Block until an armed event fires or `timeout_ms` passes.
    /// Wait interrupts are disabled on return; re-arm with `wait_enable`.
    pub fn event_wait(&self, timeout_ms: u32) -> WaitEvents {
        let (events, wakeup) = self.critical(|st| (st.wait_events, st.wakeup));
        debug_assert!(
            !events.is_empty() || !wakeup.is_empty(),
            "event_wait without wait_enable"
        );
        if events.is_empty() && wakeup.is_empty() {
            error!("[WAIT] nothing to wait for");
            return WaitEvents::empty();
        }

        let mut timer_armed = false;
        if events.contains(WaitEvents::TIMEOUT) && wakeup.is_empty() {
            if timeout_ms == 0 {
                self.critical(|st| {
                    self.config_wait_ints(st, IntStatus::empty(), WaitEvents::empty(), WaitEvents::empty())
                });
                return WaitEvents::TIMEOUT;
            }
            // the timer is shared with interrupt context, only touch it masked
            timer_armed = self.critical(|st| {
                if !st.wakeup.is_empty() {
                    return false;
                }
                self.timer.lock().start(Millis(timeout_ms));
                true
            });
        }

        let wakeup = loop {
            self.sem.take(|| {
                self.platform.idle();
                if timer_armed {
                    let expired = self.critical(|_| self.timer.lock().wait().is_ok());
                    if expired {
                        timer_armed = false;
                        self.handle_wait_timeout();
                    }
                }
            });
            let wakeup = self.critical(|st| st.wakeup);
            if !wakeup.is_empty() {
                break wakeup;
            }
        };

        self.critical(|st| {
            self.config_wait_ints(st, IntStatus::empty(), WaitEvents::empty(), WaitEvents::empty());
            let _ = self.timer.lock().cancel();
        });
        debug!("[WAIT] wakeup {:?}", wakeup);
        wakeup
    }

    /// Wait timer expiry, from the timer interrupt or the waiting thread.
    pub fn handle_wait_timeout(&self) {
        self.critical(|st| {
            if st.wait_events.contains(WaitEvents::TIMEOUT) {
                warn!("[WAIT] timeout, waiting for {:?}", st.wait_events);
                self.end_wait(st, WaitEvents::TIMEOUT);
            }
        });
    }

    /// Single exit of a wait: timer off, wait interrupts off, waiter released.
    /// Runs inside `critical`.
    fn end_wait(&self, st: &mut HostState, wakeup: WaitEvents) {
        let _ = self.timer.lock().cancel();
        self.config_wait_ints(st, IntStatus::empty(), WaitEvents::empty(), wakeup);
        self.sem.post();
    }

    fn dma_stop(&self) {
        self.data_disable();
        self.regs.write(CiuReg::Idsts, IdmacStatus::ALL.bits());
    }

    fn end_transfer(&self, st: &mut HostState, wakeup: WaitEvents) {
        self.config_xfr_ints(st, IntStatus::empty());
        self.ack(IntStatus::XFR_DONE_ICR);
        if st.dma_mode() {
            self.dma_stop();
        }
        st.path = DataPath::Idle;
        st.xfr_flags = XfrFlags::empty();
        if st.wait_events.intersects(wakeup) {
            self.end_wait(st, wakeup);
        }
    }

    pub fn callback_enable(&self, events: MediaEvents) {
        let work = self.critical(|st| {
            st.cb_events = events;
            Self::take_callback(st)
        });
        if let Some(work) = work {
            self.dispatch(work, ExecContext::Thread);
        }
    }

    pub fn register_callback(&self, callback: Work) {
        self.critical(|st| {
            st.callback = Some(callback);
            st.cb_events = MediaEvents::empty();
        });
    }

    /// The callback if the current card state matches an armed event.
    /// Arming is one shot.
    fn take_callback(st: &mut HostState) -> Option<Work> {
        let callback = st.callback.clone()?;
        let wanted = if st.card_status.contains(CardStatus::PRESENT) {
            MediaEvents::INSERTED
        } else {
            MediaEvents::EJECTED
        };
        if !st.cb_events.contains(wanted) {
            return None;
        }
        st.cb_events = MediaEvents::empty();
        Some(callback)
    }

    fn dispatch(&self, work: Work, ctx: ExecContext) {
        match ctx {
            ExecContext::Thread => work(),
            ExecContext::Interrupt => {
                if let Err(e) = self.platform.queue_work(work) {
                    error!("[MEDIA] failed to queue callback: {}", e);
                }
            }
        }
    }

    pub fn notify_media_change(&self, present: bool, ctx: ExecContext) {
        let work = self.critical(|st| {
            let before = st.card_status;
            st.card_status.set(CardStatus::PRESENT, present);
            if before == st.card_status {
                return None;
            }
            info!("[MEDIA] card {}", if present { "inserted" } else { "ejected" });
            Self::take_callback(st)
        });
        if let Some(work) = work {
            self.dispatch(work, ctx);
        }
    }

    pub fn notify_write_protect(&self, wrprotect: bool) {
        self.critical(|st| st.card_status.set(CardStatus::WRPROTECTED, wrprotect));
    }

    pub fn dma_supported(&self) -> bool {
        self.config.dma
    }

    fn dma_setup(&self, buf: VirtAddr, len: usize, dir: DataDirection) -> SdResult {
        if !self.config.dma {
            return Err(SdError::DmaUnavailable);
        }
        Self::check_buffer(buf, len)?;
        if !self.critical(|st| st.widebus) {
            warn!("[DMA] refused on a 1 bit bus");
            return Err(SdError::DmaUnavailable);
        }
        debug!("[DMA] {:?} setup {} bytes", dir, len);
        self.data_disable();
        self.regs.modify(CiuReg::Ctrl, |v| {
            v | (CtrlReg::FIFO_RESET | CtrlReg::DMA_RESET).bits()
        });
        polling_reg_clear!(
            self,
            CiuReg::Ctrl,
            CtrlReg::FIFO_RESET | CtrlReg::DMA_RESET,
            self.config.reset_timeout_us,
            SdError::ResetTimeout
        )?;
        self.regs.write(CiuReg::Bmod, BmodReg::SWR.bits());
        let head = self.critical(|st| {
            st.descs.build(
                &self.platform,
                buf,
                len,
                self.config.dma_desc_len,
                self.config.dma_max_descs,
            )
        })?;
        self.regs
            .write(CiuReg::Bmod, (BmodReg::DE | BmodReg::FB).bits());
        self.regs.write(CiuReg::Dbaddr, head as u32);
        self.regs.write(CiuReg::Idsts, IdmacStatus::ALL.bits());
        self.regs.write(
            CiuReg::Idinten,
            (IdmacStatus::TI
                | IdmacStatus::RI
                | IdmacStatus::NIS
                | IdmacStatus::AIS
                | IdmacStatus::ERRORS)
                .bits(),
        );
        self.regs
            .modify(CiuReg::Ctrl, |v| v | CtrlReg::USE_INTERNAL_DMAC.bits());
        self.regs
            .write(CiuReg::Blksiz, len.min(MAX_BLOCK_SIZE) as u32);
        self.regs.write(CiuReg::Bytcnt, len as u32);
        self.critical(|st| {
            st.path = DataPath::Dma;
            st.xfr_flags = XfrFlags::empty();
            self.config_xfr_ints(st, IntStatus::DMA_MASK);
        });
        Ok(())
    }

    /// Arm a DMA read into `buf`. Requires the 4 bit bus.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes until the transfer
    /// ends, is cancelled, or the host is reset.
    pub unsafe fn dma_recv_setup(&self, buf: *mut u8, len: usize) -> SdResult {
        self.dma_setup(buf as VirtAddr, len, DataDirection::Read)
    }

    /// Arm a DMA write from `buf`. Requires the 4 bit bus.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `len` bytes until the transfer ends,
    /// is cancelled, or the host is reset.
    pub unsafe fn dma_send_setup(&self, buf: *const u8, len: usize) -> SdResult {
        self.dma_setup(buf as VirtAddr, len, DataDirection::Write)
    }

    /// Completion report of the DMA engine for the armed transfer.
    pub fn dma_callback(&self, result: DmaResult) {
        self.critical(|st| self.dma_done(st, result));
    }

    fn dma_done(&self, st: &mut HostState, result: DmaResult) {
        if !st.dma_mode() {
            warn!("[DMA] stray completion {:?}", result);
            return;
        }
        match result {
            Ok(()) => {
                st.xfr_flags |= XfrFlags::DMADONE;
                if st.xfr_flags == XfrFlags::ALLDONE {
                    self.end_transfer(st, WaitEvents::TRANSFERDONE);
                }
            }
            Err(e) => {
                error!("[DMA] transfer failed: {:?}", e);
                self.end_transfer(st, WaitEvents::TRANSFERDONE | WaitEvents::ERROR);
            }
        }
    }

    fn recv_fifo(&self, cursor: &mut FifoCursor) {
        let status = StatusReg::from_bits_truncate(self.regs.read(CiuReg::Status));
        let avail = status.fifo_count();
        let moved = cursor.drain(avail, || self.regs.read(CiuReg::Data));
        trace!("[DATA] rx {} bytes, {} left", moved, cursor.remaining());
        if cursor.is_done() && moved < avail * 4 {
            // Surplus words; a FIFO reset here races the card, leave them
            warn!(
                "[DATA] {} words left in rx fifo, pending data crc and end bit status dropped",
                avail - (moved + 3) / 4
            );
            self.ack(IntStatus::RXDR | IntStatus::EBE | IntStatus::DCRC);
        }
    }

    fn send_fifo(&self, cursor: &mut FifoCursor) {
        let status = StatusReg::from_bits_truncate(self.regs.read(CiuReg::Status));
        let free = self
            .config
            .fifo_depth_words
            .saturating_sub(status.fifo_count());
        let moved = cursor.fill(free, |w| self.regs.write(CiuReg::Data, w));
        trace!("[DATA] tx {} bytes, {} left", moved, cursor.remaining());
    }

    fn handle_idmac(&self, st: &mut HostState) -> bool {
        let enabled = IdmacStatus::from_bits_truncate(self.regs.read(CiuReg::Idsts))
            & IdmacStatus::from_bits_truncate(self.regs.read(CiuReg::Idinten));
        if enabled.is_empty() {
            return false;
        }
        self.regs.write(CiuReg::Idsts, enabled.bits());
        let result = match DmaError::from_status(enabled) {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if enabled.intersects(IdmacStatus::TI | IdmacStatus::RI | IdmacStatus::ERRORS) {
            self.dma_done(st, result);
        }
        true
    }

    /// CIU interrupt. Runs until no enabled status is pending.
    pub fn handle_irq(&self) {
        self.critical(|st| self.service_irq(st));
    }

    fn service_irq(&self, st: &mut HostState) {
        loop {
            let idmac = self.handle_idmac(st);
            let enabled = self.rint() & IntStatus::from_bits_truncate(self.regs.read(CiuReg::Intmask));
            if enabled.is_empty() {
                if idmac {
                    continue;
                }
                break;
            }

            let pending = enabled & st.xfr_mask;
            if !pending.is_empty() {
                match &mut st.path {
                    DataPath::FifoRecv(cursor) if pending.contains(IntStatus::RXDR) => {
                        self.recv_fifo(cursor);
                        self.ack(IntStatus::RXDR);
                    }
                    DataPath::FifoSend(cursor) if pending.contains(IntStatus::TXDR) => {
                        self.send_fifo(cursor);
                        self.ack(IntStatus::TXDR);
                    }
                    _ => {}
                }

                // errors win over a DTO raised alongside them
                let errors = pending & IntStatus::DATA_ERRORS;
                if !errors.is_empty() {
                    let wakeup = if errors.contains(IntStatus::DRTO) {
                        error!("[DATA] data timeout {:?}", pending);
                        WaitEvents::TRANSFERDONE | WaitEvents::TIMEOUT
                    } else {
                        error!("[DATA] data error {:?}", errors);
                        WaitEvents::TRANSFERDONE | WaitEvents::ERROR
                    };
                    self.end_transfer(st, wakeup);
                } else if pending.contains(IntStatus::DTO) {
                    debug!(
                        "[DATA] transfer over, {} bytes to card",
                        self.regs.read(CiuReg::Tbbcnt)
                    );
                    if st.dma_mode() {
                        st.xfr_flags |= XfrFlags::XFRDONE;
                        if st.xfr_flags == XfrFlags::ALLDONE {
                            self.end_transfer(st, WaitEvents::TRANSFERDONE);
                        } else {
                            self.config_xfr_ints(st, IntStatus::empty());
                        }
                    } else {
                        if let DataPath::FifoRecv(cursor) = &mut st.path {
                            // below the watermark no RXDR is raised for the tail
                            self.recv_fifo(cursor);
                        }
                        self.end_transfer(st, WaitEvents::TRANSFERDONE);
                    }
                }
            }

            let pending = enabled & st.wait_mask;
            if !pending.is_empty() {
                if pending.intersects(IntStatus::RESP_DONE_MASK)
                    && st.wait_events.contains(WaitEvents::RESPONSEDONE)
                {
                    self.ack(IntStatus::CDONE);
                    self.end_wait(st, WaitEvents::RESPONSEDONE);
                } else if pending.contains(IntStatus::CDONE)
                    && st.wait_events.contains(WaitEvents::CMDDONE)
                {
                    self.ack(IntStatus::CDONE);
                    self.end_wait(st, WaitEvents::CMDDONE);
                } else {
                    self.ack(pending);
                }
            }
        }
    }
}
