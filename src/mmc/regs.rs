use super::*;

/* #REF: Synopsys DesignWare Mobile Storage Host, as integrated in the LPC43xx SD/MMC block */

#[repr(C)]
pub struct CiuRegs {
    pub ctrl: Reg,
    pub pwren: Reg,
    pub clkdiv: Reg,
    pub clksrc: Reg,
    pub clkena: Reg,
    pub tmout: Reg,
    pub ctype: Reg,
    pub blksiz: Reg,
    pub bytcnt: Reg,
    pub intmask: Reg,
    pub cmdarg: Reg,
    pub cmd: Reg,
    pub resp: [Reg; 4],
    pub mintsts: Reg,
    pub rintsts: Reg,
    pub status: Reg,
    pub fifoth: Reg,
    pub cdetect: Reg,
    pub wrtprt: Reg,
    pub gpio: Reg,
    pub tcbcnt: Reg,
    pub tbbcnt: Reg,
    pub debnce: Reg,
    pub usrid: Reg,
    pub verid: Reg,
    pub res0: Reg,
    pub uhs: Reg,
    pub rst_n: Reg,
    pub res1: Reg,
    pub bmod: Reg,
    pub pldmnd: Reg,
    pub dbaddr: Reg,
    pub idsts: Reg,
    pub idinten: Reg,
    pub dscaddr: Reg,
    pub bufaddr: Reg,
    pub res2: [Reg; 25],
    pub data: Reg,
}

const_assert_eq!(core::mem::size_of::<CiuRegs>(), 0x104);

/// Registers the host touches, by name.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CiuReg {
    Ctrl,
    Pwren,
    Clkdiv,
    Clksrc,
    Clkena,
    Tmout,
    Ctype,
    Blksiz,
    Bytcnt,
    Intmask,
    Cmdarg,
    Cmd,
    Resp0,
    Resp1,
    Resp2,
    Resp3,
    Mintsts,
    Rintsts,
    Status,
    Fifoth,
    Cdetect,
    Wrtprt,
    Tcbcnt,
    Tbbcnt,
    Bmod,
    Dbaddr,
    Idsts,
    Idinten,
    Data,
}

impl CiuReg {
    pub const fn offset(self) -> usize {
        use self::CiuReg::*;
        match self {
            Ctrl => 0x000,
            Pwren => 0x004,
            Clkdiv => 0x008,
            Clksrc => 0x00c,
            Clkena => 0x010,
            Tmout => 0x014,
            Ctype => 0x018,
            Blksiz => 0x01c,
            Bytcnt => 0x020,
            Intmask => 0x024,
            Cmdarg => 0x028,
            Cmd => 0x02c,
            Resp0 => 0x030,
            Resp1 => 0x034,
            Resp2 => 0x038,
            Resp3 => 0x03c,
            Mintsts => 0x040,
            Rintsts => 0x044,
            Status => 0x048,
            Fifoth => 0x04c,
            Cdetect => 0x050,
            Wrtprt => 0x054,
            Tcbcnt => 0x05c,
            Tbbcnt => 0x060,
            Bmod => 0x080,
            Dbaddr => 0x088,
            Idsts => 0x08c,
            Idinten => 0x090,
            Data => 0x100,
        }
    }
}

/// Typed access to the CIU register file.
pub trait CiuRegisters: Send + Sync {
    fn read(&self, reg: CiuReg) -> u32;

    fn write(&self, reg: CiuReg, val: u32);

    fn modify<F: FnOnce(u32) -> u32>(&self, reg: CiuReg, f: F) {
        let val = self.read(reg);
        self.write(reg, f(val));
    }
}

/// The memory mapped register block.
pub struct MmioCiu {
    regs: Wapper<'static, CiuRegs>,
}

impl MmioCiu {
    /// # Safety
    ///
    /// `base` must be the mapped virtual address of the CIU register block,
    /// owned by this instance for the rest of the program.
    pub unsafe fn new(base: VirtAddr) -> Self {
        Self {
            regs: Wapper::from_raw(base),
        }
    }

    fn reg(&self, reg: CiuReg) -> &Reg {
        use self::CiuReg::*;
        let r = &self.regs;
        match reg {
            Ctrl => &r.ctrl,
            Pwren => &r.pwren,
            Clkdiv => &r.clkdiv,
            Clksrc => &r.clksrc,
            Clkena => &r.clkena,
            Tmout => &r.tmout,
            Ctype => &r.ctype,
            Blksiz => &r.blksiz,
            Bytcnt => &r.bytcnt,
            Intmask => &r.intmask,
            Cmdarg => &r.cmdarg,
            Cmd => &r.cmd,
            Resp0 => &r.resp[0],
            Resp1 => &r.resp[1],
            Resp2 => &r.resp[2],
            Resp3 => &r.resp[3],
            Mintsts => &r.mintsts,
            Rintsts => &r.rintsts,
            Status => &r.status,
            Fifoth => &r.fifoth,
            Cdetect => &r.cdetect,
            Wrtprt => &r.wrtprt,
            Tcbcnt => &r.tcbcnt,
            Tbbcnt => &r.tbbcnt,
            Bmod => &r.bmod,
            Dbaddr => &r.dbaddr,
            Idsts => &r.idsts,
            Idinten => &r.idinten,
            Data => &r.data,
        }
    }
}

impl CiuRegisters for MmioCiu {
    fn read(&self, reg: CiuReg) -> u32 {
        self.reg(reg).read()
    }

    fn write(&self, reg: CiuReg, val: u32) {
        self.reg(reg).write(val)
    }
}

/// Logs every access at trace level.
pub struct TracedCiu<R> {
    inner: R,
}

impl<R: CiuRegisters> TracedCiu<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: CiuRegisters> CiuRegisters for TracedCiu<R> {
    fn read(&self, reg: CiuReg) -> u32 {
        let val = self.inner.read(reg);
        trace!("[CIU] {:?}@{:#05x} -> {:#010x}", reg, reg.offset(), val);
        val
    }

    fn write(&self, reg: CiuReg, val: u32) {
        trace!("[CIU] {:?}@{:#05x} <- {:#010x}", reg, reg.offset(), val);
        self.inner.write(reg, val)
    }
}

bitflags::bitflags! {
    /* INTMASK / MINTSTS / RINTSTS */
    pub struct IntStatus : u32 {
        const CD = 1 << 0;
        const RE = 1 << 1;
        const CDONE = 1 << 2;
        const DTO = 1 << 3;
        const TXDR = 1 << 4;
        const RXDR = 1 << 5;
        const RCRC = 1 << 6;
        const DCRC = 1 << 7;
        const RTO = 1 << 8;
        const DRTO = 1 << 9;
        const HTO = 1 << 10;
        const FRUN = 1 << 11;
        const HLE = 1 << 12;
        const SBE = 1 << 13;
        const ACD = 1 << 14;
        const EBE = 1 << 15;
        const SDIO = 1 << 16;

        /* Wait for the command, with or without a response */
        const CMD_DONE_MASK = IntStatus::CDONE.bits;
        const RESP_DONE_MASK =
            IntStatus::RTO.bits |
            IntStatus::RCRC.bits |
            IntStatus::CDONE.bits;
        /* Acked when a transfer ends */
        const XFR_DONE_ICR =
            IntStatus::DTO.bits |
            IntStatus::DCRC.bits |
            IntStatus::DRTO.bits |
            IntStatus::FRUN.bits |
            IntStatus::SBE.bits |
            IntStatus::EBE.bits;
        const DATA_ERRORS =
            IntStatus::DCRC.bits |
            IntStatus::DRTO.bits |
            IntStatus::FRUN.bits |
            IntStatus::SBE.bits |
            IntStatus::EBE.bits;
        const RECV_MASK = IntStatus::RXDR.bits | IntStatus::DTO.bits | IntStatus::DATA_ERRORS.bits;
        const SEND_MASK = IntStatus::TXDR.bits | IntStatus::DTO.bits | IntStatus::DATA_ERRORS.bits;
        const DMA_MASK = IntStatus::DTO.bits | IntStatus::DATA_ERRORS.bits;
    }

    pub struct CtrlReg : u32 {
        const CONTROLLER_RESET = 1 << 0;
        const FIFO_RESET = 1 << 1;
        const DMA_RESET = 1 << 2;
        const INT_ENABLE = 1 << 4;
        const DMA_ENABLE = 1 << 5;
        const USE_INTERNAL_DMAC = 1 << 25;
        const RESET_ALL =
            CtrlReg::CONTROLLER_RESET.bits |
            CtrlReg::FIFO_RESET.bits |
            CtrlReg::DMA_RESET.bits;
    }

    /*
     * CMD[5:0]     : Command index
     * CMD[6]       : Response expected
     * CMD[7]       : Long response
     * CMD[8]       : Check response CRC
     * CMD[9]       : Data expected
     * CMD[10]      : Write
     * CMD[12]      : Auto stop
     * CMD[13]      : Wait previous data
     * CMD[14]      : Stop/abort
     * CMD[15]      : Send initialization
     * CMD[21]      : Update clock registers only
     * CMD[31]      : Start command
     */
    pub struct CmdReg : u32 {
        const RESPONSE_EXPECT = 1 << 6;
        const LONG_RESPONSE = 1 << 7;
        const CHECK_CRC = 1 << 8;
        const DATA_EXPECTED = 1 << 9;
        const WRITE = 1 << 10;
        const SEND_AUTO_STOP = 1 << 12;
        const WAIT_PREV_DATA = 1 << 13;
        const STOP_ABORT = 1 << 14;
        const SEND_INIT = 1 << 15;
        const UPDATE_CLOCK = 1 << 21;
        const START = 1 << 31;
        const SHORT_RESPONSE = CmdReg::RESPONSE_EXPECT.bits;
        const LONG = CmdReg::RESPONSE_EXPECT.bits | CmdReg::LONG_RESPONSE.bits;
    }

    pub struct StatusReg : u32 {
        const RX_WATERMARK = 1 << 0;
        const TX_WATERMARK = 1 << 1;
        const FIFO_EMPTY = 1 << 2;
        const FIFO_FULL = 1 << 3;
        const DATA_BUSY = 1 << 9;
        const FIFO_COUNT = 0x1fff << 17;
    }

    pub struct BmodReg : u32 {
        const SWR = 1 << 0;
        const FB = 1 << 1;
        const DE = 1 << 7;
    }

    /* IDSTS / IDINTEN */
    pub struct IdmacStatus : u32 {
        const TI = 1 << 0;
        const RI = 1 << 1;
        const FBE = 1 << 2;
        const DU = 1 << 4;
        const CES = 1 << 5;
        const NIS = 1 << 8;
        const AIS = 1 << 9;
        const ERRORS =
            IdmacStatus::FBE.bits |
            IdmacStatus::DU.bits |
            IdmacStatus::CES.bits;
        const ALL =
            IdmacStatus::TI.bits |
            IdmacStatus::RI.bits |
            IdmacStatus::ERRORS.bits |
            IdmacStatus::NIS.bits |
            IdmacStatus::AIS.bits;
    }
}

impl StatusReg {
    /// Number of words in the FIFO.
    pub fn fifo_count(&self) -> usize {
        ((self.bits() & Self::FIFO_COUNT.bits()) >> 17) as usize
    }
}

pub const CTYPE_WIDTH1: u32 = 0;
pub const CTYPE_WIDTH4: u32 = 1 << 0;
pub const CLKENA_ENABLE: u32 = 1 << 0;
pub const CLKSRC_DIV0: u32 = 0;
pub const TMOUT_MAX: u32 = 0xffff_ffff;
pub const FIFOTH_RX_WMARK_SHIFT: u32 = 16;
pub const FIFOTH_TX_WMARK_SHIFT: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_block_offsets() {
        let base = core::mem::MaybeUninit::<CiuRegs>::uninit();
        let base_ptr = base.as_ptr();
        let off = |p: *const Reg| p as usize - base_ptr as usize;
        unsafe {
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).cmd)), CiuReg::Cmd.offset());
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).rintsts)), CiuReg::Rintsts.offset());
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).status)), CiuReg::Status.offset());
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).bmod)), CiuReg::Bmod.offset());
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).idinten)), CiuReg::Idinten.offset());
            assert_eq!(off(core::ptr::addr_of!((*base_ptr).data)), CiuReg::Data.offset());
        }
    }

    #[test]
    fn fifo_count_field() {
        let status = StatusReg::from_bits_truncate((5 << 17) | StatusReg::RX_WATERMARK.bits());
        assert_eq!(status.fifo_count(), 5);
        assert!(status.contains(StatusReg::RX_WATERMARK));
    }

    #[test]
    fn transfer_masks() {
        assert!(IntStatus::RECV_MASK.contains(IntStatus::RXDR));
        assert!(!IntStatus::RECV_MASK.contains(IntStatus::TXDR));
        assert!(!IntStatus::DMA_MASK.intersects(IntStatus::RXDR | IntStatus::TXDR));
        // every status that can end a transfer is cleared when it ends
        assert!(IntStatus::XFR_DONE_ICR.contains(IntStatus::DATA_ERRORS | IntStatus::DTO));
        assert_eq!(IntStatus::all().bits(), 0x1ffff);
    }
}
