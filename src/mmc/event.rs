bitflags::bitflags! {
    /// Events a thread may wait for.
    pub struct WaitEvents : u8 {
        const CMDDONE = 1 << 0;
        const RESPONSEDONE = 1 << 1;
        const TRANSFERDONE = 1 << 2;
        const TIMEOUT = 1 << 3;
        const ERROR = 1 << 4;
    }

    /// Media change events a callback may be armed for.
    pub struct MediaEvents : u8 {
        const INSERTED = 1 << 0;
        const EJECTED = 1 << 1;
    }

    pub struct CardStatus : u8 {
        const PRESENT = 1 << 0;
        const WRPROTECTED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClockRate {
    Disabled,
    /// Identification mode, <= 400KHz
    IdMode,
    MmcTransfer,
    SdTransfer1Bit,
    SdTransfer4Bit,
}

/// Who is calling into the host.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExecContext {
    Thread,
    Interrupt,
}
