/*
 * Logical command code handed down by the card layer:
 * [5:0]    : Command index
 * [9:6]    : Response type
 * [11:10]  : Data transfer direction
 * [12]     : Multi block transfer
 * [13]     : Stop transmission
 */
const CMDIDX_MASK: u32 = 0x3f;
const RESPONSE_SHIFT: u32 = 6;
const RESPONSE_MASK: u32 = 0xf << RESPONSE_SHIFT;
const DATAXFR_SHIFT: u32 = 10;
const DATAXFR_MASK: u32 = 0x3 << DATAXFR_SHIFT;
const MULTIBLOCK: u32 = 1 << 12;
const STOPXFR: u32 = 1 << 13;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseType {
    None = 0,
    R1 = 1,
    R1b = 2,
    R2 = 3,
    R3 = 4,
    R4 = 5,
    R5 = 6,
    R6 = 7,
    R7 = 8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataDirection {
    None = 0,
    Read = 1,
    Write = 2,
}

/// How a response is pulled out of the response registers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseShape {
    /// 48 bit, CRC checked (R1, R1b, R6)
    ShortCrc,
    /// 136 bit (R2)
    Long,
    /// 48 bit, CRC ignored (R3, R7)
    Short,
    /// R4, R5
    NotImplemented,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Response {
    Short(u32),
    /// Most significant word first.
    Long([u32; 4]),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Command(u32);

impl Command {
    pub const fn new(index: u8, resp: ResponseType, dir: DataDirection) -> Self {
        Command(
            (index as u32 & CMDIDX_MASK)
                | ((resp as u32) << RESPONSE_SHIFT)
                | ((dir as u32) << DATAXFR_SHIFT),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Command(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn multiblock(self) -> Self {
        Command(self.0 | MULTIBLOCK)
    }

    pub const fn stop(self) -> Self {
        Command(self.0 | STOPXFR)
    }

    pub const fn index(&self) -> u32 {
        self.0 & CMDIDX_MASK
    }

    /// `None` for an encoding outside the known response types.
    pub fn response_type(&self) -> Option<ResponseType> {
        use self::ResponseType::*;
        let resp = match (self.0 & RESPONSE_MASK) >> RESPONSE_SHIFT {
            0 => None,
            1 => R1,
            2 => R1b,
            3 => R2,
            4 => R3,
            5 => R4,
            6 => R5,
            7 => R6,
            8 => R7,
            _ => return Option::None,
        };
        Some(resp)
    }

    pub fn direction(&self) -> DataDirection {
        match (self.0 & DATAXFR_MASK) >> DATAXFR_SHIFT {
            1 => DataDirection::Read,
            2 => DataDirection::Write,
            _ => DataDirection::None,
        }
    }

    pub fn is_multiblock(&self) -> bool {
        self.0 & MULTIBLOCK != 0
    }

    pub fn is_stop(&self) -> bool {
        self.0 & STOPXFR != 0
    }

    pub fn shape(&self) -> ResponseShape {
        match self.response_type() {
            Some(ResponseType::R1) | Some(ResponseType::R1b) | Some(ResponseType::R6) => {
                ResponseShape::ShortCrc
            }
            Some(ResponseType::R2) => ResponseShape::Long,
            Some(ResponseType::R3) | Some(ResponseType::R7) => ResponseShape::Short,
            _ => ResponseShape::NotImplemented,
        }
    }
}

impl From<u32> for Command {
    fn from(raw: u32) -> Self {
        Command(raw)
    }
}

use self::DataDirection as D;
use self::ResponseType as R;

pub const GO_IDLE_STATE: Command = Command::new(0, R::None, D::None);
pub const ALL_SEND_CID: Command = Command::new(2, R::R2, D::None);
pub const SEND_RELATIVE_ADDR: Command = Command::new(3, R::R6, D::None);
pub const IO_SEND_OP_COND: Command = Command::new(5, R::R4, D::None);
pub const SELECT_CARD: Command = Command::new(7, R::R1b, D::None);
pub const SEND_IF_COND: Command = Command::new(8, R::R7, D::None);
pub const SEND_CSD: Command = Command::new(9, R::R2, D::None);
pub const STOP_TRANSMISSION: Command = Command::new(12, R::R1b, D::None).stop();
pub const SEND_STATUS: Command = Command::new(13, R::R1, D::None);
pub const SET_BLOCKLEN: Command = Command::new(16, R::R1, D::None);
pub const READ_SINGLE_BLOCK: Command = Command::new(17, R::R1, D::Read);
pub const READ_MULTIPLE_BLOCK: Command = Command::new(18, R::R1, D::Read).multiblock();
pub const WRITE_BLOCK: Command = Command::new(24, R::R1, D::Write);
pub const WRITE_MULTIPLE_BLOCK: Command = Command::new(25, R::R1, D::Write).multiblock();
pub const IO_RW_DIRECT: Command = Command::new(52, R::R5, D::None);
pub const APP_CMD: Command = Command::new(55, R::R1, D::None);
pub const SD_SET_BUS_WIDTH: Command = Command::new(6, R::R1, D::None);
pub const SD_SEND_OP_COND: Command = Command::new(41, R::R3, D::None);
pub const SD_SEND_SCR: Command = Command::new(51, R::R1, D::Read);
