use core::fmt;

use crate::mmc::Response;

pub type SdResult<T = ()> = Result<T, SdError>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdError {
    // Hardware Error
    SendFailure,
    ResponseTimeout,
    /// The payload is still handed back, some response classes don't care.
    ResponseCrc(Response),
    ResetTimeout,
    // Software Error
    UnsupportedResponse,
    WrongResponseType,
    InvalidParam,
    DmaUnavailable,
    WorkQueue,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::SdError::*;
        let explain = match self {
            SendFailure => "Command was not accepted by the CIU",
            ResponseTimeout => "Response timeout",
            ResponseCrc(_) => "Response crc error",
            ResetTimeout => "Controller reset timeout",
            UnsupportedResponse => "Response type not supported",
            WrongResponseType => "Wrong response type",
            InvalidParam => "Invalid parameters",
            DmaUnavailable => "Dma unavailable",
            WorkQueue => "Failed to queue work",
        };
        write!(f, "{}", explain)
    }
}
