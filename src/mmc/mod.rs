use super::*;
use alloc::sync::Arc;
use embedded_hal::timer::{Cancel, CountDown};

mod cmd;
mod config;
mod dma;
mod event;
mod fifo;
mod host;
mod regs;
mod sync;
#[cfg(test)]
pub(crate) mod testing;

pub use cmd::*;
pub use config::HostConfig;
pub use dma::{DmaError, DmaResult, MAX_DMA_DESCS};
pub use event::*;
pub use host::SdmmcHost;
pub use regs::{CiuReg, CiuRegisters, CiuRegs, MmioCiu, TracedCiu};

use dma::*;
use fifo::FifoCursor;
use regs::*;
use sync::Semaphore;

/// Host over the memory mapped register block at `base`.
///
/// # Safety
///
/// `base` must be the mapped virtual address of a CIU register block that
/// no other host drives.
pub unsafe fn host<P, T>(
    base: VirtAddr,
    platform: P,
    timer: T,
    config: HostConfig,
) -> Arc<SdmmcHost<MmioCiu, P, T>>
where
    P: Platform,
    T: CountDown<Time = Millis> + Cancel,
{
    Arc::new(SdmmcHost::new(MmioCiu::new(base), platform, timer, config))
}
