use alloc::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::error::SdResult;

pub type VirtAddr = usize;
pub type PhysAddr = usize;

pub struct Reg(volatile_register::RW<u32>);

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Reg[RW] {:#x}", self.0.read()))
    }
}

/// #Safety: the safety of register should be ensured by the host lock
/// and the START bit handshake of the command register
unsafe impl Sync for Reg {}

impl Reg {
    pub fn write(&self, reg: u32) {
        unsafe { self.0.write(reg) };
    }

    pub fn read(&self) -> u32 {
        self.0.read()
    }

    pub fn modify<F: FnOnce(u32) -> u32>(&self, f: F) {
        unsafe { self.0.modify(f) };
    }
}

pub struct Wapper<'a, T> {
    ptr: &'a mut T,
}

impl<T> Wapper<'_, T> {
    /// # Safety
    ///
    /// `base_addr` must be a mapped, properly aligned register block of type `T`
    /// that nothing else aliases for the lifetime of the wrapper.
    pub unsafe fn from_raw(base_addr: VirtAddr) -> Self {
        Self {
            ptr: &mut *(base_addr as *mut T),
        }
    }
}

impl<T> Deref for Wapper<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.ptr
    }
}

impl<T> DerefMut for Wapper<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ptr
    }
}

/// Duration unit of the wait timer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Millis(pub u32);

impl From<u32> for Millis {
    fn from(ms: u32) -> Self {
        Millis(ms)
    }
}

/// Deferred work item, run outside interrupt context.
pub type Work = Arc<dyn Fn() + Send + Sync>;

/// Services the host borrows from the surrounding kernel.
pub trait Platform: Send + Sync {
    /// Mask local interrupts, returning the previous state.
    fn irq_save(&self) -> usize;

    fn irq_restore(&self, flags: usize);

    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Called while a thread waits for the host semaphore.
    fn idle(&self) {
        wfi();
    }

    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
        vaddr
    }

    fn queue_work(&self, work: Work) -> SdResult;

    /// Unmask the host interrupt line at the interrupt controller.
    fn enable_irq(&self) -> SdResult {
        Ok(())
    }

    /// Advisory lock for buses shared with other devices.
    fn bus_lock(&self, _lock: bool) {}
}

pub fn wfi() {
    #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
    {
        use riscv::{asm, register::sstatus};
        unsafe {
            // enable interrupt and disable
            let intr = sstatus::read().sie();
            if !intr {
                sstatus::set_sie();
            }
            asm::wfi();
            if !intr {
                sstatus::clear_sie();
            }
        }
    }
    #[cfg(not(any(target_arch = "riscv32", target_arch = "riscv64")))]
    {
        core::hint::spin_loop();
    }
}
