use super::*;
use aligned::{Aligned, A16};
use alloc::boxed::Box;
use core::sync::atomic::{fence, Ordering};

pub const MAX_DMA_DESCS: usize = 32;
pub const DES_SIZE: usize = 16;
/// des1 buffer size field is 13 bits wide
pub const DES_BUFFER_MAX_LEN: usize = (1 << 13) - 1;

/* IDMAC chained descriptor, dual buffer mode unused */
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    des0: u32,
    des1: u32,
    des2: u32,
    des3: u32,
}

const_assert_eq!(core::mem::size_of::<Descriptor>(), DES_SIZE);

bitflags::bitflags! {
    pub struct DesFlags : u32 {
        const DISABLE_COMP_INT = 1 << 1;
        const LAST = 1 << 2;
        const FIRST = 1 << 3;
        const CHAIN = 1 << 4;
        const CARD_ERROR = 1 << 30;
        const OWN = 1 << 31;
    }
}

impl Descriptor {
    pub fn set_flags(&mut self, flags: DesFlags) {
        self.des0 = flags.bits();
    }

    pub fn set_buf_size(&mut self, size: u32) {
        self.des1 = size & DES_BUFFER_MAX_LEN as u32;
    }

    pub fn set_buf(&mut self, buf_paddr: PhysAddr) {
        self.des2 = buf_paddr as u32;
    }

    pub fn set_next(&mut self, next_paddr: PhysAddr) {
        self.des3 = next_paddr as u32;
    }

    pub fn flags(&self) -> DesFlags {
        DesFlags::from_bits_truncate(self.des0)
    }

    pub fn buf_size(&self) -> u32 {
        self.des1
    }

    pub fn buf(&self) -> u32 {
        self.des2
    }

    pub fn next(&self) -> u32 {
        self.des3
    }
}

/// Descriptor memory owned by one host. Boxed so the address the IDMAC
/// walks does not move with the host.
pub struct DescriptorTable {
    desc: Box<Aligned<A16, [Descriptor; MAX_DMA_DESCS]>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            desc: Box::new(Aligned([Descriptor::default(); MAX_DMA_DESCS])),
        }
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &**self.desc
    }

    /// Chain `len` bytes at `buf` into descriptors of `desc_len` bytes,
    /// returning the bus address of the first descriptor.
    pub fn build<P: Platform>(
        &mut self,
        platform: &P,
        buf: VirtAddr,
        len: usize,
        desc_len: usize,
        max_descs: usize,
    ) -> SdResult<PhysAddr> {
        let max_descs = max_descs.min(MAX_DMA_DESCS);
        if desc_len == 0 || desc_len > DES_BUFFER_MAX_LEN || desc_len & 0x3 != 0 {
            error!("[DMA] bad descriptor length {}", desc_len);
            return Err(SdError::InvalidParam);
        }
        let des_num = (len + desc_len - 1) / desc_len;
        if len == 0 || des_num > max_descs || buf & 0x3 != 0 {
            error!(
                "[DMA] buf pointer error, buf = 0x{:x?}, buf_size = 0x{:x?}",
                buf, len
            );
            return Err(SdError::InvalidParam);
        }
        let table: &mut [Descriptor] = &mut **self.desc;
        let base = table.as_ptr() as VirtAddr;
        for (i, desc) in table.iter_mut().take(des_num).enumerate() {
            let mut flags = DesFlags::OWN | DesFlags::CHAIN;
            desc.set_buf(platform.virt_to_phys(buf + i * desc_len));
            if i == des_num - 1 {
                flags |= DesFlags::LAST;
                desc.set_buf_size((len - i * desc_len) as u32);
                desc.set_next(0);
            } else {
                flags |= DesFlags::DISABLE_COMP_INT;
                desc.set_buf_size(desc_len as u32);
                desc.set_next(platform.virt_to_phys(base + (i + 1) * DES_SIZE));
            }
            if i == 0 {
                flags |= DesFlags::FIRST;
            }
            desc.set_flags(flags);
        }
        // write barrier
        fence(Ordering::SeqCst);
        Ok(platform.virt_to_phys(base))
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure reported by the DMA engine for the current transfer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DmaError {
    FatalBus,
    DescriptorUnavailable,
    CardError,
}

impl DmaError {
    pub fn from_status(status: IdmacStatus) -> Option<Self> {
        if status.contains(IdmacStatus::FBE) {
            Some(DmaError::FatalBus)
        } else if status.contains(IdmacStatus::DU) {
            Some(DmaError::DescriptorUnavailable)
        } else if status.contains(IdmacStatus::CES) {
            Some(DmaError::CardError)
        } else {
            None
        }
    }
}

pub type DmaResult = Result<(), DmaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmc::testing::SimPlatform;

    #[test]
    fn chain_layout() {
        let platform = SimPlatform::new();
        let mut table = DescriptorTable::new();
        let buf = 0x8000_0000usize;
        let head = table.build(&platform, buf, 1300, 512, 32).unwrap();
        let desc = table.descriptors();
        assert_eq!(head, desc.as_ptr() as usize);
        assert_eq!(head & 0xf, 0);

        assert!(desc[0].flags().contains(DesFlags::OWN | DesFlags::CHAIN | DesFlags::FIRST));
        assert!(!desc[0].flags().contains(DesFlags::LAST));
        assert_eq!(desc[0].buf_size(), 512);
        assert_eq!(desc[0].buf(), buf as u32);
        assert_eq!(desc[0].next() as usize, head + DES_SIZE);

        assert_eq!(desc[1].buf(), (buf + 512) as u32);
        assert!(!desc[1].flags().contains(DesFlags::FIRST));

        assert!(desc[2].flags().contains(DesFlags::LAST));
        assert!(!desc[2].flags().contains(DesFlags::DISABLE_COMP_INT));
        assert_eq!(desc[2].buf_size(), 1300 - 1024);
        assert_eq!(desc[2].next(), 0);
    }

    #[test]
    fn single_descriptor_is_first_and_last() {
        let platform = SimPlatform::new();
        let mut table = DescriptorTable::new();
        table.build(&platform, 0x1000, 512, 512, 32).unwrap();
        let flags = table.descriptors()[0].flags();
        assert!(flags.contains(DesFlags::FIRST | DesFlags::LAST | DesFlags::OWN));
    }

    #[test]
    fn rejects_oversized_or_misaligned() {
        let platform = SimPlatform::new();
        let mut table = DescriptorTable::new();
        assert_eq!(
            table.build(&platform, 0x1000, 512 * 5, 512, 4),
            Err(SdError::InvalidParam)
        );
        assert_eq!(
            table.build(&platform, 0x1002, 512, 512, 4),
            Err(SdError::InvalidParam)
        );
        assert_eq!(
            table.build(&platform, 0x1000, 0, 512, 4),
            Err(SdError::InvalidParam)
        );
    }

    #[test]
    fn idmac_error_status() {
        assert_eq!(
            DmaError::from_status(IdmacStatus::FBE | IdmacStatus::AIS),
            Some(DmaError::FatalBus)
        );
        assert_eq!(DmaError::from_status(IdmacStatus::RI | IdmacStatus::NIS), None);
    }
}
