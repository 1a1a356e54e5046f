use core::ptr;

/// Cursor over the caller buffer of a CPU driven transfer.
///
/// The FIFO is 32 bits wide. A transfer whose length is not a multiple of
/// four ends with one partial word: on receive only its leading bytes are
/// stored, on send it is zero padded.
#[derive(Debug)]
pub struct FifoCursor {
    buf: *mut u8,
    remaining: usize,
}

unsafe impl Send for FifoCursor {}

impl FifoCursor {
    /// # Safety
    ///
    /// `buf` must stay valid for `len` bytes until the transfer ends or is
    /// cancelled.
    pub unsafe fn new(buf: *mut u8, len: usize) -> Self {
        Self {
            buf,
            remaining: len,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Pop up to `words` words into the buffer, returns bytes stored.
    pub fn drain<F: FnMut() -> u32>(&mut self, words: usize, mut pop: F) -> usize {
        let mut moved = 0;
        for _ in 0..words {
            if self.remaining == 0 {
                break;
            }
            let data = pop().to_le_bytes();
            let n = self.remaining.min(4);
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), self.buf, n);
                self.buf = self.buf.add(n);
            }
            self.remaining -= n;
            moved += n;
        }
        moved
    }

    /// Push up to `words` words from the buffer, returns bytes consumed.
    pub fn fill<F: FnMut(u32)>(&mut self, words: usize, mut push: F) -> usize {
        let mut moved = 0;
        for _ in 0..words {
            if self.remaining == 0 {
                break;
            }
            let mut data = [0u8; 4];
            let n = self.remaining.min(4);
            unsafe {
                ptr::copy_nonoverlapping(self.buf, data.as_mut_ptr(), n);
                self.buf = self.buf.add(n);
            }
            push(u32::from_le_bytes(data));
            self.remaining -= n;
            moved += n;
        }
        moved
    }
}
