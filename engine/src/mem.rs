// mem.rs - Guest memory provider
//
// A flat byte array behind a cheaply cloneable handle. The decoder
// fetches encoded instructions through it, the interpreter and compiled
// routines load/store guest data through it, and every store is recorded
// so the dispatcher can invalidate translations overlapped by writes
// (self-modifying code).
//
// The handle is Rc-based: the engine, the decoder, and the JIT backend's
// host imports all reference the same guest RAM without copying it. The
// whole system is single-threaded cooperative, so RefCell is sufficient.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::cpu::TrapCause;

/// Default guest RAM size: 64 KiB.
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;

struct Inner {
    data: Vec<u8>,
    /// Ranges written since the dispatcher last drained them.
    written: Vec<Range<u32>>,
}

/// Shared handle to one guest address space.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Rc<RefCell<Inner>>,
}

impl GuestMemory {
    /// Create a zero-filled guest RAM of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                data: vec![0; size],
                written: Vec::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy a program image into guest RAM at `base`.
    pub fn load_image(&self, base: u32, image: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let end = base as usize + image.len();
        if end > inner.data.len() {
            bail!(
                "image of {} bytes at {base:#x} exceeds guest memory ({} bytes)",
                image.len(),
                inner.data.len()
            );
        }
        inner.data[base as usize..end].copy_from_slice(image);
        Ok(())
    }

    /// Fetch one instruction byte. `None` past the end of guest RAM.
    pub fn fetch_byte(&self, addr: u32) -> Option<u8> {
        self.inner.borrow().data.get(addr as usize).copied()
    }

    /// Fetch a little-endian u32 operand. `None` if any byte is unmapped.
    pub fn fetch_u32(&self, addr: u32) -> Option<u32> {
        let inner = self.inner.borrow();
        let start = addr as usize;
        let bytes = inner.data.get(start..start.checked_add(4)?)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf))
    }

    /// Guest 64-bit load. Out-of-range addresses are a guest fault, not a
    /// host error.
    pub fn load_u64(&self, addr: i64) -> Result<u64, TrapCause> {
        let inner = self.inner.borrow();
        let start = Self::check_range(&inner.data, addr)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&inner.data[start..start + 8]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Guest 64-bit store. Records the written range for translation
    /// invalidation.
    pub fn store_u64(&self, addr: i64, value: u64) -> Result<(), TrapCause> {
        let mut inner = self.inner.borrow_mut();
        let start = Self::check_range(&inner.data, addr)?;
        inner.data[start..start + 8].copy_from_slice(&value.to_le_bytes());
        inner.written.push(start as u32..(start + 8) as u32);
        Ok(())
    }

    /// Drain the ranges written since the last call.
    pub fn take_written_ranges(&self) -> Vec<Range<u32>> {
        std::mem::take(&mut self.inner.borrow_mut().written)
    }

    /// Snapshot the full contents (test and diagnostic use).
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    fn check_range(data: &[u8], addr: i64) -> Result<usize, TrapCause> {
        if addr < 0 {
            return Err(TrapCause::MemoryFault { addr });
        }
        let start = addr as usize;
        match start.checked_add(8) {
            Some(end) if end <= data.len() => Ok(start),
            _ => Err(TrapCause::MemoryFault { addr }),
        }
    }

}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_round_trip() {
        let mem = GuestMemory::new(64);
        mem.store_u64(8, 0xdead_beef_cafe).unwrap();
        assert_eq!(mem.load_u64(8).unwrap(), 0xdead_beef_cafe);
    }

    #[test]
    fn out_of_range_access_is_a_guest_fault() {
        let mem = GuestMemory::new(16);
        assert_eq!(
            mem.load_u64(9).unwrap_err(),
            TrapCause::MemoryFault { addr: 9 }
        );
        assert_eq!(
            mem.store_u64(-1, 0).unwrap_err(),
            TrapCause::MemoryFault { addr: -1 }
        );
        // Straddling the end is also rejected.
        assert!(mem.load_u64(i64::MAX - 3).is_err());
    }

    #[test]
    fn stores_are_tracked_until_drained() {
        let mem = GuestMemory::new(64);
        mem.store_u64(0, 1).unwrap();
        mem.store_u64(16, 2).unwrap();
        assert_eq!(mem.take_written_ranges(), vec![0..8, 16..24]);
        assert!(mem.take_written_ranges().is_empty());
    }

    #[test]
    fn image_larger_than_memory_is_rejected() {
        let mem = GuestMemory::new(4);
        assert!(mem.load_image(0, &[0; 8]).is_err());
        assert!(mem.load_image(2, &[0, 0]).is_ok());
    }

    #[test]
    fn fetch_past_end_returns_none() {
        let mem = GuestMemory::new(4);
        assert_eq!(mem.fetch_byte(3), Some(0));
        assert_eq!(mem.fetch_byte(4), None);
        assert_eq!(mem.fetch_u32(1), None);
        assert_eq!(mem.fetch_u32(0), Some(0));
    }
}
