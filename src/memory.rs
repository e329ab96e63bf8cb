//! Physical memory shared by the CPU and device threads.
//!
//! Memory is a single contiguous byte buffer addressed by 32-bit physical
//! addresses. There is no translation, no caching, and no alignment
//! requirement: an access of width `w` at address `a` is valid iff
//! `a + w <= len`, and every multi-byte access is little-endian.
//!
//! The buffer sits behind one coarse lock so that the CPU thread and the
//! device threads can share a single `Arc<Memory>` and take `&self`
//! accessors. The lock makes each individual 8/16/32-bit access atomic
//! with respect to itself (no torn values); ordering between independent
//! addresses is left to device protocol conventions (poll-then-read,
//! ack-after-consume).

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::boot::layout;

/// A memory access fell outside the physical address space.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out-of-bounds {width}-byte access at {addr:#010x}")]
pub struct OutOfBounds {
    /// First byte of the failed access.
    pub addr: u32,
    /// Width of the access in bytes.
    pub width: u32,
}

/// Flat physical RAM.
pub struct Memory {
    /// Size of the address space in bytes.
    len: usize,
    /// Backing store. Devices and the CPU share this through `Arc<Memory>`.
    data: Mutex<Box<[u8]>>,
}

impl Memory {
    /// Allocate a zeroed physical address space of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Size of the address space in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Lock the backing store. A poisoned lock is treated as released:
    /// a device thread that panicked mid-write leaves whatever bytes it
    /// reached, and the machine keeps running.
    fn buf(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bounds-check an access and return its starting offset.
    ///
    /// The sum is computed in 64 bits so `addr + width` cannot wrap.
    fn check(&self, addr: u32, width: u32) -> Result<usize, OutOfBounds> {
        if u64::from(addr) + u64::from(width) <= self.len as u64 {
            Ok(addr as usize)
        } else {
            Err(OutOfBounds { addr, width })
        }
    }

    /// Read a byte.
    pub fn read_u8(&self, addr: u32) -> Result<u8, OutOfBounds> {
        let at = self.check(addr, 1)?;
        Ok(self.buf()[at])
    }

    /// Read a 16-bit little-endian halfword.
    pub fn read_u16(&self, addr: u32) -> Result<u16, OutOfBounds> {
        let at = self.check(addr, 2)?;
        let buf = self.buf();
        Ok(u16::from_le_bytes([buf[at], buf[at + 1]]))
    }

    /// Read a 32-bit little-endian word.
    pub fn read_u32(&self, addr: u32) -> Result<u32, OutOfBounds> {
        let at = self.check(addr, 4)?;
        let buf = self.buf();
        Ok(u32::from_le_bytes([
            buf[at],
            buf[at + 1],
            buf[at + 2],
            buf[at + 3],
        ]))
    }

    /// Write a byte.
    pub fn write_u8(&self, addr: u32, value: u8) -> Result<(), OutOfBounds> {
        let at = self.check(addr, 1)?;
        self.buf()[at] = value;
        Ok(())
    }

    /// Write a 16-bit little-endian halfword.
    pub fn write_u16(&self, addr: u32, value: u16) -> Result<(), OutOfBounds> {
        let at = self.check(addr, 2)?;
        self.buf()[at..at + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a 32-bit little-endian word.
    pub fn write_u32(&self, addr: u32, value: u32) -> Result<(), OutOfBounds> {
        let at = self.check(addr, 4)?;
        self.buf()[at..at + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a span of memory into `out`.
    ///
    /// The whole range is bounds-checked before any byte is copied, so a
    /// failed read leaves `out` untouched.
    pub fn read_into(&self, addr: u32, out: &mut [u8]) -> Result<(), OutOfBounds> {
        let at = self.check(addr, out.len() as u32)?;
        out.copy_from_slice(&self.buf()[at..at + out.len()]);
        Ok(())
    }

    /// Write a span of bytes into memory.
    ///
    /// The whole range is bounds-checked before any byte lands, so a
    /// failed write changes nothing.
    pub fn write_from(&self, addr: u32, bytes: &[u8]) -> Result<(), OutOfBounds> {
        let at = self.check(addr, bytes.len() as u32)?;
        self.buf()[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy a boot image into memory at the boot base address.
    pub fn load_boot(&self, image: &[u8]) -> Result<(), OutOfBounds> {
        self.write_from(layout::BOOT_BASE, image)
    }
}
