//! Storage types.
//!
//! The swap engine sees flash only through the traits in this crate.  An area
//! is a window onto some physical region: reads and writes are relative to
//! the start of the area, and the area knows its own erase-sector layout,
//! which may be non-uniform (several runs of differently sized sectors within
//! one area).

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotErased,
    /// The operation was cut short, power loss or a controller abort.  The
    /// device contents past the interruption point are unspecified.
    Interrupted,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read only interface into flash.
pub trait ReadFlash {
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;
}

/// Flash that can be written and erased.
///
/// Implementations must not buffer a write or erase past a subsequent read
/// of the same bytes: once a call returns, reads observe its effect.  The
/// swap protocol's durability hangs on that.
pub trait Flash: ReadFlash {
    /// Write granularity: alignment and size multiple of every write.
    /// Writes of exactly this size are atomic.
    fn align(&self) -> usize;

    /// The value every byte holds after an erase.
    fn erased_val(&self) -> u8;

    /// Whether a buffer read back from this device is in the erased state.
    fn is_erased(&self, bytes: &[u8]) -> bool {
        let v = self.erased_val();
        bytes.iter().all(|b| *b == v)
    }

    /// Number of erase sectors in this area.
    fn sector_count(&self) -> usize;

    /// Size in bytes of the given erase sector, indexed from the start of
    /// the area.
    fn sector_size(&self, index: usize) -> usize;

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Erase the whole sectors covering `offset..offset + length`.  Both ends
    /// must fall on sector boundaries.  With `reverse` set the sectors are
    /// erased from the highest offset downward.
    fn erase(&mut self, offset: usize, length: usize, reverse: bool) -> Result<()>;
}

// Utilities for validating arguments, in the style of embedded-storage.

pub fn check_read<T: ReadFlash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_bounds(flash.capacity(), offset, length)
}

pub fn check_write<T: Flash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_bounds(flash.capacity(), offset, length)?;
    let align = flash.align();
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_erase<T: Flash>(
    flash: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length == 0 {
        return Ok(());
    }
    check_bounds(flash.capacity(), offset, length)?;

    // Both ends have to land on sector boundaries.
    let mut pos = 0;
    let mut start_seen = offset == 0;
    for i in 0..flash.sector_count() {
        pos += flash.sector_size(i);
        if pos == offset {
            start_seen = true;
        }
        if pos == offset + length {
            return if start_seen { Ok(()) } else { Err(Error::NotAligned) };
        }
        if pos > offset + length {
            break;
        }
    }
    Err(Error::NotAligned)
}

fn check_bounds(capacity: usize, offset: usize, length: usize) -> Result<()> {
    if length > capacity || offset > capacity - length {
        return Err(Error::OutOfBounds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake;

    impl ReadFlash for Fake {
        fn read(&mut self, _offset: usize, _bytes: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn capacity(&self) -> usize {
            0x3000
        }
    }

    impl Flash for Fake {
        fn align(&self) -> usize {
            8
        }
        fn erased_val(&self) -> u8 {
            0xff
        }
        fn sector_count(&self) -> usize {
            3
        }
        fn sector_size(&self, index: usize) -> usize {
            // One larger sector at the end.
            [0x800, 0x800, 0x2000][index]
        }
        fn write(&mut self, _offset: usize, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        fn erase(&mut self, _offset: usize, _length: usize, _reverse: bool) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_checks() {
        let f = Fake;
        assert_eq!(check_write(&f, 0, 16), Ok(()));
        assert_eq!(check_write(&f, 4, 16), Err(Error::NotAligned));
        assert_eq!(check_write(&f, 0, 12), Err(Error::NotAligned));
        assert_eq!(check_write(&f, 0x3000, 8), Err(Error::OutOfBounds));
    }

    #[test]
    fn erase_checks() {
        let f = Fake;
        assert_eq!(check_erase(&f, 0, 0x800), Ok(()));
        assert_eq!(check_erase(&f, 0x800, 0x800), Ok(()));
        assert_eq!(check_erase(&f, 0x1000, 0x2000), Ok(()));
        assert_eq!(check_erase(&f, 0, 0x3000), Ok(()));
        // Zero length erases are a no-op.
        assert_eq!(check_erase(&f, 0x123, 0), Ok(()));
        // Interior of the large sector.
        assert_eq!(check_erase(&f, 0x1000, 0x800), Err(Error::NotAligned));
        assert_eq!(check_erase(&f, 0x400, 0x400), Err(Error::NotAligned));
        assert_eq!(check_erase(&f, 0x1000, 0x4000), Err(Error::OutOfBounds));
    }

    #[test]
    fn erased_predicate() {
        let f = Fake;
        assert!(f.is_erased(&[0xff; 8]));
        assert!(!f.is_erased(&[0xff, 0xff, 0x00, 0xff]));
        assert!(f.is_erased(&[]));
    }
}
