//! Simulated flash
//!
//! The NOR-type flashes used in microcontrollers differ quite a bit in terms
//! of capabilities provided.  This simulator attempts to capture the
//! diversity of these devices: write alignments from 1 to 32 bytes, uniform
//! and mixed sector layouts, and the write-once-per-erase property that the
//! swap status protocol depends on.
//!
//! Beyond behaving like a flash part, the simulator models power loss.  Every
//! mutating step (one write call, one sector of an erase) consumes one unit
//! of an optional operation budget; once the budget runs out the device
//! returns `Error::Interrupted` and stops accepting mutations, leaving
//! whatever partial effect the interrupted operation had.  `reset_failure`
//! plays the part of the reboot.

use storage::{Error, Flash, ReadFlash};

pub mod gen;
pub mod styles;

pub type Result<T> = anyhow::Result<T>;

#[derive(Clone, Copy, Debug)]
struct Sector {
    off: usize,
    size: usize,
}

#[derive(Clone)]
pub struct SimFlash {
    align: usize,
    erased: u8,
    sectors: Vec<Sector>,
    data: Vec<u8>,
    /// One flag per write cell; set once the cell has been programmed since
    /// its last erase.
    programmed: Vec<bool>,
    ops: usize,
    fail_at: Option<usize>,
}

impl SimFlash {
    /// Build a device from `(sector_size, count)` runs, in order from the
    /// start of the area.
    pub fn new(align: usize, regions: &[(usize, usize)]) -> Result<SimFlash> {
        anyhow::ensure!(align.is_power_of_two() && align <= 32,
            "unsupported write alignment {}", align);

        let mut sectors = Vec::new();
        let mut off = 0;
        for &(size, count) in regions {
            anyhow::ensure!(size > 0 && size % align == 0,
                "sector size {:#x} not a multiple of the write alignment", size);
            for _ in 0..count {
                sectors.push(Sector { off, size });
                off += size;
            }
        }
        anyhow::ensure!(!sectors.is_empty(), "flash area has no sectors");

        Ok(SimFlash {
            align,
            erased: 0xff,
            sectors,
            data: vec![0xff; off],
            programmed: vec![false; off / align],
            ops: 0,
            fail_at: None,
        })
    }

    /// Program an image directly, bypassing the operation budget and the
    /// write-once accounting of whatever was there before.  This stands in
    /// for the factory or the downloader, not for the bootloader.
    pub fn install(&mut self, image: &[u8], offset: usize) -> Result<()> {
        anyhow::ensure!(offset % self.align == 0, "unaligned install");
        anyhow::ensure!(offset + image.len() <= self.data.len(), "image too large");

        self.data[offset..offset + image.len()].copy_from_slice(image);
        let first = offset / self.align;
        let last = (offset + image.len() + self.align - 1) / self.align;
        for cell in first..last {
            self.programmed[cell] = true;
        }
        Ok(())
    }

    /// Fail the `n`-th mutating step from now on, and every step after it.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_at = Some(self.ops + n);
    }

    /// The reboot: mutations are accepted again.
    pub fn reset_failure(&mut self) {
        self.fail_at = None;
    }

    /// Mutating steps performed so far.  Drives the power-fail sweeps.
    pub fn op_count(&self) -> usize {
        self.ops
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Account for one mutating step.
    fn tick(&mut self) -> storage::Result<()> {
        if let Some(limit) = self.fail_at {
            if self.ops >= limit {
                return Err(Error::Interrupted);
            }
        }
        self.ops += 1;
        Ok(())
    }

    fn sector_range(&self, offset: usize, length: usize) -> Vec<usize> {
        self.sectors
            .iter()
            .enumerate()
            .filter(|(_, s)| s.off >= offset && s.off + s.size <= offset + length)
            .map(|(i, _)| i)
            .collect()
    }
}

impl ReadFlash for SimFlash {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        storage::check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        Ok(())
    }
}

impl Flash for SimFlash {
    fn align(&self) -> usize {
        self.align
    }

    fn erased_val(&self) -> u8 {
        self.erased
    }

    fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    fn sector_size(&self, index: usize) -> usize {
        self.sectors[index].size
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        storage::check_write(self, offset, bytes.len())?;

        if let Err(e) = self.tick() {
            // An interrupted write lands some prefix of its cells.
            let partial = bytes.len() / self.align / 2;
            let _ = self.apply_write(offset, &bytes[..partial * self.align]);
            return Err(e);
        }

        self.apply_write(offset, bytes)
    }

    fn erase(&mut self, offset: usize, length: usize, reverse: bool) -> storage::Result<()> {
        storage::check_erase(self, offset, length)?;

        let mut range = self.sector_range(offset, length);
        if reverse {
            range.reverse();
        }
        for i in range {
            self.tick()?;
            let Sector { off, size } = self.sectors[i];
            self.data[off..off + size].fill(self.erased);
            for cell in off / self.align..(off + size) / self.align {
                self.programmed[cell] = false;
            }
        }
        Ok(())
    }
}

impl SimFlash {
    fn apply_write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        let first = offset / self.align;
        for (i, chunk) in bytes.chunks(self.align).enumerate() {
            if self.programmed[first + i] {
                return Err(Error::NotErased);
            }
            let at = offset + i * self.align;
            self.data[at..at + chunk.len()].copy_from_slice(chunk);
            self.programmed[first + i] = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SimFlash {
        SimFlash::new(4, &[(0x100, 2), (0x200, 1)]).unwrap()
    }

    #[test]
    fn fresh_is_erased() {
        let mut f = device();
        assert_eq!(f.capacity(), 0x400);
        let mut buf = [0u8; 0x400];
        f.read(0, &mut buf).unwrap();
        assert!(f.is_erased(&buf));
    }

    #[test]
    fn write_once_per_erase() {
        let mut f = device();
        f.write(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(f.write(0x10, &[1, 2, 3, 4]), Err(Error::NotErased));
        f.erase(0, 0x100, false).unwrap();
        f.write(0x10, &[5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 4];
        f.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);
    }

    #[test]
    fn erase_needs_sector_bounds() {
        let mut f = device();
        assert_eq!(f.erase(0x10, 0xf0, false), Err(Error::NotAligned));
        assert_eq!(f.erase(0x100, 0x100, false), Ok(()));
        assert_eq!(f.erase(0x200, 0x100, false), Err(Error::NotAligned));
    }

    #[test]
    fn interrupted_reverse_erase() {
        let mut f = device();
        for off in (0..0x400).step_by(4) {
            f.write(off, &[0xab; 4]).unwrap();
        }
        // Three sectors to erase, budget for one: only the highest sector
        // goes when erasing in reverse.
        f.fail_after(1);
        assert_eq!(f.erase(0, 0x400, true), Err(Error::Interrupted));
        let mut buf = [0u8; 0x400];
        f.reset_failure();
        f.read(0, &mut buf).unwrap();
        assert!(f.is_erased(&buf[0x200..]));
        assert!(buf[..0x200].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn interrupted_write_is_partial() {
        let mut f = device();
        f.fail_after(0);
        assert_eq!(f.write(0, &[0x11; 16]), Err(Error::Interrupted));
        f.reset_failure();
        let mut buf = [0u8; 16];
        f.read(0, &mut buf).unwrap();
        // Half the cells landed, the rest stayed erased.
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert!(f.is_erased(&buf[8..]));
    }
}
