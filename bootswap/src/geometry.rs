//! Slot geometry.
//!
//! The two slots taking part in a swap may tile the same number of bytes
//! with differently sized erase sectors.  Everything the engine does is
//! phrased in terms of *common boundaries*: offsets where the running sector
//! sums of both slots coincide.  A span between two successive common
//! boundaries is the unit that must fit in the scratch area, because it is
//! the smallest range that can be erased independently on both sides.

use heapless::Vec;
use storage::Flash;

use crate::trailer;
use crate::{Error, Result};

/// Largest sector count supported per slot.  Going past this is a
/// compatibility failure, and it also sizes the progress table in the
/// trailer.
pub const MAX_SECTORS: usize = 128;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Sector {
    /// Byte offset within the slot.
    pub off: usize,
    pub size: usize,
}

pub type SectorTable = Vec<Sector, MAX_SECTORS>;

/// Materialize an area's sector list with running offsets.
pub fn sector_table<F: Flash>(flash: &F) -> Result<SectorTable> {
    let mut table = SectorTable::new();
    let mut off = 0;
    for i in 0..flash.sector_count() {
        let size = flash.sector_size(i);
        if size == 0 {
            return Err(Error::BadArgs);
        }
        table.push(Sector { off, size }).map_err(|_| Error::BadArgs)?;
        off += size;
    }
    if table.is_empty() || off != flash.capacity() {
        return Err(Error::BadArgs);
    }
    Ok(table)
}

/// Walking from the last sector toward the first, the lowest-index sector
/// that still holds trailer bytes.
pub(crate) fn first_trailer_sector(table: &SectorTable, trailer_sz: usize) -> Result<usize> {
    let mut idx = table.len() - 1;
    let mut covered = table[idx].size;
    while covered < trailer_sz {
        if idx == 0 {
            return Err(Error::BadArgs);
        }
        idx -= 1;
        covered += table[idx].size;
    }
    Ok(idx)
}

/// End offset (offset plus size) of the first trailer-bearing sector.
pub(crate) fn trailer_sector_end_off(table: &SectorTable, trailer_sz: usize) -> Result<usize> {
    let s = table[first_trailer_sector(table, trailer_sz)?];
    Ok(s.off + s.size)
}

/// Sector geometry of the three areas taking part in a swap.
pub struct Geometry {
    pub(crate) primary: SectorTable,
    pub(crate) secondary: SectorTable,
    pub(crate) scratch_size: usize,
    /// Status element size: the largest write alignment among the areas a
    /// status entry may be written to.
    pub(crate) elem_sz: usize,
}

impl Geometry {
    pub fn new<F: Flash>(primary: &F, secondary: &F, scratch: &F) -> Result<Geometry> {
        let elem_sz = primary.align().max(scratch.align());
        Ok(Geometry {
            primary: sector_table(primary)?,
            secondary: sector_table(secondary)?,
            scratch_size: scratch.capacity(),
            elem_sz,
        })
    }

    fn slot_size(&self) -> usize {
        let last = self.primary[self.primary.len() - 1];
        last.off + last.size
    }

    /// Whether the two slots can be swapped through the scratch area.
    ///
    /// The slots are walked in lock step.  Between two successive common
    /// boundaries only one side may contribute more than one sector, and the
    /// span between the boundaries must fit in the scratch area.
    pub fn compatible(&self) -> bool {
        let p = &self.primary;
        let s = &self.secondary;

        #[cfg(not(feature = "decompress"))]
        {
            let total_p: usize = p.iter().map(|s| s.size).sum();
            let total_s: usize = s.iter().map(|s| s.size).sum();
            if total_p != total_s {
                log::warn!("cannot upgrade: slot sizes differ ({:#x} vs {:#x})",
                    total_p, total_s);
                return false;
            }
        }

        let (mut i, mut j) = (0, 0);
        let (mut sz_p, mut sz_s) = (0usize, 0usize);
        // Which side has been running smaller sectors since the last common
        // boundary: 0 = neither, 1 = primary, 2 = secondary.
        let mut smaller = 0u8;

        while i < p.len() || j < s.len() {
            if sz_p == sz_s {
                if i >= p.len() || j >= s.len() {
                    log::warn!("cannot upgrade: sector walk ran off one slot");
                    return false;
                }
                sz_p += p[i].size;
                sz_s += s[j].size;
                i += 1;
                j += 1;
            } else if sz_p < sz_s {
                if i >= p.len() || smaller == 2 {
                    log::warn!("cannot upgrade: slots have non-compatible sectors");
                    return false;
                }
                sz_p += p[i].size;
                i += 1;
                smaller = 1;
            } else {
                if j >= s.len() || smaller == 1 {
                    log::warn!("cannot upgrade: slots have non-compatible sectors");
                    return false;
                }
                sz_s += s[j].size;
                j += 1;
                smaller = 2;
            }

            if sz_p == sz_s {
                // Common boundary.  The span on either side has to fit the
                // scratch in one piece.
                if sz_p > self.scratch_size {
                    log::warn!("cannot upgrade: span of {:#x} does not fit scratch", sz_p);
                    return false;
                }
                smaller = 0;
                sz_p = 0;
                sz_s = 0;
            }
        }

        sz_p == sz_s
    }

    /// Starting from `last_sector_idx` and walking backward, the largest run
    /// of primary sectors that still fits the scratch area.  Returns the
    /// first (lowest) sector index of the run and its byte count.
    pub(crate) fn copy_granule(&self, last_sector_idx: usize) -> (usize, usize) {
        let mut sz = 0;
        let mut first = last_sector_idx + 1;
        for i in (0..=last_sector_idx).rev() {
            let grown = sz + self.primary[i].size;
            if grown > self.scratch_size {
                break;
            }
            sz = grown;
            first = i;
        }
        (first, sz)
    }

    /// The last primary sector that participates in swapping `copy_size`
    /// bytes.  Both slots' cumulative sizes are advanced until they cover
    /// `copy_size` and agree, which lands on a common boundary.
    pub(crate) fn last_sector_idx(&self, copy_size: usize) -> Result<usize> {
        if copy_size == 0 {
            return Err(Error::BadArgs);
        }
        let (mut i, mut j) = (0, 0);
        let (mut sz_p, mut sz_s) = (0usize, 0usize);
        loop {
            if sz_p < copy_size || sz_p < sz_s {
                if i >= self.primary.len() {
                    return Err(Error::BadArgs);
                }
                sz_p += self.primary[i].size;
                i += 1;
            }
            if sz_s < copy_size || sz_s < sz_p {
                if j >= self.secondary.len() {
                    return Err(Error::BadArgs);
                }
                sz_s += self.secondary[j].size;
                j += 1;
            }
            if sz_p >= copy_size && sz_s >= copy_size && sz_p == sz_s {
                break;
            }
        }
        Ok(i - 1)
    }

    /// How many granules a swap of `copy_size` bytes takes.
    pub fn swap_count(&self, copy_size: usize) -> Result<usize> {
        let mut last = self.last_sector_idx(copy_size)?;
        let mut count = 0;
        loop {
            let (first, sz) = self.copy_granule(last);
            if sz == 0 {
                // A single sector exceeds the scratch; compatibility should
                // have rejected this geometry.
                return Err(Error::BadArgs);
            }
            count += 1;
            if first == 0 {
                break;
            }
            last = first - 1;
        }
        Ok(count)
    }

    pub(crate) fn first_trailer_sector_primary(&self, trailer_sz: usize) -> Result<usize> {
        first_trailer_sector(&self.primary, trailer_sz)
    }

    /// Largest application image that fits a slot, accounting for the
    /// trailer and for scratch-trailer padding.
    ///
    /// When the sector sharing the trailer start is small, the scratch's own
    /// trailer can be larger than the slice of trailer inside that sector;
    /// the payload then has to back off by the difference, or its tail could
    /// not be staged next to the scratch trailer.
    pub fn app_max_size(&self) -> usize {
        if !self.compatible() {
            return 0;
        }

        let trailer_sz = trailer::size(self.elem_sz);
        let slot_size = self.slot_size();
        if trailer_sz >= slot_size {
            log::warn!("cannot upgrade: trailer does not fit the slot");
            return 0;
        }
        let slot_trailer_off = slot_size - trailer_sz;

        let end_p = match trailer_sector_end_off(&self.primary, trailer_sz) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let end_s = match trailer_sector_end_off(&self.secondary, trailer_sz) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let trailer_sector_end = end_p.max(end_s);

        let trailer_sz_in_first_sector = trailer_sector_end - slot_trailer_off;
        let scratch_trailer_sz = trailer::scratch_size(self.elem_sz);
        let padding = scratch_trailer_sz.saturating_sub(trailer_sz_in_first_sector);

        slot_trailer_off - padding
    }
}
