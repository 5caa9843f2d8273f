//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to
//! them.  Each style here describes the three areas a swap needs: the primary
//! slot, the secondary slot, and the scratch area.

use crate::Result;
use crate::SimFlash;

/// The configuration of a single flash area.  Regions are `(sector_size,
/// count)` runs from the start of the area.
pub struct AreaLayout {
    pub align: usize,
    pub regions: &'static [(usize, usize)],
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(self.align, self.regions)
    }
}

/// Uniform small sectors, K64-style.  Both slots look the same and the
/// scratch holds exactly one sector.
pub static UNIFORM_MAIN: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x1000, 4)],
};
pub static UNIFORM_UPGRADE: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x1000, 4)],
};
pub static UNIFORM_SCRATCH: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x1000, 1)],
};

/// Mixed sector sizes, STM32F-style.  The slots agree on total size but
/// tile it differently, so copies have to respect common boundaries, and
/// the scratch must hold the largest span.
pub static MIXED_MAIN: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x1000, 2), (0x2000, 1)],
};
pub static MIXED_UPGRADE: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x2000, 1), (0x1000, 2)],
};
pub static MIXED_SCRATCH: AreaLayout = AreaLayout {
    align: 4,
    regions: &[(0x2000, 1)],
};

/// Wide-write parts, STM32H-style alignment.  Status cells are 32 bytes.
pub static WIDE_MAIN: AreaLayout = AreaLayout {
    align: 32,
    regions: &[(0x1000, 4)],
};
pub static WIDE_UPGRADE: AreaLayout = AreaLayout {
    align: 32,
    regions: &[(0x1000, 4)],
};
pub static WIDE_SCRATCH: AreaLayout = AreaLayout {
    align: 32,
    regions: &[(0x1000, 1)],
};

/// All of the device styles, as (primary, secondary, scratch) triples.
pub static ALL_FLASHES: [(&'static AreaLayout, &'static AreaLayout, &'static AreaLayout); 3] = [
    (&UNIFORM_MAIN, &UNIFORM_UPGRADE, &UNIFORM_SCRATCH),
    (&MIXED_MAIN, &MIXED_UPGRADE, &MIXED_SCRATCH),
    (&WIDE_MAIN, &WIDE_UPGRADE, &WIDE_SCRATCH),
];

/// An iterator that returns each of the device triples on each iteration.
pub fn all_flashes() -> impl Iterator<Item = Result<(SimFlash, SimFlash, SimFlash)>> {
    ALL_FLASHES.iter().map(|(p, s, sc)| {
        Ok((p.build()?, s.build()?, sc.build()?))
    })
}
