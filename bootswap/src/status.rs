//! Image upgrade status
//!
//! After a reset the engine has to decide, from durable markers alone,
//! whether a swap was under way and where its authoritative record lives.
//! Three observations answer that: the primary slot's trailer magic, the
//! scratch area's trailer magic, and the primary copy-done flag.
//!
//! The combinations and their meaning:
//!
//! | primary magic | scratch magic | primary copy-done | record lives in
//! |---------------|---------------|-------------------|----------------
//! | good          | not good      | set               | nowhere - swap finished
//! | good          | not good      | unset             | primary slot
//! | any           | good          | any               | scratch
//! | unset         | any           | unset             | primary slot
//!
//! The table is matched top to bottom and the first hit wins; the rows
//! overlap, so their order is part of the semantics.  Anything that matches
//! no row means no swap is in progress.
//!
//! Once the record is found, the progress table inside it is scanned for the
//! boundary between written and erased cells; the cell count reconstructs
//! the granule index and phase the swap had reached.

use storage::Flash;

use crate::trailer::{self, Flag, Magic, SwapState, PHASE_COUNT};
use crate::Result;

/// Where the authoritative swap record lives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusSource {
    /// No swap in progress.
    None,
    /// The primary slot's own trailer.
    Primary,
    /// The scratch trailer; the granule sharing a sector with the slot
    /// trailer was in flight.
    Scratch,
}

#[derive(Clone, Copy)]
enum MagicPat {
    Good,
    Unset,
    NotGood,
    Any,
}

impl MagicPat {
    fn matches(self, m: Magic) -> bool {
        match self {
            MagicPat::Good => m == Magic::Good,
            MagicPat::Unset => m == Magic::Unset,
            MagicPat::NotGood => m != Magic::Good,
            MagicPat::Any => true,
        }
    }
}

#[derive(Clone, Copy)]
enum FlagPat {
    Set,
    Unset,
    Any,
}

impl FlagPat {
    fn matches(self, f: Flag) -> bool {
        match self {
            FlagPat::Set => f == Flag::Set,
            FlagPat::Unset => f == Flag::Unset,
            FlagPat::Any => true,
        }
    }
}

struct StatusRule {
    primary_magic: MagicPat,
    scratch_magic: MagicPat,
    primary_copy_done: FlagPat,
    source: StatusSource,
}

/// Keep this literal and in this order; rows shadow one another.
static STATUS_RULES: [StatusRule; 4] = [
    StatusRule {
        primary_magic: MagicPat::Good,
        scratch_magic: MagicPat::NotGood,
        primary_copy_done: FlagPat::Set,
        source: StatusSource::None,
    },
    StatusRule {
        primary_magic: MagicPat::Good,
        scratch_magic: MagicPat::NotGood,
        primary_copy_done: FlagPat::Unset,
        source: StatusSource::Primary,
    },
    StatusRule {
        primary_magic: MagicPat::Any,
        scratch_magic: MagicPat::Good,
        primary_copy_done: FlagPat::Any,
        source: StatusSource::Scratch,
    },
    StatusRule {
        primary_magic: MagicPat::Unset,
        scratch_magic: MagicPat::Any,
        primary_copy_done: FlagPat::Unset,
        source: StatusSource::Primary,
    },
];

/// Classify the trailer states read from the primary slot and the scratch.
/// `image_num` is the image this boot is examining; a scratch record left by
/// a different image's swap is not ours to resume.
pub fn status_source(primary: &SwapState, scratch: &SwapState, image_num: u8) -> StatusSource {
    for rule in &STATUS_RULES {
        if rule.primary_magic.matches(primary.magic)
            && rule.scratch_magic.matches(scratch.magic)
            && rule.primary_copy_done.matches(primary.copy_done)
        {
            let mut source = rule.source;
            if source == StatusSource::Scratch && scratch.image_num != image_num {
                source = StatusSource::None;
            }
            log::debug!("swap status source: {:?}", source);
            return source;
        }
    }

    StatusSource::None
}

/// Scan a progress table for the written/erased boundary and reconstruct
/// `(granule index, phase marker)`.  `None` means no progress was recorded.
///
/// A written cell past the boundary means a status write was torn.  When the
/// primary slot gets signature-checked anyway the scan may continue, and the
/// check rejects a bad outcome; otherwise this is not survivable.
pub(crate) fn read_progress<F: Flash>(
    f: &mut F,
    status_base: usize,
    granules: usize,
    elem_sz: usize,
) -> Result<Option<(usize, u8)>> {
    let entries = granules * PHASE_COUNT;
    let mut found = false;
    let mut found_pos = None;
    let mut invalid = false;

    for pos in 0..entries {
        if trailer::read_progress_cell(f, status_base, pos, elem_sz)? {
            if !found {
                found = true;
            } else if found_pos.is_some() {
                invalid = true;
                break;
            }
        } else if found && found_pos.is_none() {
            found_pos = Some(pos);
        }
    }

    if invalid {
        log::error!("inconsistent swap progress detected");
        #[cfg(not(feature = "validate-primary"))]
        return Err(crate::Error::BadArgs);
    }

    if !found {
        return Ok(None);
    }
    let pos = found_pos.unwrap_or(entries);
    Ok(Some((pos / PHASE_COUNT + 1, (pos % PHASE_COUNT) as u8 + 1)))
}

#[cfg(test)]
mod tests {
    use simflash::SimFlash;

    use super::*;
    use crate::trailer::SwapType;

    fn state(magic: Magic, copy_done: Flag, image_num: u8) -> SwapState {
        SwapState {
            magic,
            swap_type: SwapType::Test,
            image_num,
            copy_done,
            image_ok: Flag::Unset,
        }
    }

    #[test]
    fn rule_table() {
        use Magic::*;
        use StatusSource::*;

        // (primary magic, scratch magic, primary copy-done) -> source
        let cases = [
            ((Good, Unset, Flag::Set), None),
            ((Good, Bad, Flag::Set), None),
            ((Good, Unset, Flag::Unset), Primary),
            ((Good, Good, Flag::Set), Scratch),
            ((Bad, Good, Flag::Unset), Scratch),
            ((Unset, Good, Flag::Set), Scratch),
            ((Unset, Unset, Flag::Unset), Primary),
            ((Unset, Bad, Flag::Unset), Primary),
            // Nothing matches: partially written primary magic, no scratch.
            ((Bad, Unset, Flag::Unset), None),
            // Completed swap with a half-written copy-done never happens,
            // but it must not resume either.
            ((Good, Unset, Flag::Bad), None),
        ];

        for ((pm, sm, cd), want) in cases {
            let got = status_source(&state(pm, cd, 0), &state(sm, Flag::Unset, 0), 0);
            assert_eq!(got, want, "case {:?}/{:?}/{:?}", pm, sm, cd);
        }
    }

    #[test]
    fn scratch_for_other_image_is_ignored() {
        let primary = state(Magic::Unset, Flag::Unset, 0);
        let scratch = state(Magic::Good, Flag::Unset, 1);
        assert_eq!(status_source(&primary, &scratch, 1), StatusSource::Scratch);
        assert_eq!(status_source(&primary, &scratch, 0), StatusSource::None);
    }

    #[test]
    fn progress_reconstruction() {
        let mut f = SimFlash::new(4, &[(0x1000, 4)]).unwrap();
        let base = trailer::status_off(&f, crate::MAX_SECTORS, 4);

        assert_eq!(read_progress(&mut f, base, crate::MAX_SECTORS, 4).unwrap(), None);

        let steps = [
            ((1, 1), (1, 2)),
            ((1, 2), (1, 3)),
            ((1, 3), (2, 1)),
            ((2, 1), (2, 2)),
        ];
        for ((idx, marker), want) in steps {
            trailer::write_progress_entry(&mut f, base, idx, marker, 4).unwrap();
            let got = read_progress(&mut f, base, crate::MAX_SECTORS, 4).unwrap();
            assert_eq!(got, Some(want));
        }
    }

    #[test]
    fn full_table_reads_past_the_end() {
        let mut f = SimFlash::new(4, &[(0x100, 2)]).unwrap();
        // A tiny fake table: pretend it holds two granules.
        let base = 0;
        for idx in 1..=2 {
            for marker in 1..=3 {
                trailer::write_progress_entry(&mut f, base, idx, marker, 4).unwrap();
            }
        }
        let got = read_progress(&mut f, base, 2, 4).unwrap();
        assert_eq!(got, Some((3, 1)));
    }

    #[test]
    fn torn_progress_write() {
        let mut f = SimFlash::new(4, &[(0x1000, 4)]).unwrap();
        let base = trailer::status_off(&f, crate::MAX_SECTORS, 4);
        // written, written, erased, written: the third write was lost.
        trailer::write_progress_entry(&mut f, base, 1, 1, 4).unwrap();
        trailer::write_progress_entry(&mut f, base, 1, 2, 4).unwrap();
        trailer::write_progress_entry(&mut f, base, 2, 1, 4).unwrap();

        let got = read_progress(&mut f, base, crate::MAX_SECTORS, 4);
        #[cfg(feature = "validate-primary")]
        assert_eq!(got.unwrap(), Some((1, 3)));
        #[cfg(not(feature = "validate-primary"))]
        assert_eq!(got.unwrap_err(), crate::Error::BadArgs);
    }
}
