//! The swap engine.
//!
//! A swap exchanges the images in the primary and secondary slots through
//! the scratch area, one granule at a time, walking from the highest sectors
//! down.  Each granule goes through three durable phases:
//!
//! - *stage*: the granule's secondary-slot bytes are copied into scratch;
//! - *move*: the secondary span is erased and refilled from the primary;
//! - *publish*: the primary span is erased and refilled from scratch.
//!
//! A progress cell is written after each phase.  Every phase starts by
//! erasing everything it is about to write, so repeating a phase after a
//! reset produces byte-identical results; the progress cell is what makes a
//! phase "have happened".
//!
//! The granule whose sectors also carry the slot trailer needs care: while
//! it is in flight the primary trailer does not exist, so the status record
//! lives in a small trailer at the top of the scratch area, and the publish
//! phase rebuilds the primary trailer from it, magic last.  That granule is
//! always the first one, because the walk starts at the top of the slot.

use storage::Flash;

use crate::geometry::{self, Geometry, MAX_SECTORS};
use crate::image::{self, HeaderLocation, ImageHeader, Slot};
use crate::status::{self, StatusSource};
use crate::trailer::{self, Flag, Magic, SwapType, PHASE_COUNT};
use crate::{Error, Result};

/// Copy chunk size.  Multiple of every supported write alignment.
const COPY_BUF: usize = 1024;

/// The three durable phases of a granule, in execution order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Phase {
    Stage = 1,
    Move = 2,
    Publish = 3,
}

impl Phase {
    fn from_marker(marker: u8) -> Result<Phase> {
        match marker {
            1 => Ok(Phase::Stage),
            2 => Ok(Phase::Move),
            3 => Ok(Phase::Publish),
            _ => Err(Error::BadArgs),
        }
    }
}

/// In-RAM swap progress.  Reconstructed from the progress table on resume.
#[derive(Debug, Clone)]
pub struct BootStatus {
    /// Granule ordinal, starting at 1.  Past the granule count means the
    /// swap is complete.
    pub idx: usize,
    pub state: Phase,
    /// The granule in flight shares a sector with the slot trailer, and the
    /// status record lives in scratch.
    pub use_scratch: bool,
    /// Bytes being exchanged, as recorded in the trailer.
    pub swap_size: usize,
    #[cfg(feature = "encrypt")]
    pub enc_keys: [[u8; trailer::KEY_SZ]; 2],
}

impl BootStatus {
    pub fn reset(swap_size: usize) -> BootStatus {
        BootStatus {
            idx: 1,
            state: Phase::Stage,
            use_scratch: false,
            swap_size,
            #[cfg(feature = "encrypt")]
            enc_keys: [[0; trailer::KEY_SZ]; 2],
        }
    }
}

/// The engine: three flash areas plus their analyzed geometry.
pub struct Swap<'a, F: Flash> {
    primary: &'a mut F,
    secondary: &'a mut F,
    scratch: &'a mut F,
    geom: Geometry,
    image_num: u8,
}

impl<'a, F: Flash> Swap<'a, F> {
    /// Analyze the areas and refuse geometries the protocol cannot handle.
    pub fn new(
        primary: &'a mut F,
        secondary: &'a mut F,
        scratch: &'a mut F,
        image_num: u8,
    ) -> Result<Swap<'a, F>> {
        let geom = Geometry::new(&*primary, &*secondary, &*scratch)?;
        if geom.elem_sz > trailer::MAX_ALIGN {
            log::warn!("write alignment {} too large for the status protocol", geom.elem_sz);
            return Err(Error::BadArgs);
        }
        if !geom.compatible() {
            return Err(Error::BadArgs);
        }
        if trailer::size(geom.elem_sz) >= primary.capacity()
            || trailer::scratch_size(geom.elem_sz) >= scratch.capacity()
        {
            log::warn!("trailer does not fit the configured areas");
            return Err(Error::BadArgs);
        }
        Ok(Swap { primary, secondary, scratch, geom, image_num })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }

    /// Classify where the authoritative swap record lives, if anywhere.
    pub fn status_source(&mut self) -> Result<StatusSource> {
        let elem = self.geom.elem_sz;
        let primary = trailer::read_swap_state(self.primary, elem)?;
        let scratch = trailer::read_swap_state(self.scratch, elem)?;
        Ok(status::status_source(&primary, &scratch, self.image_num))
    }

    /// Reconstruct the boot status of an interrupted swap.  `None` when no
    /// durable progress exists, whether or not a swap was requested.
    pub fn resume_status(&mut self) -> Result<Option<BootStatus>> {
        let elem = self.geom.elem_sz;
        let source = self.status_source()?;

        let progress = match source {
            StatusSource::None => return Ok(None),
            StatusSource::Primary => {
                let base = trailer::status_off(&*self.primary, MAX_SECTORS, elem);
                status::read_progress(self.primary, base, MAX_SECTORS, elem)?
            }
            StatusSource::Scratch => {
                let base = trailer::status_off(&*self.scratch, 1, elem);
                status::read_progress(self.scratch, base, 1, elem)?
            }
        };

        let (idx, marker) = match progress {
            Some(p) => p,
            None => return Ok(None),
        };

        let record: &mut F = match source {
            StatusSource::Scratch => &mut *self.scratch,
            _ => &mut *self.primary,
        };
        let swap_size = trailer::read_swap_size(record, elem)?;

        let mut bs = BootStatus::reset(swap_size);
        bs.idx = idx;
        bs.state = Phase::from_marker(marker)?;
        #[cfg(feature = "encrypt")]
        for slot in 0..2 {
            bs.enc_keys[slot] = trailer::read_enc_key(record, slot, elem)?;
        }

        log::debug!("resuming swap at granule {} phase {:?}", bs.idx, bs.state);
        Ok(Some(bs))
    }

    /// Resume an interrupted swap, or start the one staged in the secondary
    /// slot.  Returns whether a swap ran.  `fresh_swap_size` is the byte
    /// count to exchange when starting fresh; a resumed swap uses the size
    /// recorded in the trailer.
    pub fn run(&mut self, fresh_swap_size: usize) -> Result<bool> {
        let elem = self.geom.elem_sz;

        let mut bs = match self.resume_status()? {
            Some(bs) => bs,
            None => {
                let request = trailer::read_swap_state(self.secondary, elem)?;
                if request.magic != Magic::Good {
                    log::debug!("no swap in progress or requested");
                    return Ok(false);
                }
                BootStatus::reset(fresh_swap_size)
            }
        };

        self.swap_image(&mut bs)?;
        self.finalize()?;
        Ok(true)
    }

    /// The outer loop: granules from the top of the slot downward, skipping
    /// the ones the status says are finished.
    fn swap_image(&mut self, bs: &mut BootStatus) -> Result<()> {
        let mut last = self.geom.last_sector_idx(bs.swap_size)?;
        let mut ordinal = 1;
        loop {
            let (first, sz) = self.geom.copy_granule(last);
            if sz == 0 {
                return Err(Error::BadArgs);
            }
            if ordinal >= bs.idx {
                self.swap_sectors(first, sz, bs)?;
            }
            if first == 0 {
                break;
            }
            last = first - 1;
            ordinal += 1;
        }
        Ok(())
    }

    /// Exchange one granule: sectors `first_idx..` covering `sz` bytes.
    fn swap_sectors(&mut self, first_idx: usize, sz: usize, bs: &mut BootStatus) -> Result<()> {
        let elem = self.geom.elem_sz;
        let img_off = self.geom.primary[first_idx].off;
        let trailer_sz = trailer::size(elem);

        let first_trailer_primary = self.geom.first_trailer_sector_primary(trailer_sz)?;
        let trailer_boundary = self.geom.primary[first_trailer_primary].off;

        let mut copy_sz = sz;
        if img_off + sz > trailer_boundary {
            // This granule's sectors also hold the trailer: payload copies
            // stop where the trailer begins.
            copy_sz = (self.primary.capacity() - img_off).saturating_sub(trailer_sz);

            // Nor may the staged copy run into the scratch's own trailer.
            let scratch_trailer_off = trailer::status_off(&*self.scratch, 1, elem);
            if copy_sz > scratch_trailer_off {
                copy_sz = scratch_trailer_off;
            }
        }

        bs.use_scratch = bs.idx == 1 && copy_sz != sz;

        log::debug!(
            "granule {}: sectors {}.. img_off {:#x} sz {:#x} copy {:#x} scratch {}",
            bs.idx, first_idx, img_off, sz, copy_sz, bs.use_scratch,
        );

        if bs.state == Phase::Stage {
            self.scratch.erase(0, self.scratch.capacity(), false)?;

            if bs.idx == 1 {
                // Some durable place must hold the swap request while the
                // slot trailers are scrambled; scratch plays that part even
                // when this granule does not otherwise need it.
                self.init_status(false, bs)?;

                if !bs.use_scratch {
                    trailer::scramble_trailer_sectors(self.primary, &self.geom.primary, elem)?;
                    self.init_status(true, bs)?;
                    self.scratch.erase(0, self.scratch.capacity(), false)?;
                }
            }

            copy_region(self.secondary, self.scratch, img_off, 0, copy_sz)?;

            self.write_status(bs)?;
            bs.state = Phase::Move;
        }

        if bs.state == Phase::Move {
            let mut erase_sz = sz;

            if bs.idx == 1 {
                trailer::scramble_trailer_sectors(self.secondary, &self.geom.secondary, elem)?;

                if bs.use_scratch {
                    // The scramble already erased the trailer sectors; stop
                    // the span erase at their boundary.
                    let first_trailer =
                        geometry::first_trailer_sector(&self.geom.secondary, trailer_sz)?;
                    let boundary = self.geom.secondary[first_trailer].off;
                    erase_sz = boundary.saturating_sub(img_off);
                }
            }

            self.secondary.erase(img_off, erase_sz, false)?;
            copy_region(self.primary, self.secondary, img_off, img_off, copy_sz)?;

            self.write_status(bs)?;
            bs.state = Phase::Publish;
        }

        if bs.state == Phase::Publish {
            let mut erase_sz = sz;

            if bs.use_scratch {
                // The entire trailer goes, not just the span this granule
                // overlaps; it is rebuilt from scratch below.
                trailer::scramble_trailer_sectors(self.primary, &self.geom.primary, elem)?;
                erase_sz = trailer_boundary.saturating_sub(img_off);
            }

            self.primary.erase(img_off, erase_sz, false)?;
            copy_region(self.scratch, self.primary, 0, img_off, copy_sz)?;

            if bs.use_scratch {
                // Progress recorded in scratch this granule moves into the
                // slot's own table, then the tail fields are rebuilt.  Magic
                // goes last: until it lands the primary trailer stays
                // uncommitted and scratch remains authoritative.
                let scratch_status = trailer::status_off(&*self.scratch, 1, elem);
                copy_region(
                    self.scratch,
                    self.primary,
                    scratch_status,
                    img_off + copy_sz,
                    (PHASE_COUNT - 1) * elem,
                )?;

                let staged = trailer::read_swap_state(self.scratch, elem)?;
                if staged.image_ok == Flag::Set {
                    trailer::write_image_ok(self.primary, elem)?;
                }
                if staged.swap_type != SwapType::None {
                    trailer::write_swap_info(self.primary, staged.swap_type, self.image_num, elem)?;
                }
                trailer::write_swap_size(self.primary, bs.swap_size, elem)?;
                #[cfg(feature = "encrypt")]
                for slot in 0..2 {
                    trailer::write_enc_key(self.primary, slot, &bs.enc_keys[slot], elem)?;
                }
                trailer::write_magic(self.primary, elem)?;
            }

            let erase_scratch = bs.use_scratch;
            bs.use_scratch = false;

            self.write_status(bs)?;
            bs.idx += 1;
            bs.state = Phase::Stage;

            if erase_scratch {
                // Highest sector first, so the scratch magic dies before the
                // progress cells: a reset mid-erase can never leave a
                // partially-valid scratch trailer to be trusted on the next
                // boot.
                self.scratch.erase(0, self.scratch.capacity(), true)?;
            }
        }

        Ok(())
    }

    /// Write the initial trailer for this swap, into the scratch area or the
    /// primary slot.  The request being honored still sits in the secondary
    /// trailer at this point; carry its type and confirm flag over.
    fn init_status(&mut self, to_primary: bool, bs: &BootStatus) -> Result<()> {
        let elem = self.geom.elem_sz;
        let request = trailer::read_swap_state(self.secondary, elem)?;

        let dst: &mut F = if to_primary { &mut *self.primary } else { &mut *self.scratch };

        if request.image_ok == Flag::Set {
            trailer::write_image_ok(dst, elem)?;
        }
        if request.swap_type != SwapType::None {
            trailer::write_swap_info(dst, request.swap_type, self.image_num, elem)?;
        }
        trailer::write_swap_size(dst, bs.swap_size, elem)?;
        #[cfg(feature = "encrypt")]
        for slot in 0..2 {
            trailer::write_enc_key(dst, slot, &bs.enc_keys[slot], elem)?;
        }
        trailer::write_magic(dst, elem)?;
        Ok(())
    }

    /// One durable progress cell, into scratch while the trailer-bearing
    /// granule is in flight, into the primary trailer otherwise.
    fn write_status(&mut self, bs: &BootStatus) -> Result<()> {
        let elem = self.geom.elem_sz;
        let (f, granules): (&mut F, usize) = if bs.use_scratch {
            (&mut *self.scratch, 1)
        } else {
            (&mut *self.primary, MAX_SECTORS)
        };
        let base = trailer::status_off(&*f, granules, elem);
        trailer::write_progress_entry(f, base, bs.idx, bs.state as u8, elem)
    }

    /// Publish completion and retire the scratch record.
    fn finalize(&mut self) -> Result<()> {
        let elem = self.geom.elem_sz;

        let state = trailer::read_swap_state(self.primary, elem)?;
        if state.copy_done != Flag::Set {
            trailer::write_copy_done(self.primary, elem)?;
        }

        // A reset between the last progress write and here can leave the
        // scratch trailer live; without this it would stay authoritative
        // forever.
        if trailer::read_magic(self.scratch, elem)? == Magic::Good {
            self.scratch.erase(0, self.scratch.capacity(), true)?;
        }
        Ok(())
    }

    /// Read `slot`'s image header from wherever it currently is.  Pass the
    /// boot status while a swap is in flight; `None` reads the slot in
    /// place.
    pub fn image_header(&mut self, slot: Slot, bs: Option<&BootStatus>) -> Result<ImageHeader> {
        let location = match bs {
            Some(bs) => image::header_location(slot, bs, self.geom.swap_count(bs.swap_size)?),
            None => match slot {
                Slot::Primary => HeaderLocation::Primary,
                Slot::Secondary => HeaderLocation::Secondary,
            },
        };
        match location {
            HeaderLocation::Primary => image::read_header(self.primary),
            HeaderLocation::Secondary => image::read_header(self.secondary),
            HeaderLocation::Scratch => image::read_header(self.scratch),
        }
    }
}

/// Copy bytes between two areas through a bounce buffer.
fn copy_region<F: Flash>(
    src: &mut F,
    dst: &mut F,
    src_off: usize,
    dst_off: usize,
    len: usize,
) -> Result<()> {
    let mut buf = [0u8; COPY_BUF];
    let mut pos = 0;
    while pos < len {
        let chunk = (len - pos).min(COPY_BUF);
        src.read(src_off + pos, &mut buf[..chunk])?;
        dst.write(dst_off + pos, &buf[..chunk])?;
        pos += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_markers() {
        for phase in [Phase::Stage, Phase::Move, Phase::Publish] {
            assert_eq!(Phase::from_marker(phase as u8).unwrap(), phase);
        }
        assert_eq!(Phase::from_marker(0), Err(Error::BadArgs));
        assert_eq!(Phase::from_marker(4), Err(Error::BadArgs));
        assert!(Phase::Stage < Phase::Move && Phase::Move < Phase::Publish);
    }

    #[test]
    fn reset_status() {
        let bs = BootStatus::reset(0x3000);
        assert_eq!(bs.idx, 1);
        assert_eq!(bs.state, Phase::Stage);
        assert!(!bs.use_scratch);
        assert_eq!(bs.swap_size, 0x3000);
    }
}
