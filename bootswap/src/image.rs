//! Boot image support
//!
//! Each slot begins with an image header followed by the payload and a TLV
//! block.  The engine only needs enough of this to identify an image and
//! measure its footprint; interpreting the TLV contents (hashes, signatures)
//! belongs to the verification side.
//!
//! While a swap is in flight the bytes a caller thinks of as "the primary
//! image's header" may physically sit in the other slot or in the scratch
//! area; [`header_location`] answers where, given the recorded progress.

use core::mem::size_of;

use asraw::{AsMutRaw, AsRaw};
use storage::ReadFlash;

use crate::swap::{BootStatus, Phase};
use crate::{Error, Result};

/// The image header contains the following magic value, indicating the
/// interpretation of the rest of the image header.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;

/// A slot taking part in the swap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Slot {
    Primary,
    Secondary,
}

/// Where header bytes physically live at some instant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HeaderLocation {
    Primary,
    Secondary,
    Scratch,
}

/// The image begins with the following header, interpreted as a C struct.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ImageHeader {
    /// Magic number, indicates this particular header.
    pub magic: u32,
    /// The address to load this image, only used when not executing in
    /// place.
    pub load_addr: u32,
    /// The size of the header; padding up to this offset precedes the
    /// payload, which usually carries alignment requirements of its own.
    pub hdr_size: u16,
    /// The size of the protected TLV block, zero if absent.
    pub protected_tlv_size: u16,
    /// The size of the payload, not counting the header.
    pub img_size: u32,
    /// Flags for this image, largely unused.
    pub flags: u32,
    /// Version of this particular image.
    pub version: ImageVersion,
    pad1: u32,
}

impl AsRaw for ImageHeader {}
unsafe impl AsMutRaw for ImageHeader {}

/// A pseudo-semantic version, used for upgrade eligibility between images.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

/// The TLV block starts with this header.
#[derive(Debug, Default)]
#[repr(C)]
struct TlvInfo {
    magic: u16,
    /// Length of the block, including this header.
    len: u16,
}

impl AsRaw for TlvInfo {}
unsafe impl AsMutRaw for TlvInfo {}

const TLV_INFO_MAGIC: u16 = 0x6907;
const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// Read and check the header at the front of a region.
pub fn read_header<F: ReadFlash>(flash: &mut F) -> Result<ImageHeader> {
    let mut header = ImageHeader::default();
    flash.read(0, header.as_mut_raw())?;

    if header.magic != IMAGE_MAGIC {
        return Err(Error::InvalidImage);
    }
    Ok(header)
}

/// Total byte footprint of the image installed in a region: header, payload,
/// protected TLV block if any, and the TLV block.  This is what a swap has
/// to move.
pub fn image_footprint<F: ReadFlash>(flash: &mut F) -> Result<usize> {
    let header = read_header(flash)?;

    let mut off = header.hdr_size as usize + header.img_size as usize;
    let mut info = TlvInfo::default();
    flash.read(off, info.as_mut_raw())?;

    if header.protected_tlv_size > 0 {
        if info.magic != TLV_PROT_INFO_MAGIC || info.len != header.protected_tlv_size {
            return Err(Error::InvalidImage);
        }
        off += header.protected_tlv_size as usize;
        flash.read(off, info.as_mut_raw())?;
    }

    if info.magic != TLV_INFO_MAGIC || (info.len as usize) < size_of::<TlvInfo>() {
        return Err(Error::InvalidImage);
    }

    Ok(off + info.len as usize)
}

/// Where `slot`'s header bytes are while the swap described by `bs` is in
/// flight over `swap_count` granules.
///
/// Granules run from high offsets to low, so the header moves during the
/// final granule: the staged secondary header sits in scratch from the move
/// phase on, and the primary header has already been moved into the
/// secondary slot once the publish phase begins.  After the last granule the
/// slots have simply traded contents.
pub fn header_location(slot: Slot, bs: &BootStatus, swap_count: usize) -> HeaderLocation {
    let done = bs.idx - 1;

    if done >= swap_count {
        return match slot {
            Slot::Primary => HeaderLocation::Secondary,
            Slot::Secondary => HeaderLocation::Primary,
        };
    }

    if done + 1 == swap_count {
        match slot {
            Slot::Secondary if bs.state >= Phase::Move => HeaderLocation::Scratch,
            Slot::Primary if bs.state >= Phase::Publish => HeaderLocation::Secondary,
            Slot::Primary => HeaderLocation::Primary,
            Slot::Secondary => HeaderLocation::Secondary,
        }
    } else {
        match slot {
            Slot::Primary => HeaderLocation::Primary,
            Slot::Secondary => HeaderLocation::Secondary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(idx: usize, state: Phase) -> BootStatus {
        BootStatus {
            idx,
            state,
            use_scratch: false,
            swap_size: 0x3000,
            #[cfg(feature = "encrypt")]
            enc_keys: [[0; crate::trailer::KEY_SZ]; 2],
        }
    }

    #[test]
    fn header_tracking() {
        use HeaderLocation as L;

        // Earlier granules leave the header sectors untouched.
        assert_eq!(header_location(Slot::Primary, &bs(1, Phase::Publish), 3), L::Primary);
        assert_eq!(header_location(Slot::Secondary, &bs(2, Phase::Move), 3), L::Secondary);

        // Final granule: staged copy leaves the secondary at the move phase,
        // the primary's bytes are in the secondary once publish begins.
        assert_eq!(header_location(Slot::Secondary, &bs(3, Phase::Stage), 3), L::Secondary);
        assert_eq!(header_location(Slot::Secondary, &bs(3, Phase::Move), 3), L::Scratch);
        assert_eq!(header_location(Slot::Secondary, &bs(3, Phase::Publish), 3), L::Scratch);
        assert_eq!(header_location(Slot::Primary, &bs(3, Phase::Move), 3), L::Primary);
        assert_eq!(header_location(Slot::Primary, &bs(3, Phase::Publish), 3), L::Secondary);

        // All granules done: the slots traded places.
        assert_eq!(header_location(Slot::Primary, &bs(4, Phase::Stage), 3), L::Secondary);
        assert_eq!(header_location(Slot::Secondary, &bs(4, Phase::Stage), 3), L::Primary);
    }
}
