//! Scratch-mediated image swap for a second-stage bootloader.
//!
//! Two flash slots hold firmware images: the primary slot boots, the
//! secondary slot stages an upgrade candidate.  This crate exchanges the two
//! images through a small scratch area, one bounded granule at a time, and
//! records its progress in an image trailer at the tail of the slots so that
//! a reset at any instant leaves the device resumable.
//!
//! The pieces:
//!
//! - [`geometry`]: decides whether two differently-sectored slots can be
//!   swapped at all, and cuts the work into granules that fit the scratch.
//! - [`trailer`]: the durable status record and its byte layout.
//! - [`status`]: boot-time classification of the trailers into "no swap",
//!   "resume from the primary trailer" or "resume from scratch".
//! - [`swap`]: the three-phase exchange itself.
//! - [`image`]: image headers, and where the header actually is mid-swap.
//!
//! Image signature checking, upgrade policy, and the flash drivers themselves
//! all live outside this crate; flash is reached through the `storage`
//! traits only.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod geometry;
pub mod image;
pub mod status;
pub mod swap;
pub mod trailer;

pub use geometry::{Geometry, Sector, MAX_SECTORS};
pub use image::{image_footprint, read_header, HeaderLocation, ImageHeader, Slot};
pub use status::StatusSource;
pub use swap::{BootStatus, Phase, Swap};
pub use trailer::{Flag, Magic, SwapType};

/// Errors surfaced by the engine.  None of them are retryable from inside:
/// the caller either declines the upgrade (geometry) or resets and lets the
/// resume protocol repeat the interrupted phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The flash adapter failed.
    Flash(storage::Error),
    /// Geometry or status inconsistency detected after work began.
    BadArgs,
    /// An image header or TLV block did not parse.
    InvalidImage,
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Flash(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
