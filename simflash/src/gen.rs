//! Image generation.
//!
//! Builds deterministic, well-formed (but unsigned) images directly in
//! memory: a header with the image magic, a PRNG payload, and a minimal TLV
//! block carrying a placeholder hash entry.  Signing belongs to the
//! provisioning tools, not to the swap tests, so none happens here.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

use anyhow::Result;

/// Header magic, shared with the boot side.
const IMAGE_MAGIC: u32 = 0x96f3b83d;
/// TLV info block magic.
const TLV_INFO_MAGIC: u16 = 0x6907;
/// Placeholder hash entry: kind and payload length.
const TLV_SHA256: u16 = 0x10;
const HASH_LEN: usize = 32;

pub struct GeneratedImage {
    pub data: Vec<u8>,
}

impl GeneratedImage {
    /// Total footprint: header, payload and TLV block.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct GenBuilder {
    /// Bytes reserved for the header at the front of the image.
    header_size: usize,
    /// Payload size, not counting header or TLV.
    size: usize,
    /// Seed for the PRNG.
    seed: u64,
    /// Version as (major, minor, revision, build).
    version: (u8, u8, u16, u32),
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 0x20,
            size: 0x2000,
            seed: 1,
            version: (0, 1, 0, 0),
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn version(&mut self, version: (u8, u8, u16, u32)) -> &mut Self {
        self.version = version;
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        anyhow::ensure!(self.header_size >= 0x20, "header area too small");

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);

        let mut data = Vec::with_capacity(self.header_size + self.size + 8 + 4 + HASH_LEN);

        // Header.
        put32(&mut data, IMAGE_MAGIC);
        put32(&mut data, 0); // load address, XIP
        put16(&mut data, self.header_size as u16);
        put16(&mut data, 0); // no protected TLV
        put32(&mut data, self.size as u32);
        put32(&mut data, 0); // flags
        let (major, minor, revision, build) = self.version;
        data.push(major);
        data.push(minor);
        put16(&mut data, revision);
        put32(&mut data, build);
        put32(&mut data, 0); // pad
        data.resize(self.header_size, 0);

        // Payload.
        let mut payload = vec![0u8; self.size];
        rng.fill_bytes(&mut payload);
        data.extend_from_slice(&payload);

        // TLV block: info header plus one hash entry.
        put16(&mut data, TLV_INFO_MAGIC);
        put16(&mut data, (4 + 4 + HASH_LEN) as u16);
        put16(&mut data, TLV_SHA256);
        put16(&mut data, HASH_LEN as u16);
        let mut hash = [0u8; HASH_LEN];
        rng.fill_bytes(&mut hash);
        data.extend_from_slice(&hash);

        Ok(GeneratedImage { data })
    }
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
