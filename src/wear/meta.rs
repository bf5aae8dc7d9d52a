//! On-flash page metadata for the wear-leveled path.
//!
//! Every programmed data page carries a small header in its spare area: a
//! magic marker, the logical sector the page holds, and a monotonically
//! increasing sequence number, guarded by a CRC. The header is the only
//! persistent record of the sector map: resume rebuilds the whole mapping by
//! replaying these headers in sequence order. An all-0xFF spare means the
//! page was never programmed.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

use crate::error::{FtlError, Result};

const META_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Serialized size of [`PageMeta`] in the spare area.
pub const META_BYTES: usize = 20;

/// The per-page metadata header.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"SNm1")]
pub struct PageMeta {
    /// Logical sector stored in this page.
    pub sector: u32,
    /// Allocation sequence number; higher wins during resume.
    pub seq: u64,
    crc: u32,
}

impl PageMeta {
    /// Build a header for `sector` at sequence `seq`, with a valid CRC.
    pub fn new(sector: u32, seq: u64) -> Self {
        let mut meta = Self {
            sector,
            seq,
            crc: 0,
        };
        meta.crc = meta.compute_crc();
        meta
    }

    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        META_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()])
    }

    /// Parse a header from the start of a spare buffer, verifying magic and
    /// CRC. Returns `None` for erased or corrupt spare content.
    pub fn decode(spare: &[u8]) -> Option<Self> {
        let (_, meta) = Self::from_bytes((spare, 0)).ok()?;
        (meta.crc == meta.compute_crc()).then_some(meta)
    }

    /// Serialize into the start of a spare buffer, filling the remainder with
    /// the erased pattern.
    pub fn encode(self, spare: &mut [u8]) -> Result<()> {
        let bytes = self.to_bytes().unwrap();
        let header = spare
            .get_mut(..bytes.len())
            .ok_or(FtlError::Unsupported("spare area too small for metadata"))?;
        header.copy_from_slice(&bytes);
        spare[bytes.len()..].fill(0xFF);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let meta = PageMeta::new(1234, 0xA1B2C3D4E5);
        let mut spare = vec![0u8; 64];
        meta.encode(&mut spare).unwrap();

        assert_eq!(PageMeta::decode(&spare), Some(meta));
        assert!(spare[META_BYTES..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_serialized_size() {
        let bytes = PageMeta::new(0, 0).to_bytes().unwrap();
        assert_eq!(bytes.len(), META_BYTES);
    }

    #[test]
    fn test_decode_rejects_damage() {
        let meta = PageMeta::new(7, 42);
        let mut spare = vec![0u8; 64];
        meta.encode(&mut spare).unwrap();

        // Flip a payload bit: CRC must catch it.
        let mut bad = spare.clone();
        bad[6] ^= 0x01;
        assert_eq!(PageMeta::decode(&bad), None);

        // Break the magic.
        let mut bad = spare.clone();
        bad[0] = b'X';
        assert_eq!(PageMeta::decode(&bad), None);

        // Erased spare is not a header.
        assert_eq!(PageMeta::decode(&vec![0xFFu8; 64]), None);

        // Too-small target buffer is refused.
        let mut tiny = vec![0u8; META_BYTES - 1];
        assert!(meta.encode(&mut tiny).is_err());
    }
}
