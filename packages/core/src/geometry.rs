//! LittleFS geometry candidates.
//!
//! A LittleFS image does not record the block, read and program sizes it
//! was formatted with, so they have to be guessed from a small ordered set
//! of values seen on real embedded targets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block sizes tried by default, most common first.
///
/// 4096 is the flash sector size used by ESP32/STM32 SPI flash layouts;
/// 512 is the sector size of SD cards.
pub const DEFAULT_BLOCK_SIZES: [u32; 2] = [4096, 512];

/// Read/program sizes tried by default, most common first.
pub const DEFAULT_IO_SIZES: [u32; 2] = [16, 512];

/// Block sizes of the extended detection range.
pub const EXTENDED_BLOCK_SIZES: [u32; 4] = [512, 4096, 8192, 16384];

/// Read/program sizes of the extended detection range.
pub const EXTENDED_IO_SIZES: [u32; 9] = [4, 8, 16, 32, 64, 128, 256, 512, 1024];

/// The (block_size, read_size, prog_size) triple needed to interpret an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub read_size: u32,
    pub prog_size: u32,
}

impl Geometry {
    pub const fn new(block_size: u32, read_size: u32, prog_size: u32) -> Self {
        Self {
            block_size,
            read_size,
            prog_size,
        }
    }

    /// Checks the constraints LittleFS places on a configuration.
    ///
    /// All sizes must be non-zero and the block size must be a multiple of
    /// both the read and the program size.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Error::InvalidGeometry {
            value: self.to_string(),
            message: message.to_string(),
        };

        if self.block_size == 0 || self.read_size == 0 || self.prog_size == 0 {
            return Err(invalid("sizes must be non-zero"));
        }
        if self.block_size % self.read_size != 0 {
            return Err(invalid("block_size must be a multiple of read_size"));
        }
        if self.block_size % self.prog_size != 0 {
            return Err(invalid("block_size must be a multiple of prog_size"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Returns the driver command-line flags for this geometry.
    pub fn driver_args(&self) -> [String; 3] {
        [
            format!("--block_size={}", self.block_size),
            format!("--read_size={}", self.read_size),
            format!("--prog_size={}", self.prog_size),
        ]
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_size, self.read_size, self.prog_size)
    }
}

/// Parses `BLOCK:READ:PROG`, e.g. `4096:16:16`.
impl FromStr for Geometry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidGeometry {
            value: s.to_string(),
            message: message.to_string(),
        };

        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(invalid("expected BLOCK:READ:PROG"));
        }

        let mut sizes = [0u32; 3];
        for (slot, part) in sizes.iter_mut().zip(&parts) {
            *slot = part
                .trim()
                .parse()
                .map_err(|_| invalid("sizes must be unsigned integers"))?;
        }

        let geometry = Geometry::new(sizes[0], sizes[1], sizes[2]);
        geometry.validate()?;
        Ok(geometry)
    }
}

/// Builders for ordered candidate lists.
pub struct GeometryCandidates;

impl GeometryCandidates {
    /// The fixed default set, block-size major, most common values first.
    pub fn default_set() -> Vec<Geometry> {
        Self::cartesian(&DEFAULT_BLOCK_SIZES, &DEFAULT_IO_SIZES)
    }

    /// The wider range used for detection when the defaults do not match.
    ///
    /// Combinations LittleFS would reject are skipped.
    pub fn extended() -> Vec<Geometry> {
        Self::cartesian(&EXTENDED_BLOCK_SIZES, &EXTENDED_IO_SIZES)
    }

    fn cartesian(block_sizes: &[u32], io_sizes: &[u32]) -> Vec<Geometry> {
        let mut candidates = Vec::new();
        for &block_size in block_sizes {
            for &read_size in io_sizes {
                for &prog_size in io_sizes {
                    let geometry = Geometry::new(block_size, read_size, prog_size);
                    if geometry.is_valid() {
                        candidates.push(geometry);
                    }
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_order() {
        let candidates = GeometryCandidates::default_set();
        assert_eq!(
            candidates,
            vec![
                Geometry::new(4096, 16, 16),
                Geometry::new(4096, 16, 512),
                Geometry::new(4096, 512, 16),
                Geometry::new(4096, 512, 512),
                Geometry::new(512, 16, 16),
                Geometry::new(512, 16, 512),
                Geometry::new(512, 512, 16),
                Geometry::new(512, 512, 512),
            ]
        );
    }

    #[test]
    fn test_extended_skips_invalid_combinations() {
        let candidates = GeometryCandidates::extended();
        assert!(candidates.iter().all(Geometry::is_valid));
        // 1024-byte reads never fit a 512-byte block
        assert!(
            !candidates
                .iter()
                .any(|g| g.block_size == 512 && g.read_size == 1024)
        );
        assert!(candidates.contains(&Geometry::new(16384, 1024, 4)));
        assert_eq!(candidates.first(), Some(&Geometry::new(512, 4, 4)));
    }

    #[test]
    fn test_parse_geometry() {
        let geometry: Geometry = "4096:16:16".parse().unwrap();
        assert_eq!(geometry, Geometry::new(4096, 16, 16));
        assert_eq!(geometry.to_string(), "4096:16:16");

        assert!("4096:16".parse::<Geometry>().is_err());
        assert!("4096:abc:16".parse::<Geometry>().is_err());
        assert!("4096:0:16".parse::<Geometry>().is_err());
        assert!("500:16:16".parse::<Geometry>().is_err());
    }

    #[test]
    fn test_driver_args() {
        let args = Geometry::new(512, 16, 512).driver_args();
        assert_eq!(
            args,
            [
                "--block_size=512".to_string(),
                "--read_size=16".to_string(),
                "--prog_size=512".to_string(),
            ]
        );
    }
}
