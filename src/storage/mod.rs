//! # Block Storage
//!
//! The paging engine underneath the scene graph. A [`SurfelDatabase`] owns
//! every [`SurfelBlock`] and, optionally, a backing file in the versioned
//! `.ssb` layout:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬───────────────────┐
//! │ header       │ block payloads (records)     │ block directory   │
//! │ 1144 bytes   │ appended / rewritten in place│ 164 bytes / entry │
//! └──────────────┴──────────────────────────────┴───────────────────┘
//! ```
//!
//! Blocks are paged in by [`SurfelDatabase::pin_block`] and paged out when
//! the last [`BlockPin`] is dropped.
//!
//! ## Limitations
//!
//! - **Single-threaded**: the handle is `Clone` and internally locked so pins
//!   can outlive borrows of the scene, not so that several threads can page
//!   concurrently.
//! - **No free-space reuse**: a block that outgrows its region is appended
//!   at the end of the file and the old region is leaked.

pub mod block;
pub mod codec;
pub mod database;
pub(crate) mod header;

pub use block::{BlockFlags, BlockInfo, SurfelBlock};
pub use codec::{SurfelCodec, codec_for};
pub use database::{BlockPin, BlockSplit, DatabaseStats, SurfelDatabase};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// On-disk format version of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion { major: 6, minor: 0 };
    pub const OLDEST: FormatVersion = FormatVersion { major: 2, minor: 0 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn validate(&self) -> Result<()> {
        if self.major < Self::OLDEST.major || self.major > Self::CURRENT.major {
            return Err(Error::UnsupportedVersion { major: self.major, minor: self.minor });
        }
        Ok(())
    }

    /// Size of one record in this layout.
    pub fn bytes_per_surfel(&self) -> usize {
        codec_for(*self).record_size()
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How a database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Truncate/create and write a fresh header.
    Create,
    /// Open an existing file for update.
    ReadWrite,
    /// Open an existing file; syncing is a no-op and block writes fail.
    ReadOnly,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    /// `"w"` creates, anything containing `'+'` updates, anything else reads.
    fn from_str(s: &str) -> Result<Self> {
        Ok(if s == "w" {
            AccessMode::Create
        } else if s.contains('+') {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_parse() {
        assert_eq!("w".parse::<AccessMode>().unwrap(), AccessMode::Create);
        assert_eq!("r+".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert_eq!("r".parse::<AccessMode>().unwrap(), AccessMode::ReadOnly);
        assert_eq!("".parse::<AccessMode>().unwrap(), AccessMode::ReadOnly);
    }

    #[test]
    fn test_bytes_per_surfel_by_version() {
        assert_eq!(FormatVersion::new(6, 0).bytes_per_surfel(), 48);
        assert_eq!(FormatVersion::new(5, 0).bytes_per_surfel(), 44);
        assert_eq!(FormatVersion::new(4, 0).bytes_per_surfel(), 40);
        assert_eq!(FormatVersion::new(3, 0).bytes_per_surfel(), 24);
        assert_eq!(FormatVersion::new(2, 0).bytes_per_surfel(), 16);
    }

    #[test]
    fn test_version_bounds() {
        assert!(FormatVersion::new(1, 0).validate().is_err());
        assert!(FormatVersion::new(7, 0).validate().is_err());
        assert!(FormatVersion::CURRENT.validate().is_ok());
    }
}
