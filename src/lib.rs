#![deny(unsafe_code)]
//! Grid-tiled image decoding and composition for HEIF/AVIF style containers.
//!
//! A `grid` item describes a composite image built from an ordered list of
//! tile items. This crate resolves that list, decodes every tile through a
//! caller-provided codec, validates that the tiles agree with each other, and
//! pastes them into a single output canvas. The inverse path builds a new
//! grid item out of already-encoded tiles.
//!
//! Pixel decoding itself is delegated to a [`TileDecoder`]; the container is
//! reached through the [`ImageContainer`] and [`ContainerWriter`] traits.
//! [`MemoryContainer`] is an in-memory implementation of both.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::borrow::Cow;
use std::convert::TryInto as _;

use fallible_collections::TryReserveError;

mod assemble;
mod canvas;
mod container;
mod decode;
mod grid;
mod image;
mod scheduler;

pub use crate::assemble::{GridAssembler, GridItem};
pub use crate::container::{
    ColorInformation, ContainerWriter, FourCC, ImageContainer, ImageSpatialExtents, ItemId, ItemProperty,
    MemoryContainer, item_type, reference_type,
};
pub use crate::decode::{GridDecoder, NoProgress, ProcessedIds, Progress, ProgressCounter, TileDecoder, WarningList};
pub use crate::grid::{GridDescriptor, TileReferenceList};
pub use crate::image::{Channel, Chroma, PixelFormat, PixelImage, Plane};

pub use enough::{Stop, StopReason, Unstoppable};

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

/// Describes grid decode and assembly failures.
///
/// Tile-level failures may be downgraded to warnings in lenient mode;
/// see [`Error::is_always_fatal`] for the ones that never are.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Corrupt or malformed data: bad descriptor, inconsistent tile sizes.
    InvalidData(&'static str),
    /// Valid but unsupported data, such as an unknown descriptor version.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Out of memory
    OutOfMemory,
    /// A declared size or count exceeds the configured security ceiling
    ResourceLimitExceeded(&'static str),
    /// The container has no item reference table at all.
    MissingReferenceBox,
    /// The number of tile references differs from `rows * columns`.
    TileCountMismatch { expected: u32, found: u32 },
    /// A tile reference does not point at an image item.
    MissingTileImage(ItemId),
    /// A tile's pixel format differs from the canvas format.
    ChromaFormatMismatch,
    /// The item was reached again while decoding itself.
    CyclicReference(ItemId),
    /// The grid would hold more tiles than a reference list can address.
    TooManyTiles,
    /// Failure reported by the per-codec tile decoder.
    Codec(Cow<'static, str>),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
    /// A worker thread panicked while holding shared decode state.
    Poisoned,
}

impl Error {
    /// Errors that end a grid decode in lenient mode too.
    ///
    /// Cycles, security ceilings, cancellation and panicked workers are about
    /// the whole request, not about one broken tile.
    pub fn is_always_fatal(&self) -> bool {
        matches!(
            self,
            Self::CyclicReference(_)
                | Self::ResourceLimitExceeded(_)
                | Self::OutOfMemory
                | Self::Stopped(_)
                | Self::Poisoned
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::OutOfMemory => "OOM",
            Self::MissingReferenceBox => "No iref box available",
            Self::TileCountMismatch { expected, found } => {
                return write!(f, "Grid expects {expected} tiles, but {found} are referenced");
            },
            Self::MissingTileImage(id) => return write!(f, "Grid tile {id} is not an image item"),
            Self::ChromaFormatMismatch => "Grid tiles have mismatched chroma formats",
            Self::CyclicReference(id) => return write!(f, "Item {id} references itself"),
            Self::TooManyTiles => "Too many tiles in grid",
            Self::Codec(msg) => return write!(f, "Tile decoder: {msg}"),
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
            Self::Poisoned => "A tile worker panicked",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::UnexpectedEOF
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

/// Also covers `std::collections::TryReserveError`, which this re-exports.
impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration for decoding grid images with resource limits and threading
///
/// Resource limits are checked **before** allocations occur, preventing out-of-memory
/// conditions from malicious files that claim unrealistic dimensions or counts.
/// Leniency never relaxes them.
///
/// # Examples
///
/// ```rust
/// use zenheif_grid::DecodeConfig;
///
/// // Default limits, sequential decoding
/// let config = DecodeConfig::default();
///
/// // Tighter limits for untrusted input, four tile workers
/// let config = DecodeConfig::default()
///     .with_max_image_size_pixels(64_000_000)
///     .with_max_number_of_tiles(256)
///     .with_max_threads(4)
///     .lenient(true);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum `width * height` of a composed grid.
    /// Default: 2^28 pixels
    pub max_image_size_pixels: Option<u64>,

    /// Maximum number of tiles (`rows * columns`) in one grid.
    /// Default: 65,535 tiles
    pub max_number_of_tiles: Option<u32>,

    /// Maximum number of tiles decoded concurrently.
    /// Default: 0 (sequential, no worker threads)
    pub max_threads: u32,

    /// Downgrade failures of tiles other than the first to warnings.
    /// Default: false (strict)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_image_size_pixels: Some(1 << 28),
            max_number_of_tiles: Some(u16::MAX as u32),
            max_threads: 0,
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            max_image_size_pixels: None,
            max_number_of_tiles: None,
            max_threads: 0,
            lenient: false,
        }
    }

    /// Set the maximum composed image area in pixels
    pub fn with_max_image_size_pixels(mut self, pixels: u64) -> Self {
        self.max_image_size_pixels = Some(pixels);
        self
    }

    /// Set the maximum grid tile count
    pub fn with_max_number_of_tiles(mut self, tiles: u32) -> Self {
        self.max_number_of_tiles = Some(tiles);
        self
    }

    /// Set the number of concurrently decoded tiles. 0 decodes sequentially.
    pub fn with_max_threads(mut self, threads: u32) -> Self {
        self.max_threads = threads;
        self
    }

    /// Enable lenient decoding mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn limits(&self) -> SecurityLimits<'_> {
        SecurityLimits { config: self }
    }
}

/// Ceilings on attacker-controlled quantities, checked before proportional allocation.
pub(crate) struct SecurityLimits<'a> {
    config: &'a DecodeConfig,
}

impl SecurityLimits<'_> {
    pub(crate) fn validate_image_size(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.config.max_image_size_pixels {
            let pixels = u64::from(width) * u64::from(height);
            if pixels > limit {
                return Err(Error::ResourceLimitExceeded("image size limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_tile_count(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_number_of_tiles {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("grid tile count limit exceeded"));
            }
        }

        Ok(())
    }
}
