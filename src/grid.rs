// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `grid` item payload and the tile list bound to it.

use bitreader::BitReader;
use byteorder::{BigEndian, ByteOrder};

use crate::container::{ImageContainer, ItemId, reference_type};
use crate::{Error, Result};

/// Layout of a grid derived image item
///
/// Stored as the item's data, not as a property box.
/// See ISO/IEC 23008-12:2017 § 6.6.2.3
///
/// ```text
/// version:u8 (0)  flags:u8  rows_minus_one:u8  columns_minus_one:u8
/// output_width  output_height   (16 bits each, or 32 bits if flags & 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDescriptor {
    rows: u16,
    columns: u16,
    output_width: u32,
    output_height: u32,
}

impl GridDescriptor {
    /// version + flags + rows + columns + two 16-bit sizes
    const MIN_SIZE: usize = 8;
    /// version + flags + rows + columns + two 32-bit sizes
    const MIN_LARGE_SIZE: usize = 12;
    const MAX_ROWS_OR_COLUMNS: u16 = 256;

    /// Create a descriptor. `rows` and `columns` must be in `1..=256`.
    pub fn new(rows: u16, columns: u16, output_width: u32, output_height: u32) -> Result<Self> {
        if !(1..=Self::MAX_ROWS_OR_COLUMNS).contains(&rows) || !(1..=Self::MAX_ROWS_OR_COLUMNS).contains(&columns) {
            return Err(Error::InvalidData("grid rows and columns must be in 1..=256"));
        }
        Ok(Self { rows, columns, output_width, output_height })
    }

    /// Parse the grid item payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(Error::InvalidData("grid descriptor too short"));
        }

        let mut bits = BitReader::new(data);
        let version = bits.read_u8(8)?;
        if version != 0 {
            return Err(Error::Unsupported("grid version > 0"));
        }

        // flags & 1 determines field size: 0 = 16-bit, 1 = 32-bit
        let flags = bits.read_u8(8)?;
        let field_bits = if flags & 1 == 0 { 16 } else { 32 };
        if field_bits == 32 && data.len() < Self::MIN_LARGE_SIZE {
            return Err(Error::InvalidData("grid descriptor too short for 32-bit sizes"));
        }

        let rows = u16::from(bits.read_u8(8)?) + 1;
        let columns = u16::from(bits.read_u8(8)?) + 1;
        let output_width = bits.read_u32(field_bits)?;
        let output_height = bits.read_u32(field_bits)?;

        Ok(Self { rows, columns, output_width, output_height })
    }

    /// Serialize with the smallest field width that holds both output sizes.
    pub fn write(&self) -> std::vec::Vec<u8> {
        let large = self.output_width > u32::from(u16::MAX) || self.output_height > u32::from(u16::MAX);
        let mut out = [0u8; Self::MIN_LARGE_SIZE];
        out[0] = 0; // version
        out[1] = u8::from(large);
        out[2] = (self.rows - 1) as u8;
        out[3] = (self.columns - 1) as u8;
        let len = if large {
            BigEndian::write_u32(&mut out[4..8], self.output_width);
            BigEndian::write_u32(&mut out[8..12], self.output_height);
            Self::MIN_LARGE_SIZE
        } else {
            BigEndian::write_u16(&mut out[4..6], self.output_width as u16);
            BigEndian::write_u16(&mut out[6..8], self.output_height as u16);
            Self::MIN_SIZE
        };
        out[..len].to_vec()
    }

    /// Number of tile rows (1-256)
    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Number of tile columns (1-256)
    pub fn columns(&self) -> u16 {
        self.columns
    }

    pub fn output_width(&self) -> u32 {
        self.output_width
    }

    pub fn output_height(&self) -> u32 {
        self.output_height
    }

    /// `rows * columns`
    pub fn tile_count(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.columns)
    }
}

/// Tile item ids of a grid, in row-major order.
///
/// An id of 0 marks a slot that has not been filled in yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileReferenceList {
    tiles: std::vec::Vec<ItemId>,
}

impl TileReferenceList {
    /// Read the `dimg` references of `grid_item` and check them against the descriptor.
    pub fn resolve<C: ImageContainer + ?Sized>(
        grid_item: ItemId,
        descriptor: &GridDescriptor,
        container: &C,
    ) -> Result<Self> {
        if !container.has_references() {
            return Err(Error::MissingReferenceBox);
        }

        let tiles = container.references(grid_item, reference_type::DERIVED_IMAGE);
        let expected = descriptor.tile_count();
        if tiles.len() != expected as usize {
            return Err(Error::TileCountMismatch {
                expected,
                found: u32::try_from(tiles.len()).unwrap_or(u32::MAX),
            });
        }

        Ok(Self { tiles })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ItemId> {
        self.tiles.get(index).copied()
    }

    pub fn as_slice(&self) -> &[ItemId] {
        &self.tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerWriter, MemoryContainer, item_type};

    #[test]
    fn parse_16bit() {
        let grid = GridDescriptor::parse(&[0, 0, 1, 2, 0x01, 0x00, 0x00, 0x60]).unwrap();
        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.columns(), 3);
        assert_eq!(grid.output_width(), 256);
        assert_eq!(grid.output_height(), 96);
    }

    #[test]
    fn parse_32bit() {
        let grid = GridDescriptor::parse(&[0, 1, 255, 0, 0, 1, 0, 0, 0, 0, 0, 7]).unwrap();
        assert_eq!(grid.rows(), 256);
        assert_eq!(grid.columns(), 1);
        assert_eq!(grid.output_width(), 65536);
        assert_eq!(grid.output_height(), 7);
    }

    #[test]
    fn parse_rejects_short_input() {
        assert_eq!(
            GridDescriptor::parse(&[0, 0, 0, 0, 0, 0, 0]),
            Err(Error::InvalidData("grid descriptor too short"))
        );
        assert_eq!(
            GridDescriptor::parse(&[0, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0]),
            Err(Error::InvalidData("grid descriptor too short for 32-bit sizes"))
        );
    }

    #[test]
    fn parse_rejects_version() {
        assert_eq!(
            GridDescriptor::parse(&[1, 0, 0, 0, 0, 1, 0, 1]),
            Err(Error::Unsupported("grid version > 0"))
        );
    }

    #[test]
    fn parse_ignores_trailing_bytes() {
        let grid = GridDescriptor::parse(&[0, 0, 0, 0, 0, 4, 0, 4, 0xff, 0xff]).unwrap();
        assert_eq!((grid.output_width(), grid.output_height()), (4, 4));
    }

    #[test]
    fn write_picks_minimal_field_width() {
        let small = GridDescriptor::new(2, 2, 65535, 65535).unwrap();
        assert_eq!(small.write(), [0, 0, 1, 1, 0xff, 0xff, 0xff, 0xff]);

        let large = GridDescriptor::new(1, 256, 65536, 1).unwrap();
        assert_eq!(large.write(), [0, 1, 0, 255, 0, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn write_then_parse_is_identity() {
        let sizes = [0, 1, 255, 65535, 65536, u32::MAX];
        for &(rows, columns) in &[(1, 1), (1, 256), (256, 1), (17, 3), (256, 256)] {
            for &w in &sizes {
                for &h in &sizes {
                    let grid = GridDescriptor::new(rows, columns, w, h).unwrap();
                    assert_eq!(GridDescriptor::parse(&grid.write()).unwrap(), grid);
                }
            }
        }
    }

    #[test]
    fn new_rejects_out_of_range_layout() {
        assert!(GridDescriptor::new(0, 1, 1, 1).is_err());
        assert!(GridDescriptor::new(1, 257, 1, 1).is_err());
    }

    #[test]
    fn resolve_requires_reference_table() {
        let mut file = MemoryContainer::new();
        let grid = file.add_new_item(item_type::GRID).unwrap();
        let descriptor = GridDescriptor::new(1, 1, 8, 8).unwrap();
        assert_eq!(
            TileReferenceList::resolve(grid, &descriptor, &file),
            Err(Error::MissingReferenceBox)
        );
    }

    #[test]
    fn resolve_checks_tile_count() {
        let mut file = MemoryContainer::new();
        let grid = file.add_new_item(item_type::GRID).unwrap();
        let tiles: std::vec::Vec<ItemId> = (0..5).map(|_| file.add_new_item(item_type::AV01).unwrap()).collect();

        for found in 0..=tiles.len() {
            let mut file = file.clone();
            file.add_reference(grid, reference_type::DERIVED_IMAGE, &tiles[..found]).unwrap();
            for &(rows, columns) in &[(1, 1), (2, 2), (1, 5), (3, 1)] {
                let descriptor = GridDescriptor::new(rows, columns, 8, 8).unwrap();
                let result = TileReferenceList::resolve(grid, &descriptor, &file);
                if found == descriptor.tile_count() as usize {
                    assert_eq!(result.unwrap().as_slice(), &tiles[..found]);
                } else {
                    assert_eq!(
                        result,
                        Err(Error::TileCountMismatch { expected: descriptor.tile_count(), found: found as u32 })
                    );
                }
            }
        }
    }
}
