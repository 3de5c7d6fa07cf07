// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building a new grid item out of already-encoded tiles.

use log::debug;

use crate::container::{ContainerWriter, ImageContainer, ImageSpatialExtents, ItemId, ItemProperty, item_type, reference_type};
use crate::grid::GridDescriptor;
use crate::{Error, Result};

/// A grid item under construction. Returned by [`GridAssembler::create_grid`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridItem {
    id: ItemId,
    descriptor: GridDescriptor,
    bound_tiles: u32,
}

impl GridItem {
    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn descriptor(&self) -> &GridDescriptor {
        &self.descriptor
    }

    /// Number of successful [`GridAssembler::bind_tile`] calls so far
    pub fn bound_tiles(&self) -> u32 {
        self.bound_tiles
    }
}

/// Writes grid items and their tile references into a container.
///
/// ```rust
/// use zenheif_grid::{GridAssembler, MemoryContainer, item_type};
///
/// let mut file = MemoryContainer::new();
/// let tiles = [
///     file.add_image(item_type::AV01, 64, 64)?,
///     file.add_image(item_type::AV01, 64, 64)?,
/// ];
/// let mut assembler = GridAssembler::new(&mut file);
/// let mut grid = assembler.create_grid(128, 64, 1, 2)?;
/// for (tx, &tile) in tiles.iter().enumerate() {
///     assembler.bind_tile(&mut grid, tx as u32, 0, tile)?;
/// }
/// assert_eq!(file.top_level_items(), [grid.id()]);
/// # Ok::<(), zenheif_grid::Error>(())
/// ```
pub struct GridAssembler<'a, C: ImageContainer + ContainerWriter + ?Sized> {
    container: &'a mut C,
}

impl<'a, C: ImageContainer + ContainerWriter + ?Sized> GridAssembler<'a, C> {
    pub fn new(container: &'a mut C) -> Self {
        Self { container }
    }

    /// Add a `grid` item of `rows` × `columns` tiles with an output of `output_width` × `output_height`.
    ///
    /// Every tile slot starts out as the placeholder id 0 until [`Self::bind_tile`] fills it.
    pub fn create_grid(&mut self, output_width: u32, output_height: u32, rows: u32, columns: u32) -> Result<GridItem> {
        let rows = u16::try_from(rows).map_err(|_| Error::InvalidData("grid rows and columns must be in 1..=256"))?;
        let columns =
            u16::try_from(columns).map_err(|_| Error::InvalidData("grid rows and columns must be in 1..=256"))?;
        let descriptor = GridDescriptor::new(rows, columns, output_width, output_height)?;
        // reference lists hold at most 16 bits' worth of entries
        if descriptor.tile_count() > u32::from(u16::MAX) {
            return Err(Error::TooManyTiles);
        }

        let id = self.container.add_new_item(item_type::GRID)?;
        self.container.append_item_data(id, &descriptor.write())?;

        let mut placeholders = std::vec::Vec::new();
        placeholders.try_reserve_exact(descriptor.tile_count() as usize)?;
        placeholders.resize(descriptor.tile_count() as usize, 0);
        self.container.add_reference(id, reference_type::DERIVED_IMAGE, &placeholders)?;

        self.container.add_property(
            id,
            ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: output_width, height: output_height }),
        )?;

        debug!("Created grid item {id}: {columns}×{rows} tiles, {output_width}×{output_height} output");
        Ok(GridItem { id, descriptor, bound_tiles: 0 })
    }

    /// Put `tile` at column `tile_x`, row `tile_y` of `grid`.
    ///
    /// The tile is hidden from the top-level item list. The first tile bound
    /// also lends its pixel-layout and colour properties to the grid item.
    pub fn bind_tile(&mut self, grid: &mut GridItem, tile_x: u32, tile_y: u32, tile: ItemId) -> Result<()> {
        let columns = u32::from(grid.descriptor.columns());
        if tile_x >= columns || tile_y >= u32::from(grid.descriptor.rows()) {
            return Err(Error::InvalidData("tile position outside the grid"));
        }
        if !self.container.is_image(tile) {
            return Err(Error::MissingTileImage(tile));
        }

        self.container.mark_item_hidden(tile, true)?;
        let slot = tile_y as usize * columns as usize + tile_x as usize;
        self.container
            .set_reference_at(grid.id, reference_type::DERIVED_IMAGE, slot, tile)?;

        if grid.bound_tiles == 0 {
            let shared: std::vec::Vec<ItemProperty> = self
                .container
                .properties(tile)
                .iter()
                .filter(|p| p.is_shared_with_grid())
                .cloned()
                .collect();
            for property in shared {
                self.container.add_property(grid.id, property)?;
            }
        }
        grid.bound_tiles += 1;
        Ok(())
    }
}
