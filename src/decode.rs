// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding grid items into a single image.
//!
//! [`GridDecoder`] resolves a grid's descriptor and tile list, decodes every
//! tile through the caller's [`TileDecoder`] and composes the results.
//! Tiles that are themselves derived images (`grid`, `iden`) are decoded
//! recursively; [`ProcessedIds`] carries the chain of items being decoded so
//! that a reference cycle fails instead of recursing forever.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use enough::{Stop, Unstoppable};
use log::{debug, warn};

use crate::canvas::CanvasCompositor;
use crate::container::{ImageContainer, ImageSpatialExtents, ItemId, item_type, reference_type};
use crate::grid::{GridDescriptor, TileReferenceList};
use crate::image::PixelImage;
use crate::scheduler::{TileJob, lock, run_jobs};
use crate::{DecodeConfig, Error, Result};

/// Decodes coded (non-derived) image items such as `av01` or `hvc1` tiles.
///
/// Called once per tile, possibly from several threads at once when
/// [`DecodeConfig::max_threads`] is non-zero.
pub trait TileDecoder: Sync {
    /// `processed` holds every item on the path to `tile`, `tile` included.
    /// Implementations that decode other items on behalf of `tile` must pass it on.
    fn decode(&self, tile: ItemId, config: &DecodeConfig, processed: &ProcessedIds) -> Result<PixelImage>;
}

/// Items on the path from the requested item down to the one being decoded.
///
/// Passed by value down every recursive decode: a branch extends its own
/// copy, so siblings in a grid may legitimately share a tile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedIds(BTreeSet<ItemId>);

impl ProcessedIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, item: ItemId) -> bool {
        self.0.contains(&item)
    }

    /// This set plus `item`, or [`Error::CyclicReference`] if `item` is already in it.
    pub fn with(&self, item: ItemId) -> Result<Self> {
        if self.contains(item) {
            return Err(Error::CyclicReference(item));
        }
        let mut extended = self.clone();
        extended.0.insert(item);
        Ok(extended)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Non-fatal problems collected across the workers of one decode.
#[derive(Debug, Default)]
pub struct WarningList {
    warnings: Mutex<std::vec::Vec<Error>>,
}

impl WarningList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, warning: Error) -> Result<()> {
        let mut warnings = lock(&self.warnings)?;
        warnings.try_reserve(1)?;
        warnings.push(warning);
        Ok(())
    }

    pub fn extend(&self, more: std::vec::Vec<Error>) -> Result<()> {
        if more.is_empty() {
            return Ok(());
        }
        let mut warnings = lock(&self.warnings)?;
        warnings.try_reserve(more.len())?;
        warnings.extend(more);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.warnings)?.len())
    }

    pub fn into_vec(self) -> Result<std::vec::Vec<Error>> {
        self.warnings.into_inner().map_err(|_| Error::Poisoned)
    }
}

/// Receives the completed-tile count of a full grid decode.
///
/// Calls are serialized and `completed` strictly increases from 1 to `total`
/// (fewer if the decode fails). Under parallel decoding the calls follow tile
/// completion order, not tile index order.
pub trait Progress: Sync {
    fn tile_completed(&self, completed: u32, total: u32);
}

/// Ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn tile_completed(&self, _completed: u32, _total: u32) {}
}

/// Keeps the latest progress report, readable from another thread.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    completed: AtomicU32,
    total: AtomicU32,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }
}

impl Progress for ProgressCounter {
    fn tile_completed(&self, completed: u32, total: u32) {
        self.total.store(total, Ordering::Release);
        self.completed.store(completed, Ordering::Release);
    }
}

struct GridLayout {
    descriptor: GridDescriptor,
    tiles: TileReferenceList,
}

/// Decodes `grid`, `iden` and coded image items from an [`ImageContainer`].
///
/// ```rust,no_run
/// # fn example(file: &zenheif_grid::MemoryContainer, codec: &dyn zenheif_grid::TileDecoder) -> zenheif_grid::Result<()> {
/// use zenheif_grid::{DecodeConfig, GridDecoder};
///
/// let config = DecodeConfig::default().with_max_threads(4).lenient(true);
/// let decoder = GridDecoder::new(file, codec, config);
/// let image = decoder.decode_full(1)?;
/// for warning in image.warnings() {
///     eprintln!("damaged tile: {warning}");
/// }
/// # Ok(())
/// # }
/// ```
///
/// A grid's descriptor and tile list are read once per decoder and reused by
/// later calls, so decoding a grid tile by tile reads its payload only once.
pub struct GridDecoder<'a> {
    container: &'a dyn ImageContainer,
    codec: &'a dyn TileDecoder,
    config: DecodeConfig,
    layouts: Mutex<HashMap<ItemId, Arc<GridLayout>>>,
}

impl<'a> GridDecoder<'a> {
    pub fn new(container: &'a dyn ImageContainer, codec: &'a dyn TileDecoder, config: DecodeConfig) -> Self {
        Self { container, codec, config, layouts: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Decode every tile of `grid` and compose them into one image.
    pub fn decode_full(&self, grid: ItemId) -> Result<PixelImage> {
        self.decode_full_with(grid, &Unstoppable, &NoProgress)
    }

    /// [`Self::decode_full`] with cooperative cancellation and progress reporting.
    ///
    /// `stop` is polled before each tile is started. Once it fires, no more
    /// tiles are started, running ones finish, and [`Error::Stopped`] is returned.
    pub fn decode_full_with(&self, grid: ItemId, stop: &(dyn Stop + Sync), progress: &dyn Progress) -> Result<PixelImage> {
        let processed = self.enter_grid(grid)?;
        self.decode_grid(grid, &processed, self.config.max_threads, stop, progress)
    }

    /// Decode only the tile at column `tile_x`, row `tile_y` of `grid`.
    pub fn decode_region(&self, grid: ItemId, tile_x: u32, tile_y: u32) -> Result<PixelImage> {
        self.decode_region_with(grid, tile_x, tile_y, &Unstoppable)
    }

    pub fn decode_region_with(&self, grid: ItemId, tile_x: u32, tile_y: u32, stop: &(dyn Stop + Sync)) -> Result<PixelImage> {
        let processed = self.enter_grid(grid)?;
        let layout = self.resolve_layout(grid)?;
        let columns = u32::from(layout.descriptor.columns());
        if tile_x >= columns || tile_y >= u32::from(layout.descriptor.rows()) {
            return Err(Error::InvalidData("tile position outside the grid"));
        }

        let index = tile_y as usize * columns as usize + tile_x as usize;
        let tile = layout.tiles.get(index).ok_or(Error::InvalidData("tile position outside the grid"))?;
        if !self.container.is_image(tile) {
            return Err(Error::MissingTileImage(tile));
        }
        stop.check()?;
        self.decode_nested(tile, &processed, stop)
    }

    /// Decode any image item: a grid, an identity-derived item, or a coded image.
    pub fn decode_item(&self, item: ItemId) -> Result<PixelImage> {
        self.decode_item_from(item, &ProcessedIds::new(), self.config.max_threads, &Unstoppable)
    }

    /// Cycle guard and stored-error check for a grid requested by the caller.
    fn enter_grid(&self, grid: ItemId) -> Result<ProcessedIds> {
        let processed = ProcessedIds::new().with(grid)?;
        if let Some(err) = self.container.item_error(grid) {
            return Err(err);
        }
        if self.container.item_type(grid) != Some(item_type::GRID) {
            return Err(Error::InvalidData("item is not a grid"));
        }
        Ok(processed)
    }

    /// Decode an item reached from inside another one. Nested grids run on the calling thread.
    fn decode_nested(&self, item: ItemId, processed: &ProcessedIds, stop: &(dyn Stop + Sync)) -> Result<PixelImage> {
        self.decode_item_from(item, processed, 0, stop)
    }

    /// Decode `item`, reached through the items in `processed`.
    fn decode_item_from(
        &self,
        item: ItemId,
        processed: &ProcessedIds,
        max_threads: u32,
        stop: &(dyn Stop + Sync),
    ) -> Result<PixelImage> {
        let processed = processed.with(item)?;
        if let Some(err) = self.container.item_error(item) {
            return Err(err);
        }
        match self.container.item_type(item) {
            Some(t) if t == item_type::GRID => self.decode_grid(item, &processed, max_threads, stop, &NoProgress),
            Some(t) if t == item_type::IDENTITY => {
                let sources = self.container.references(item, reference_type::DERIVED_IMAGE);
                let [source] = sources.as_slice() else {
                    return Err(Error::InvalidData("identity item must have exactly one source image"));
                };
                self.decode_item_from(*source, &processed, max_threads, stop)
            },
            Some(_) if self.container.is_image(item) => self.codec.decode(item, &self.config, &processed),
            _ => Err(Error::MissingTileImage(item)),
        }
    }

    /// Descriptor and tile list of `grid`, parsed on first use. Failures are not cached.
    fn resolve_layout(&self, grid: ItemId) -> Result<Arc<GridLayout>> {
        let limits = self.config.limits();
        if let Some(layout) = lock(&self.layouts)?.get(&grid).cloned() {
            limits.validate_tile_count(layout.descriptor.tile_count())?;
            return Ok(layout);
        }

        let descriptor = GridDescriptor::parse(&self.container.item_data(grid)?)?;
        limits.validate_tile_count(descriptor.tile_count())?;
        let tiles = TileReferenceList::resolve(grid, &descriptor, self.container)?;
        debug!(
            "Grid {grid}: {}×{} tiles, {}×{} output",
            descriptor.columns(),
            descriptor.rows(),
            descriptor.output_width(),
            descriptor.output_height()
        );
        let layout = Arc::new(GridLayout { descriptor, tiles });
        Ok(Arc::clone(lock(&self.layouts)?.entry(grid).or_insert(layout)))
    }

    /// `processed` already contains `grid`.
    fn decode_grid(
        &self,
        grid: ItemId,
        processed: &ProcessedIds,
        max_threads: u32,
        stop: &(dyn Stop + Sync),
        progress: &dyn Progress,
    ) -> Result<PixelImage> {
        let layout = self.resolve_layout(grid)?;
        let descriptor = &layout.descriptor;
        let mut compositor =
            CanvasCompositor::new(descriptor.output_width(), descriptor.output_height(), &self.config.limits())?;

        let first = layout.tiles.get(0).ok_or(Error::InvalidData("grid has no tiles"))?;
        if !self.container.is_image(first) {
            return Err(Error::MissingTileImage(first));
        }
        let tile_size = self
            .container
            .image_extents(first)
            .filter(|e| e.width > 0 && e.height > 0)
            .ok_or(Error::InvalidData("grid tile has no size"))?;
        check_coverage(descriptor, tile_size)?;

        let warnings = WarningList::new();
        let jobs = self.plan_jobs(grid, &layout, tile_size, &warnings)?;
        let total = u32::try_from(jobs.len())?;
        let (first_job, rest) = jobs.split_first().ok_or(Error::InvalidData("grid has no decodable tiles"))?;

        // Tile 0 runs alone so that it, and no later tile, fixes the canvas
        // format. Its failures are fatal in both modes.
        stop.check()?;
        let mut tile = self.decode_tile(first_job, processed, tile_size, stop)?;
        compositor.paste(&tile, first_job.x0, first_job.y0)?;
        warnings.extend(tile.take_warnings())?;
        let completed = Mutex::new(1u32);
        progress.tile_completed(1, total);

        let bands = compositor.bands(tile_size.height)?;
        run_jobs(rest, max_threads, stop, |job| {
            let pasted = self.decode_tile(job, processed, tile_size, stop).and_then(|mut tile| {
                bands.paste(&tile, job.x0, job.y0)?;
                Ok(tile.take_warnings())
            });
            match pasted {
                Ok(tile_warnings) => warnings.extend(tile_warnings)?,
                Err(err) if self.config.lenient && !err.is_always_fatal() => {
                    warn!("Grid {grid}: skipping tile {} (item {}): {err}", job.index, job.tile);
                    warnings.push(err)?;
                },
                Err(err) => return Err(err),
            }
            let mut completed = lock(&completed)?;
            *completed += 1;
            progress.tile_completed(*completed, total);
            Ok(())
        })?;
        drop(bands);

        let mut canvas = compositor.into_image().ok_or(Error::InvalidData("grid has no decodable tiles"))?;
        for warning in warnings.into_vec()? {
            canvas.add_warning(warning);
        }
        if !canvas.warnings().is_empty() {
            debug!("Grid {grid}: decoded with {} warnings", canvas.warnings().len());
        }
        Ok(canvas)
    }

    /// Row-major jobs for every tile that is an image. Others fail the decode,
    /// or become warnings in lenient mode.
    fn plan_jobs(
        &self,
        grid: ItemId,
        layout: &GridLayout,
        tile_size: ImageSpatialExtents,
        warnings: &WarningList,
    ) -> Result<std::vec::Vec<TileJob>> {
        let columns = usize::from(layout.descriptor.columns());
        let mut jobs = std::vec::Vec::new();
        jobs.try_reserve_exact(layout.tiles.len())?;

        let (mut x0, mut y0) = (0u32, 0u32);
        for (index, &tile) in layout.tiles.as_slice().iter().enumerate() {
            if self.container.is_image(tile) {
                jobs.push(TileJob { index, tile, x0, y0 });
            } else if index != 0 && self.config.lenient {
                warn!("Grid {grid}: tile {index} (item {tile}) is not an image");
                warnings.push(Error::MissingTileImage(tile))?;
            } else {
                return Err(Error::MissingTileImage(tile));
            }

            if (index + 1) % columns == 0 {
                x0 = 0;
                y0 = y0.saturating_add(tile_size.height);
            } else {
                x0 = x0.saturating_add(tile_size.width);
            }
        }
        Ok(jobs)
    }

    fn decode_tile(
        &self,
        job: &TileJob,
        processed: &ProcessedIds,
        tile_size: ImageSpatialExtents,
        stop: &(dyn Stop + Sync),
    ) -> Result<PixelImage> {
        let tile = self.decode_nested(job.tile, processed, stop)?;
        if tile.width() != tile_size.width || tile.height() != tile_size.height {
            return Err(Error::InvalidData("grid tiles have different sizes"));
        }
        Ok(tile)
    }
}

/// The tiles must cover the output, and every tile must start inside it.
fn check_coverage(descriptor: &GridDescriptor, tile: ImageSpatialExtents) -> Result<()> {
    let columns = u64::from(descriptor.columns());
    let rows = u64::from(descriptor.rows());
    let (width, height) = (u64::from(descriptor.output_width()), u64::from(descriptor.output_height()));
    let (tile_width, tile_height) = (u64::from(tile.width), u64::from(tile.height));

    if columns * tile_width < width || rows * tile_height < height {
        return Err(Error::InvalidData("grid tiles do not cover the output image"));
    }
    if (columns - 1) * tile_width >= width || (rows - 1) * tile_height >= height {
        return Err(Error::InvalidData("grid tiles extend past the output image"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_ids_reject_repeats() {
        let root = ProcessedIds::new().with(1).unwrap();
        let branch = root.with(2).unwrap();
        assert!(branch.contains(1) && branch.contains(2));
        assert_eq!(root.len(), 1);
        assert_eq!(branch.with(1), Err(Error::CyclicReference(1)));
        // siblings extend their own copies
        assert!(root.with(2).is_ok());
    }

    #[test]
    fn warning_list_collects_across_threads() {
        let warnings = WarningList::new();
        std::thread::scope(|s| {
            for id in 0..8 {
                let warnings = &warnings;
                s.spawn(move || warnings.push(Error::MissingTileImage(id)).unwrap());
            }
        });
        warnings.extend(std::vec![Error::ChromaFormatMismatch]).unwrap();
        assert_eq!(warnings.len(), Ok(9));
        let mut all = warnings.into_vec().unwrap();
        all.retain(|w| matches!(w, Error::MissingTileImage(_)));
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn progress_counter_keeps_latest() {
        let counter = ProgressCounter::new();
        counter.tile_completed(1, 4);
        counter.tile_completed(2, 4);
        assert_eq!((counter.completed(), counter.total()), (2, 4));
    }

    #[test]
    fn coverage() {
        let grid = GridDescriptor::new(2, 3, 192, 96).unwrap();
        let tile = |width, height| ImageSpatialExtents { width, height };
        assert!(check_coverage(&grid, tile(64, 48)).is_ok());
        // partial edge tiles
        assert!(check_coverage(&grid, tile(65, 49)).is_ok());
        assert_eq!(
            check_coverage(&grid, tile(63, 48)),
            Err(Error::InvalidData("grid tiles do not cover the output image"))
        );
        assert_eq!(
            check_coverage(&grid, tile(96, 48)),
            Err(Error::InvalidData("grid tiles extend past the output image"))
        );
    }
}
