//! Assemble a grid from synthetic tiles, then decode it back
//!
//! Usage: compose_grid [columns] [rows] [threads]
use std::env;

use zenheif_grid::{
    Channel, Chroma, DecodeConfig, GridAssembler, GridDecoder, ImageContainer, ItemId, MemoryContainer, PixelFormat,
    PixelImage, ProcessedIds, ProgressCounter, TileDecoder, Unstoppable, item_type,
};

const TILE_WIDTH: u32 = 256;
const TILE_HEIGHT: u32 = 192;

/// Stands in for a real AV1/HEVC decoder: fills each tile with a horizontal ramp.
struct RampDecoder<'a> {
    file: &'a MemoryContainer,
}

impl TileDecoder for RampDecoder<'_> {
    fn decode(&self, tile: ItemId, _: &DecodeConfig, _: &ProcessedIds) -> zenheif_grid::Result<PixelImage> {
        let size = self
            .file
            .image_extents(tile)
            .ok_or(zenheif_grid::Error::InvalidData("tile has no ispe"))?;
        let mut image = PixelImage::new(size.width, size.height, PixelFormat::new(Chroma::Yuv420, 8), false)?;
        if let Some(luma) = image.plane_mut(Channel::Y) {
            let stride = luma.stride();
            for (i, px) in luma.data_mut().iter_mut().enumerate() {
                *px = ((i % stride) as u32 * 255 / size.width) as u8 ^ (tile as u8).wrapping_mul(37);
            }
        }
        Ok(image)
    }
}

fn arg(args: &[String], index: usize, default: u32) -> u32 {
    args.get(index).and_then(|a| a.parse().ok()).unwrap_or(default)
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let columns = arg(&args, 1, 4);
    let rows = arg(&args, 2, 3);
    let threads = arg(&args, 3, 4);

    // the last column and row are cropped by a third of a tile
    let output_width = columns.saturating_mul(TILE_WIDTH).saturating_sub(TILE_WIDTH / 3);
    let output_height = rows.saturating_mul(TILE_HEIGHT).saturating_sub(TILE_HEIGHT / 3);

    let mut file = MemoryContainer::new();
    let tiles: Vec<ItemId> = (0..columns * rows)
        .map(|_| file.add_image(item_type::AV01, TILE_WIDTH, TILE_HEIGHT).expect("add tile"))
        .collect();

    let mut assembler = GridAssembler::new(&mut file);
    let mut grid = match assembler.create_grid(output_width, output_height, rows, columns) {
        Ok(grid) => grid,
        Err(e) => {
            eprintln!("Cannot create a {columns}×{rows} grid: {e}");
            std::process::exit(1);
        },
    };
    for (i, &tile) in tiles.iter().enumerate() {
        let i = i as u32;
        assembler
            .bind_tile(&mut grid, i % columns, i / columns, tile)
            .expect("bind tile");
    }
    println!("Grid item {}: {:?}", grid.id(), grid.descriptor());
    println!("Top-level items: {:?}", file.top_level_items());

    let codec = RampDecoder { file: &file };
    let config = DecodeConfig::default().with_max_threads(threads);
    let progress = ProgressCounter::new();
    let decoder = GridDecoder::new(&file, &codec, config);
    match decoder.decode_full_with(grid.id(), &Unstoppable, &progress) {
        Ok(image) => {
            println!(
                "Decoded {}×{} {:?} from {}/{} tiles",
                image.width(),
                image.height(),
                image.format().chroma,
                progress.completed(),
                progress.total()
            );
            for plane in image.planes() {
                println!("  {:?}: {}×{}, {} bytes", plane.channel(), plane.width(), plane.height(), plane.data().len());
            }
        },
        Err(e) => {
            eprintln!("Decode error: {e}");
            std::process::exit(1);
        },
    }
}
