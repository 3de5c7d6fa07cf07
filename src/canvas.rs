// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The output canvas of a full grid decode.
//!
//! The canvas is allocated from the first tile, which fixes its pixel format
//! and whether it has alpha. After that it can be split into one band per tile
//! row, each behind its own lock, so tiles in different rows paste concurrently.

use std::sync::Mutex;

use arrayvec::ArrayVec;
use log::debug;

use crate::image::{Channel, PixelFormat, PixelImage, Plane};
use crate::scheduler::lock;
use crate::{Error, Result, SecurityLimits, ToUsize};

pub(crate) struct CanvasCompositor {
    width: u32,
    height: u32,
    image: Option<PixelImage>,
}

impl CanvasCompositor {
    /// Checks the canvas area against the security ceiling; nothing is allocated yet.
    pub(crate) fn new(width: u32, height: u32, limits: &SecurityLimits<'_>) -> Result<Self> {
        limits.validate_image_size(width, height)?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("grid output size cannot be zero"));
        }
        Ok(Self { width, height, image: None })
    }

    /// Get the canvas, creating it in `first_tile`'s format if no tile has been pasted yet.
    pub(crate) fn ensure_canvas(&mut self, first_tile: &PixelImage) -> Result<&mut PixelImage> {
        let image = match self.image.take() {
            Some(image) => image,
            None => {
                let format = first_tile.format();
                debug!(
                    "Grid canvas: {}×{} {:?} {}-bit{}",
                    self.width,
                    self.height,
                    format.chroma,
                    format.bit_depth,
                    if first_tile.has_alpha() { " with alpha" } else { "" }
                );
                PixelImage::new(self.width, self.height, format, first_tile.has_alpha())?
            },
        };
        Ok(self.image.insert(image))
    }

    /// Copy `tile` into the canvas with its top-left corner at (`x0`, `y0`).
    ///
    /// Parts of the tile outside the canvas are clipped. A tile without alpha
    /// leaves the canvas alpha opaque.
    pub(crate) fn paste(&mut self, tile: &PixelImage, x0: u32, y0: u32) -> Result<()> {
        self.ensure_canvas(tile)?;
        self.bands(0)?.paste(tile, x0, y0)
    }

    /// Split the canvas into bands of `band_height` luma rows.
    ///
    /// A height of 0, or one that would cut through a subsampled chroma row,
    /// gives a single band.
    pub(crate) fn bands(&mut self, band_height: u32) -> Result<CanvasBands<'_>> {
        let image = self.image.as_mut().ok_or(Error::InvalidData("no tile has been pasted"))?;
        let format = image.format();
        let (_, sy) = format.chroma.subsampling();
        let split = band_height > 0 && band_height % (1 << sy) == 0;
        let (band_height, count) = if split {
            (band_height, image.height().div_ceil(band_height))
        } else {
            (image.height(), 1)
        };

        let mut bands: std::vec::Vec<Band<'_>> = (0..count)
            .map(|i| Band { first_row: i.saturating_mul(band_height), planes: ArrayVec::new() })
            .collect();
        for plane in image.planes_mut() {
            let (channel, width, stride) = (plane.channel(), plane.width(), plane.stride());
            let rows = match channel {
                _ if !split => plane.height(),
                Channel::Cb | Channel::Cr => band_height >> sy,
                Channel::Y | Channel::Alpha => band_height,
            };
            let chunk = stride
                .checked_mul(rows.to_usize())
                .filter(|&len| len > 0)
                .ok_or(Error::InvalidData("empty canvas plane"))?;
            for (band, data) in bands.iter_mut().zip(plane.data_mut().chunks_mut(chunk)) {
                let height = u32::try_from(data.len() / stride)?;
                band.planes.push(BandPlane { channel, width, height, stride, data });
            }
        }

        Ok(CanvasBands {
            format,
            band_height,
            bands: bands.into_iter().map(Mutex::new).collect(),
        })
    }

    /// The composed canvas, or `None` if no tile was ever pasted.
    pub(crate) fn into_image(self) -> Option<PixelImage> {
        self.image
    }
}

/// Disjoint row bands of an allocated canvas.
pub(crate) struct CanvasBands<'a> {
    format: PixelFormat,
    band_height: u32,
    bands: std::vec::Vec<Mutex<Band<'a>>>,
}

struct Band<'a> {
    /// First luma row of the canvas covered by this band
    first_row: u32,
    planes: ArrayVec<BandPlane<'a>, 4>,
}

struct BandPlane<'a> {
    channel: Channel,
    width: u32,
    height: u32,
    stride: usize,
    data: &'a mut [u8],
}

impl CanvasBands<'_> {
    /// Same as [`CanvasCompositor::paste`], locking only the band that holds row `y0`.
    ///
    /// The tile must not extend below that band.
    pub(crate) fn paste(&self, tile: &PixelImage, x0: u32, y0: u32) -> Result<()> {
        if tile.format() != self.format {
            return Err(Error::ChromaFormatMismatch);
        }
        let Some(band) = self.bands.get((y0 / self.band_height).to_usize()) else {
            return Ok(());
        };
        let mut band = lock(band)?;
        let first_row = band.first_row;

        let (sx, sy) = self.format.chroma.subsampling();
        let bytes_per_sample = self.format.bytes_per_sample();
        for dst in &mut band.planes {
            let Some(src) = tile.plane(dst.channel) else {
                continue;
            };
            let (x, y) = match dst.channel {
                Channel::Cb | Channel::Cr => (x0 >> sx, (y0 >> sy) - (first_row >> sy)),
                Channel::Y | Channel::Alpha => (x0, y0 - first_row),
            };
            dst.copy_rect(src, x, y, bytes_per_sample);
        }
        Ok(())
    }
}

impl BandPlane<'_> {
    fn copy_rect(&mut self, src: &Plane, x: u32, y: u32, bytes_per_sample: usize) {
        if x >= self.width || y >= self.height {
            return;
        }
        let width = src.width().min(self.width - x).to_usize() * bytes_per_sample;
        let height = src.height().min(self.height - y);
        let dst_x = x.to_usize() * bytes_per_sample;

        for row in 0..height {
            let from = &src.row(row)[..width];
            let start = (y + row).to_usize() * self.stride + dst_x;
            self.data[start..start + width].copy_from_slice(from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DecodeConfig;
    use crate::image::Chroma;

    fn solid(width: u32, height: u32, chroma: Chroma, value: u8, alpha: Option<u8>) -> PixelImage {
        let mut image = PixelImage::new(width, height, PixelFormat::new(chroma, 8), alpha.is_some()).unwrap();
        for channel in [Channel::Y, Channel::Cb, Channel::Cr] {
            if let Some(plane) = image.plane_mut(channel) {
                plane.fill(u16::from(value));
            }
        }
        if let Some(a) = alpha {
            image.plane_mut(Channel::Alpha).unwrap().fill(u16::from(a));
        }
        image
    }

    #[test]
    fn size_is_checked_before_allocation() {
        let config = DecodeConfig::default().with_max_image_size_pixels(1000);
        assert!(matches!(
            CanvasCompositor::new(100, 11, &config.limits()),
            Err(Error::ResourceLimitExceeded(_))
        ));
        assert!(CanvasCompositor::new(0, 10, &DecodeConfig::unlimited().limits()).is_err());
    }

    #[test]
    fn paste_places_tiles_and_clips_edges() {
        let mut compositor = CanvasCompositor::new(6, 4, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(4, 4, Chroma::Yuv420, 10, None), 0, 0).unwrap();
        compositor.paste(&solid(4, 4, Chroma::Yuv420, 20, None), 4, 0).unwrap();

        let canvas = compositor.into_image().unwrap();
        let luma = canvas.plane(Channel::Y).unwrap();
        assert_eq!(luma.row(0), [10, 10, 10, 10, 20, 20]);
        assert_eq!(luma.row(3), [10, 10, 10, 10, 20, 20]);
        let cb = canvas.plane(Channel::Cb).unwrap();
        assert_eq!((cb.width(), cb.height()), (3, 2));
        assert_eq!(cb.row(1), [10, 10, 20]);
    }

    #[test]
    fn first_tile_sets_format() {
        let mut compositor = CanvasCompositor::new(8, 4, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(4, 4, Chroma::Yuv444, 1, None), 4, 0).unwrap();
        assert_eq!(
            compositor.paste(&solid(4, 4, Chroma::Yuv420, 1, None), 0, 0),
            Err(Error::ChromaFormatMismatch)
        );
        let canvas = compositor.into_image().unwrap();
        assert_eq!(canvas.format(), PixelFormat::new(Chroma::Yuv444, 8));
        assert_eq!(canvas.plane(Channel::Y).unwrap().row(0), [0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn alpha_stays_opaque_under_alphaless_tiles() {
        let mut compositor = CanvasCompositor::new(4, 2, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(2, 2, Chroma::Monochrome, 5, Some(7)), 0, 0).unwrap();
        compositor.paste(&solid(2, 2, Chroma::Monochrome, 6, None), 2, 0).unwrap();

        let canvas = compositor.into_image().unwrap();
        assert_eq!(canvas.plane(Channel::Alpha).unwrap().row(1), [7, 7, 255, 255]);
        assert_eq!(canvas.plane(Channel::Y).unwrap().row(1), [5, 5, 6, 6]);
    }

    #[test]
    fn rows_paste_into_separate_bands() {
        let mut compositor = CanvasCompositor::new(16, 14, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(4, 4, Chroma::Yuv420, 1, None), 0, 0).unwrap();
        let tiles: std::vec::Vec<_> = (1..16u8).map(|i| solid(4, 4, Chroma::Yuv420, i + 1, None)).collect();

        let bands = compositor.bands(4).unwrap();
        assert_eq!(bands.bands.len(), 4);
        {
            // a paste into the second tile row does not wait for the first
            let _first_row = bands.bands[0].lock().unwrap();
            bands.paste(&tiles[3], 0, 4).unwrap();
        }
        std::thread::scope(|s| {
            for (i, tile) in tiles.iter().enumerate() {
                let bands = &bands;
                s.spawn(move || {
                    let i = i as u32 + 1;
                    bands.paste(tile, (i % 4) * 4, (i / 4) * 4).unwrap();
                });
            }
        });
        assert_eq!(bands.paste(&solid(4, 4, Chroma::Yuv444, 1, None), 4, 0), Err(Error::ChromaFormatMismatch));
        drop(bands);

        let canvas = compositor.into_image().unwrap();
        let (luma, cr) = (canvas.plane(Channel::Y).unwrap(), canvas.plane(Channel::Cr).unwrap());
        for i in 0..16u32 {
            assert_eq!(luma.sample((i % 4) * 4 + 3, ((i / 4) * 4 + 3).min(13)), (i + 1) as u16);
            assert_eq!(cr.sample((i % 4) * 2 + 1, ((i / 4) * 2 + 1).min(6)), (i + 1) as u16);
        }
    }

    #[test]
    fn odd_band_height_under_vertical_subsampling_is_one_band() {
        let mut compositor = CanvasCompositor::new(6, 6, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(3, 3, Chroma::Yuv420, 1, None), 0, 0).unwrap();
        assert_eq!(compositor.bands(3).unwrap().bands.len(), 1);
        assert_eq!(compositor.bands(2).unwrap().bands.len(), 3);

        let mut compositor = CanvasCompositor::new(6, 6, &DecodeConfig::default().limits()).unwrap();
        compositor.paste(&solid(3, 3, Chroma::Yuv422, 1, None), 0, 0).unwrap();
        assert_eq!(compositor.bands(3).unwrap().bands.len(), 2);
    }

    #[test]
    fn nothing_pasted_means_no_canvas() {
        let mut compositor = CanvasCompositor::new(4, 4, &DecodeConfig::default().limits()).unwrap();
        assert!(compositor.bands(4).is_err());
        assert!(compositor.into_image().is_none());
    }
}
