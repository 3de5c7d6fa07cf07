// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use arrayvec::ArrayVec;

use crate::{Error, Result, ToUsize, TryVec};

/// Chroma sampling of an image's colour planes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl Chroma {
    /// log2 of the horizontal and vertical chroma subsampling factors
    pub fn subsampling(self) -> (u8, u8) {
        match self {
            Self::Yuv420 => (1, 1),
            Self::Yuv422 => (1, 0),
            Self::Monochrome | Self::Yuv444 => (0, 0),
        }
    }

    pub fn has_chroma_planes(self) -> bool {
        self != Self::Monochrome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub chroma: Chroma,
    /// 8, 10, 12 or 16
    pub bit_depth: u8,
}

impl PixelFormat {
    pub fn new(chroma: Chroma, bit_depth: u8) -> Self {
        Self { chroma, bit_depth }
    }

    /// Samples deeper than 8 bits are stored as little-endian `u16`.
    pub fn bytes_per_sample(&self) -> usize {
        if self.bit_depth > 8 { 2 } else { 1 }
    }

    pub(crate) fn max_sample_value(&self) -> u16 {
        ((1u32 << self.bit_depth.clamp(1, 16)) - 1) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Y,
    Cb,
    Cr,
    Alpha,
}

/// One channel of samples, row-major, `stride` bytes per row.
#[derive(Debug)]
pub struct Plane {
    channel: Channel,
    width: u32,
    height: u32,
    bytes_per_sample: usize,
    stride: usize,
    data: TryVec<u8>,
}

impl Plane {
    fn allocate(channel: Channel, width: u32, height: u32, bytes_per_sample: usize) -> Result<Self> {
        let stride = width
            .to_usize()
            .checked_mul(bytes_per_sample)
            .ok_or(Error::OutOfMemory)?;
        let len = stride.checked_mul(height.to_usize()).ok_or(Error::OutOfMemory)?;
        let mut data = std::vec::Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0);
        Ok(Self { channel, width, height, bytes_per_sample, stride, data: data.into() })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y.to_usize() * self.stride;
        &self.data[start..start + self.stride]
    }

    pub fn sample(&self, x: u32, y: u32) -> u16 {
        let at = y.to_usize() * self.stride + x.to_usize() * self.bytes_per_sample;
        if self.bytes_per_sample == 2 {
            u16::from_le_bytes([self.data[at], self.data[at + 1]])
        } else {
            u16::from(self.data[at])
        }
    }

    /// Set every sample to `value`.
    pub fn fill(&mut self, value: u16) {
        if self.bytes_per_sample == 2 {
            let bytes = value.to_le_bytes();
            for pair in self.data.chunks_exact_mut(2) {
                pair.copy_from_slice(&bytes);
            }
        } else {
            self.data.iter_mut().for_each(|b| *b = value as u8);
        }
    }
}

/// A decoded image: colour planes, an optional alpha plane, and any
/// non-fatal problems met while producing it.
#[derive(Debug)]
pub struct PixelImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: ArrayVec<Plane, 4>,
    warnings: std::vec::Vec<Error>,
}

impl PixelImage {
    /// Allocate an image with zeroed colour planes.
    ///
    /// If `with_alpha` is set, the alpha plane starts fully opaque.
    pub fn new(width: u32, height: u32, format: PixelFormat, with_alpha: bool) -> Result<Self> {
        let bps = format.bytes_per_sample();
        let mut planes = ArrayVec::new();
        planes.push(Plane::allocate(Channel::Y, width, height, bps)?);
        if format.chroma.has_chroma_planes() {
            let (sx, sy) = format.chroma.subsampling();
            let chroma_width = width.div_ceil(1 << sx);
            let chroma_height = height.div_ceil(1 << sy);
            planes.push(Plane::allocate(Channel::Cb, chroma_width, chroma_height, bps)?);
            planes.push(Plane::allocate(Channel::Cr, chroma_width, chroma_height, bps)?);
        }
        if with_alpha {
            let mut alpha = Plane::allocate(Channel::Alpha, width, height, bps)?;
            alpha.fill(format.max_sample_value());
            planes.push(alpha);
        }
        Ok(Self { width, height, format, planes, warnings: std::vec::Vec::new() })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn has_alpha(&self) -> bool {
        self.plane(Channel::Alpha).is_some()
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, channel: Channel) -> Option<&Plane> {
        self.planes.iter().find(|p| p.channel == channel)
    }

    pub fn plane_mut(&mut self, channel: Channel) -> Option<&mut Plane> {
        self.planes.iter_mut().find(|p| p.channel == channel)
    }

    pub(crate) fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    /// Non-fatal errors collected while decoding this image in lenient mode.
    pub fn warnings(&self) -> &[Error] {
        &self.warnings
    }

    pub fn add_warning(&mut self, warning: Error) {
        self.warnings.push(warning);
    }

    pub(crate) fn take_warnings(&mut self) -> std::vec::Vec<Error> {
        std::mem::take(&mut self.warnings)
    }
}
