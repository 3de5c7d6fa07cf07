// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Items, properties and references of a HEIF container, as seen by the grid engine.

use std::borrow::Cow;

use arrayvec::ArrayVec;

use crate::{Error, Result};

/// Opaque handle into the container's item table. 0 is never a valid item.
pub type ItemId = u32;

/// Four-character code used for item types and reference types.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const fn new(value: &[u8; 4]) -> Self {
        Self(*value)
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self(number.to_be_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.0)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.0 == **other
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            std::fmt::Write::write_char(f, c)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{self}'")
    }
}

/// Item types the grid engine cares about.
pub mod item_type {
    use super::FourCC;

    /// Image grid derivation. See ISO/IEC 23008-12:2017 § 6.6.2.3
    pub const GRID: FourCC = FourCC::new(b"grid");
    /// Identity derivation. See ISO/IEC 23008-12:2017 § 6.6.2.1
    pub const IDENTITY: FourCC = FourCC::new(b"iden");
    pub const AV01: FourCC = FourCC::new(b"av01");
    pub const HVC1: FourCC = FourCC::new(b"hvc1");
    pub const JPEG: FourCC = FourCC::new(b"jpeg");
    pub const UNCOMPRESSED: FourCC = FourCC::new(b"unci");
    pub const EXIF: FourCC = FourCC::new(b"Exif");

    pub(crate) fn is_image(item_type: FourCC) -> bool {
        [GRID, IDENTITY, AV01, HVC1, JPEG, UNCOMPRESSED].contains(&item_type)
    }
}

/// Item reference types. See ISO 14496-12:2015 § 8.11.12
pub mod reference_type {
    use super::FourCC;

    /// Derived image: grid tiles, identity sources.
    pub const DERIVED_IMAGE: FourCC = FourCC::new(b"dimg");
    pub const THUMBNAIL: FourCC = FourCC::new(b"thmb");
    pub const AUXILIARY: FourCC = FourCC::new(b"auxl");
}

/// Image spatial extents (dimensions)
/// See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

/// Colour description attached to an image item ('colr').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorInformation {
    Nclx {
        color_primaries: u16,
        transfer_characteristics: u16,
        matrix_coefficients: u16,
        full_range: bool,
    },
    Icc(std::vec::Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemProperty {
    ImageSpatialExtents(ImageSpatialExtents),
    /// Bits per channel ('pixi')
    Channels(ArrayVec<u8, 16>),
    ColorInformation(ColorInformation),
    /// Auxiliary type URN ('auxC')
    AuxiliaryType(std::vec::Vec<u8>),
}

impl ItemProperty {
    /// Properties of a grid that describe its tiles' pixels and are copied from the first tile.
    pub(crate) fn is_shared_with_grid(&self) -> bool {
        matches!(self, Self::Channels(_) | Self::ColorInformation(_))
    }
}

/// Read access to the container's item table.
pub trait ImageContainer: Sync {
    /// `None` if there is no such item.
    fn item_type(&self, item: ItemId) -> Option<FourCC>;

    /// Error recorded for an item while the container was parsed, if any.
    fn item_error(&self, item: ItemId) -> Option<Error>;

    fn item_data(&self, item: ItemId) -> Result<Cow<'_, [u8]>>;

    /// Whether the container has an item reference table ('iref') at all.
    fn has_references(&self) -> bool;

    /// Targets of the `kind` references from `from`, in reference order.
    fn references(&self, from: ItemId, kind: FourCC) -> std::vec::Vec<ItemId>;

    fn properties(&self, item: ItemId) -> &[ItemProperty];

    fn is_image(&self, item: ItemId) -> bool {
        self.item_type(item).is_some_and(item_type::is_image)
    }

    fn image_extents(&self, item: ItemId) -> Option<ImageSpatialExtents> {
        self.properties(item).iter().find_map(|prop| match prop {
            ItemProperty::ImageSpatialExtents(e) => Some(*e),
            _ => None,
        })
    }
}

/// Mutation primitives used when building new items.
pub trait ContainerWriter {
    fn add_new_item(&mut self, item_type: FourCC) -> Result<ItemId>;

    fn append_item_data(&mut self, item: ItemId, data: &[u8]) -> Result<()>;

    /// Append references of type `kind` from `from` to each of `to`.
    fn add_reference(&mut self, from: ItemId, kind: FourCC, to: &[ItemId]) -> Result<()>;

    /// Overwrite the `index`th reference of type `kind` from `from`.
    fn set_reference_at(&mut self, from: ItemId, kind: FourCC, index: usize, to: ItemId) -> Result<()>;

    fn add_property(&mut self, item: ItemId, property: ItemProperty) -> Result<()>;

    /// Hidden items are left out of the top-level item listing.
    fn mark_item_hidden(&mut self, item: ItemId, hidden: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
struct MemoryItem {
    id: ItemId,
    item_type: FourCC,
    data: std::vec::Vec<u8>,
    properties: std::vec::Vec<ItemProperty>,
    hidden: bool,
    error: Option<Error>,
}

#[derive(Debug, Clone)]
struct ItemReference {
    from: ItemId,
    kind: FourCC,
    to: std::vec::Vec<ItemId>,
}

/// In-memory item table implementing both [`ImageContainer`] and [`ContainerWriter`].
///
/// Item ids are assigned sequentially starting at 1.
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    items: std::vec::Vec<MemoryItem>,
    references: Option<std::vec::Vec<ItemReference>>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item of `item_type` with an 'ispe' property of the given size.
    pub fn add_image(&mut self, item_type: FourCC, width: u32, height: u32) -> Result<ItemId> {
        let id = self.add_new_item(item_type)?;
        self.add_property(id, ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width, height }))?;
        Ok(id)
    }

    /// Record a parse error against an item; decoding it will report this error.
    pub fn set_item_error(&mut self, item: ItemId, error: Error) -> Result<()> {
        self.item_mut(item)?.error = Some(error);
        Ok(())
    }

    pub fn is_hidden(&self, item: ItemId) -> bool {
        self.item(item).is_some_and(|i| i.hidden)
    }

    /// Ids of items that are not hidden, in creation order.
    pub fn top_level_items(&self) -> std::vec::Vec<ItemId> {
        self.items.iter().filter(|i| !i.hidden).map(|i| i.id).collect()
    }

    fn item(&self, item: ItemId) -> Option<&MemoryItem> {
        // ids are 1-based and never reused
        let index = item.checked_sub(1)? as usize;
        self.items.get(index).filter(|i| i.id == item)
    }

    fn item_mut(&mut self, item: ItemId) -> Result<&mut MemoryItem> {
        let index = item.checked_sub(1).ok_or(Error::InvalidData("item not found"))? as usize;
        self.items
            .get_mut(index)
            .filter(|i| i.id == item)
            .ok_or(Error::InvalidData("item not found"))
    }
}

impl ImageContainer for MemoryContainer {
    fn item_type(&self, item: ItemId) -> Option<FourCC> {
        self.item(item).map(|i| i.item_type)
    }

    fn item_error(&self, item: ItemId) -> Option<Error> {
        self.item(item).and_then(|i| i.error.clone())
    }

    fn item_data(&self, item: ItemId) -> Result<Cow<'_, [u8]>> {
        self.item(item)
            .map(|i| Cow::Borrowed(i.data.as_slice()))
            .ok_or(Error::InvalidData("item not found"))
    }

    fn has_references(&self) -> bool {
        self.references.is_some()
    }

    fn references(&self, from: ItemId, kind: FourCC) -> std::vec::Vec<ItemId> {
        self.references
            .iter()
            .flatten()
            .filter(|r| r.from == from && r.kind == kind)
            .flat_map(|r| r.to.iter().copied())
            .collect()
    }

    fn properties(&self, item: ItemId) -> &[ItemProperty] {
        self.item(item).map_or(&[], |i| i.properties.as_slice())
    }
}

impl ContainerWriter for MemoryContainer {
    fn add_new_item(&mut self, item_type: FourCC) -> Result<ItemId> {
        let id = ItemId::try_from(self.items.len() + 1).map_err(|_| Error::InvalidData("too many items"))?;
        self.items.try_reserve(1)?;
        self.items.push(MemoryItem {
            id,
            item_type,
            data: std::vec::Vec::new(),
            properties: std::vec::Vec::new(),
            hidden: false,
            error: None,
        });
        Ok(id)
    }

    fn append_item_data(&mut self, item: ItemId, data: &[u8]) -> Result<()> {
        let item = self.item_mut(item)?;
        item.data.try_reserve(data.len())?;
        item.data.extend_from_slice(data);
        Ok(())
    }

    fn add_reference(&mut self, from: ItemId, kind: FourCC, to: &[ItemId]) -> Result<()> {
        self.item_mut(from)?;
        let references = self.references.get_or_insert_with(std::vec::Vec::new);
        if let Some(existing) = references.iter_mut().find(|r| r.from == from && r.kind == kind) {
            existing.to.try_reserve(to.len())?;
            existing.to.extend_from_slice(to);
        } else {
            references.try_reserve(1)?;
            references.push(ItemReference { from, kind, to: to.to_vec() });
        }
        Ok(())
    }

    fn set_reference_at(&mut self, from: ItemId, kind: FourCC, index: usize, to: ItemId) -> Result<()> {
        let slot = self
            .references
            .iter_mut()
            .flatten()
            .find(|r| r.from == from && r.kind == kind)
            .ok_or(Error::InvalidData("reference not found"))?
            .to
            .get_mut(index)
            .ok_or(Error::InvalidData("reference index out of bounds"))?;
        *slot = to;
        Ok(())
    }

    fn add_property(&mut self, item: ItemId, property: ItemProperty) -> Result<()> {
        let item = self.item_mut(item)?;
        item.properties.try_reserve(1)?;
        item.properties.push(property);
        Ok(())
    }

    fn mark_item_hidden(&mut self, item: ItemId, hidden: bool) -> Result<()> {
        self.item_mut(item)?.hidden = hidden;
        Ok(())
    }
}
