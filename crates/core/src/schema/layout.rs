use std::ops::Range;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

use super::field::{FieldKind, FieldValue, read_raw, write_raw};
use super::registry::ComponentKind;

/// Decoded value of one component: one entry per registered field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentValue(pub Vec<FieldValue>);

impl ComponentValue {
    pub fn from_vec3(v: Vec3) -> Self {
        Self(vec![
            FieldValue::Float(v.x),
            FieldValue::Float(v.y),
            FieldValue::Float(v.z),
        ])
    }

    pub fn from_quat(q: Quat) -> Self {
        Self(vec![
            FieldValue::Float(q.x),
            FieldValue::Float(q.y),
            FieldValue::Float(q.z),
            FieldValue::Float(q.w),
        ])
    }

    pub fn from_u32(v: u32) -> Self {
        Self(vec![FieldValue::UInt(v)])
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self.0.as_slice() {
            [x, y, z] => Some(Vec3::new(x.as_f32()?, y.as_f32()?, z.as_f32()?)),
            _ => None,
        }
    }

    pub fn as_quat(&self) -> Option<Quat> {
        match self.0.as_slice() {
            [x, y, z, w] => {
                Some(Quat::from_xyzw(x.as_f32()?, y.as_f32()?, z.as_f32()?, w.as_f32()?).normalize())
            }
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.0.as_slice() {
            [v] => v.as_u32(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub kind: FieldKind,
    pub offset: usize,
    pub width: usize,
}

/// Offset table of one component, generated once at registration.
///
/// Each field sits at an offset aligned to its own width; the total size is
/// padded to the component's alignment. Padding bytes are always zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLayout {
    fields: Vec<FieldSlot>,
    size: usize,
    align: usize,
}

impl ComponentLayout {
    pub fn new(fields: &[FieldKind]) -> Result<Self, RegistryError> {
        let mut slots = Vec::with_capacity(fields.len());
        let mut offset = 0;
        let mut align = 1;

        for kind in fields {
            kind.validate()?;
            let width = kind.width();
            offset = align_up(offset, width);
            slots.push(FieldSlot {
                kind: *kind,
                offset,
                width,
            });
            offset += width;
            align = align.max(width);
        }

        Ok(Self {
            fields: slots,
            size: align_up(offset, align),
            align,
        })
    }

    pub fn fields(&self) -> &[FieldSlot] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Serializes `value` into `out`, which must be exactly `size()` bytes.
    pub fn write(
        &self,
        kind: ComponentKind,
        value: &ComponentValue,
        out: &mut [u8],
    ) -> Result<(), RegistryError> {
        if value.0.len() != self.fields.len() {
            return Err(RegistryError::FieldCountMismatch {
                kind,
                expected: self.fields.len(),
                found: value.0.len(),
            });
        }
        debug_assert_eq!(out.len(), self.size);

        out.fill(0);
        for (index, (slot, field)) in self.fields.iter().zip(&value.0).enumerate() {
            let raw = slot.kind.encode(index, *field)?;
            write_raw(&mut out[slot.offset..slot.offset + slot.width], raw);
        }
        Ok(())
    }

    /// Decodes `bytes`; on failure returns the index and raw value of the
    /// first out-of-range field.
    pub fn read(&self, bytes: &[u8]) -> Result<ComponentValue, (usize, u32)> {
        let mut values = Vec::with_capacity(self.fields.len());
        for (index, slot) in self.fields.iter().enumerate() {
            let raw = read_raw(&bytes[slot.offset..slot.offset + slot.width]);
            values.push(slot.kind.decode(raw).ok_or((index, raw))?);
        }
        Ok(ComponentValue(values))
    }
}

/// Per-entity slot layout shared by every snapshot image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotLayout {
    presence_bytes: usize,
    components: Vec<Range<usize>>,
    stride: usize,
}

impl SlotLayout {
    pub(crate) fn build(layouts: &[&ComponentLayout]) -> Self {
        let presence_bytes = layouts.len().div_ceil(8).max(1);
        let mut offset = presence_bytes;
        let mut align = 1;
        let mut components = Vec::with_capacity(layouts.len());

        for layout in layouts {
            offset = align_up(offset, layout.align());
            components.push(offset..offset + layout.size());
            offset += layout.size();
            align = align.max(layout.align());
        }

        Self {
            presence_bytes,
            components,
            stride: align_up(offset, align),
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn presence_bytes(&self) -> usize {
        self.presence_bytes
    }

    /// Byte range of `kind` relative to the slot start.
    pub fn component_range(&self, kind: ComponentKind) -> Option<Range<usize>> {
        self.components.get(kind.index()).cloned()
    }

    /// `(byte offset, bit mask)` of the presence bit for `kind`.
    pub fn presence_bit(&self, kind: ComponentKind) -> (usize, u8) {
        let index = kind.index();
        (index / 8, 1 << (index % 8))
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}
