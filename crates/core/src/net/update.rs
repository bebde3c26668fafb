//! Byte-exact codec for the body of a server update.
//!
//! ```text
//! flags:u8 | payload (run-length encoded when UpdateFlags::RLE)
//! payload = kind:u8 tick:u32 [base_tick:u32] [acked_input_tick:u32 input_age:i16]
//!           removed:u16 id:u64* rejections:u16 id:u64*
//!           entities:u16 (id:u64 mask:u32 component_bytes*)*
//! ```
//! Component bytes use the registry layout and appear in ascending kind order.

use std::collections::HashSet;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::MalformedUpdate;
use crate::id::NetworkId;
use crate::schema::{ComponentKind, ComponentRegistry, ComponentValue, kinds_in_mask};
use crate::store::rle;
use crate::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum UpdateKind {
    Snapshot = 0,
    #[default]
    Delta = 1,
    Resync = 2,
}

impl UpdateKind {
    pub fn is_full(self) -> bool {
        !matches!(self, Self::Delta)
    }

    fn from_u8(value: u8) -> Result<Self, MalformedUpdate> {
        match value {
            0 => Ok(Self::Snapshot),
            1 => Ok(Self::Delta),
            2 => Ok(Self::Resync),
            other => Err(MalformedUpdate::UnknownKind(other)),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        const RLE = 1 << 0;
        const HAS_BASE = 1 << 1;
        const HAS_INPUT_ACK = 1 << 2;
        /// A full update that holds every entity the client should know.
        const COMPLETE = 1 << 3;
    }
}

/// Clock sample and input acknowledgement piggybacked on an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAck {
    pub tick: Tick,
    /// Ticks the server held that input before consuming it.
    pub age: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateHeader {
    pub kind: UpdateKind,
    pub tick: Tick,
    pub base_tick: Option<Tick>,
    pub input_ack: Option<InputAck>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEntity {
    pub id: NetworkId,
    pub components: Vec<(ComponentKind, ComponentValue)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedUpdate {
    pub kind: UpdateKind,
    pub tick: Tick,
    pub base_tick: Option<Tick>,
    pub input_ack: Option<InputAck>,
    pub complete: bool,
    pub removed: Vec<NetworkId>,
    pub spawn_rejections: Vec<NetworkId>,
    pub entities: Vec<DecodedEntity>,
}

const ENTITY_HEADER_BYTES: usize = 8 + 4;
const ID_BYTES: usize = 8;

/// Serializes one update against a byte budget.
///
/// Everything written counts against the budget before run-length encoding,
/// so the finished body never exceeds it.
pub struct UpdateWriter<'a> {
    registry: &'a ComponentRegistry,
    buf: Vec<u8>,
    budget: usize,
    count_pos: usize,
    entity_count: u16,
    removed_written: usize,
}

impl<'a> UpdateWriter<'a> {
    /// Writes the header. Removals take at most half the budget; the rest
    /// stays queued for a later update (see [`UpdateWriter::removed_written`]).
    pub fn begin(
        registry: &'a ComponentRegistry,
        header: &UpdateHeader,
        removed: &[NetworkId],
        rejections: &[NetworkId],
        budget: usize,
    ) -> Self {
        let mut flags = UpdateFlags::empty();
        flags.set(UpdateFlags::HAS_BASE, header.base_tick.is_some());
        flags.set(UpdateFlags::HAS_INPUT_ACK, header.input_ack.is_some());

        let mut buf = Vec::with_capacity(budget.min(4096));
        buf.push(flags.bits());
        buf.push(header.kind as u8);
        buf.extend_from_slice(&header.tick.to_le_bytes());
        if let Some(base) = header.base_tick {
            buf.extend_from_slice(&base.to_le_bytes());
        }
        if let Some(ack) = header.input_ack {
            buf.extend_from_slice(&ack.tick.to_le_bytes());
            buf.extend_from_slice(&ack.age.to_le_bytes());
        }

        let removal_room = (budget / 2).saturating_sub(buf.len() + 2) / ID_BYTES;
        let removed_written = removed.len().min(removal_room).min(u16::MAX as usize);
        write_ids(&mut buf, &removed[..removed_written]);

        let rejections = &rejections[..rejections.len().min(u16::MAX as usize)];
        write_ids(&mut buf, rejections);

        let count_pos = buf.len();
        buf.extend_from_slice(&0u16.to_le_bytes());

        Self {
            registry,
            buf,
            budget,
            count_pos,
            entity_count: 0,
            removed_written,
        }
    }

    pub fn removed_written(&self) -> usize {
        self.removed_written
    }

    pub fn entity_count(&self) -> u16 {
        self.entity_count
    }

    pub fn written_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.buf.len())
    }

    /// Marks a full update as complete, letting the client drop every
    /// entity it does not list.
    pub fn set_complete(&mut self, complete: bool) {
        let mut flags = UpdateFlags::from_bits_retain(self.buf[0]);
        flags.set(UpdateFlags::COMPLETE, complete);
        self.buf[0] = flags.bits();
    }

    pub fn entity_size(registry: &ComponentRegistry, mask: u32) -> usize {
        ENTITY_HEADER_BYTES
            + kinds_in_mask(mask)
                .filter_map(|kind| registry.encoded_size(kind).ok())
                .sum::<usize>()
    }

    /// Appends one entity record if it fits; `components` must be in
    /// ascending kind order. Returns `false` and writes nothing otherwise.
    pub fn try_push(&mut self, id: NetworkId, components: &[(ComponentKind, &[u8])]) -> bool {
        let size = ENTITY_HEADER_BYTES + components.iter().map(|(_, b)| b.len()).sum::<usize>();
        if size > self.remaining() || self.entity_count == u16::MAX {
            return false;
        }

        let mask = components.iter().fold(0u32, |m, (kind, _)| m | kind.bit());
        self.buf.extend_from_slice(&id.to_bits().to_le_bytes());
        self.buf.extend_from_slice(&mask.to_le_bytes());
        for (kind, bytes) in components {
            debug_assert_eq!(self.registry.encoded_size(*kind).ok(), Some(bytes.len()));
            self.buf.extend_from_slice(bytes);
        }
        self.entity_count += 1;
        true
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf[self.count_pos..self.count_pos + 2]
            .copy_from_slice(&self.entity_count.to_le_bytes());

        let compressed = rle::encode(&self.buf[1..]);
        if compressed.len() + 1 < self.buf.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(self.buf[0] | UpdateFlags::RLE.bits());
            out.extend_from_slice(&compressed);
            out
        } else {
            self.buf
        }
    }
}

fn write_ids(buf: &mut Vec<u8>, ids: &[NetworkId]) {
    buf.extend_from_slice(&(ids.len() as u16).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&id.to_bits().to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedUpdate> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(MalformedUpdate::Truncated {
                offset: self.pos,
                needed: n,
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MalformedUpdate> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MalformedUpdate> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MalformedUpdate> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, MalformedUpdate> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }

    fn id(&mut self) -> Result<NetworkId, MalformedUpdate> {
        let bits = self.u64()?;
        NetworkId::from_bits(bits).map_err(|_| MalformedUpdate::InvalidNetworkId(bits))
    }

    fn ids(&mut self) -> Result<Vec<NetworkId>, MalformedUpdate> {
        let count = self.u16()? as usize;
        (0..count).map(|_| self.id()).collect()
    }
}

/// Decodes and validates an update body. `max_len` bounds RLE expansion.
pub fn decode_update(
    body: &[u8],
    registry: &ComponentRegistry,
    max_len: usize,
) -> Result<DecodedUpdate, MalformedUpdate> {
    let (&flag_byte, rest) = body.split_first().ok_or(MalformedUpdate::Truncated {
        offset: 0,
        needed: 1,
    })?;
    let flags = UpdateFlags::from_bits(flag_byte).ok_or(MalformedUpdate::UnknownFlags(flag_byte))?;

    let expanded;
    let payload = if flags.contains(UpdateFlags::RLE) {
        expanded = rle::decode(rest, max_len)?;
        expanded.as_slice()
    } else {
        rest
    };
    let mut reader = Reader {
        bytes: payload,
        pos: 0,
    };

    let kind = UpdateKind::from_u8(reader.u8()?)?;
    let tick = reader.u32()?;
    let base_tick = match flags.contains(UpdateFlags::HAS_BASE) {
        true => Some(reader.u32()?),
        false => None,
    };
    let input_ack = match flags.contains(UpdateFlags::HAS_INPUT_ACK) {
        true => Some(InputAck {
            tick: reader.u32()?,
            age: reader.u16()? as i16,
        }),
        false => None,
    };
    let removed = reader.ids()?;
    let spawn_rejections = reader.ids()?;

    let count = reader.u16()? as usize;
    let mut seen = HashSet::with_capacity(count);
    let mut entities = Vec::with_capacity(count);
    for _ in 0..count {
        let id = reader.id()?;
        if !seen.insert(id) {
            return Err(MalformedUpdate::DuplicateEntity(id));
        }
        let mask = reader.u32()?;
        if mask & !registry.all_mask() != 0 {
            return Err(MalformedUpdate::UnknownComponents { mask });
        }

        let mut components = Vec::with_capacity(mask.count_ones() as usize);
        for kind in kinds_in_mask(mask) {
            let layout = &registry
                .descriptor(kind)
                .map_err(|_| MalformedUpdate::UnknownComponents { mask })?
                .layout;
            let bytes = reader.take(layout.size())?;
            let value = layout
                .read(bytes)
                .map_err(|(field, raw)| MalformedUpdate::OutOfRange { kind, field, raw })?;
            components.push((kind, value));
        }
        entities.push(DecodedEntity { id, components });
    }

    let trailing = payload.len() - reader.pos;
    if trailing != 0 {
        return Err(MalformedUpdate::TrailingBytes(trailing));
    }

    Ok(DecodedUpdate {
        kind,
        tick,
        base_tick,
        input_ack,
        complete: flags.contains(UpdateFlags::COMPLETE),
        removed,
        spawn_rejections,
        entities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdAllocator, OwnerTag};
    use crate::schema::{FieldKind, FieldValue};

    fn registry() -> (ComponentRegistry, ComponentKind, ComponentKind) {
        let mut registry = ComponentRegistry::new();
        let pos = registry
            .register("position", &[FieldKind::quantized(0.0, 100.0, 0.5).unwrap(); 3], true)
            .unwrap();
        let alive = registry.register("alive", &[FieldKind::Flag], false).unwrap();
        (registry, pos, alive)
    }

    fn header(kind: UpdateKind) -> UpdateHeader {
        UpdateHeader {
            kind,
            tick: 77,
            base_tick: Some(70),
            input_ack: Some(InputAck { tick: 79, age: -2 }),
        }
    }

    #[test]
    fn test_encode_decode_update() {
        let (registry, pos, alive) = registry();
        let mut ids = IdAllocator::new(OwnerTag::SERVER);
        let (a, gone) = (ids.allocate().unwrap(), ids.allocate().unwrap());

        let pos_bytes = registry
            .encode(pos, &ComponentValue(vec![FieldValue::Float(10.0); 3]))
            .unwrap();
        let alive_bytes = registry
            .encode(alive, &ComponentValue(vec![FieldValue::Bool(true)]))
            .unwrap();

        let mut writer =
            UpdateWriter::begin(&registry, &header(UpdateKind::Delta), &[gone], &[], 1200);
        assert!(writer.try_push(a, &[(pos, pos_bytes.as_slice()), (alive, alive_bytes.as_slice())]));
        writer.set_complete(true);
        let body = writer.finish();

        let update = decode_update(&body, &registry, 4096).unwrap();
        assert_eq!(update.kind, UpdateKind::Delta);
        assert!(update.complete);
        assert_eq!(update.tick, 77);
        assert_eq!(update.base_tick, Some(70));
        assert_eq!(update.input_ack, Some(InputAck { tick: 79, age: -2 }));
        assert_eq!(update.removed, vec![gone]);
        assert_eq!(update.entities.len(), 1);
        assert_eq!(update.entities[0].components[1].1, ComponentValue(vec![FieldValue::Bool(true)]));
    }

    #[test]
    fn test_budget_is_respected() {
        let (registry, pos, _) = registry();
        let mut ids = IdAllocator::new(OwnerTag::SERVER);
        let bytes = vec![0u8; registry.encoded_size(pos).unwrap()];

        let mut writer = UpdateWriter::begin(&registry, &header(UpdateKind::Snapshot), &[], &[], 100);
        let mut pushed = 0;
        while writer.try_push(ids.allocate().unwrap(), &[(pos, bytes.as_slice())]) {
            pushed += 1;
        }
        assert!(pushed > 0);
        assert!(writer.written_bytes() <= 100);
        assert!(writer.finish().len() <= 100);
    }

    fn raw_header(kind: UpdateKind) -> Vec<u8> {
        let mut body = vec![0u8, kind as u8];
        body.extend_from_slice(&5u32.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body
    }

    #[test]
    fn test_truncated_and_trailing_rejected() {
        let (registry, _, _) = registry();
        let mut body = raw_header(UpdateKind::Delta);
        body.extend_from_slice(&0u16.to_le_bytes());
        assert!(decode_update(&body, &registry, 4096).is_ok());

        let mut long = body.clone();
        long.push(0);
        assert_eq!(
            decode_update(&long, &registry, 4096),
            Err(MalformedUpdate::TrailingBytes(1))
        );
        assert!(matches!(
            decode_update(&body[..4], &registry, 4096),
            Err(MalformedUpdate::Truncated { .. })
        ));
        assert_eq!(
            decode_update(&[0x80], &registry, 4096),
            Err(MalformedUpdate::UnknownFlags(0x80))
        );
    }

    #[test]
    fn test_unknown_component_mask_rejected() {
        let (registry, _, _) = registry();
        let mut body = raw_header(UpdateKind::Delta);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&1u64.to_le_bytes());
        body.extend_from_slice(&0b100u32.to_le_bytes());

        assert_eq!(
            decode_update(&body, &registry, 4096),
            Err(MalformedUpdate::UnknownComponents { mask: 0b100 })
        );
    }

    #[test]
    fn test_out_of_range_quantized_rejected() {
        let (registry, _, alive) = registry();
        let mut body = raw_header(UpdateKind::Snapshot);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&1u64.to_le_bytes());
        body.extend_from_slice(&alive.bit().to_le_bytes());
        body.push(2);

        assert_eq!(
            decode_update(&body, &registry, 4096),
            Err(MalformedUpdate::OutOfRange {
                kind: alive,
                field: 0,
                raw: 2
            })
        );
    }

    #[test]
    fn test_invalid_id_rejected() {
        let (registry, _, _) = registry();
        let mut body = vec![0u8, UpdateKind::Delta as u8];
        body.extend_from_slice(&5u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());

        assert_eq!(
            decode_update(&body, &registry, 4096),
            Err(MalformedUpdate::InvalidNetworkId(0))
        );
    }
}
