use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

use super::field::FieldKind;
use super::layout::{ComponentLayout, ComponentValue, SlotLayout};

pub const MAX_COMPONENT_KINDS: usize = 32;

/// Registration index of a replicated component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKind(u8);

impl ComponentKind {
    pub const fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_COMPONENT_KINDS);
        Self(index as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn bit(self) -> u32 {
        1 << self.0
    }
}

/// Iterates the kinds named by a component mask in ascending order.
pub fn kinds_in_mask(mask: u32) -> impl Iterator<Item = ComponentKind> {
    (0..MAX_COMPONENT_KINDS)
        .filter(move |i| mask & (1 << i) != 0)
        .map(ComponentKind::from_index)
}

#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub kind: ComponentKind,
    pub layout: ComponentLayout,
    /// Must reach a client at least once before the entity counts as spawned there.
    pub required: bool,
}

/// Fixed set of replicated component types. Frozen once shared.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: Vec<ComponentDescriptor>,
    by_name: HashMap<String, ComponentKind>,
    slot: SlotLayout,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        fields: &[FieldKind],
        required: bool,
    ) -> Result<ComponentKind, RegistryError> {
        if self.components.len() >= MAX_COMPONENT_KINDS {
            return Err(RegistryError::TooManyKinds(MAX_COMPONENT_KINDS));
        }
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let layout = ComponentLayout::new(fields)?;
        let kind = ComponentKind::from_index(self.components.len());
        self.components.push(ComponentDescriptor {
            name: name.to_string(),
            kind,
            layout,
            required,
        });
        self.by_name.insert(name.to_string(), kind);

        let layouts: Vec<&ComponentLayout> = self.components.iter().map(|c| &c.layout).collect();
        self.slot = SlotLayout::build(&layouts);

        Ok(kind)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn kind(&self, name: &str) -> Option<ComponentKind> {
        self.by_name.get(name).copied()
    }

    pub fn descriptor(&self, kind: ComponentKind) -> Result<&ComponentDescriptor, RegistryError> {
        self.components
            .get(kind.index())
            .ok_or(RegistryError::UnknownKind(kind))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.components.iter()
    }

    pub fn slot_layout(&self) -> &SlotLayout {
        &self.slot
    }

    pub fn all_mask(&self) -> u32 {
        match self.components.len() {
            MAX_COMPONENT_KINDS => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    pub fn required_mask(&self) -> u32 {
        self.components
            .iter()
            .filter(|c| c.required)
            .fold(0, |mask, c| mask | c.kind.bit())
    }

    pub fn encoded_size(&self, kind: ComponentKind) -> Result<usize, RegistryError> {
        Ok(self.descriptor(kind)?.layout.size())
    }

    pub fn encode(
        &self,
        kind: ComponentKind,
        value: &ComponentValue,
    ) -> Result<Vec<u8>, RegistryError> {
        let layout = &self.descriptor(kind)?.layout;
        let mut out = vec![0u8; layout.size()];
        layout.write(kind, value, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_fields() -> [FieldKind; 3] {
        [FieldKind::quantized(-512.0, 512.0, 0.01).unwrap(); 3]
    }

    #[test]
    fn test_register_assigns_sequential_kinds() {
        let mut registry = ComponentRegistry::new();
        let pos = registry.register("position", &position_fields(), true).unwrap();
        let hp = registry
            .register("health", &[FieldKind::unsigned(1).unwrap()], false)
            .unwrap();

        assert_eq!(pos.index(), 0);
        assert_eq!(hp.index(), 1);
        assert_eq!(registry.all_mask(), 0b11);
        assert_eq!(registry.required_mask(), 0b01);
        assert_eq!(registry.kind("health"), Some(hp));
    }

    #[test]
    fn test_duplicate_and_overflow_rejected() {
        let mut registry = ComponentRegistry::new();
        for i in 0..MAX_COMPONENT_KINDS {
            registry
                .register(&format!("c{i}"), &[FieldKind::Flag], false)
                .unwrap();
        }
        assert_eq!(registry.all_mask(), u32::MAX);
        assert!(matches!(
            registry.register("c0", &[FieldKind::Flag], false),
            Err(RegistryError::TooManyKinds(_))
        ));

        let mut fresh = ComponentRegistry::new();
        fresh.register("a", &[FieldKind::Flag], false).unwrap();
        assert!(matches!(
            fresh.register("a", &[FieldKind::Flag], false),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_kinds_in_mask_ascending() {
        let kinds: Vec<usize> = kinds_in_mask(0b1010_0001).map(|k| k.index()).collect();
        assert_eq!(kinds, vec![0, 5, 7]);
    }
}
