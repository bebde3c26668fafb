use std::sync::Arc;

use tessera::{ComponentKind, ComponentRegistry, FieldKind, RegistryError};

/// Registry and component handles of the arena. Both sides must build it the
/// same way; registration order fixes the component indices.
#[derive(Debug, Clone)]
pub struct ArenaSchema {
    pub registry: Arc<ComponentRegistry>,
    pub position: ComponentKind,
    pub velocity: ComponentKind,
    /// Player id of the client steering the entity.
    pub controller: ComponentKind,
    pub health: ComponentKind,
}

impl ArenaSchema {
    pub fn new() -> Result<Self, RegistryError> {
        let mut registry = ComponentRegistry::new();
        let coord = FieldKind::quantized(-512.0, 512.0, 0.01)?;
        let speed = FieldKind::quantized(-64.0, 64.0, 0.01)?;

        let position = registry.register("position", &[coord, coord, coord], true)?;
        let velocity = registry.register("velocity", &[speed, speed, speed], false)?;
        let controller = registry.register("controller", &[FieldKind::unsigned(2)?], false)?;
        let health = registry.register("health", &[FieldKind::unsigned(1)?], false)?;

        Ok(Self {
            registry: Arc::new(registry),
            position,
            velocity,
            controller,
            health,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let a = ArenaSchema::new().unwrap();
        let b = ArenaSchema::new().unwrap();
        assert_eq!(a.position, b.position);
        assert_eq!(a.health, b.health);
        assert_eq!(a.registry.required_mask(), a.position.bit());
        assert_eq!(a.registry.len(), 4);
    }
}
