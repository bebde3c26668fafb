mod field;
mod layout;
mod registry;

pub use field::{FieldKind, FieldValue};
pub use layout::{ComponentLayout, ComponentValue, FieldSlot, SlotLayout};
pub use registry::{
    ComponentDescriptor, ComponentKind, ComponentRegistry, MAX_COMPONENT_KINDS, kinds_in_mask,
};
