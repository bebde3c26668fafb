use crate::id::{ClientId, NetworkId};
use crate::schema::ComponentKind;

/// Gameplay visibility override. Changed components are relevant to every
/// client unless the hook hides them.
pub trait RelevanceHook {
    fn is_relevant(&self, client: ClientId, id: NetworkId, kind: ComponentKind) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRelevant;

impl RelevanceHook for AlwaysRelevant {
    fn is_relevant(&self, _client: ClientId, _id: NetworkId, _kind: ComponentKind) -> bool {
        true
    }
}

impl<F> RelevanceHook for F
where
    F: Fn(ClientId, NetworkId, ComponentKind) -> bool,
{
    fn is_relevant(&self, client: ClientId, id: NetworkId, kind: ComponentKind) -> bool {
        self(client, id, kind)
    }
}
