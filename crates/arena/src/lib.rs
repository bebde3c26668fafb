//! Shared rules of the demo arena: the component schema, the input codec and
//! the movement rules both the server and the predicting client run.

mod input;
mod rules;
mod schema;
mod sim;

pub use input::{ArenaInput, Buttons};
pub use rules::ArenaRules;
pub use schema::ArenaSchema;
pub use sim::ArenaSim;
