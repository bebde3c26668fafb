pub mod client;
pub mod clock;
pub mod error;
pub mod id;
pub mod interest;
pub mod lagcomp;
pub mod net;
pub mod prediction;
pub mod schema;
pub mod server;
pub mod store;
pub mod tick;
pub mod world;

pub use client::{ClientConfig, ClientEvent, ClientReplicator, ClientTick};
pub use clock::{ClockConfig, ClockSync, FixedTimestep, InterpDescriptor};
pub use error::{FragmentError, IdError, MalformedUpdate, RegistryError, ResyncRequired, StoreError};
pub use id::{ClientId, IdAllocator, NetworkId, OwnerTag, PlayerId};
pub use interest::{Aabb, AlwaysRelevant, InterestConfig, InterestManager, RelevanceHook, SpatialIndex};
pub use lagcomp::{
    ColliderFrame, FireQuery, FrameFlags, HitOutcome, Hitbox, LagCompConfig, LagCompensator,
    ProjectileSpawn, Transform,
};
pub use net::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, DeliveryOutcome, InputCommand, NetworkEndpoint, Packet,
    PacketError, PacketHeader, PacketType, UpdateKind,
};
pub use prediction::{
    PredictionConfig, PredictionContext, PredictionEngine, PredictionTag, Simulation,
};
pub use schema::{ComponentKind, ComponentRegistry, ComponentValue, FieldKind, FieldValue};
pub use server::{OutboundUpdate, ServerConfig, ServerReplicator};
pub use store::{StateStore, StoreConfig};
pub use tick::Tick;
pub use world::{ComponentSource, RemoteSink, ReplicatedWorld};
