//! The fabric: the per-epoch coordination substrate.
//!
//! Entanglements, file claims, discoveries, and pulses are exchanged between
//! concurrently running phases through a single `rusqlite` connection opened
//! in WAL mode and guarded by an async `Mutex`, matching the corpus's
//! actor-over-shared-state idiom for its own sqlite-backed stores.

mod store;
mod types;

pub use store::Fabric;
pub use types::{
    Discovery, DiscoveryKind, Entanglement, EntanglementKind, EntanglementStatus, FileClaim,
    PhaseState, Pulse, PulseKind,
};
