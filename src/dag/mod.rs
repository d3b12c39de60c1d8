//! Phase dependency graph: construction, inference, and eligibility queries.
//!
//! ```no_run
//! use nebula::dag::builder::DagBuilder;
//!
//! # fn example(phases: Vec<nebula::phase::PhaseSpec>) -> anyhow::Result<()> {
//! let graph = DagBuilder::new(phases).build()?;
//! let waves = nebula::dag::scheduler::waves(&graph);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod scheduler;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use scheduler::{resolve_eligible, resolve_speculative, tracks, waves, TrackerSnapshot};
