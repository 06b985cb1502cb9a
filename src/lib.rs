//! 6TiSCH low-power mesh discrete-event simulator core.
//!
//! This crate is a library plus a thin CLI binary (`src/bin/sixsim.rs`): the
//! library owns the protocol stack and event-driven engine, the binary only
//! loads configuration, wires collaborators and prints results (spec §1, §6).

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod packet;
pub mod rng;
pub mod time;

pub use config::Config;
pub use engine::Simulation;
pub use error::{DropReason, EngineError};
