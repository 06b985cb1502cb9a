//! External collaborator interfaces (spec §1, §6).
//!
//! These traits are the only contract the core depends on; their concrete
//! algorithms (topology generation, mobility, statistics aggregation,
//! ILP import) are out of scope per spec §1. Each trait ships one default
//! or reference implementation so the crate and its tests are runnable
//! standalone.

pub mod ilp;
pub mod modulation;
pub mod statistics;
pub mod topology;

pub use ilp::{ImportedCell, IlpImporter, NullIlpImporter};
pub use modulation::{Mcs, Modulation, SimpleModulation};
pub use statistics::{CellStats, JsonStatistics, MoteStats, NullStatistics, Statistics};
pub use topology::{LogDistanceTopology, Point, Topology};
