pub mod counters;
pub mod engine;
pub mod process;
pub mod samples;

pub use engine::{StatsEngine, StatsSnapshot};
