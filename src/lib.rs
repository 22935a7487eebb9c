pub mod engine;
pub mod exchange;
pub mod indicators;
pub mod journal;
pub mod logging;
pub mod position;
pub mod sizing;
pub mod state;
