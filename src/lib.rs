#![deny(clippy::all)]

pub mod app;
pub mod config;
pub mod metadata;
pub mod object;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod utils;
pub mod worker;
