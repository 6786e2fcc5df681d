pub mod aggregate;
pub mod cli;
pub mod collector;
pub mod commands;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod model;
pub mod probes;
pub mod report;
pub mod sampler;
pub mod session;

pub use engine::Profiler;
pub use error::{Error, Result};
