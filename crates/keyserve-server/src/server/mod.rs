pub mod config;
pub mod generator;
pub mod handoff;
pub mod pool;
pub mod reactor;
pub mod registry;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod test_util;
