pub mod app;
pub mod balancer;
pub mod config;
pub mod reconcile;
pub mod resolver;
pub mod signal;
pub mod supervisor;
pub mod target;
pub mod trace;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use target::{Target, TargetSet};
