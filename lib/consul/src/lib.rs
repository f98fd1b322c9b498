mod client;
mod health;
mod kv;

pub use client::{Client, Config, Error, QueryMeta, QueryOptions};
pub use health::{HealthCheck, Node, ServiceEntry, ServiceInfo};
pub use kv::KvPair;
