pub mod cache;
pub mod engine;
pub mod metrics;
pub mod packet;
pub mod tasks;

pub use engine::{DhcpEngine, EngineConfig};
pub use metrics::MessageCounters;
