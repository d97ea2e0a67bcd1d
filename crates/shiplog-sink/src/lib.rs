#![warn(missing_docs)]

//! Shiplog durable sink.
//!
//! Log path:   Logger → DurableSink::log → active MappedBuffer
//! Drain path: swap → sink runner → ChunkHeader + items → `{prefix}_{time}.log`
//! Retention:  timer → sink runner → delete oldest `.log` files over budget

pub mod config;
pub mod error;
pub mod logger;
pub mod retention;
pub mod rotation;
pub mod sink;

pub use config::SinkConfig;
pub use error::{SinkError, SinkResult};
pub use logger::{Logger, Sink};
pub use retention::{evict, EvictionReport};
pub use rotation::FileRotator;
pub use shiplog_core::{Level, Location, LogRecord};
pub use sink::{DurableSink, SinkStats};
