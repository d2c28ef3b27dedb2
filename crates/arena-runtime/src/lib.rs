//! # arena-runtime
//!
//! Queue backends and the async aggregator for Arena Fleet.
//!
//! `arena-core` knows how a single work item moves through its lifecycle and
//! how results are parsed and folded. This crate supplies the I/O around it:
//!
//! - [`WorkQueue`]: the queue contract, with an in-process [`MemoryQueue`]
//!   and a shared-store `RedisQueue` (feature `redis`, on by default)
//! - [`Aggregator`]: reads a job's terminal items with bounded timeouts and
//!   produces the job report
//! - [`ArenaConfig`]: YAML/JSON configuration selecting the backend
//!
//! ## Example
//!
//! ```rust,ignore
//! use arena_runtime::{connect_queue, Aggregator, ArenaConfig};
//!
//! let config = ArenaConfig::from_file("arena.yaml")?;
//! let queue = connect_queue(&config.queue).await?;
//! let aggregator = Aggregator::new(queue, config.aggregator);
//!
//! let summary = aggregator.job_result("job-42").await?;
//! println!("pass rate: {:?}", summary.get("passRate"));
//! ```

pub mod aggregator;
pub mod config;
pub mod queue;

pub use aggregator::{AggregateError, Aggregator};
pub use config::{
    AggregatorConfig, ArenaConfig, ConfigError, QueueBackendConfig, QueueConfig, RedisConfig,
};
pub use queue::{connect_queue, JobProgress, MemoryQueue, QueueError, WorkQueue, LEASE_EXPIRED};
#[cfg(feature = "redis")]
pub use queue::RedisQueue;
