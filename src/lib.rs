//! Consignment Migrator Library
//!
//! Moves members' sales and installments from the legacy MySQL store into the
//! normalized PostgreSQL schema: reference loading, key resolution across the
//! two key spaces, partitioned parallel load with idempotent writes,
//! checkpoint/resume, retry with backoff and a final integrity check.
//!
//! # Modules
//!
//! - `checkpoint`: Durable per-worker progress and resume.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `errors`: Error handling types.
//! - `models`: Legacy rows, destination rows and natural keys.
//! - `partition`: Splitting id ranges across workers.
//! - `pipeline`: Phase orchestration and the worker pool.
//! - `progress`: Progress events, aggregation and reporting.
//! - `reference`: Reference data shared by all workers.
//! - `resolver`: Legacy natural key to destination key resolution.
//! - `retry`: Timeouts and exponential backoff.
//! - `store`: Source and destination store interfaces.
//! - `transform`: Legacy window to destination rows.
//! - `verify`: Post-run row count verification.
//! - `worker`: Per-range read/transform/write loop.
//! - `writer`: Bulk insert with per-row fallback.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod reference;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod transform;
pub mod verify;
pub mod worker;
pub mod writer;
