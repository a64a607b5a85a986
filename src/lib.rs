//! # Cleaver
//!
//! A chunked batch execution engine: split oversized inputs into ordered
//! chunks, process them sequentially or with bounded parallelism under a
//! retry policy, watch coalesced progress, and merge per-chunk results back
//! into one ordered output.
//!
//! ## Usage
//!
//! ```
//! use cleaver::driver::BatchDriver;
//! use cleaver::options::BatchOptions;
//! use cleaver::scheduler::processor;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let options = BatchOptions::new().with_max_chunk_size(2000).with_parallel(4);
//! let mut driver = BatchDriver::new(
//!     options,
//!     processor(|chunk: String, _index| async move { Ok(chunk.to_uppercase()) }),
//! );
//!
//! driver.supply("input far too large for one request...").await;
//! driver.start().await;
//! let snapshot = driver.join().await;
//! assert!(snapshot.completed_clean());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `chunk` - Boundary-aware splitting of text, slices, and byte ranges
//! - `driver` - Stateful facade over splitting, scheduling, and merging
//! - `error` - Typed errors for batch runs, merging, and protocol phases
//! - `instrument` - Per-label timing and digest-keyed result memoization
//! - `job` - Batch job state, phase machine, and failure records
//! - `merge` - Order-preserving result merging with a default decision table
//! - `options` - Serializable options surface for drivers and schedulers
//! - `progress` - Coalescing progress snapshots over a watch channel
//! - `retry` - Configurable backoff, error matchers, and attempt history
//! - `scheduler` - Sequential and bounded-parallel chunk scheduling
//! - `transport` - Chunked send and three-phase upload protocols
pub mod chunk;
pub mod driver;
pub mod error;
pub mod instrument;
pub mod job;
pub mod merge;
pub mod options;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod transport;
