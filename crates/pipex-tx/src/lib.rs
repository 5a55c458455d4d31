//! # pipex-tx
//!
//! Built-in transformers and the fork-join worker pool.
//!
//! - [`builtins`] — the stream-level operators (`map`, `filter`, `take`,
//!   `batch`, ...), grounded on `operators/funcs.py`.
//! - [`executor`] — [`executor::ForkJoin`], a per-record worker pool that
//!   runs across background threads or background processes, grounded on
//!   `operators/concurrency.py`.
//! - [`spec`] — [`spec::TransformerSpec`], the closed set of built-in
//!   operations that can cross a process boundary.

pub mod builtins;
pub mod executor;
pub mod spec;

pub use builtins::{
    Batch, ChannelMap, Constant, Dup, Done, DropN, Filter, Grep, Map, Preload, SelectChannels,
    Shuffle, Slice, SwitchChannel, Take, Tap, Unbatch,
};
pub use executor::{run_worker_loop, ForkJoin, ProcessWorker, RecordWorker, WORKER_LOOP_FLAG};
pub use spec::TransformerSpec;
