//! The fork-join worker pool: parallelizes a per-record function across
//! either background threads ([`engine::ForkJoin::threaded`] /
//! [`engine::ForkJoin::parallel`]) or background processes
//! ([`engine::ForkJoin::on_bg_process`]), grounded on
//! `operators/concurrency.py`.

pub mod engine;
pub mod process;
pub mod worker;

pub use engine::ForkJoin;
pub use process::{run_worker_loop, ProcessWorker, WORKER_LOOP_FLAG};
pub use worker::RecordWorker;
