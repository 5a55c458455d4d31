//! Serializable descriptions of the handful of built-in, per-record
//! operations that hold no closure, so they can cross a process boundary
//! for `on_bg_process` / [`crate::executor::process::ProcessWorker`].
//!
//! Fork-join only ever distributes *per-record* work (each worker gets one
//! record, returns one record) — that's what makes load-balancing across
//! workers and reassembling output order well-defined. Stream-reshaping
//! builtins like `take`/`slice`/`batch`/`grep`/`shuffle` change how many
//! records come out for how many go in, so they run directly in the
//! synchronous chain instead and are never fork-join targets.
//!
//! Grounded on `operators/concurrency.py`'s subprocess path, which pickles a
//! reference to a named function. Rust closures can't be introspected or
//! sent across a process boundary, so process-mode fork-join only accepts
//! this closed, explicit set of descriptions — the original's `bg='process'`
//! could fail at run time on an unpicklable callable; here the same failure
//! mode is a construction-time `PipexError::NotProcessSafe` instead, since
//! [`ForkJoin::on_bg_process`] never accepts anything else in the first
//! place.
//!
//! [`ForkJoin::on_bg_process`]: crate::executor::ForkJoin::on_bg_process

use pipex_core::{AtomValue, Record};
use serde::{Deserialize, Serialize};

/// A built-in per-record operation, named and parameterized so it can be
/// serialized to a child process and reconstructed there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransformerSpec {
    /// Switches the active channel.
    Channel { channel: String },
    /// Copies a channel's atom under a new name.
    Dup { from: String, to: String },
    /// Replaces the active channel's value with a fixed constant.
    Constant { value: AtomValue },
    /// A no-op: returns the record unchanged.
    Done,
}

impl TransformerSpec {
    /// True for `Done`, the one variant with nothing meaningful to do in a
    /// fork-join transformer position (it only makes sense as a terminal
    /// no-op sink).
    pub fn is_sink(&self) -> bool {
        matches!(self, TransformerSpec::Done)
    }

    /// Applies the described operation to a single record. This is the
    /// whole of what a process-mode worker does with each record it reads
    /// off stdin.
    pub fn apply(&self, record: Record) -> anyhow::Result<Record> {
        Ok(match self {
            TransformerSpec::Channel { channel } => record.with_channel(channel),
            TransformerSpec::Dup { from, to } => match record.get_atom(from) {
                Some(atom) => record.with_channel_item(to, atom.clone()),
                None => record,
            },
            TransformerSpec::Constant { value } => record.with_value(value.clone()),
            TransformerSpec::Done => record,
        })
    }
}
