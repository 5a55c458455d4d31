//! # pipex-core
//!
//! Foundational types for pipex: the record/atom data model, the
//! `Source`/`Transformer`/`Sink` roles, the chain algebra that composes
//! them, and the error types shared across the workspace.
//!
//! ## Key Components
//!
//! - **Record model**: [`Record`] and [`atom::Atom`], an immutable,
//!   multi-channel unit of data.
//! - **Roles**: [`Source`], [`Transformer`], [`Sink`] — the three things a
//!   chain node can be.
//! - **Chain algebra**: [`chain::AnyChain`], composed with `then` (sequential
//!   attach) and `pipe` (parallel merge).
//! - **Identity hashing**: [`hash::pipex_hash`], used by the bucket store to
//!   decide whether upstream work can be skipped on rewrite.
//!
//! ## Example
//!
//! ```rust
//! use pipex_core::{AnyChain, We};
//!
//! # fn example(source: AnyChain, transformer: AnyChain) -> anyhow::Result<()> {
//! let chain = source.then(transformer)?;
//! let _hash = chain.chain_hash();
//! # Ok(())
//! # }
//! ```

pub mod atom;
pub mod chain;
pub mod context;
pub mod error;
pub mod hash;
pub mod record;
pub mod traits;

pub use atom::{Atom, AtomValue, Format};
pub use chain::{AnyChain, Pipeline, TransformedSink, TransformedSource, TransformerSequence};
pub use context::We;
pub use error::{PipexError, PipexResult};
pub use hash::pipex_hash;
pub use record::Record;
pub use traits::{RecordStream, Sink, Source, Transformer};
