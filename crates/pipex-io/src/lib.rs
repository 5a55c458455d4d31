//! # pipex-io
//!
//! The bucket store: a versioned, identity-cached [`Source`](pipex_core::Source)
//! + [`Sink`](pipex_core::Sink) that persists records and can skip
//! regenerating them when the upstream chain hasn't changed, plus coercions
//! for treating a plain `Vec<Record>` or iterator as a chain endpoint.
//!
//! ## Backends
//!
//! - [`directory::DirectoryBucket`] — one JSON descriptor per record, with
//!   non-scalar channels written to sidecar files.
//! - [`archive::ArchiveBucket`] — a single-file container for bucket
//!   contents, honoring the same metadata contract without depending on a
//!   real HDF5 library.

pub mod archive;
pub mod bucket;
pub mod coerce;
pub mod directory;
pub mod version;

pub use archive::ArchiveBucket;
pub use bucket::{BatchMode, Bucket, BucketMetadata};
pub use coerce::{IterSource, ListSourceSink, PrintSink};
pub use directory::DirectoryBucket;
pub use version::{BucketVersion, SinkDataVersion, SourceDataVersion};
