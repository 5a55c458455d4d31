use pipex_core::{Record, RecordStream, Sink, Source};

use crate::version::{BucketVersion, SinkDataVersion, SourceDataVersion, CURRENT_META_VERSION};
use serde::{Deserialize, Serialize};

/// How a [`Bucket`] flushes its metadata while writing a batch of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Flush metadata after every record (safest, slowest).
    Stream,
    /// Flush metadata once, after all records have been written.
    FullBatch,
    /// Flush metadata every `n` records.
    MiniBatch(usize),
}

/// On-disk metadata for a bucket: what produced the data it holds, and
/// whether that data is safe to reuse on a rewrite. Mirrors the original's
/// `BucketMetadata` field-for-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketMetadata {
    pub meta_version: BucketVersion,
    pub data_hash: String,
    pub source_chain_hash: String,
    pub source_data_hash: String,
    pub latest_record_timestamp: f64,
}

impl BucketMetadata {
    pub fn initial(source_chain_hash: String, source_data_hash: String) -> Self {
        BucketMetadata {
            meta_version: CURRENT_META_VERSION,
            // Minted once the rewrite this metadata describes actually
            // completes (see `Bucket::run_cached`); empty here just means
            // "in progress", the same way `source_data_hash` below is empty
            // when the upstream source has no known identity yet.
            data_hash: String::new(),
            source_chain_hash,
            source_data_hash,
            latest_record_timestamp: 0.0,
        }
    }

    pub fn fetch_source_data_version(&self) -> SourceDataVersion {
        SourceDataVersion {
            chain_hash: self.source_chain_hash.clone(),
            data_hash: self.source_data_hash.clone(),
        }
    }

    pub fn fetch_sink_data_version(&self) -> SinkDataVersion {
        SinkDataVersion {
            chain_hash: self.source_chain_hash.clone(),
            data_hash: self.data_hash.clone(),
        }
    }
}

/// A versioned, identity-cached store of records: both a [`Source`] (replay
/// what's stored) and a [`Sink`] (persist what flows in), plus the metadata
/// bookkeeping that lets a pipeline skip regenerating a bucket's contents
/// when nothing upstream has changed.
///
/// Concrete backends ([`crate::directory::DirectoryBucket`],
/// [`crate::archive::ArchiveBucket`]) implement the storage primitives;
/// this trait supplies the rewrite-skip policy on top of them.
pub trait Bucket: Source + Sink {
    fn load_metadata(&self) -> anyhow::Result<Option<BucketMetadata>>;
    fn flush_metadata(&self, meta: &BucketMetadata) -> anyhow::Result<()>;
    fn load_ids(&self) -> anyhow::Result<Vec<String>>;
    fn load_record(&self, id: &str) -> anyhow::Result<Record>;
    fn save_record(&self, record: &Record) -> anyhow::Result<()>;

    /// This bucket's own `data_hash`, for when it's used as the upstream
    /// `Source` of another bucket — the thing that lets a chain of buckets
    /// detect "nothing changed" without reading anything back. An empty or
    /// missing metadata `data_hash` (no completed write yet) reads as
    /// `None`, the `Source::data_hash` default's "assume changed".
    fn stored_data_hash(&self) -> Option<String> {
        match self.load_metadata() {
            Ok(Some(meta)) if !meta.data_hash.is_empty() => Some(meta.data_hash),
            _ => None,
        }
    }

    /// Decides whether the bucket's stored contents can be reused as-is
    /// (`false`) or must be regenerated from upstream (`true`): the
    /// original's `rewriting_required` check, comparing the upstream
    /// chain's identity hash and a content hash of what it would produce.
    /// An unknown upstream `data_hash` (`None`) always forces a rewrite,
    /// since there's nothing to compare against.
    fn rewrite_required(
        &self,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
    ) -> anyhow::Result<bool> {
        let Some(source_data_hash) = source_data_hash else {
            return Ok(true);
        };
        match self.load_metadata()? {
            None => Ok(true),
            Some(meta) => Ok(meta.source_chain_hash != source_chain_hash
                || meta.source_data_hash != source_data_hash),
        }
    }

    /// The rewrite-skip entry point behind [`Sink::process_cached`]: if
    /// `source_chain_hash`/`source_data_hash` already match what's on
    /// disk, replays stored records without ever calling `upstream`;
    /// otherwise drains it, persisting each record as it arrives and
    /// minting a fresh `data_hash` once the write completes successfully,
    /// the same point the original mints a new version stamp in its
    /// `finally` block.
    fn run_cached(
        self: Box<Self>,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
        upstream: Box<dyn FnOnce() -> RecordStream + Send>,
        batch_mode: BatchMode,
    ) -> RecordStream
    where
        Self: Sized + 'static,
    {
        match self.rewrite_required(source_chain_hash, source_data_hash) {
            Ok(false) => {
                tracing::debug!(chain_hash = %source_chain_hash, "bucket rewrite skipped, replaying from storage");
                let ids = match self.load_ids() {
                    Ok(ids) => ids,
                    Err(err) => return Box::new(std::iter::once(Err(err))),
                };
                let records: Vec<anyhow::Result<Record>> =
                    ids.into_iter().map(|id| self.load_record(&id)).collect();
                Box::new(records.into_iter())
            }
            Ok(true) => {
                tracing::debug!(chain_hash = %source_chain_hash, "bucket rewrite required, regenerating");
                let mut meta = BucketMetadata::initial(
                    source_chain_hash.to_string(),
                    source_data_hash.unwrap_or_default().to_string(),
                );
                let mut since_flush = 0usize;
                let mut out: Vec<anyhow::Result<Record>> = Vec::new();
                let mut failed = false;

                for item in upstream() {
                    match item {
                        Ok(record) => {
                            if let Err(err) = self.save_record(&record) {
                                out.push(Err(err));
                                failed = true;
                                break;
                            }
                            meta.latest_record_timestamp =
                                meta.latest_record_timestamp.max(record.timestamp());
                            since_flush += 1;
                            out.push(Ok(record));
                        }
                        Err(err) => {
                            out.push(Err(err));
                            failed = true;
                            break;
                        }
                    }

                    let should_flush = match batch_mode {
                        BatchMode::Stream => true,
                        BatchMode::MiniBatch(n) if since_flush >= n => true,
                        _ => false,
                    };
                    if should_flush {
                        if let Err(err) = self.flush_metadata(&meta) {
                            out.push(Err(err));
                            failed = true;
                            break;
                        }
                        since_flush = 0;
                    }
                }

                if !failed {
                    meta.data_hash = uuid::Uuid::new_v4().to_string();
                    if let Err(err) = self.flush_metadata(&meta) {
                        out.push(Err(err));
                    }
                }
                Box::new(out.into_iter())
            }
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }
}
