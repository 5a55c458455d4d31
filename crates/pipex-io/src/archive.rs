use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use pipex_core::{Atom, AtomValue, Format, PipexError, Record, RecordStream, Sink, Source, We};
use serde::{Deserialize, Serialize};

use crate::bucket::{Bucket, BatchMode, BucketMetadata};

/// A single-file [`Bucket`] backend, grounded on
/// `storages/h5storage/h5bucket.py`'s metadata contract (one group-like
/// section per record, with `active_channel`/`timestamp` attributes and one
/// sub-section per channel carrying a `format` attribute) without a
/// dependency on the HDF5 C library: the contract is honored over a plain
/// length-prefixed JSON container instead of HDF5's physical layout, which
/// is explicitly out of scope.
///
/// Layout: an 8-byte little-endian length header followed by a
/// `serde_json`-encoded [`ArchiveEntry`], repeated for each record, with a
/// trailing entry holding the bucket's [`BucketMetadata`].
pub struct ArchiveBucket {
    path: PathBuf,
    lock: Mutex<()>,
    batch_mode: BatchMode,
}

#[derive(Serialize, Deserialize)]
enum ArchiveEntry {
    Record {
        id: String,
        timestamp: f64,
        active_channel: String,
        channels: BTreeMap<String, Atom>,
    },
    Metadata(BucketMetadata),
}

impl ArchiveBucket {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(ArchiveBucket {
            path,
            lock: Mutex::new(()),
            batch_mode: BatchMode::FullBatch,
        })
    }

    /// Overrides how often metadata is flushed while this bucket regenerates
    /// its contents. Defaults to [`BatchMode::FullBatch`].
    pub fn with_batch_mode(mut self, batch_mode: BatchMode) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    fn read_all(&self) -> anyhow::Result<Vec<ArchiveEntry>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_buf = [0u8; 8];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u64::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            entries.push(serde_json::from_slice(&buf)?);
        }
        Ok(entries)
    }

    fn append(&self, entry: &ArchiveEntry) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&(bytes.len() as u64).to_le_bytes())?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Metadata is stored as the last `Metadata` entry written; flushing
    /// rewrites the whole file with any prior metadata entries dropped,
    /// since unlike the directory backend there's no separate metadata
    /// file to atomically replace.
    fn rewrite_without_metadata(&self, records: &[ArchiveEntry]) -> anyhow::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for entry in records {
                if matches!(entry, ArchiveEntry::Metadata(_)) {
                    continue;
                }
                let bytes = serde_json::to_vec(entry)?;
                writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Bucket for ArchiveBucket {
    fn load_metadata(&self) -> anyhow::Result<Option<BucketMetadata>> {
        let _guard = self.lock.lock().unwrap();
        let entries = self.read_all()?;
        Ok(entries.into_iter().rev().find_map(|e| match e {
            ArchiveEntry::Metadata(m) => Some(m),
            _ => None,
        }))
    }

    fn flush_metadata(&self, meta: &BucketMetadata) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let entries = self.read_all()?;
        self.rewrite_without_metadata(&entries)?;
        self.append(&ArchiveEntry::Metadata(meta.clone()))
    }

    fn load_ids(&self) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap();
        let mut ids: Vec<String> = self
            .read_all()?
            .into_iter()
            .filter_map(|e| match e {
                ArchiveEntry::Record { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn load_record(&self, id: &str) -> anyhow::Result<Record> {
        let _guard = self.lock.lock().unwrap();
        let entry = self
            .read_all()?
            .into_iter()
            .rev()
            .find(|e| matches!(e, ArchiveEntry::Record { id: rid, .. } if rid == id))
            .ok_or_else(|| PipexError::MissingRecordFile(id.to_string()))?;

        let ArchiveEntry::Record {
            id,
            timestamp,
            active_channel,
            channels,
        } = entry
        else {
            unreachable!("filtered to Record entries above");
        };

        let mut channels: Vec<(String, Atom)> = channels.into_iter().collect();
        let (first_name, first_atom) = channels.remove(0);
        let mut record = Record::from_object(first_atom.value, &first_name, id, timestamp);
        for (name, atom) in channels {
            record = record.with_channel_item(&name, atom);
        }
        Ok(record.with_channel(&active_channel))
    }

    fn save_record(&self, record: &Record) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let channels: BTreeMap<String, Atom> = record
            .channels()
            .map(|name| {
                (
                    name.to_string(),
                    record.get_atom(name).expect("channel from iteration").clone(),
                )
            })
            .collect();
        self.append(&ArchiveEntry::Record {
            id: record.id().to_string(),
            timestamp: record.timestamp(),
            active_channel: record.active_channel().to_string(),
            channels,
        })
    }
}

impl Source for ArchiveBucket {
    fn generate(self: Box<Self>, _we: We) -> RecordStream {
        match self.load_ids() {
            Ok(ids) => Box::new(ids.into_iter().map(move |id| self.load_record(&id))),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn chain_hash(&self) -> String {
        pipex_core::pipex_hash("ArchiveBucket", &[&self.path.display().to_string()])
    }

    fn data_hash(&self) -> Option<String> {
        self.stored_data_hash()
    }
}

impl Sink for ArchiveBucket {
    fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
        Box::new(input.map(move |r| {
            let record = r?;
            self.save_record(&record)?;
            Ok(record)
        }))
    }

    fn chain_hash(&self) -> String {
        pipex_core::pipex_hash("ArchiveBucket", &[&self.path.display().to_string()])
    }

    fn process_cached(
        self: Box<Self>,
        _we: We,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
        upstream: Box<dyn FnOnce() -> RecordStream + Send>,
    ) -> RecordStream {
        let batch_mode = self.batch_mode;
        Bucket::run_cached(self, source_chain_hash, source_data_hash, upstream, batch_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipex_core::AtomValue;

    fn sample(id: &str) -> Record {
        Record::from_object(AtomValue::Int(7), "default", id.to_string(), 2.0)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = ArchiveBucket::open(dir.path().join("bucket.pxa")).unwrap();
        bucket.save_record(&sample("a")).unwrap();
        let loaded = bucket.load_record("a").unwrap();
        assert_eq!(loaded.get("default"), Some(&AtomValue::Int(7)));
    }

    #[test]
    fn metadata_round_trips_and_survives_record_writes() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = ArchiveBucket::open(dir.path().join("bucket.pxa")).unwrap();
        bucket.save_record(&sample("a")).unwrap();
        let meta = BucketMetadata::initial("c".into(), "d".into());
        bucket.flush_metadata(&meta).unwrap();
        bucket.save_record(&sample("b")).unwrap();

        let loaded_meta = bucket.load_metadata().unwrap().unwrap();
        assert_eq!(loaded_meta.source_chain_hash, "c");
        assert_eq!(bucket.load_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn later_write_of_same_id_shadows_earlier_one() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = ArchiveBucket::open(dir.path().join("bucket.pxa")).unwrap();
        bucket.save_record(&sample("a")).unwrap();
        bucket
            .save_record(&sample("a").with_value(AtomValue::Int(99)))
            .unwrap();
        let loaded = bucket.load_record("a").unwrap();
        assert_eq!(loaded.get("default"), Some(&AtomValue::Int(99)));
    }

    #[test]
    fn process_cached_skips_regeneration_when_upstream_is_unchanged() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket.pxa");
        let calls = Arc::new(AtomicUsize::new(0));

        let upstream = |calls: Arc<AtomicUsize>, id: &'static str| -> Box<dyn FnOnce() -> RecordStream + Send> {
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::new(vec![Ok(sample(id))].into_iter())
            })
        };

        let bucket = Box::new(ArchiveBucket::open(&path).unwrap());
        let out: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash"), upstream(calls.clone(), "a"))
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let bucket = Box::new(ArchiveBucket::open(&path).unwrap());
        let out: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash"), upstream(calls.clone(), "b"))
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "upstream must not run again when chain/data hashes match"
        );
        assert_eq!(out[0].as_ref().unwrap().id(), "a");
    }
}
