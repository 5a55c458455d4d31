use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pipex_core::{Atom, AtomValue, Format, PipexError, Record, RecordStream, Sink, Source, We};

use crate::bucket::{Bucket, BatchMode, BucketMetadata};

/// The reference directory-backed [`Bucket`]: one `pbucket.json` metadata
/// file, one descriptor per record under `pbkt_data/`, and one sidecar file
/// per non-`data`-format channel under `pbkt_<channel>/`.
///
/// Grounded on `storages/pstorage/pbucket.py`: same file names, same
/// atomic-flush-via-rename metadata write, same double-writer detection
/// (a `pbucket.json.tmp` left behind from a still-running or crashed writer
/// is treated as a concurrent-write error rather than silently overwritten).
pub struct DirectoryBucket {
    root: PathBuf,
    batch_mode: BatchMode,
}

impl DirectoryBucket {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DirectoryBucket {
            root,
            batch_mode: BatchMode::FullBatch,
        })
    }

    /// Overrides how often metadata is flushed while this bucket regenerates
    /// its contents. Defaults to [`BatchMode::FullBatch`].
    pub fn with_batch_mode(mut self, batch_mode: BatchMode) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("pbucket.json")
    }

    fn meta_tmp_path(&self) -> PathBuf {
        self.root.join("pbucket.json.tmp")
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("pbkt_data")
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(format!("pbkt_{channel}"))
    }

    fn descriptor_path(&self, id: &str) -> PathBuf {
        self.data_dir().join(format!("{id}.json"))
    }

    fn sidecar_path(&self, channel: &str, id: &str, format: &Format) -> PathBuf {
        self.channel_dir(channel)
            .join(format!("{id}.{}", format.extension()))
    }

    fn ensure_sub_dir(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ChannelDescriptor {
    format: Format,
    /// Present only for `Format::Data`; other formats live in a sidecar
    /// file named after the record id under `pbkt_<channel>/`.
    inline_value: Option<AtomValue>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RecordDescriptor {
    id: String,
    timestamp: f64,
    active_channel: String,
    channels: BTreeMap<String, ChannelDescriptor>,
}

impl Bucket for DirectoryBucket {
    fn load_metadata(&self) -> anyhow::Result<Option<BucketMetadata>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn flush_metadata(&self, meta: &BucketMetadata) -> anyhow::Result<()> {
        let tmp = self.meta_tmp_path();
        if tmp.exists() {
            return Err(PipexError::DoubleWriterDetected.into());
        }
        fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        fs::rename(&tmp, self.meta_path())?;
        Ok(())
    }

    fn load_ids(&self) -> anyhow::Result<Vec<String>> {
        let dir = self.data_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_record(&self, id: &str) -> anyhow::Result<Record> {
        let path = self.descriptor_path(id);
        if !path.exists() {
            return Err(PipexError::MissingRecordFile(id.to_string()).into());
        }
        let descriptor: RecordDescriptor = serde_json::from_slice(&fs::read(path)?)?;

        let mut channels: Vec<(String, Atom)> = Vec::new();
        for (name, chan) in descriptor.channels {
            let atom = match chan.inline_value {
                Some(value) => Atom::with_format(value, chan.format),
                None => {
                    let sidecar = self.sidecar_path(&name, &descriptor.id, &chan.format);
                    let bytes = fs::read(&sidecar)
                        .map_err(|_| PipexError::MissingRecordFile(descriptor.id.clone()))?;
                    let value = match chan.format {
                        Format::Text => AtomValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
                        _ => AtomValue::Blob(bytes),
                    };
                    Atom::with_format(value, chan.format)
                }
            };
            channels.push((name, atom));
        }

        let (first_name, first_atom) = channels
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("record {} has no channels", descriptor.id))?;
        let mut record = Record::from_object(
            first_atom.value,
            &first_name,
            descriptor.id.clone(),
            descriptor.timestamp,
        );
        for (name, atom) in channels.into_iter().skip(1) {
            record = record.with_channel_item(&name, atom);
        }
        Ok(record.with_channel(&descriptor.active_channel))
    }

    fn save_record(&self, record: &Record) -> anyhow::Result<()> {
        self.ensure_sub_dir(&self.data_dir())?;

        let mut channels = BTreeMap::new();
        for name in record.channels() {
            let atom = record.get_atom(name).expect("channel name came from iteration");
            let descriptor = if atom.format == Format::Data {
                ChannelDescriptor {
                    format: atom.format.clone(),
                    inline_value: Some(atom.value.clone()),
                }
            } else {
                let dir = self.channel_dir(name);
                self.ensure_sub_dir(&dir)?;
                let bytes = match &atom.value {
                    AtomValue::Blob(b) => b.clone(),
                    AtomValue::Text(s) => s.clone().into_bytes(),
                    other => serde_json::to_vec(other)?,
                };
                fs::write(self.sidecar_path(name, record.id(), &atom.format), bytes)?;
                ChannelDescriptor {
                    format: atom.format.clone(),
                    inline_value: None,
                }
            };
            channels.insert(name.to_string(), descriptor);
        }

        let descriptor = RecordDescriptor {
            id: record.id().to_string(),
            timestamp: record.timestamp(),
            active_channel: record.active_channel().to_string(),
            channels,
        };
        fs::write(
            self.descriptor_path(record.id()),
            serde_json::to_vec_pretty(&descriptor)?,
        )?;
        Ok(())
    }
}

impl Source for DirectoryBucket {
    fn generate(self: Box<Self>, _we: We) -> RecordStream {
        match self.load_ids() {
            Ok(ids) => Box::new(ids.into_iter().map(move |id| self.load_record(&id))),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn chain_hash(&self) -> String {
        pipex_core::pipex_hash("DirectoryBucket", &[&self.root.display().to_string()])
    }

    fn data_hash(&self) -> Option<String> {
        self.stored_data_hash()
    }
}

impl Sink for DirectoryBucket {
    fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
        Box::new(input.map(move |r| {
            let record = r?;
            self.save_record(&record)?;
            Ok(record)
        }))
    }

    fn chain_hash(&self) -> String {
        pipex_core::pipex_hash("DirectoryBucket", &[&self.root.display().to_string()])
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
    use pipex_core::We;

    fn sample_record(id: &str) -> Record {
        Record::from_object(AtomValue::Int(42), "default", id.to_string(), 1.0)
            .with_channel_item("note", Atom::new(AtomValue::Text("hello".into())))
            .with_channel_item("blob", Atom::new(AtomValue::Blob(vec![1, 2, 3])))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::open(dir.path()).unwrap();
        let record = sample_record("rec-1");
        bucket.save_record(&record).unwrap();

        let loaded = bucket.load_record("rec-1").unwrap();
        assert_eq!(loaded.id(), record.id());
        assert_eq!(loaded.active_channel(), record.active_channel());
        assert_eq!(loaded.get("default"), record.get("default"));
        assert_eq!(loaded.get("note"), record.get("note"));
        assert_eq!(loaded.get("blob"), record.get("blob"));
    }

    #[test]
    fn load_ids_lists_saved_records_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::open(dir.path()).unwrap();
        bucket.save_record(&sample_record("b")).unwrap();
        bucket.save_record(&sample_record("a")).unwrap();
        assert_eq!(bucket.load_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn metadata_flush_detects_concurrent_writer() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::open(dir.path()).unwrap();
        fs::write(bucket.meta_tmp_path(), b"stale").unwrap();

        let meta = BucketMetadata::initial("chash".into(), "dhash".into());
        let err = bucket.flush_metadata(&meta).unwrap_err();
        assert!(err.downcast_ref::<PipexError>().is_some());
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::open(dir.path()).unwrap();
        assert!(bucket.load_metadata().unwrap().is_none());

        let meta = BucketMetadata::initial("chash".into(), "dhash".into());
        bucket.flush_metadata(&meta).unwrap();
        let loaded = bucket.load_metadata().unwrap().unwrap();
        assert_eq!(loaded.source_chain_hash, "chash");
    }

    #[test]
    fn sink_process_passes_records_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DirectoryBucket::open(dir.path()).unwrap();
        let input: RecordStream = Box::new(vec![Ok(sample_record("r1"))].into_iter());
        let out: Vec<_> = Box::new(bucket).process(We::new(), input).collect();
        assert_eq!(out.len(), 1);
        assert!(DirectoryBucket::open(dir.path())
            .unwrap()
            .load_ids()
            .unwrap()
            .contains(&"r1".to_string()));
    }

    #[test]
    fn process_cached_skips_regeneration_when_upstream_is_unchanged() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let upstream = |calls: Arc<AtomicUsize>, id: &'static str| -> Box<dyn FnOnce() -> RecordStream + Send> {
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::new(vec![Ok(sample_record(id))].into_iter())
            })
        };

        let bucket = Box::new(DirectoryBucket::open(dir.path()).unwrap());
        let out: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash"), upstream(calls.clone(), "r1"))
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let bucket = Box::new(DirectoryBucket::open(dir.path()).unwrap());
        let out: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash"), upstream(calls.clone(), "r2"))
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "upstream must not run again when chain/data hashes match"
        );
        assert_eq!(out[0].as_ref().unwrap().id(), "r1");
    }

    #[test]
    fn process_cached_regenerates_when_data_hash_changes() {
        let dir = tempfile::tempdir().unwrap();

        let bucket = Box::new(DirectoryBucket::open(dir.path()).unwrap());
        let upstream: Box<dyn FnOnce() -> RecordStream + Send> =
            Box::new(|| Box::new(vec![Ok(sample_record("r1"))].into_iter()));
        let _: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash-a"), upstream)
            .collect();

        let bucket = Box::new(DirectoryBucket::open(dir.path()).unwrap());
        let upstream: Box<dyn FnOnce() -> RecordStream + Send> =
            Box::new(|| Box::new(vec![Ok(sample_record("r2"))].into_iter()));
        let out: Vec<_> = bucket
            .process_cached(We::new(), "chash", Some("dhash-b"), upstream)
            .collect();

        let ids: Vec<_> = out.iter().map(|r| r.as_ref().unwrap().id().to_string()).collect();
        assert_eq!(ids, vec!["r2"]);
    }
}
