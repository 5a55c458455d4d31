use std::sync::{Arc, Mutex};

use pipex_core::{pipex_hash, AtomValue, Record, RecordStream, Sink, Source, We};

/// Turns a plain `Vec<Record>` into both a [`Source`] (replays the records)
/// and a [`Sink`] (appends to the vec), the coercion the original exposed
/// implicitly by letting a `list` be used wherever a chain endpoint was
/// expected.
#[derive(Clone, Default)]
pub struct ListSourceSink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl ListSourceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        ListSourceSink {
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn snapshot(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }
}

impl Source for ListSourceSink {
    fn generate(self: Box<Self>, _we: We) -> RecordStream {
        let records = self.records.lock().unwrap().clone();
        Box::new(records.into_iter().map(Ok))
    }

    fn chain_hash(&self) -> String {
        String::new()
    }
}

impl Sink for ListSourceSink {
    fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
        let records = self.records;
        Box::new(input.map(move |r| {
            let record = r?;
            records.lock().unwrap().push(record.clone());
            Ok(record)
        }))
    }

    fn chain_hash(&self) -> String {
        String::new()
    }
}

/// Coerces any iterator of values into a [`Source`] that wraps each one in
/// a [`Record`] on a single named channel, the Rust analogue of passing a
/// plain iterable where the original expected a `Source`.
pub struct IterSource<I> {
    channel: String,
    values: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = AtomValue> + Send,
{
    pub fn new(channel: impl Into<String>, values: I) -> Self {
        IterSource {
            channel: channel.into(),
            values,
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator<Item = AtomValue> + Send + 'static,
{
    fn generate(self: Box<Self>, _we: We) -> RecordStream {
        let channel = self.channel;
        Box::new(self.values.enumerate().map(move |(i, value)| {
            Ok(Record::from_object(
                value,
                &channel,
                format!("r{i}"),
                0.0,
            ))
        }))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("IterSource", &[&self.channel])
    }
}

/// A sink that writes each record's active value to a line-oriented
/// callback (by default `tracing::info!`), the coercion surface for what
/// the original recognized as a bare `print` target. Unlike Python, Rust
/// has no singleton function value to special-case, so callers use
/// [`PrintSink::default`] (logs via `tracing`) or [`PrintSink::to`] with an
/// explicit writer.
pub struct PrintSink {
    write: Box<dyn Fn(&str) + Send>,
}

impl Default for PrintSink {
    fn default() -> Self {
        PrintSink {
            write: Box::new(|line| tracing::info!("{line}")),
        }
    }
}

impl PrintSink {
    pub fn to(write: impl Fn(&str) + Send + 'static) -> Self {
        PrintSink {
            write: Box::new(write),
        }
    }
}

impl Sink for PrintSink {
    fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
        Box::new(input.map(move |r| {
            let record = r?;
            (self.write)(&format!("{:?}", record.value()));
            Ok(record)
        }))
    }

    fn chain_hash(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_source_sink_replays_what_was_appended() {
        let sink = ListSourceSink::new();
        let input: RecordStream = Box::new(
            vec![Record::from_object(
                AtomValue::Int(1),
                "default",
                "r0".into(),
                0.0,
            )]
            .into_iter()
            .map(Ok),
        );
        for r in Box::new(sink.clone()).process(We::new(), input) {
            r.unwrap();
        }
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn iter_source_wraps_values_as_records() {
        let source = IterSource::new("default", vec![AtomValue::Int(1), AtomValue::Int(2)].into_iter());
        let records: Vec<_> = Box::new(source)
            .generate(We::new())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn print_sink_invokes_writer_per_record() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = PrintSink::to(move |line| seen_clone.lock().unwrap().push(line.to_string()));
        let input: RecordStream = Box::new(
            vec![Record::from_object(
                AtomValue::Int(5),
                "default",
                "r0".into(),
                0.0,
            )]
            .into_iter()
            .map(Ok),
        );
        for r in Box::new(sink).process(We::new(), input) {
            r.unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
