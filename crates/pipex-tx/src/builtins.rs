//! Built-in transformers, grounded on `operators/funcs.py`. The original's
//! curry-placeholder mechanism (an `...` hole in a partially-applied call)
//! is replaced throughout by plain closures, per the chain algebra's
//! REDESIGN FLAGS.

use std::sync::mpsc::sync_channel;
use std::thread;

use pipex_core::{pipex_hash, Atom, AtomValue, Record, RecordStream, Sink, Transformer};
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn stop_on_err(input: RecordStream, mut step: impl FnMut(Record) -> Option<Record> + Send + 'static) -> RecordStream {
    Box::new(input.filter_map(move |r| match r {
        Ok(record) => step(record).map(Ok),
        Err(e) => Some(Err(e)),
    }))
}

/// `map(label, f)`: replaces the active channel's value.
pub struct Map<F> {
    label: String,
    f: F,
}

impl<F> Map<F>
where
    F: Fn(&AtomValue) -> AtomValue + Send + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Map {
            label: label.into(),
            f,
        }
    }
}

impl<F> Transformer for Map<F>
where
    F: Fn(&AtomValue) -> AtomValue + Send + 'static,
{
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let f = self.f;
        stop_on_err(input, move |r| {
            let new_value = r.value().map(&f).unwrap_or(AtomValue::Null);
            Some(r.with_value(new_value))
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("map", &[&self.label])
    }
}

/// `filter(label, predicate)`: drops records whose active value fails the
/// predicate.
pub struct Filter<F> {
    label: String,
    predicate: F,
}

impl<F> Filter<F>
where
    F: Fn(&AtomValue) -> bool + Send + 'static,
{
    pub fn new(label: impl Into<String>, predicate: F) -> Self {
        Filter {
            label: label.into(),
            predicate,
        }
    }
}

impl<F> Transformer for Filter<F>
where
    F: Fn(&AtomValue) -> bool + Send + 'static,
{
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let predicate = self.predicate;
        stop_on_err(input, move |r| {
            let keep = r.value().map(&predicate).unwrap_or(false);
            keep.then_some(r)
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("filter", &[&self.label])
    }
}

/// `tap(label, f)`: runs `f` for its side effect and passes the record
/// through unchanged.
pub struct Tap<F> {
    label: String,
    f: F,
}

impl<F> Tap<F>
where
    F: Fn(&AtomValue) + Send + 'static,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Tap {
            label: label.into(),
            f,
        }
    }
}

impl<F> Transformer for Tap<F>
where
    F: Fn(&AtomValue) + Send + 'static,
{
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let f = self.f;
        stop_on_err(input, move |r| {
            if let Some(v) = r.value() {
                f(v);
            }
            Some(r)
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("tap", &[&self.label])
    }
}

/// `grep(pattern)`: keeps records whose active value's text rendering
/// contains `pattern`.
pub struct Grep {
    pattern: String,
}

impl Grep {
    pub fn new(pattern: impl Into<String>) -> Self {
        Grep {
            pattern: pattern.into(),
        }
    }
}

impl Transformer for Grep {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let pattern = self.pattern;
        stop_on_err(input, move |r| {
            let text = r.value().map(render_text).unwrap_or_default();
            text.contains(&pattern).then_some(r)
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("grep", &[&self.pattern])
    }
}

fn render_text(v: &AtomValue) -> String {
    match v {
        AtomValue::Text(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

/// `take(n)`: keeps only the first `n` records.
pub struct Take {
    n: usize,
}

impl Take {
    pub fn new(n: usize) -> Self {
        Take { n }
    }
}

impl Transformer for Take {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        Box::new(input.take(self.n))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("take", &[&self.n.to_string()])
    }
}

/// `drop(n)`: skips the first `n` records.
pub struct DropN {
    n: usize,
}

impl DropN {
    pub fn new(n: usize) -> Self {
        DropN { n }
    }
}

impl Transformer for DropN {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        Box::new(input.skip(self.n))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("drop", &[&self.n.to_string()])
    }
}

/// `slice(start, end)`: keeps records in `[start, end)`. `end = None` means
/// unbounded.
pub struct Slice {
    start: usize,
    end: Option<usize>,
}

impl Slice {
    pub fn new(start: usize, end: Option<usize>) -> Self {
        Slice { start, end }
    }
}

impl Transformer for Slice {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let skipped = input.skip(self.start);
        match self.end {
            Some(end) => Box::new(skipped.take(end.saturating_sub(self.start))),
            None => Box::new(skipped),
        }
    }

    fn chain_hash(&self) -> String {
        pipex_hash(
            "slice",
            &[&self.start.to_string(), &self.end.map_or_else(|| "-".into(), |e| e.to_string())],
        )
    }
}

/// `channel(name)`: switches the active channel.
pub struct SwitchChannel {
    channel: String,
}

impl SwitchChannel {
    pub fn new(channel: impl Into<String>) -> Self {
        SwitchChannel {
            channel: channel.into(),
        }
    }
}

impl Transformer for SwitchChannel {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let channel = self.channel;
        stop_on_err(input, move |r| Some(r.with_channel(&channel)))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("channel", &[&self.channel])
    }
}

/// `channel_map(channel, label, f)`: applies `f` to a named channel without
/// switching which channel is active.
pub struct ChannelMap<F> {
    channel: String,
    label: String,
    f: F,
}

impl<F> ChannelMap<F>
where
    F: Fn(&AtomValue) -> AtomValue + Send + 'static,
{
    pub fn new(channel: impl Into<String>, label: impl Into<String>, f: F) -> Self {
        ChannelMap {
            channel: channel.into(),
            label: label.into(),
            f,
        }
    }
}

impl<F> Transformer for ChannelMap<F>
where
    F: Fn(&AtomValue) -> AtomValue + Send + 'static,
{
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let (channel, f) = (self.channel, self.f);
        stop_on_err(input, move |r| {
            let current = r.get(&channel).cloned().unwrap_or(AtomValue::Null);
            let new_atom = Atom::new(f(&current));
            Some(r.with_channel_item(&channel, new_atom))
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("channel_map", &[&self.channel, &self.label])
    }
}

/// `dup(from, to)`: copies a channel's atom under a new name.
pub struct Dup {
    from: String,
    to: String,
}

impl Dup {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Dup {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl Transformer for Dup {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let (from, to) = (self.from, self.to);
        stop_on_err(input, move |r| {
            let atom = r.get_atom(&from).cloned();
            Some(match atom {
                Some(atom) => r.with_channel_item(&to, atom),
                None => r,
            })
        })
    }

    fn chain_hash(&self) -> String {
        pipex_hash("dup", &[&self.from, &self.to])
    }
}

/// `constant(value)`: replaces every record's active value with a fixed
/// constant, ignoring whatever was there.
pub struct Constant {
    value: AtomValue,
}

impl Constant {
    pub fn new(value: AtomValue) -> Self {
        Constant { value }
    }
}

impl Transformer for Constant {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let value = self.value;
        stop_on_err(input, move |r| Some(r.with_value(value.clone())))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("constant", &[&format!("{:?}", self.value)])
    }
}

/// `select_channels(names)`: keeps only the named channels, switching the
/// active channel to the first kept one if the current active channel was
/// dropped.
pub struct SelectChannels {
    channels: Vec<String>,
}

impl SelectChannels {
    pub fn new(channels: Vec<String>) -> Self {
        SelectChannels { channels }
    }
}

impl Transformer for SelectChannels {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let channels = self.channels;
        stop_on_err(input, move |r| {
            let mut kept: Vec<(String, Atom)> = channels
                .iter()
                .filter_map(|name| r.get_atom(name).map(|a| (name.clone(), a.clone())))
                .collect();
            if kept.is_empty() {
                return None;
            }
            let active_kept = channels.iter().any(|c| c == r.active_channel());
            let (first_name, first_atom) = kept.remove(0);
            let mut rec = Record::from_object(
                first_atom.value,
                &first_name,
                r.id().to_string(),
                r.timestamp(),
            );
            for (name, atom) in kept {
                rec = rec.with_channel_item(&name, atom);
            }
            if active_kept {
                rec = rec.with_channel(r.active_channel());
            }
            Some(rec)
        })
    }

    fn chain_hash(&self) -> String {
        let refs: Vec<&str> = self.channels.iter().map(String::as_str).collect();
        pipex_hash("select_channels", &refs)
    }
}

/// `batch(size)`: groups `size` records into one, whose active value is a
/// `List` of the grouped values. [`Unbatch`] is its inverse.
pub struct Batch {
    size: usize,
}

impl Batch {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "batch size must be positive");
        Batch { size }
    }
}

impl Transformer for Batch {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let size = self.size;
        let mut chunk: Vec<Record> = Vec::with_capacity(size);
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            loop {
                match input.next() {
                    Some(Ok(r)) => {
                        chunk.push(r);
                        if chunk.len() == size {
                            let group = std::mem::take(&mut chunk);
                            return Some(Ok(batch_group(group)));
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some(Err(e));
                    }
                    None => {
                        done = true;
                        if chunk.is_empty() {
                            return None;
                        }
                        let group = std::mem::take(&mut chunk);
                        return Some(Ok(batch_group(group)));
                    }
                }
            }
        }))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("batch", &[&self.size.to_string()])
    }
}

/// Name of the channel a [`Batch`] group lands on, mirroring the original's
/// `PRecord.from_object(mini_batch, 'precord_batch')`.
pub const BATCH_CHANNEL: &str = "precord_batch";

fn batch_group(group: Vec<Record>) -> Record {
    let ids: Vec<String> = group.iter().map(|r| r.id().to_string()).collect();
    let timestamp = group.last().map(|r| r.timestamp()).unwrap_or(0.0);
    Record::from_object(
        AtomValue::RecordBatch(group),
        BATCH_CHANNEL,
        ids.join(","),
        timestamp,
    )
}

/// `unbatch()`: the inverse of [`Batch`] — unpacks a `precord_batch` record
/// back into the whole records it was grouped from, the original's `yield
/// from unbatched` (each grouped record comes back out exactly as it went
/// in, own id/timestamp/channels included — not rebuilt from a bare value).
pub struct Unbatch;

impl Transformer for Unbatch {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        Box::new(input.flat_map(|r| -> Box<dyn Iterator<Item = anyhow::Result<Record>> + Send> {
            match r {
                Err(e) => Box::new(std::iter::once(Err(e))),
                Ok(record) => match record.value() {
                    Some(AtomValue::RecordBatch(group)) => {
                        Box::new(group.clone().into_iter().map(Ok))
                    }
                    _ => Box::new(std::iter::once(Ok(record))),
                },
            }
        }))
    }

    fn chain_hash(&self) -> String {
        "unbatch".to_string()
    }
}

/// `preload(n)`: runs the upstream on a background thread so up to `n`
/// records are ready ahead of the consumer, the Rust analogue of the
/// original's background-thread preloading transformer. Unlike
/// `threaded`/`parallel` (the fork-join executor), this runs exactly one
/// background worker and preserves input order.
pub struct Preload {
    n: usize,
}

impl Preload {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "preload lookahead must be positive");
        Preload { n }
    }
}

impl Transformer for Preload {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let (tx, rx) = sync_channel(self.n);
        thread::spawn(move || {
            for item in input {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Box::new(rx.into_iter())
    }

    fn chain_hash(&self) -> String {
        pipex_hash("preload", &[&self.n.to_string()])
    }
}

/// `shuffle(seed)`: buffers the whole stream and returns it in random
/// order. Matches the original's reservoir-free, whole-buffer shuffle —
/// not suitable for unbounded streams, a documented limitation rather than
/// an oversight.
pub struct Shuffle {
    seed: Option<u64>,
}

impl Shuffle {
    pub fn new(seed: Option<u64>) -> Self {
        Shuffle { seed }
    }
}

impl Transformer for Shuffle {
    fn transform(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        let mut buffered = Vec::new();
        for item in input {
            match item {
                Ok(r) => buffered.push(r),
                Err(e) => return Box::new(std::iter::once(Err(e))),
            }
        }
        let mut rng: Box<dyn rand::RngCore> = match self.seed {
            Some(seed) => Box::new(rand::rngs::StdRng::seed_from_u64(seed)),
            None => Box::new(rand::thread_rng()),
        };
        buffered.shuffle(&mut rng);
        Box::new(buffered.into_iter().map(Ok))
    }

    fn chain_hash(&self) -> String {
        pipex_hash("shuffle", &[&self.seed.map_or_else(|| "-".into(), |s| s.to_string())])
    }
}

/// `done()`: a terminal no-op sink. Passes every record through unchanged
/// with no side effect of its own, useful as a fork-join target when only
/// upstream side effects matter; whoever drains the pipeline (e.g.
/// `Pipeline::run`) still decides whether records are collected or simply
/// dropped as they're pulled through.
pub struct Done;

impl Sink for Done {
    fn process(self: Box<Self>, _we: pipex_core::We, input: RecordStream) -> RecordStream {
        input
    }

    fn chain_hash(&self) -> String {
        "done".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipex_core::We;

    fn rec(n: i64) -> anyhow::Result<Record> {
        Ok(Record::from_object(
            AtomValue::Int(n),
            "default",
            format!("r{n}"),
            0.0,
        ))
    }

    fn values(stream: RecordStream) -> Vec<AtomValue> {
        stream
            .map(|r| r.unwrap().value().cloned().unwrap())
            .collect()
    }

    #[test]
    fn map_transforms_active_value() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2)].into_iter());
        let out = Box::new(Map::new("double", |v: &AtomValue| match v {
            AtomValue::Int(n) => AtomValue::Int(n * 2),
            other => other.clone(),
        }))
        .transform(We::new(), input);
        assert_eq!(values(out), vec![AtomValue::Int(2), AtomValue::Int(4)]);
    }

    #[test]
    fn filter_drops_non_matching() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2), rec(3)].into_iter());
        let out = Box::new(Filter::new("even", |v: &AtomValue| {
            matches!(v, AtomValue::Int(n) if n % 2 == 0)
        }))
        .transform(We::new(), input);
        assert_eq!(values(out), vec![AtomValue::Int(2)]);
    }

    #[test]
    fn take_and_drop_bound_the_stream() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2), rec(3)].into_iter());
        let out = Box::new(Take::new(2)).transform(We::new(), input);
        assert_eq!(out.count(), 2);

        let input: RecordStream = Box::new(vec![rec(1), rec(2), rec(3)].into_iter());
        let out = Box::new(DropN::new(2)).transform(We::new(), input);
        assert_eq!(values(out), vec![AtomValue::Int(3)]);
    }

    #[test]
    fn batch_then_unbatch_is_identity_on_values() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2), rec(3)].into_iter());
        let batched = Box::new(Batch::new(2)).transform(We::new(), input);
        let unbatched = Box::new(Unbatch).transform(We::new(), batched);
        assert_eq!(
            values(unbatched),
            vec![AtomValue::Int(1), AtomValue::Int(2), AtomValue::Int(3)]
        );
    }

    #[test]
    fn batch_groups_whole_records_on_the_batch_channel() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2)].into_iter());
        let mut out = Box::new(Batch::new(2)).transform(We::new(), input);
        let grouped = out.next().unwrap().unwrap();
        assert!(out.next().is_none());
        assert_eq!(grouped.active_channel(), BATCH_CHANNEL);
        match grouped.value() {
            Some(AtomValue::RecordBatch(group)) => {
                assert_eq!(group.len(), 2);
                assert_eq!(group[0].id(), "r1");
                assert_eq!(group[1].id(), "r2");
            }
            other => panic!("expected a RecordBatch, got {other:?}"),
        }
    }

    #[test]
    fn unbatch_recovers_original_ids_and_channels() {
        let r1 = Record::from_object(AtomValue::Int(1), "default", "r1".into(), 0.0)
            .with_channel_item("aux", Atom::new(AtomValue::Text("x".into())));
        let r2 = Record::from_object(AtomValue::Int(2), "default", "r2".into(), 0.0);
        let input: RecordStream = Box::new(vec![Ok(r1), Ok(r2)].into_iter());
        let batched = Box::new(Batch::new(2)).transform(We::new(), input);
        let unbatched: Vec<Record> = Box::new(Unbatch)
            .transform(We::new(), batched)
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(unbatched.len(), 2);
        assert_eq!(unbatched[0].id(), "r1");
        assert_eq!(unbatched[0].get("aux"), Some(&AtomValue::Text("x".into())));
        assert_eq!(unbatched[1].id(), "r2");
    }

    #[test]
    fn dup_copies_channel_under_new_name() {
        let input: RecordStream = Box::new(vec![rec(1)].into_iter());
        let out = Box::new(Dup::new("default", "copy")).transform(We::new(), input);
        let r = out.into_iter().next().unwrap().unwrap();
        assert_eq!(r.get("copy"), Some(&AtomValue::Int(1)));
    }

    #[test]
    fn select_channels_drops_unlisted() {
        let r = Record::from_object(AtomValue::Int(1), "default", "r0".into(), 0.0)
            .with_channel_item("extra", Atom::new(AtomValue::Text("x".into())));
        let input: RecordStream = Box::new(vec![Ok(r)].into_iter());
        let out = Box::new(SelectChannels::new(vec!["default".into()])).transform(We::new(), input);
        let r = out.into_iter().next().unwrap().unwrap();
        assert_eq!(r.get("extra"), None);
        assert_eq!(r.get("default"), Some(&AtomValue::Int(1)));
    }

    #[test]
    fn preload_preserves_order() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2), rec(3)].into_iter());
        let out = Box::new(Preload::new(2)).transform(We::new(), input);
        assert_eq!(
            values(out),
            vec![AtomValue::Int(1), AtomValue::Int(2), AtomValue::Int(3)]
        );
    }

    #[test]
    fn shuffle_is_a_permutation_of_the_input() {
        let input: RecordStream = Box::new((0..20).map(rec));
        let out = Box::new(Shuffle::new(Some(42))).transform(We::new(), input);
        let mut out_vals: Vec<i64> = out
            .map(|r| match r.unwrap().value().cloned().unwrap() {
                AtomValue::Int(n) => n,
                _ => unreachable!(),
            })
            .collect();
        out_vals.sort();
        assert_eq!(out_vals, (0..20).collect::<Vec<_>>());
    }
}
