//! The chain algebra: composing `Source`/`Transformer`/`Sink` nodes into
//! runnable pipelines.
//!
//! Two combinators, matching the two operators the original overloaded on
//! `PipeChain` (`>>` and `|`):
//!
//! - [`AnyChain::then`] — sequential attach (Redirect, `↦`). `a.then(b)`
//!   feeds `a`'s output into `b`.
//! - [`AnyChain::pipe`] — parallel merge (Pipe, `∥`). `a.pipe(b)` runs `a`
//!   and `b` on the same input and merges each pair of resulting records'
//!   channels with [`Record::merge`].
//!
//! Both go through a flatten-then-reparse step: composing a chain that
//! already contains a composite node (a `TransformerSequence`, say) first
//! decomposes it back into its constituent tokens, then re-derives the
//! canonical normal form from the full token list. This is what keeps
//! `a.then(b).then(c).then(d)` a single flat `TransformerSequence` of four
//! transformers instead of a `TransformerSequence` nested inside another.

use crate::context::We;
use crate::error::PipexError;
use crate::hash::pipex_hash;
use crate::record::Record;
use crate::traits::{RecordStream, Sink, Source, SourceSink, Transformer};

/// A chain node whose concrete role (source/transformer/sink, primitive or
/// composite) is not yet known to the caller — the type builder methods
/// operate over before it settles into a canonical form.
pub enum AnyChain {
    Source(Box<dyn Source>),
    Transformer(Box<dyn Transformer>),
    Sink(Box<dyn Sink>),
    /// A node that is both a `Source` and a `Sink` — e.g. a bucket store.
    /// Distinct from `Sink` because the chain algebra needs to know, at
    /// composition time, that something may still come after it (a
    /// buffering boundary).
    SourceSink(Box<dyn SourceSink>),
    TransformedSource(TransformedSource),
    TransformerSequence(TransformerSequence),
    TransformedSink(TransformedSink),
    /// Zero or more transformers followed by a buffering-boundary sink,
    /// normal form for `Transformer.then(SourceSink)` when nothing has
    /// supplied a concrete upstream `Source` yet.
    BufferedSink(BufferedSink),
    Pipeline(Pipeline),
    /// A complete `source ↦ transformers ↦ sink` segment whose sink is also
    /// a `Source`, so — unlike `Pipeline` — it can still be the left-hand
    /// side of another `then`.
    BufferedPipeline(BufferedPipeline),
}

impl AnyChain {
    fn kind_name(&self) -> &'static str {
        match self {
            AnyChain::Source(_) => "Source",
            AnyChain::Transformer(_) => "Transformer",
            AnyChain::Sink(_) => "Sink",
            AnyChain::SourceSink(_) => "SourceSink",
            AnyChain::TransformedSource(_) => "TransformedSource",
            AnyChain::TransformerSequence(_) => "TransformerSequence",
            AnyChain::TransformedSink(_) => "TransformedSink",
            AnyChain::BufferedSink(_) => "BufferedSink",
            AnyChain::Pipeline(_) => "Pipeline",
            AnyChain::BufferedPipeline(_) => "BufferedPipeline",
        }
    }

    pub fn chain_hash(&self) -> String {
        match self {
            AnyChain::Source(s) => s.chain_hash(),
            AnyChain::Transformer(t) => t.chain_hash(),
            AnyChain::Sink(k) => k.chain_hash(),
            AnyChain::SourceSink(sk) => sk.node_chain_hash(),
            AnyChain::TransformedSource(ts) => ts.chain_hash(),
            AnyChain::TransformerSequence(ts) => ts.chain_hash(),
            AnyChain::TransformedSink(ts) => ts.chain_hash(),
            AnyChain::BufferedSink(bs) => bs.chain_hash(),
            AnyChain::Pipeline(p) => p.chain_hash(),
            AnyChain::BufferedPipeline(bp) => bp.chain_hash(),
        }
    }

    /// Sequential attach (Redirect, `↦`): feed `self`'s output into `other`.
    pub fn then(self, other: AnyChain) -> Result<AnyChain, PipexError> {
        let mut tokens = flatten(self);
        tokens.extend(flatten(other));
        parse(tokens)
    }

    /// Runs the chain if it has already reduced to something runnable on
    /// its own — a [`Pipeline`] or a [`BufferedPipeline`], both of which
    /// carry a concrete `Source` all the way through to a terminal sink.
    /// Anything else is still missing a source, a sink, or both.
    pub fn run(self, we: We) -> Result<RecordStream, PipexError> {
        match self {
            AnyChain::Pipeline(p) => Ok(p.run(we)),
            AnyChain::BufferedPipeline(bp) => Ok(Box::new(bp).generate(we)),
            other => Err(PipexError::TypeMismatch {
                lhs: "chain",
                rhs: other.kind_name(),
                reason: "only a chain reduced to a Pipeline (source through \
                         to a terminal sink) can be run standalone",
            }),
        }
    }

    /// Parallel merge (Pipe, `∥`): run `self` and `other` on the same input
    /// and merge each pair of results. Both sides must share the same role.
    pub fn pipe(self, other: AnyChain) -> Result<AnyChain, PipexError> {
        use AnyChain::*;
        match (self, other) {
            (Source(l), Source(r)) => Ok(Source(Box::new(ParallelSources { left: l, right: r }))),
            (Transformer(l), Transformer(r)) => {
                Ok(Transformer(Box::new(ParallelMerge { left: l, right: r })))
            }
            (Transformer(l), TransformerSequence(r)) => Ok(Transformer(Box::new(ParallelMerge {
                left: l,
                right: Box::new(r),
            }))),
            (TransformerSequence(l), Transformer(r)) => Ok(Transformer(Box::new(ParallelMerge {
                left: Box::new(l),
                right: r,
            }))),
            (TransformerSequence(l), TransformerSequence(r)) => {
                Ok(Transformer(Box::new(ParallelMerge {
                    left: Box::new(l),
                    right: Box::new(r),
                })))
            }
            (Sink(l), Sink(r)) => Ok(Sink(Box::new(ParallelSinks { left: l, right: r }))),
            (lhs, rhs) => Err(PipexError::TypeMismatch {
                lhs: lhs.kind_name(),
                rhs: rhs.kind_name(),
                reason: "pipe requires both sides to share a role: source∥source, \
                         transformer∥transformer, or sink∥sink",
            }),
        }
    }
}

enum ChainToken {
    S(Box<dyn Source>),
    T(Box<dyn Transformer>),
    K(Box<dyn Sink>),
    /// A buffering-boundary sink: usable as the chain's terminal sink, or,
    /// if more tokens follow, as the `Source` for the rest of the chain.
    SK(Box<dyn SourceSink>),
}

fn flatten(chain: AnyChain) -> Vec<ChainToken> {
    match chain {
        AnyChain::Source(s) => vec![ChainToken::S(s)],
        AnyChain::Transformer(t) => vec![ChainToken::T(t)],
        AnyChain::Sink(k) => vec![ChainToken::K(k)],
        AnyChain::SourceSink(sk) => vec![ChainToken::SK(sk)],
        AnyChain::TransformedSource(ts) => {
            let mut tokens = vec![ChainToken::S(ts.source)];
            tokens.extend(ts.transformers.into_iter().map(ChainToken::T));
            tokens
        }
        AnyChain::TransformerSequence(ts) => ts.0.into_iter().map(ChainToken::T).collect(),
        AnyChain::TransformedSink(ts) => {
            let mut tokens: Vec<_> = ts.transformers.into_iter().map(ChainToken::T).collect();
            tokens.push(ChainToken::K(ts.sink));
            tokens
        }
        AnyChain::BufferedSink(bs) => {
            let mut tokens: Vec<_> = bs.transformers.into_iter().map(ChainToken::T).collect();
            tokens.push(ChainToken::SK(bs.sink));
            tokens
        }
        AnyChain::Pipeline(p) => {
            let mut tokens = vec![ChainToken::S(p.source)];
            tokens.extend(p.transformers.into_iter().map(ChainToken::T));
            tokens.push(ChainToken::K(p.sink));
            tokens
        }
        AnyChain::BufferedPipeline(bp) => {
            let mut tokens = vec![ChainToken::S(bp.source)];
            tokens.extend(bp.transformers.into_iter().map(ChainToken::T));
            tokens.push(ChainToken::SK(bp.sink));
            tokens
        }
    }
}

fn parse(tokens: Vec<ChainToken>) -> Result<AnyChain, PipexError> {
    let mut source: Option<Box<dyn Source>> = None;
    let mut transformers: Vec<Box<dyn Transformer>> = Vec::new();
    let mut sink: Option<Box<dyn Sink>> = None;

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        match token {
            ChainToken::S(s) => {
                if source.is_some() || !transformers.is_empty() || sink.is_some() {
                    return Err(PipexError::TypeMismatch {
                        lhs: "chain",
                        rhs: "Source",
                        reason: "a source may only appear at the head of a chain",
                    });
                }
                source = Some(s);
            }
            ChainToken::T(t) => {
                if sink.is_some() {
                    return Err(PipexError::TypeMismatch {
                        lhs: "Sink",
                        rhs: "Transformer",
                        reason: "nothing may follow a sink in a chain",
                    });
                }
                transformers.push(t);
            }
            ChainToken::K(k) => {
                if sink.is_some() {
                    return Err(PipexError::TypeMismatch {
                        lhs: "Sink",
                        rhs: "Sink",
                        reason: "a chain may only end in a single sink",
                    });
                }
                sink = Some(k);
            }
            ChainToken::SK(sk) => {
                if sink.is_some() {
                    return Err(PipexError::TypeMismatch {
                        lhs: "Sink",
                        rhs: "Sink",
                        reason: "a chain may only end in a single sink",
                    });
                }
                if iter.peek().is_some() {
                    // A buffering boundary with more chain to come: close
                    // out everything seen so far and keep going with it as
                    // the new upstream source.
                    let closed_transformers = std::mem::take(&mut transformers);
                    source = Some(match source.take() {
                        Some(s) => Box::new(BufferedPipeline {
                            source: s,
                            transformers: closed_transformers,
                            sink: sk,
                        }),
                        None => Box::new(BufferedSink {
                            transformers: closed_transformers,
                            sink: sk,
                        }),
                    });
                } else {
                    return Ok(match source.take() {
                        Some(s) => AnyChain::BufferedPipeline(BufferedPipeline {
                            source: s,
                            transformers: std::mem::take(&mut transformers),
                            sink: sk,
                        }),
                        None => AnyChain::BufferedSink(BufferedSink {
                            transformers: std::mem::take(&mut transformers),
                            sink: sk,
                        }),
                    });
                }
            }
        }
    }

    Ok(match (source, sink, transformers) {
        (Some(s), Some(k), ts) => AnyChain::Pipeline(Pipeline {
            source: s,
            transformers: ts,
            sink: k,
        }),
        (Some(s), None, ts) => AnyChain::TransformedSource(TransformedSource {
            source: s,
            transformers: ts,
        }),
        (None, Some(k), ts) => AnyChain::TransformedSink(TransformedSink {
            transformers: ts,
            sink: k,
        }),
        (None, None, ts) => AnyChain::TransformerSequence(TransformerSequence(ts)),
    })
}

fn fold_transformers(
    we: &We,
    transformers: Vec<Box<dyn Transformer>>,
    input: RecordStream,
) -> RecordStream {
    transformers
        .into_iter()
        .fold(input, |stream, t| t.transform(we.clone(), stream))
}

fn hash_children(tag: &str, children: &[String]) -> String {
    let refs: Vec<&str> = children.iter().map(String::as_str).collect();
    pipex_hash(tag, &refs)
}

/// Drives `source ↦ transformers ↦ sink`, letting `sink` decide whether to
/// skip calling `source`/`transformers` at all (the bucket store's
/// rewrite-skip check). `source_chain_hash` — the structural identity of
/// everything upstream of `sink` — is computed eagerly since it only
/// depends on shape, not execution; `source_data_hash` is read from
/// `source` before anything runs, per [`Source::data_hash`]'s contract.
fn run_cached(
    source: Box<dyn Source>,
    transformers: Vec<Box<dyn Transformer>>,
    sink: Box<dyn Sink>,
    we: We,
) -> RecordStream {
    let mut children = vec![source.chain_hash()];
    children.extend(transformers.iter().map(|t| t.chain_hash()));
    let source_chain_hash = hash_children("TransformedSource", &children);
    let source_data_hash = source.data_hash();

    let we_upstream = we.clone();
    let upstream: Box<dyn FnOnce() -> RecordStream + Send> = Box::new(move || {
        let generated = source.generate(we_upstream.clone());
        fold_transformers(&we_upstream, transformers, generated)
    });

    sink.process_cached(we, &source_chain_hash, source_data_hash.as_deref(), upstream)
}

/// A flat run of transformers, normal form for `Transformer.then(Transformer)`.
pub struct TransformerSequence(pub Vec<Box<dyn Transformer>>);

impl Transformer for TransformerSequence {
    fn transform(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        fold_transformers(&we, self.0, input)
    }

    fn chain_hash(&self) -> String {
        let children: Vec<String> = self.0.iter().map(|t| t.chain_hash()).collect();
        hash_children("TransformerSequence", &children)
    }
}

/// A source followed by zero or more transformers, normal form for
/// `Source.then(Transformer)`.
pub struct TransformedSource {
    pub source: Box<dyn Source>,
    pub transformers: Vec<Box<dyn Transformer>>,
}

impl Source for TransformedSource {
    fn generate(self: Box<Self>, we: We) -> RecordStream {
        let upstream = self.source.generate(we.clone());
        fold_transformers(&we, self.transformers, upstream)
    }

    fn chain_hash(&self) -> String {
        let mut children = vec![self.source.chain_hash()];
        children.extend(self.transformers.iter().map(|t| t.chain_hash()));
        hash_children("TransformedSource", &children)
    }
}

/// Zero or more transformers followed by a sink, normal form for
/// `Transformer.then(Sink)`.
pub struct TransformedSink {
    pub transformers: Vec<Box<dyn Transformer>>,
    pub sink: Box<dyn Sink>,
}

impl Sink for TransformedSink {
    fn process(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        let transformed = fold_transformers(&we, self.transformers, input);
        self.sink.process(we, transformed)
    }

    fn chain_hash(&self) -> String {
        let mut children: Vec<String> = self.transformers.iter().map(|t| t.chain_hash()).collect();
        children.push(self.sink.chain_hash());
        hash_children("TransformedSink", &children)
    }
}

/// A complete source-to-sink chain, the only normal form that can be run
/// standalone with [`Pipeline::run`].
pub struct Pipeline {
    pub source: Box<dyn Source>,
    pub transformers: Vec<Box<dyn Transformer>>,
    pub sink: Box<dyn Sink>,
}

impl Pipeline {
    /// Drives the whole chain, draining the sink's pass-through output.
    /// Callers that only care about side effects can do
    /// `for _ in pipeline.run(we) {}`; callers that want the records the
    /// sink saw can collect the iterator. Goes through [`run_cached`] so a
    /// bucket-terminated pipeline gets the rewrite-skip check for free.
    pub fn run(self, we: We) -> RecordStream {
        run_cached(self.source, self.transformers, self.sink, we)
    }

    pub fn chain_hash(&self) -> String {
        let mut children = vec![self.source.chain_hash()];
        children.extend(self.transformers.iter().map(|t| t.chain_hash()));
        children.push(self.sink.chain_hash());
        hash_children("Pipeline", &children)
    }
}

/// Zero or more transformers followed by a buffering-boundary sink with no
/// upstream `Source` attached yet — normal form for
/// `Transformer.then(SourceSink)`. The transformers only ever apply on the
/// write side ([`Sink::process`]); reading it back as a `Source` goes
/// straight to the underlying sink, since nothing produced a fresh stream
/// to transform.
pub struct BufferedSink {
    pub transformers: Vec<Box<dyn Transformer>>,
    pub sink: Box<dyn SourceSink>,
}

impl BufferedSink {
    pub fn chain_hash(&self) -> String {
        let mut children: Vec<String> = self.transformers.iter().map(|t| t.chain_hash()).collect();
        children.push(self.sink.node_chain_hash());
        hash_children("BufferedSink", &children)
    }
}

impl Sink for BufferedSink {
    fn process(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        let transformed = fold_transformers(&we, self.transformers, input);
        self.sink.into_sink().process(we, transformed)
    }

    fn chain_hash(&self) -> String {
        BufferedSink::chain_hash(self)
    }

    fn process_cached(
        self: Box<Self>,
        we: We,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
        upstream: Box<dyn FnOnce() -> RecordStream + Send>,
    ) -> RecordStream {
        let transformers = self.transformers;
        let we_fold = we.clone();
        let folded: Box<dyn FnOnce() -> RecordStream + Send> =
            Box::new(move || fold_transformers(&we_fold, transformers, upstream()));
        self.sink
            .into_sink()
            .process_cached(we, source_chain_hash, source_data_hash, folded)
    }
}

impl Source for BufferedSink {
    fn generate(self: Box<Self>, we: We) -> RecordStream {
        self.sink.into_source().generate(we)
    }

    fn chain_hash(&self) -> String {
        BufferedSink::chain_hash(self)
    }

    fn data_hash(&self) -> Option<String> {
        self.sink.node_data_hash()
    }
}

/// A complete `source ↦ transformers ↦ sink` segment whose sink is also a
/// `Source` (a bucket, typically) — a buffering boundary between two chain
/// segments. Running it writes every record through exactly like
/// [`Pipeline::run`] (with the same rewrite-skip check), and what it hands
/// back downstream is the
/// sink's own pass-through output, so a chain can keep going after it
/// without re-reading storage separately.
pub struct BufferedPipeline {
    pub source: Box<dyn Source>,
    pub transformers: Vec<Box<dyn Transformer>>,
    pub sink: Box<dyn SourceSink>,
}

impl BufferedPipeline {
    pub fn chain_hash(&self) -> String {
        let mut children = vec![self.source.chain_hash()];
        children.extend(self.transformers.iter().map(|t| t.chain_hash()));
        children.push(self.sink.node_chain_hash());
        hash_children("BufferedPipeline", &children)
    }
}

impl Source for BufferedPipeline {
    fn generate(self: Box<Self>, we: We) -> RecordStream {
        run_cached(self.source, self.transformers, self.sink.into_sink(), we)
    }

    fn chain_hash(&self) -> String {
        BufferedPipeline::chain_hash(self)
    }

    fn data_hash(&self) -> Option<String> {
        self.sink.node_data_hash()
    }
}

/// `Source ∥ Source`: generates from both sources and merges each pair of
/// records by position with [`Record::merge`]. Streams lazily, unlike the
/// transformer/sink variants below, since neither side needs to buffer an
/// existing input.
struct ParallelSources {
    left: Box<dyn Source>,
    right: Box<dyn Source>,
}

impl Source for ParallelSources {
    fn generate(self: Box<Self>, we: We) -> RecordStream {
        let left = self.left.generate(we.clone());
        let right = self.right.generate(we);
        Box::new(left.zip(right).map(|(l, r)| Ok(l?.union_channels(&r?))))
    }

    fn chain_hash(&self) -> String {
        hash_children(
            "ParallelSources",
            &[self.left.chain_hash(), self.right.chain_hash()],
        )
    }
}

/// `Transformer ∥ Transformer`: runs both branches over the same input and
/// merges each pair of results. Because each branch needs its own pass over
/// the input, the input is buffered into memory first — a documented
/// divergence from the otherwise fully-lazy pipeline.
struct ParallelMerge {
    left: Box<dyn Transformer>,
    right: Box<dyn Transformer>,
}

impl Transformer for ParallelMerge {
    fn transform(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        let mut buffered = Vec::new();
        for item in input {
            match item {
                Ok(record) => buffered.push(record),
                Err(err) => return Box::new(std::iter::once(Err(err))),
            }
        }

        let left_in: RecordStream = Box::new(buffered.clone().into_iter().map(Ok));
        let right_in: RecordStream = Box::new(buffered.into_iter().map(Ok));
        let left_out: Vec<_> = self.left.transform(we.clone(), left_in).collect();
        let right_out: Vec<_> = self.right.transform(we, right_in).collect();

        let merged: Vec<_> = left_out
            .into_iter()
            .zip(right_out)
            .map(|(l, r)| Ok(l?.union_channels(&r?)))
            .collect();
        Box::new(merged.into_iter())
    }

    fn chain_hash(&self) -> String {
        hash_children(
            "ParallelMerge",
            &[self.left.chain_hash(), self.right.chain_hash()],
        )
    }
}

/// `Sink ∥ Sink`: runs both sinks' effects over the same (buffered) input
/// and passes the original records through once, since sinks don't alter
/// the value by contract.
struct ParallelSinks {
    left: Box<dyn Sink>,
    right: Box<dyn Sink>,
}

impl Sink for ParallelSinks {
    fn process(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        let mut buffered = Vec::new();
        for item in input {
            match item {
                Ok(record) => buffered.push(record),
                Err(err) => return Box::new(std::iter::once(Err(err))),
            }
        }

        let left_in: RecordStream = Box::new(buffered.clone().into_iter().map(Ok));
        let right_in: RecordStream = Box::new(buffered.clone().into_iter().map(Ok));
        for r in self.left.process(we.clone(), left_in) {
            if let Err(e) = r {
                return Box::new(std::iter::once(Err(e)));
            }
        }
        for r in self.right.process(we, right_in) {
            if let Err(e) = r {
                return Box::new(std::iter::once(Err(e)));
            }
        }
        Box::new(buffered.into_iter().map(Ok))
    }

    fn chain_hash(&self) -> String {
        hash_children(
            "ParallelSinks",
            &[self.left.chain_hash(), self.right.chain_hash()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomValue;

    struct Count(i64);
    impl Source for Count {
        fn generate(self: Box<Self>, _we: We) -> RecordStream {
            let n = self.0;
            Box::new((0..n).map(|i| {
                Ok(Record::from_object(
                    AtomValue::Int(i),
                    Record::DEFAULT_CHANNEL,
                    format!("r{i}"),
                    0.0,
                ))
            }))
        }
        fn chain_hash(&self) -> String {
            pipex_hash("Count", &[&self.0.to_string()])
        }
    }

    struct Double;
    impl Transformer for Double {
        fn transform(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
            Box::new(input.map(|r| {
                let r = r?;
                let v = match r.value() {
                    Some(AtomValue::Int(n)) => *n * 2,
                    _ => 0,
                };
                Ok(r.with_value(AtomValue::Int(v)))
            }))
        }
        fn chain_hash(&self) -> String {
            "Double".into()
        }
    }

    struct Collect(std::sync::Arc<std::sync::Mutex<Vec<i64>>>);
    impl Sink for Collect {
        fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
            let sink = self.0;
            Box::new(input.map(move |r| {
                let r = r?;
                if let Some(AtomValue::Int(n)) = r.value() {
                    sink.lock().unwrap().push(*n);
                }
                Ok(r)
            }))
        }
        fn chain_hash(&self) -> String {
            "Collect".into()
        }
    }

    #[test]
    fn then_flattens_sequence() {
        let chain = AnyChain::Transformer(Box::new(Double))
            .then(AnyChain::Transformer(Box::new(Double)))
            .unwrap()
            .then(AnyChain::Transformer(Box::new(Double)))
            .unwrap();
        match chain {
            AnyChain::TransformerSequence(seq) => assert_eq!(seq.0.len(), 3),
            _ => panic!("expected a flat TransformerSequence"),
        }
    }

    #[test]
    fn pipeline_runs_source_through_sink() {
        let sink_buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = AnyChain::Source(Box::new(Count(3)))
            .then(AnyChain::Transformer(Box::new(Double)))
            .unwrap()
            .then(AnyChain::Sink(Box::new(Collect(sink_buf.clone()))))
            .unwrap();

        let pipeline = match chain {
            AnyChain::Pipeline(p) => p,
            _ => panic!("expected a Pipeline"),
        };

        for r in pipeline.run(We::new()) {
            r.unwrap();
        }
        assert_eq!(*sink_buf.lock().unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn sink_after_sink_is_rejected() {
        let err = AnyChain::Sink(Box::new(Collect(Default::default())))
            .then(AnyChain::Sink(Box::new(Collect(Default::default()))))
            .unwrap_err();
        assert!(matches!(err, PipexError::TypeMismatch { .. }));
    }

    #[test]
    fn pipe_merges_parallel_sources() {
        let chain = AnyChain::Source(Box::new(Count(2)))
            .pipe(AnyChain::Source(Box::new(Count(2))))
            .unwrap();
        let source = match chain {
            AnyChain::Source(s) => s,
            _ => panic!("expected a Source"),
        };
        let records: Vec<_> = source.generate(We::new()).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
    }

    /// A counting source: bumps a shared counter every time it's actually
    /// generated from, so a test can prove rewrite-skip means it never runs
    /// twice.
    struct CountingSource {
        n: i64,
        runs: std::sync::Arc<std::sync::Mutex<i32>>,
    }
    impl Source for CountingSource {
        fn generate(self: Box<Self>, _we: We) -> RecordStream {
            *self.runs.lock().unwrap() += 1;
            let n = self.n;
            Box::new((0..n).map(|i| {
                Ok(Record::from_object(
                    AtomValue::Int(i),
                    Record::DEFAULT_CHANNEL,
                    format!("r{i}"),
                    0.0,
                ))
            }))
        }
        fn chain_hash(&self) -> String {
            pipex_hash("CountingSource", &[&self.n.to_string()])
        }
    }

    struct Increment;
    impl Transformer for Increment {
        fn transform(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
            Box::new(input.map(|r| {
                let r = r?;
                let v = match r.value() {
                    Some(AtomValue::Int(n)) => *n + 1,
                    _ => 0,
                };
                Ok(r.with_value(AtomValue::Int(v)))
            }))
        }
        fn chain_hash(&self) -> String {
            "Increment".into()
        }
    }

    #[derive(Default)]
    struct MemoryBucketState {
        records: Vec<Record>,
        data_hash: Option<String>,
        source_chain_hash: Option<String>,
        source_data_hash: Option<String>,
    }

    /// A minimal in-memory stand-in for a bucket store: a `Source+Sink` that
    /// tracks the same version bookkeeping `DirectoryBucket`/`ArchiveBucket`
    /// persist to disk, so the chain algebra's buffering boundary and
    /// `Sink::process_cached`'s rewrite-skip contract can be exercised
    /// without touching a filesystem.
    struct MemoryBucket {
        state: std::sync::Arc<std::sync::Mutex<MemoryBucketState>>,
    }

    impl Source for MemoryBucket {
        fn generate(self: Box<Self>, _we: We) -> RecordStream {
            let records = self.state.lock().unwrap().records.clone();
            Box::new(records.into_iter().map(Ok))
        }
        fn chain_hash(&self) -> String {
            "MemoryBucket".into()
        }
        fn data_hash(&self) -> Option<String> {
            self.state.lock().unwrap().data_hash.clone()
        }
    }

    impl Sink for MemoryBucket {
        fn process(self: Box<Self>, _we: We, input: RecordStream) -> RecordStream {
            let state = self.state.clone();
            Box::new(input.map(move |r| {
                let record = r?;
                state.lock().unwrap().records.push(record.clone());
                Ok(record)
            }))
        }
        fn chain_hash(&self) -> String {
            "MemoryBucket".into()
        }
        fn process_cached(
            self: Box<Self>,
            _we: We,
            source_chain_hash: &str,
            source_data_hash: Option<&str>,
            upstream: Box<dyn FnOnce() -> RecordStream + Send>,
        ) -> RecordStream {
            let guard = self.state.lock().unwrap();
            let unchanged = guard.source_chain_hash.as_deref() == Some(source_chain_hash)
                && guard.source_data_hash.as_deref() == source_data_hash;
            if unchanged {
                let records = guard.records.clone();
                drop(guard);
                return Box::new(records.into_iter().map(Ok));
            }
            drop(guard);

            let records: Vec<Record> = match upstream().collect() {
                Ok(records) => records,
                Err(err) => return Box::new(std::iter::once(Err(err))),
            };
            let mut guard = self.state.lock().unwrap();
            guard.records = records.clone();
            guard.source_chain_hash = Some(source_chain_hash.to_string());
            guard.source_data_hash = source_data_hash.map(str::to_string);
            guard.data_hash = Some(format!("v{}", guard.records.len()));
            Box::new(records.into_iter().map(Ok))
        }
    }

    #[test]
    fn rewrite_skip_avoids_regenerating_when_nothing_changed() {
        let runs = std::sync::Arc::new(std::sync::Mutex::new(0));
        let state = std::sync::Arc::new(std::sync::Mutex::new(MemoryBucketState::default()));

        let run_once = || {
            let chain = AnyChain::Source(Box::new(CountingSource {
                n: 3,
                runs: runs.clone(),
            }))
            .then(AnyChain::SourceSink(Box::new(MemoryBucket {
                state: state.clone(),
            })))
            .unwrap();
            for r in chain.run(We::new()).unwrap() {
                r.unwrap();
            }
        };

        run_once();
        assert_eq!(*runs.lock().unwrap(), 1);
        run_once();
        assert_eq!(
            *runs.lock().unwrap(),
            1,
            "second run should replay stored records instead of invoking the source again"
        );
    }

    #[test]
    fn buffered_boundary_lets_a_transformer_continue_after_a_bucket() {
        let runs = std::sync::Arc::new(std::sync::Mutex::new(0));
        let bucket_a = std::sync::Arc::new(std::sync::Mutex::new(MemoryBucketState::default()));
        let bucket_b = std::sync::Arc::new(std::sync::Mutex::new(MemoryBucketState::default()));

        let build = || {
            AnyChain::Source(Box::new(CountingSource {
                n: 3,
                runs: runs.clone(),
            }))
            .then(AnyChain::SourceSink(Box::new(MemoryBucket {
                state: bucket_a.clone(),
            })))
            .unwrap()
            .then(AnyChain::Transformer(Box::new(Increment)))
            .unwrap()
            .then(AnyChain::SourceSink(Box::new(MemoryBucket {
                state: bucket_b.clone(),
            })))
            .unwrap()
        };

        let chain = build();
        assert!(matches!(chain, AnyChain::BufferedPipeline(_)));
        let out: Vec<Record> = chain.run(We::new()).unwrap().collect::<Result<_, _>>().unwrap();
        let values: Vec<i64> = out
            .iter()
            .map(|r| match r.value() {
                Some(AtomValue::Int(n)) => *n,
                _ => -1,
            })
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(*runs.lock().unwrap(), 1);

        for r in build().run(We::new()).unwrap() {
            r.unwrap();
        }
        assert_eq!(
            *runs.lock().unwrap(),
            1,
            "bucketA's own rewrite-skip check should keep the original source from re-running \
             even though bucketB's downstream check reruns the chain"
        );
    }
}
