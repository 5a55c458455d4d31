use crate::context::We;
use crate::record::Record;

/// A lazy, possibly-failing stream of records. Boxed so chain combinators
/// can return heterogeneous iterator types without naming them; `Send` so
/// the fork-join executor can hand one to a worker thread.
pub type RecordStream = Box<dyn Iterator<Item = anyhow::Result<Record>> + Send>;

/// Produces records from nothing. The Rust analogue of `pbase.py`'s
/// `Source.generate_precords`.
///
/// Consumes `self` by value rather than borrowing: a chain is built once
/// and run once, and taking ownership lets the returned iterator close
/// over the source's state without a lifetime parameter leaking into
/// [`RecordStream`].
pub trait Source: Send {
    fn generate(self: Box<Self>, we: We) -> RecordStream;

    /// A stable identity hash for this node, used by the bucket store's
    /// rewrite-skip decision. Nodes that are "pass-through" (their identity
    /// doesn't affect output, e.g. a cache wrapper) may return an empty
    /// string, matching the original's `pass_through` escape hatch.
    fn chain_hash(&self) -> String;

    /// `fetch_source_data_version(ctx).data_hash` in the original: identity
    /// of the data this source currently produces, or `None` when unknown
    /// (the default — "assume changed", forcing a rewrite downstream). A
    /// bucket overrides this with its own persisted `data_hash`, which is
    /// what lets a chain of buckets detect "nothing changed" without
    /// re-running anything.
    fn data_hash(&self) -> Option<String> {
        None
    }
}

/// Consumes a stream of records and produces another stream. The Rust
/// analogue of `Transformer.transform`.
pub trait Transformer: Send {
    fn transform(self: Box<Self>, we: We, input: RecordStream) -> RecordStream;

    fn chain_hash(&self) -> String;
}

/// Consumes a stream of records for effect, passing each one through
/// unchanged once its effect has run (so sinks can sit in the middle of a
/// chain, e.g. inside a fork-join target). The Rust analogue of
/// `Sink.process`.
pub trait Sink: Send {
    fn process(self: Box<Self>, we: We, input: RecordStream) -> RecordStream;

    fn chain_hash(&self) -> String;

    /// Rewrite-skip entry point. `upstream` is the not-yet-run generator
    /// side of the pipeline (source plus any transformers before this
    /// sink), deferred behind a thunk so a sink that recognizes nothing has
    /// changed — same `source_chain_hash`, same `source_data_hash` as last
    /// time — can skip calling it at all and replay its own stored output
    /// instead. The default just runs `upstream` unconditionally and
    /// forwards to [`Sink::process`], which is correct for every sink that
    /// isn't a version-tracking store.
    fn process_cached(
        self: Box<Self>,
        we: We,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
        upstream: Box<dyn FnOnce() -> RecordStream + Send>,
    ) -> RecordStream {
        let _ = (source_chain_hash, source_data_hash);
        self.process(we, upstream())
    }
}

/// A chain node that is both a [`Source`] and a [`Sink`] — a buffering
/// boundary: a bucket store is the paradigm case, readable for
/// what it holds and writable as a pass-through sink. Blanket-implemented
/// for anything that already implements both, so no backend needs to name
/// it explicitly.
///
/// The `node_*` methods exist only to disambiguate calling a supertrait
/// method through a `Box<dyn SourceSink>`, where plain `self.chain_hash()`
/// would be ambiguous between the `Source` and `Sink` impls.
pub trait SourceSink: Source + Sink {
    fn into_source(self: Box<Self>) -> Box<dyn Source>;
    fn into_sink(self: Box<Self>) -> Box<dyn Sink>;

    fn node_chain_hash(&self) -> String {
        Source::chain_hash(self)
    }

    fn node_data_hash(&self) -> Option<String> {
        Source::data_hash(self)
    }
}

impl<T: Source + Sink + 'static> SourceSink for T {
    fn into_source(self: Box<Self>) -> Box<dyn Source> {
        self
    }

    fn into_sink(self: Box<Self>) -> Box<dyn Sink> {
        self
    }
}

/// Blanket impl so a `Box<dyn Transformer>` composes like any other
/// transformer, needed for chain nodes built by the flatten/reparse
/// algebra that hold other nodes as trait objects.
impl Transformer for Box<dyn Transformer> {
    fn transform(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        (*self).transform(we, input)
    }

    fn chain_hash(&self) -> String {
        (**self).chain_hash()
    }
}

impl Source for Box<dyn Source> {
    fn generate(self: Box<Self>, we: We) -> RecordStream {
        (*self).generate(we)
    }

    fn chain_hash(&self) -> String {
        (**self).chain_hash()
    }

    fn data_hash(&self) -> Option<String> {
        (**self).data_hash()
    }
}

impl Sink for Box<dyn Sink> {
    fn process(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        (*self).process(we, input)
    }

    fn chain_hash(&self) -> String {
        (**self).chain_hash()
    }

    fn process_cached(
        self: Box<Self>,
        we: We,
        source_chain_hash: &str,
        source_data_hash: Option<&str>,
        upstream: Box<dyn FnOnce() -> RecordStream + Send>,
    ) -> RecordStream {
        (*self).process_cached(we, source_chain_hash, source_data_hash, upstream)
    }
}
