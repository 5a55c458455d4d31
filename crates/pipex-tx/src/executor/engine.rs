//! The fork-join executor: a producer thread slices the upstream record
//! iterator into `chunk_size` chunks and feeds them onto one shared bounded
//! queue; a pool of worker threads pull chunks from it, apply the same
//! [`RecordWorker`] record-by-record, and push their own output chunks onto
//! a shared result queue that the consumer drains as it arrives.
//!
//! Grounded on `operators/concurrency.py` line-for-line: `ProducerThread`
//! feeds a bounded `Queue` in `chunk_size` slices, `Worker` instances pull
//! from it and push result chunks to a shared output queue, and
//! `base_fork_join` drains that queue until every worker has reported done.
//! **Output order is not preserved** — records keep their own id, but
//! which worker finishes first decides arrival order; a caller who needs
//! order should not reach for this operator.
//! `crossbeam-channel` stands in for Python's `queue.Queue` — chosen over
//! `std::sync::mpsc` because mpsc's receiver is single-consumer only, which
//! can't express a worker pool pulling from one shared queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use pipex_core::{pipex_hash, PipexError, Record, RecordStream, Transformer, We};

use super::process;
use super::worker::RecordWorker;
use crate::spec::TransformerSpec;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fork-join transformer stage: distributes chunks of records to a pool
/// of worker threads running the same [`RecordWorker`], and streams their
/// output back as it arrives (no reordering — see module docs).
pub struct ForkJoin {
    label: String,
    worker: Arc<dyn RecordWorker>,
    workers: usize,
    /// `queue_size` in the original: a per-worker slot factor, not the
    /// queue's actual capacity. See [`ForkJoin::real_queue_capacity`].
    queue_size: usize,
    chunk_size: usize,
    ignore_error: bool,
}

impl ForkJoin {
    /// Runs `f` across `workers` background threads, the Rust analogue of
    /// `bg='thread'`.
    pub fn threaded(
        label: impl Into<String>,
        workers: usize,
        queue_size: usize,
        f: impl Fn(&We, Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    ) -> Self {
        assert!(workers > 0, "fork-join needs at least one worker");
        ForkJoin {
            label: label.into(),
            worker: Arc::new(f),
            workers,
            queue_size: queue_size.max(1),
            chunk_size: 1,
            ignore_error: false,
        }
    }

    pub(crate) fn with_worker(
        label: impl Into<String>,
        workers: usize,
        queue_size: usize,
        worker: Arc<dyn RecordWorker>,
    ) -> Self {
        ForkJoin {
            label: label.into(),
            worker,
            workers: workers.max(1),
            queue_size: queue_size.max(1),
            chunk_size: 1,
            ignore_error: false,
        }
    }

    /// Alias for [`ForkJoin::threaded`], named to match the other three
    /// construction entry points (`parallel`, `on_bg_thread`,
    /// `on_bg_process`).
    pub fn on_bg_thread(
        label: impl Into<String>,
        workers: usize,
        queue_size: usize,
        f: impl Fn(&We, Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    ) -> Self {
        Self::threaded(label, workers, queue_size, f)
    }

    /// Like [`ForkJoin::threaded`], but sizes the worker pool to the
    /// machine's available parallelism instead of a caller-chosen count.
    pub fn parallel(
        label: impl Into<String>,
        queue_size: usize,
        f: impl Fn(&We, Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::threaded(label, workers, queue_size, f)
    }

    /// Runs a [`TransformerSpec`] across a pool of persistent child
    /// processes instead of threads. See [`process`] for why only specs
    /// (not arbitrary transformers) can be run this way.
    pub fn on_bg_process(
        label: impl Into<String>,
        workers: usize,
        queue_size: usize,
        spec: TransformerSpec,
    ) -> Result<Self, PipexError> {
        process::build(label, workers, queue_size, spec)
    }

    /// Feeds workers `n` records at a time instead of one at a time.
    /// Matches `chunk_size` (default 1).
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        assert!(n > 0, "chunk_size must be positive");
        self.chunk_size = n;
        self
    }

    /// When `true`, a worker that hits a record it can't process logs and
    /// drops that one worker rather than surfacing the failure downstream
    /// and winding the whole stage down. Matches `ignore_error` (default
    /// `false`).
    pub fn with_ignore_error(mut self, ignore_error: bool) -> Self {
        self.ignore_error = ignore_error;
        self
    }

    /// `_real_queue_size` in the original: `queue_size * workers + workers`
    /// — enough slots for every worker's in-flight chunk plus its sentinel.
    fn real_queue_capacity(&self) -> usize {
        self.queue_size * self.workers + self.workers
    }
}

impl Transformer for ForkJoin {
    fn transform(self: Box<Self>, we: We, input: RecordStream) -> RecordStream {
        run(
            self.worker,
            self.workers,
            self.real_queue_capacity(),
            self.chunk_size,
            self.ignore_error,
            we,
            input,
        )
    }

    fn chain_hash(&self) -> String {
        pipex_hash(
            "ForkJoin",
            &[
                &self.label,
                &self.workers.to_string(),
                &self.queue_size.to_string(),
                &self.chunk_size.to_string(),
                &self.ignore_error.to_string(),
            ],
        )
    }
}

type Chunk = Vec<anyhow::Result<Record>>;

/// A worker's private control plane: `quit` lets the main side ask this one
/// worker to stop early, `done` is the worker's own "I've exited" notice —
/// the per-worker `ctl_in_q`/`ctl_out_q` pair from the original, kept
/// separate from the shared work/result queues so one worker's shutdown
/// signal never has to compete with record traffic.
struct WorkerControl {
    quit_tx: Sender<()>,
    done_rx: Receiver<()>,
}

fn run(
    worker: Arc<dyn RecordWorker>,
    workers: usize,
    queue_capacity: usize,
    chunk_size: usize,
    ignore_error: bool,
    we: We,
    input: RecordStream,
) -> RecordStream {
    let (work_tx, work_rx) = bounded::<Option<Chunk>>(queue_capacity);
    let (result_tx, result_rx) = bounded::<Option<Chunk>>(queue_capacity);
    let abort = Arc::new(AtomicBool::new(false));

    let producer = spawn_producer(we.clone(), input, work_tx, workers, chunk_size, abort.clone());
    let mut handles = vec![producer];
    let mut controls = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (quit_tx, quit_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        handles.push(spawn_worker(
            we.clone(),
            worker.clone(),
            work_rx.clone(),
            result_tx.clone(),
            quit_rx,
            done_tx,
            chunk_size,
            ignore_error,
            abort.clone(),
        ));
        controls.push(WorkerControl { quit_tx, done_rx });
    }
    drop(result_tx);

    Box::new(ForkJoinStream {
        result_rx,
        pending: Vec::new(),
        live_workers: workers,
        abort,
        controls,
        handles: Some(handles),
    })
}

fn spawn_producer(
    we: We,
    input: RecordStream,
    work_tx: Sender<Option<Chunk>>,
    workers: usize,
    chunk_size: usize,
    abort: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut items = input.peekable();
        'outer: while items.peek().is_some() {
            if we.is_cancelled() || abort.load(Ordering::SeqCst) {
                return;
            }
            let chunk: Chunk = (&mut items).take(chunk_size).collect();
            let mut payload = Some(chunk);
            loop {
                match work_tx.send_timeout(payload, POLL_INTERVAL) {
                    Ok(()) => break,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(_))
                        if we.is_cancelled() || abort.load(Ordering::SeqCst) =>
                    {
                        break 'outer;
                    }
                    Err(crossbeam_channel::SendTimeoutError::Timeout(v)) => {
                        payload = v;
                        continue;
                    }
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return,
                }
            }
        }
        for _ in 0..workers {
            if work_tx.send(None).is_err() {
                return;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    we: We,
    worker: Arc<dyn RecordWorker>,
    work_rx: Receiver<Option<Chunk>>,
    result_tx: Sender<Option<Chunk>>,
    quit_rx: Receiver<()>,
    done_tx: Sender<()>,
    chunk_size: usize,
    ignore_error: bool,
    abort: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut out_chunk: Chunk = Vec::with_capacity(chunk_size);
        'outer: loop {
            if we.is_cancelled() || quit_rx.try_recv().is_ok() {
                break;
            }
            let mut sel = Select::new();
            let work_idx = sel.recv(&work_rx);
            let quit_idx = sel.recv(&quit_rx);
            let op = match sel.select_timeout(POLL_INTERVAL) {
                Ok(op) => op,
                Err(_) => continue,
            };
            let received = if op.index() == quit_idx {
                let _ = op.recv(&quit_rx);
                break;
            } else if op.index() == work_idx {
                op.recv(&work_rx)
            } else {
                unreachable!("Select only registered two operations")
            };

            match received {
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    for item in chunk {
                        let result = match item {
                            Ok(record) => worker.call(&we, record),
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok(record) => out_chunk.push(Ok(record)),
                            Err(e) if ignore_error => {
                                tracing::warn!(error = %e, "fork-join worker dropped a record and is exiting (ignore_error)");
                                break 'outer;
                            }
                            Err(e) => {
                                out_chunk.push(Err(e));
                                abort.store(true, Ordering::SeqCst);
                            }
                        }
                        if out_chunk.len() >= chunk_size {
                            if send_chunk(&result_tx, std::mem::take(&mut out_chunk), &quit_rx, &we).is_err() {
                                break 'outer;
                            }
                        }
                        if abort.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        if !out_chunk.is_empty() {
            let _ = send_chunk(&result_tx, out_chunk, &quit_rx, &we);
        }
        let _ = result_tx.send(None);
        let _ = done_tx.send(());
    })
}

/// Pushes one finished chunk to the shared result queue, with the same
/// timeout-and-requit loop the producer uses.
fn send_chunk(
    result_tx: &Sender<Option<Chunk>>,
    chunk: Chunk,
    quit_rx: &Receiver<()>,
    we: &We,
) -> Result<(), ()> {
    let mut payload = Some(chunk);
    loop {
        match result_tx.send_timeout(payload, POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(v)) => {
                if we.is_cancelled() || quit_rx.try_recv().is_ok() {
                    return Err(());
                }
                payload = v;
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return Err(()),
        }
    }
}

struct ForkJoinStream {
    result_rx: Receiver<Option<Chunk>>,
    pending: Vec<anyhow::Result<Record>>,
    live_workers: usize,
    abort: Arc<AtomicBool>,
    controls: Vec<WorkerControl>,
    handles: Option<Vec<JoinHandle<()>>>,
}

impl Iterator for ForkJoinStream {
    type Item = anyhow::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(v) = self.pending.pop() {
                return Some(v);
            }
            if self.live_workers == 0 {
                return None;
            }
            match self.result_rx.recv() {
                Ok(Some(chunk)) => {
                    self.pending.extend(chunk.into_iter().rev());
                }
                Ok(None) => {
                    self.live_workers -= 1;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for ForkJoinStream {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        for control in &self.controls {
            let _ = control.quit_tx.send(());
        }
        for control in &self.controls {
            let _ = control.done_rx.recv_timeout(POLL_INTERVAL * 4);
        }
        if let Some(handles) = self.handles.take() {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::warn!("fork-join worker thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipex_core::AtomValue;

    fn rec(n: i64) -> anyhow::Result<Record> {
        Ok(Record::from_object(
            AtomValue::Int(n),
            "default",
            format!("r{n}"),
            0.0,
        ))
    }

    /// Fork-join makes no ordering guarantee — only multiset equality:
    /// `multiset(out) == multiset(map(f, in))`.
    #[test]
    fn fork_join_preserves_multiset_equality_across_workers() {
        let input: RecordStream = Box::new((0..50).map(rec));
        let fj = ForkJoin::threaded("double", 4, 8, |_we, r| {
            let v = match r.value() {
                Some(AtomValue::Int(n)) => *n * 2,
                _ => 0,
            };
            Ok(r.with_value(AtomValue::Int(v)))
        });
        let mut out: Vec<i64> = Box::new(fj)
            .transform(We::new(), input)
            .map(|r| match r.unwrap().value().cloned().unwrap() {
                AtomValue::Int(n) => n,
                _ => unreachable!(),
            })
            .collect();
        out.sort();
        let expected: Vec<i64> = (0..50).map(|n| n * 2).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn fork_join_propagates_worker_errors_when_not_ignoring() {
        let input: RecordStream = Box::new(vec![rec(1), rec(2)].into_iter());
        let fj = ForkJoin::threaded("fail_on_two", 2, 4, |_we, r| match r.value() {
            Some(AtomValue::Int(2)) => Err(anyhow::anyhow!("boom")),
            _ => Ok(r),
        });
        let results: Vec<_> = Box::new(fj).transform(We::new(), input).collect();
        assert!(results.iter().any(|r| r.is_err()));
    }

    #[test]
    fn ignore_error_drops_the_failing_worker_but_other_workers_still_finish() {
        let input: RecordStream = Box::new((0..20).map(rec));
        let fj = ForkJoin::threaded("fail_on_thirteen", 4, 4, |_we, r| match r.value() {
            Some(AtomValue::Int(13)) => Err(anyhow::anyhow!("boom")),
            _ => Ok(r),
        })
        .with_ignore_error(true);
        let results: Vec<_> = Box::new(fj).transform(We::new(), input).collect();
        assert!(
            results.iter().all(|r| r.is_ok()),
            "no error should surface downstream when ignore_error is set"
        );
        assert!(results.len() < 20, "the record that failed should be dropped, not passed through");
    }

    #[test]
    fn chunked_fork_join_still_processes_every_record() {
        let input: RecordStream = Box::new((0..30).map(rec));
        let fj = ForkJoin::threaded("triple", 3, 4, |_we, r| {
            let v = match r.value() {
                Some(AtomValue::Int(n)) => *n * 3,
                _ => 0,
            };
            Ok(r.with_value(AtomValue::Int(v)))
        })
        .with_chunk_size(5);
        let mut out: Vec<i64> = Box::new(fj)
            .transform(We::new(), input)
            .map(|r| match r.unwrap().value().cloned().unwrap() {
                AtomValue::Int(n) => n,
                _ => unreachable!(),
            })
            .collect();
        out.sort();
        let expected: Vec<i64> = (0..30).map(|n| n * 3).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn cancellation_stops_the_producer_early() {
        let we = We::new();
        we.cancel();
        let input: RecordStream = Box::new((0..1000).map(rec));
        let fj = ForkJoin::threaded("noop", 2, 4, |_we, r| Ok(r));
        let out: Vec<_> = Box::new(fj).transform(we, input).collect();
        assert!(out.len() < 1000);
    }
}
