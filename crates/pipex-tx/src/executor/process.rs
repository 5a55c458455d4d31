//! Process-mode fork-join: each worker is a persistent child process
//! speaking newline-delimited JSON on its stdin/stdout, grounded on
//! `operators/concurrency.py`'s `bg='process'` path (a `multiprocessing`
//! worker applying the same picklable callable to each queued item).
//!
//! Rust has no cross-process closure transport, so the child only knows how
//! to apply a [`TransformerSpec`] — see that module's doc comment for why
//! this is a closed set rather than "anything the caller passes".
//!
//! The child process is `std::env::current_exe()` re-invoked with a hidden
//! worker-loop flag; wiring that flag up is the embedding binary's job (see
//! [`run_worker_loop`]), which is why this module never spawns a
//! hard-coded binary name.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use pipex_core::{PipexError, Record, We};

use crate::spec::TransformerSpec;

use super::engine::ForkJoin;
use super::worker::RecordWorker;

/// The flag `run_worker_loop`'s caller should recognize at process start,
/// before doing anything else, and hand off to [`run_worker_loop`] if
/// present.
pub const WORKER_LOOP_FLAG: &str = "--pipex-worker-loop";

/// A `RecordWorker` that pipes each record to a persistent child process
/// running [`run_worker_loop`] and reads back one JSON line per record.
pub struct ProcessWorker {
    spec: TransformerSpec,
    child: Mutex<ChildProcess>,
}

struct ChildProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    /// Spawns the child process up front so a misconfigured `current_exe`
    /// or missing worker-loop support surfaces immediately, not on the
    /// first record.
    pub fn spawn(spec: TransformerSpec) -> Result<Self, PipexError> {
        let exe = std::env::current_exe().map_err(|e| {
            tracing::error!(error = %e, "current_exe lookup failed");
            PipexError::NotProcessSafe {
                transformer: format!("{spec:?}"),
                reason: "could not determine the current executable to re-spawn as a worker",
            }
        })?;

        let spec_json = serde_json::to_string(&spec).map_err(|_| PipexError::NotProcessSafe {
            transformer: format!("{spec:?}"),
            reason: "transformer spec failed to serialize to JSON",
        })?;

        let mut child = Command::new(exe)
            .arg(WORKER_LOOP_FLAG)
            .arg(spec_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|_| PipexError::NotProcessSafe {
                transformer: format!("{spec:?}"),
                reason: "failed to spawn worker child process",
            })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));

        Ok(ProcessWorker {
            spec,
            child: Mutex::new(ChildProcess { child, stdin, stdout }),
        })
    }
}

impl RecordWorker for ProcessWorker {
    fn call(&self, _we: &We, record: Record) -> anyhow::Result<Record> {
        let mut guard = self.child.lock().unwrap();
        let line = serde_json::to_string(&record)?;
        guard.stdin.write_all(line.as_bytes())?;
        guard.stdin.write_all(b"\n")?;
        guard.stdin.flush()?;

        let mut response = String::new();
        let read = guard.stdout.read_line(&mut response)?;
        if read == 0 {
            anyhow::bail!("worker process for {:?} exited unexpectedly", self.spec);
        }
        let record: Record = serde_json::from_str(response.trim_end())?;
        Ok(record)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Runs the worker-loop side of [`ProcessWorker`]: reads one JSON-encoded
/// `Record` per line from `stdin`, applies `spec`, and writes the result
/// (also one JSON line) to `stdout`. The embedding binary's `main` should
/// call this and exit as soon as it sees [`WORKER_LOOP_FLAG`] among its
/// arguments, before any normal argument parsing.
pub fn run_worker_loop(
    spec: &TransformerSpec,
    stdin: impl std::io::Read,
    mut stdout: impl Write,
) -> std::io::Result<()> {
    let reader = BufReader::new(stdin);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)?;
        let result = spec
            .apply(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let out = serde_json::to_string(&result)?;
        stdout.write_all(out.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }
    Ok(())
}

/// Builds a process-backed fork-join stage. Fails immediately if the spec
/// describes a sink (`TransformerSpec::Done` has nothing to apply
/// per-record in a transformer position) or if the child process can't be
/// spawned — never mid-stream.
pub(crate) fn build(
    label: impl Into<String>,
    workers: usize,
    queue_capacity: usize,
    spec: TransformerSpec,
) -> Result<ForkJoin, PipexError> {
    if spec.is_sink() {
        return Err(PipexError::NotProcessSafe {
            transformer: format!("{spec:?}"),
            reason: "this spec describes a Sink; use it as the chain's terminal sink directly \
                     instead of wrapping it in a fork-join transformer stage",
        });
    }
    let mut workers_vec: Vec<std::sync::Arc<dyn RecordWorker>> = Vec::with_capacity(workers);
    for _ in 0..workers {
        let worker = ProcessWorker::spawn(spec.clone())?;
        workers_vec.push(std::sync::Arc::new(worker));
    }
    Ok(ForkJoin::with_worker(
        label,
        workers,
        queue_capacity,
        std::sync::Arc::new(RoundRobinWorkers::new(workers_vec)),
    ))
}

/// Dispatches each call to the next process worker in the pool, round
/// robin. Needed because [`ForkJoin`] expects one shared `RecordWorker`,
/// but each `ProcessWorker` owns its own child process and can't be shared
/// across fork-join's own worker threads without serializing every call
/// through a single child.
struct RoundRobinWorkers {
    workers: Vec<std::sync::Arc<dyn RecordWorker>>,
    next: std::sync::atomic::AtomicUsize,
}

impl RoundRobinWorkers {
    fn new(workers: Vec<std::sync::Arc<dyn RecordWorker>>) -> Self {
        RoundRobinWorkers {
            workers,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl RecordWorker for RoundRobinWorkers {
    fn call(&self, we: &We, record: Record) -> anyhow::Result<Record> {
        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.workers.len();
        self.workers[idx].call(we, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipex_core::AtomValue;

    #[test]
    fn worker_loop_applies_spec_line_by_line() {
        let spec = TransformerSpec::Constant {
            value: AtomValue::Int(7),
        };
        let input = Record::from_object(AtomValue::Int(1), "default", "r0".into(), 0.0);
        let line = serde_json::to_string(&input).unwrap() + "\n";
        let mut out = Vec::new();
        run_worker_loop(&spec, line.as_bytes(), &mut out).unwrap();
        let out_line = String::from_utf8(out).unwrap();
        let record: Record = serde_json::from_str(out_line.trim_end()).unwrap();
        assert_eq!(record.value(), Some(&AtomValue::Int(7)));
    }
}
