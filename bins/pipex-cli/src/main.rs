//! # pipex-cli
//!
//! Demo runner for a small built-in pipex pipeline: a counting source, a
//! `map` doubling each value, a fork-join stage (threaded or process
//! backed, per the runtime config), and a sink (a directory bucket if
//! configured, otherwise stdout via `tracing`).
//!
//! This binary is also the worker-loop entry point for process-mode
//! fork-join: `pipex_tx::executor::process::ProcessWorker` re-spawns
//! `current_exe()` with [`pipex_tx::WORKER_LOOP_FLAG`], and `main` hands
//! off to [`pipex_tx::run_worker_loop`] before any normal argument parsing
//! or logging setup runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pipex_core::{AnyChain, AtomValue, We};
use pipex_io::{DirectoryBucket, IterSource, PrintSink};
use pipex_tx::spec::TransformerSpec;
use pipex_tx::{ForkJoin, Map};
use serde::Deserialize;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the demo pipeline runner.
#[derive(Parser, Debug)]
#[command(name = "pipex-cli")]
#[command(about = "Runs a small demo pipex pipeline")]
struct Args {
    /// Runtime config YAML (executor/bucket knobs only — this is not a
    /// pipeline DSL; the pipeline's shape is still assembled in code).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of records the demo source generates.
    #[arg(short = 'n', long, default_value_t = 20)]
    count: i64,
}

/// Executor and bucket knobs loaded from YAML.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RuntimeConfig {
    backend: Backend,
    workers: usize,
    queue_capacity: usize,
    bucket: Option<BucketConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backend: Backend::Thread,
            workers: 4,
            queue_capacity: 16,
            bucket: None,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum Backend {
    #[default]
    Thread,
    Process,
}

#[derive(Debug, Deserialize, Clone)]
struct BucketConfig {
    path: PathBuf,
}

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    if let Some(pos) = argv.iter().position(|a| a == pipex_tx::WORKER_LOOP_FLAG) {
        let spec_json = argv
            .get(pos + 1)
            .context("--pipex-worker-loop requires a spec argument")?;
        let spec: TransformerSpec = serde_json::from_str(spec_json)?;
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        return pipex_tx::run_worker_loop(&spec, stdin.lock(), stdout.lock()).map_err(Into::into);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config: RuntimeConfig = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading runtime config {}", path.display()))?;
            serde_yaml::from_str(&text)?
        }
        None => RuntimeConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args.count, config))
}

async fn run(count: i64, config: RuntimeConfig) -> Result<()> {
    let we = We::new();
    let run_we = we.clone();
    let mut pipeline = tokio::task::spawn_blocking(move || run_pipeline(run_we, count, config));

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, cancelling pipeline");
            we.cancel();
        }
        result = &mut pipeline => {
            return result?;
        }
    }

    pipeline.await?
}

fn run_pipeline(we: We, count: i64, config: RuntimeConfig) -> Result<()> {
    let source = IterSource::new("default", (0..count).map(AtomValue::Int));

    let double = Map::new("double", |v: &AtomValue| match v {
        AtomValue::Int(n) => AtomValue::Int(n * 2),
        other => other.clone(),
    });

    let worker_count = config.workers.max(1);
    let fork_join = match config.backend {
        Backend::Thread => ForkJoin::threaded(
            "increment_fanout",
            worker_count,
            config.queue_capacity,
            |_we, r| {
                let v = match r.value() {
                    Some(AtomValue::Int(n)) => n + 1,
                    _ => 0,
                };
                Ok(r.with_value(AtomValue::Int(v)))
            },
        ),
        Backend::Process => ForkJoin::on_bg_process(
            "passthrough_fanout",
            worker_count,
            config.queue_capacity,
            TransformerSpec::Channel {
                channel: "default".to_string(),
            },
        )?,
    };

    let chain = AnyChain::Source(Box::new(source))
        .then(AnyChain::Transformer(Box::new(double)))?
        .then(AnyChain::Transformer(Box::new(fork_join)))?;

    let chain = match config.bucket {
        // A bucket is a Source+Sink — tagging it `SourceSink` rather than
        // plain `Sink` is what would let a later `.then()` keep building on
        // top of it (the buffering-boundary case), even though this demo
        // chain ends here.
        Some(bucket) => {
            let sink = DirectoryBucket::open(bucket.path)?;
            chain.then(AnyChain::SourceSink(Box::new(sink)))?
        }
        None => chain.then(AnyChain::Sink(Box::new(PrintSink::default())))?,
    };

    for record in chain.run(we)? {
        record?;
    }
    Ok(())
}
