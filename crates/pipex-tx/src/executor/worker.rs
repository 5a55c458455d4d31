use pipex_core::{Record, We};

/// Applies one operation to one record. The unit of work a fork-join
/// worker thread repeats for as long as the upstream producer keeps
/// feeding it, grounded on `operators/concurrency.py`'s `Worker.run`, which
/// pulls items off a shared queue and calls the same function on each.
pub trait RecordWorker: Send + Sync {
    fn call(&self, we: &We, record: Record) -> anyhow::Result<Record>;
}

impl<F> RecordWorker for F
where
    F: Fn(&We, Record) -> anyhow::Result<Record> + Send + Sync,
{
    fn call(&self, we: &We, record: Record) -> anyhow::Result<Record> {
        self(we, record)
    }
}
