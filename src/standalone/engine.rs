//! The four stages of a standalone run.
//!
//! Map and reduce spread their work over a bounded pool of blocking workers
//! pulling from a shared queue. Every worker owns one clone of the stage's
//! sender, so the stream closes exactly when the last worker exits; consumers
//! treat exhaustion of the stream as the stage barrier.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{MapReduceError, MapReduceResult, TaskFailure, TaskId};
use crate::standalone::phase::Phase;
use crate::*;

/// Values collected per key by the shuffle.
pub type Grouping<K, V> = HashMap<K, Vec<V>>;

/// What a single map or reduce invocation reports back.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(TaskFailure),
}

/// The output side of a running map or reduce stage.
pub struct StageStream<T> {
    phase: Phase,
    receiver: mpsc::Receiver<TaskOutcome<T>>,
    workers: JoinSet<()>,
}

/// What a consumer stage produced, plus the failures it saw upstream.
#[derive(Debug)]
pub struct StageReport<T> {
    pub output: T,
    pub failures: Vec<TaskFailure>,
}

impl<T: Send + 'static> StageStream<T> {
    fn new(
        phase: Phase,
        receiver: mpsc::Receiver<TaskOutcome<T>>,
        workers: JoinSet<()>,
    ) -> Self {
        Self {
            phase,
            receiver,
            workers,
        }
    }

    /// Feeds every completed item to `on_item` until the stream is exhausted,
    /// then joins the workers.
    ///
    /// `consumer` is the phase doing the draining; a cancellation is reported
    /// against it, while a lost worker is reported against the producing stage.
    /// Returning early on cancellation drops the receiver, which makes every
    /// worker's next send fail so it stops pulling work.
    async fn drain<F>(
        mut self,
        consumer: Phase,
        token: &CancellationToken,
        mut on_item: F,
    ) -> MapReduceResult<Vec<TaskFailure>>
    where
        F: FnMut(T),
    {
        let producer = self.phase;
        let mut failures = Vec::new();
        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(MapReduceError::Cancelled { phase: consumer });
                }
                outcome = self.receiver.recv() => outcome,
            };
            match outcome {
                Some(TaskOutcome::Completed(item)) => on_item(item),
                Some(TaskOutcome::Failed(failure)) => {
                    warn!(
                        phase = %producer,
                        task = %failure.task,
                        reason = %failure.reason,
                        "task failed"
                    );
                    failures.push(failure);
                }
                None => break,
            }
        }
        while let Some(joined) = self.workers.join_next().await {
            joined.map_err(|source| MapReduceError::WorkerLost {
                phase: producer,
                source,
            })?;
        }
        if token.is_cancelled() {
            return Err(MapReduceError::Cancelled { phase: consumer });
        }
        Ok(failures)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    format!("panicked: {detail}")
}

/// Runs `task`, turning an error or a panic into a failure for `id`.
fn run_task<T>(
    id: impl FnOnce() -> TaskId,
    task: impl FnOnce() -> anyhow::Result<T>,
) -> TaskOutcome<T> {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(output)) => TaskOutcome::Completed(output),
        Ok(Err(err)) => TaskOutcome::Failed(TaskFailure::from_error(id(), &err)),
        Err(panic) => TaskOutcome::Failed(TaskFailure::new(id(), panic_message(panic.as_ref()))),
    }
}

/// Starts `min(config.workers, items)` blocking workers that pull items from
/// a shared queue until it is empty, sending one outcome per item.
fn spawn_pool<I, T, F>(
    phase: Phase,
    items: Vec<I>,
    config: &EngineConfig,
    token: &CancellationToken,
    work: F,
) -> StageStream<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> TaskOutcome<T> + Send + Sync + 'static,
{
    let (sender, receiver) = mpsc::channel(config.channel_capacity);
    let mut workers = JoinSet::new();
    let n_workers = config.workers.min(items.len());
    debug!(%phase, items = items.len(), workers = n_workers, "dispatching tasks");

    let queue = Arc::new(Mutex::new(items.into_iter()));
    let work = Arc::new(work);
    for worker_id in 0..n_workers {
        let queue = Arc::clone(&queue);
        let sender = sender.clone();
        let work = Arc::clone(&work);
        let token = token.clone();
        workers.spawn_blocking(move || {
            let mut processed = 0usize;
            while !token.is_cancelled() {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next();
                let Some(item) = next else {
                    break;
                };
                if sender.blocking_send(work(item)).is_err() {
                    break;
                }
                processed += 1;
            }
            trace!(%phase, worker_id, processed, "worker exiting");
        });
    }

    StageStream::new(phase, receiver, workers)
}

/// Starts the map stage over `records`, each tagged with its input index.
///
/// Each record's pairs are sent downstream as one batch.
pub fn perform_map<M: Mapper>(
    mapper: &Arc<M>,
    records: Vec<(usize, M::Record)>,
    config: &EngineConfig,
    token: &CancellationToken,
) -> StageStream<Vec<KeyValue<M::Key, M::Value>>> {
    let mapper = Arc::clone(mapper);
    spawn_pool(Phase::Mapping, records, config, token, move |(index, record)| {
        run_task(|| TaskId::Record(index), || mapper.map(record))
    })
}

/// Groups the map stage's output by key.
///
/// The grouping is only returned once every map worker has finished; failed
/// records are handed back alongside it for the caller to act on.
pub async fn perform_shuffle<K, V>(
    stream: StageStream<Vec<KeyValue<K, V>>>,
    token: &CancellationToken,
) -> MapReduceResult<StageReport<Grouping<K, V>>>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    let mut grouping = Grouping::new();
    let mut pairs = 0usize;
    let failures = stream
        .drain(Phase::Shuffling, token, |batch| {
            for KeyValue { key, value } in batch {
                pairs += 1;
                grouping.entry(key).or_insert_with(Vec::new).push(value);
            }
        })
        .await?;
    debug!(pairs, keys = grouping.len(), failed = failures.len(), "shuffle complete");

    Ok(StageReport {
        output: grouping,
        failures,
    })
}

/// Starts the reduce stage, one reducer call per key in `grouping`, on the
/// same kind of pool the map stage uses.
pub fn perform_reduce<K, V, R>(
    reducer: &Arc<R>,
    grouping: Grouping<K, V>,
    config: &EngineConfig,
    token: &CancellationToken,
) -> StageStream<KeyValue<K, R::Output>>
where
    K: Eq + Hash + Debug + Send + 'static,
    V: Send + 'static,
    R: Reducer<K, V>,
{
    let reducer = Arc::clone(reducer);
    let groups: Vec<(K, Vec<V>)> = grouping.into_iter().collect();
    spawn_pool(Phase::Reducing, groups, config, token, move |(key, values)| {
        match run_task(|| TaskId::key(&key), || reducer.reduce(&key, values)) {
            TaskOutcome::Completed(value) => TaskOutcome::Completed(KeyValue::new(key, value)),
            TaskOutcome::Failed(failure) => TaskOutcome::Failed(failure),
        }
    })
}

/// Drains the reduce stage into the final result.
///
/// Keys reaching this point are distinct, so inserting never overwrites.
pub async fn collect<K, O>(
    stream: StageStream<KeyValue<K, O>>,
    token: &CancellationToken,
) -> MapReduceResult<StageReport<FinalResult<K, O>>>
where
    K: Eq + Hash + Send + 'static,
    O: Send + 'static,
{
    let mut result = FinalResult::new();
    let failures = stream
        .drain(Phase::Collecting, token, |KeyValue { key, value }| {
            let previous = result.insert(key, value);
            debug_assert!(previous.is_none(), "key reduced twice");
        })
        .await?;

    Ok(StageReport {
        output: result,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Split;

    impl Mapper for Split {
        type Record = &'static str;
        type Key = String;
        type Value = u32;

        fn map(&self, record: &'static str) -> MapOutput<String, u32> {
            if record == "boom" {
                bail!("cannot map {record}");
            }
            if record == "panic" {
                panic!("mapper blew up");
            }
            Ok(record
                .split_whitespace()
                .map(|word| KeyValue::new(word.to_string(), 1))
                .collect())
        }
    }

    struct Sum;

    impl Reducer<String, u32> for Sum {
        type Output = u32;

        fn reduce(&self, key: &String, values: Vec<u32>) -> anyhow::Result<u32> {
            if key == "poison" {
                bail!("refusing to reduce {key}");
            }
            if key == "panic" {
                panic!("reducer blew up");
            }
            Ok(values.into_iter().sum())
        }
    }

    fn indexed(records: &[&'static str]) -> Vec<(usize, &'static str)> {
        records.iter().copied().enumerate().collect()
    }

    fn config(workers: usize) -> EngineConfig {
        EngineConfig::default()
            .with_workers(workers)
            .with_channel_capacity(2)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shuffle_groups_every_pair() {
        let token = CancellationToken::new();
        let records = indexed(&["a b a", "b c", "", "a"]);
        let stream = perform_map(&Arc::new(Split), records, &config(3), &token);
        let report = perform_shuffle(stream, &token).await.unwrap();

        assert!(report.failures.is_empty());
        let mut grouping = report.output;
        assert_eq!(grouping.len(), 3);
        assert_eq!(grouping.remove("a").unwrap().len(), 3);
        assert_eq!(grouping.remove("b").unwrap().len(), 2);
        assert_eq!(grouping.remove("c").unwrap(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn map_failures_and_panics_are_reported_per_record() {
        let token = CancellationToken::new();
        let records = indexed(&["a", "boom", "b", "panic"]);
        let stream = perform_map(&Arc::new(Split), records, &config(2), &token);
        let report = perform_shuffle(stream, &token).await.unwrap();

        let mut failed: Vec<_> = report
            .failures
            .iter()
            .map(|f| f.task.clone())
            .collect();
        failed.sort_by_key(|task| task.to_string());
        assert_eq!(failed, vec![TaskId::Record(1), TaskId::Record(3)]);
        let panicked = report
            .failures
            .iter()
            .find(|f| f.task == TaskId::Record(3))
            .unwrap();
        assert_eq!(panicked.reason, "panicked: mapper blew up");
        assert_eq!(report.output.len(), 2);
    }

    #[tokio::test]
    async fn empty_map_stage_closes_immediately() {
        let token = CancellationToken::new();
        let stream = perform_map(&Arc::new(Split), Vec::new(), &config(4), &token);
        let report = perform_shuffle(stream, &token).await.unwrap();
        assert!(report.output.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduce_and_collect_cover_every_key_once() {
        let token = CancellationToken::new();
        let grouping: Grouping<String, u32> = (0..50)
            .map(|n| (format!("key-{n}"), vec![1; n % 5 + 1]))
            .collect();

        let stream = perform_reduce(&Arc::new(Sum), grouping, &config(4), &token);
        let report = collect(stream, &token).await.unwrap();

        assert!(report.failures.is_empty());
        assert_eq!(report.output.len(), 50);
        assert_eq!(report.output["key-7"], 3);
        let expected: usize = (0..50usize).map(|n| n % 5 + 1).sum();
        assert_eq!(report.output.values().sum::<u32>(), expected as u32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduce_failure_names_the_key() {
        let token = CancellationToken::new();
        let grouping: Grouping<String, u32> =
            [("fine".to_string(), vec![1, 2]), ("poison".to_string(), vec![3])]
                .into_iter()
                .collect();

        let stream = perform_reduce(&Arc::new(Sum), grouping, &config(2), &token);
        let report = collect(stream, &token).await.unwrap();

        assert_eq!(report.output.len(), 1);
        assert_eq!(report.output["fine"], 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task, TaskId::key("poison"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_never_exceeds_configured_workers() {
        struct Gauge {
            running: AtomicUsize,
            peak: AtomicUsize,
        }

        impl Mapper for Gauge {
            type Record = u32;
            type Key = u32;
            type Value = ();

            fn map(&self, record: u32) -> MapOutput<u32, ()> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![KeyValue::new(record % 7, ())])
            }
        }

        let gauge = Arc::new(Gauge {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        let records = (0..40u32).enumerate().collect();
        let stream = perform_map(&gauge, records, &config(3), &token);
        let report = perform_shuffle(stream, &token).await.unwrap();

        assert_eq!(report.output.values().map(Vec::len).sum::<usize>(), 40);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_drain() {
        let token = CancellationToken::new();
        token.cancel();
        let stream = perform_map(&Arc::new(Split), indexed(&["a", "b"]), &config(1), &token);
        let err = perform_shuffle(stream, &token).await.unwrap_err();
        assert!(matches!(
            err,
            MapReduceError::Cancelled {
                phase: Phase::Shuffling
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reducer_panic_is_reported_for_its_key() {
        let token = CancellationToken::new();
        let grouping: Grouping<String, u32> =
            [("fine".to_string(), vec![1, 2]), ("panic".to_string(), vec![3])]
                .into_iter()
                .collect();

        let stream = perform_reduce(&Arc::new(Sum), grouping, &config(2), &token);
        let report = collect(stream, &token).await.unwrap();

        assert_eq!(report.output.len(), 1);
        assert_eq!(report.output["fine"], 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task, TaskId::key("panic"));
        assert_eq!(report.failures[0].reason, "panicked: reducer blew up");
    }

    struct SlowGauge {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Reducer<u32, u32> for SlowGauge {
        type Output = u32;

        fn reduce(&self, _key: &u32, values: Vec<u32>) -> anyhow::Result<u32> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(values.into_iter().sum())
        }
    }

    async fn reduce_peak(keys: Vec<u32>, workers: usize) -> usize {
        let gauge = Arc::new(SlowGauge {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        let n_keys = keys.len();
        let grouping: Grouping<u32, u32> = keys
            .into_iter()
            .map(|key| (key, vec![1]))
            .collect();

        let stream = perform_reduce(&gauge, grouping, &config(workers), &token);
        let report = collect(stream, &token).await.unwrap();
        assert_eq!(report.output.len(), n_keys);
        gauge.peak.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduce_uses_every_worker_slot() {
        let peak = reduce_peak(vec![0, 1000, 2000, 3000], 4).await;
        assert_eq!(peak, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduce_pool_never_exceeds_configured_workers() {
        let peak = reduce_peak((0..12).collect(), 3).await;
        assert!(peak <= 3, "peak = {peak}");
    }

    #[test]
    fn panic_messages_are_extracted() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "panicked: owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "panicked: non-string panic payload");
    }
}
