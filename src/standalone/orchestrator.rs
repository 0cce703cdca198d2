//! Sequences the stages of a run.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{collect, perform_map, perform_reduce, perform_shuffle};
use super::phase::{Phase, PhaseTracker};
use crate::config::EngineConfig;
use crate::error::{MapReduceError, MapReduceResult, TaskFailure, TaskId};
use crate::{FinalResult, Mapper, Reducer};

/// Result type produced by an [`Engine`] built from `M` and `R`.
pub type EngineResult<M, R> = FinalResult<
    <M as Mapper>::Key,
    <R as Reducer<<M as Mapper>::Key, <M as Mapper>::Value>>::Output,
>;

/// Runs MapReduce jobs for one mapper/reducer pair.
///
/// The engine keeps no state between runs, so a single instance can be
/// shared and driven by several concurrent runs over independent inputs.
pub struct Engine<M, R> {
    mapper: Arc<M>,
    reducer: Arc<R>,
    config: EngineConfig,
}

impl<M, R> Clone for Engine<M, R> {
    fn clone(&self) -> Self {
        Self {
            mapper: Arc::clone(&self.mapper),
            reducer: Arc::clone(&self.reducer),
            config: self.config.clone(),
        }
    }
}

impl<M, R> Engine<M, R>
where
    M: Mapper,
    R: Reducer<M::Key, M::Value>,
{
    pub fn new(mapper: M, reducer: R) -> Self {
        Self {
            mapper: Arc::new(mapper),
            reducer: Arc::new(reducer),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mapper: M, reducer: R, config: EngineConfig) -> MapReduceResult<Self> {
        config.validate()?;
        Ok(Self {
            mapper: Arc::new(mapper),
            reducer: Arc::new(reducer),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a job over `records` to completion.
    pub async fn run<I>(&self, records: I) -> MapReduceResult<EngineResult<M, R>>
    where
        I: IntoIterator<Item = M::Record>,
    {
        self.run_until_cancelled(records, CancellationToken::new()).await
    }

    /// Runs a job over `records`, giving up as soon as `token` is cancelled.
    ///
    /// A cancelled run returns [`MapReduceError::Cancelled`], never a partial
    /// result.
    pub async fn run_until_cancelled<I>(
        &self,
        records: I,
        token: CancellationToken,
    ) -> MapReduceResult<EngineResult<M, R>>
    where
        I: IntoIterator<Item = M::Record>,
    {
        self.try_run(records.into_iter().map(Ok), token).await
    }

    /// Runs a job over inputs that may already have failed to be read.
    ///
    /// An `Err` input is never handed to the mapper. It is reported as a
    /// [`TaskId::Input`] failure together with any map failures, and the run
    /// does not proceed to reduce.
    pub async fn try_run<I>(
        &self,
        inputs: I,
        token: CancellationToken,
    ) -> MapReduceResult<EngineResult<M, R>>
    where
        I: IntoIterator<Item = anyhow::Result<M::Record>>,
    {
        let started = Instant::now();
        let mut tracker = PhaseTracker::new();
        match self.execute(inputs, &token, &mut tracker).await {
            Ok(result) => {
                info!(
                    keys = result.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run complete"
                );
                Ok(result)
            }
            Err(err) => {
                tracker.fail();
                warn!(phase = %err.phase(), "run failed: {err}");
                Err(err)
            }
        }
    }

    async fn execute<I>(
        &self,
        inputs: I,
        token: &CancellationToken,
        tracker: &mut PhaseTracker,
    ) -> MapReduceResult<EngineResult<M, R>>
    where
        I: IntoIterator<Item = anyhow::Result<M::Record>>,
    {
        let mut failures = Vec::new();
        let mut records = Vec::new();
        for (index, input) in inputs.into_iter().enumerate() {
            match input {
                Ok(record) => records.push((index, record)),
                Err(err) => {
                    warn!(index, "skipping malformed input record: {err:#}");
                    failures.push(TaskFailure::from_error(TaskId::Input(index), &err));
                }
            }
        }

        tracker.advance();
        let mapped = perform_map(&self.mapper, records, &self.config, token);

        // Grouping is final only once every map worker has reported.
        tracker.advance();
        let shuffled = perform_shuffle(mapped, token).await?;
        failures.extend(shuffled.failures);
        if !failures.is_empty() {
            return Err(MapReduceError::TaskFailures {
                phase: Phase::Mapping,
                failures,
            });
        }
        check_cancelled(token, tracker.current())?;

        tracker.advance();
        let reduced = perform_reduce(&self.reducer, shuffled.output, &self.config, token);

        tracker.advance();
        let collected = collect(reduced, token).await?;
        if !collected.failures.is_empty() {
            return Err(MapReduceError::TaskFailures {
                phase: Phase::Reducing,
                failures: collected.failures,
            });
        }

        tracker.advance();
        debug!(phase = %tracker.current(), "all stages finished");
        Ok(collected.output)
    }
}

fn check_cancelled(token: &CancellationToken, phase: Phase) -> MapReduceResult<()> {
    if token.is_cancelled() {
        return Err(MapReduceError::Cancelled { phase });
    }
    Ok(())
}
