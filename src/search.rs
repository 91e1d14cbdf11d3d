use log::debug;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use std::num::NonZeroUsize;

use crate::action::Action;
use crate::agent::{AgentError, LoopTreeAgent};
use crate::metrics::Metric;

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("Failed to start {threads} worker threads: {source}")]
    ThreadPool {
        threads: usize,
        source: rayon::ThreadPoolBuildError,
    },
}

/// Scores every available action by applying it to a copy of `agent` and evaluating `metric`.
///
/// Results are sorted ascending by score, ties broken by action order. With `jobs` of one the
/// candidates are evaluated on the calling thread, with more they run on a dedicated pool of
/// that many threads, and with `None` on the global rayon pool.
pub fn rank_actions(
    agent: &LoopTreeAgent,
    metric: Metric,
    jobs: Option<NonZeroUsize>,
) -> Result<Vec<(Action, f64)>, SearchError> {
    let candidates = agent.available_actions()?;
    let thread_count = jobs
        .map(|j| j.get())
        .unwrap_or_else(rayon::current_num_threads);
    debug!(
        "Ranking {} actions by {metric} on {thread_count} thread(s)",
        candidates.len()
    );

    let score = |action: Action| -> Result<(Action, f64), AgentError> {
        let mut lookahead = agent.clone();
        lookahead.apply(action)?;
        Ok((action, lookahead.evaluate(metric)?))
    };
    let mut ranked = match jobs {
        Some(_) if thread_count == 1 => candidates
            .into_iter()
            .map(score)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(thread_count)
                .build()
                .map_err(|source| SearchError::ThreadPool {
                    threads: thread_count,
                    source,
                })?;
            pool.install(|| {
                candidates
                    .into_par_iter()
                    .map(score)
                    .collect::<Result<Vec<_>, _>>()
            })?
        }
        None => candidates
            .into_par_iter()
            .map(score)
            .collect::<Result<Vec<_>, _>>()?,
    };
    // Stable, so equal scores keep action order.
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(ranked)
}
