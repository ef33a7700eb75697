use std::future::Future;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use super::state::{step, Event, ResearchRun};
use crate::config::ModelSpec;
use crate::framing::Frame;
use crate::models::ChatTurn;
use crate::tasks::{
    sources_from_hits, CompileRequest, ReportCompiler, ResourceAnalyzer, ResourceSearcher,
    TopicPlanner,
};

/// Input of one end-to-end research run.
#[derive(Debug, Clone)]
pub struct ResearchJob {
    pub prompt: String,
    pub history: Vec<ChatTurn>,
    pub model: ModelSpec,
}

/// Drives a run through planning, per-topic search and analysis, and
/// compilation, publishing every intermediate state.
pub struct ResearchOrchestrator {
    planner: TopicPlanner,
    searcher: ResourceSearcher,
    analyzer: ResourceAnalyzer,
    compiler: ReportCompiler,
}

impl ResearchOrchestrator {
    pub fn new(
        planner: TopicPlanner,
        searcher: ResourceSearcher,
        analyzer: ResourceAnalyzer,
        compiler: ReportCompiler,
    ) -> Self {
        Self {
            planner,
            searcher,
            analyzer,
            compiler,
        }
    }

    pub fn planner(&self) -> &TopicPlanner {
        &self.planner
    }

    pub fn searcher(&self) -> &ResourceSearcher {
        &self.searcher
    }

    pub fn analyzer(&self) -> &ResourceAnalyzer {
        &self.analyzer
    }

    pub fn compiler(&self) -> &ReportCompiler {
        &self.compiler
    }

    /// Runs the job to a terminal state. Topics are processed one after the
    /// other; only a planner or compiler failure fails the run. Once every
    /// receiver of `updates` is gone the run stops as `Abandoned` and no
    /// further provider calls are made.
    #[instrument(skip(self, job, updates), fields(model = %job.model.id))]
    pub async fn run(&self, job: &ResearchJob, updates: &watch::Sender<ResearchRun>) -> ResearchRun {
        let start_time = std::time::Instant::now();
        info!("Starting research run");

        let mut run = ResearchRun::new(job.prompt.clone());
        updates.send_replace(run.clone());

        let Some(planned) = watched(updates, self.planner.plan(&job.prompt, &job.history)).await
        else {
            return abandon(run, updates);
        };
        let event = match planned {
            Ok(plan) => Event::Planned(plan.topics),
            Err(err) => Event::Failed(format!("Failed to plan research topics: {}", err)),
        };
        if !advance(&mut run, event, updates) {
            return run;
        }

        for index in 0..run.planned_topics() {
            let title = run.topics[index].title.clone();

            let Some(hits) = watched(updates, self.searcher.search_hits(&title)).await else {
                return abandon(run, updates);
            };
            if !advance(&mut run, Event::Searched(sources_from_hits(&hits)), updates) {
                return run;
            }

            let sources = run.topics[index].sources.clone();
            let Some(analysis) = watched(updates, self.analyzer.analyze(&title, &sources)).await
            else {
                return abandon(run, updates);
            };
            if !advance(&mut run, Event::Analyzed(analysis.learnings), updates) {
                return run;
            }
        }

        let request = CompileRequest {
            prompt: job.prompt.clone(),
            learnings: run.learnings(),
            history: job.history.clone(),
            model: job.model.clone(),
        };
        let Some(opened) = watched(updates, self.compiler.stream(&request)).await else {
            return abandon(run, updates);
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(err) => {
                advance(
                    &mut run,
                    Event::Failed(format!("Failed to compile research result: {}", err)),
                    updates,
                );
                return run;
            }
        };

        loop {
            let Some(next) = watched(updates, frames.next()).await else {
                return abandon(run, updates);
            };
            let Some(frame) = next else { break };
            let event = match frame {
                Frame::Data(text) => Event::Drafted(text),
                Frame::Meta(usage) => Event::Compiled(usage),
                Frame::Error(message) => {
                    Event::Failed(format!("Failed to compile research result: {}", message))
                }
            };
            if !advance(&mut run, event, updates) {
                break;
            }
        }

        if !run.phase.is_terminal() {
            warn!("Report stream ended without usage trailer");
            advance(
                &mut run,
                Event::Failed("Research result stream ended unexpectedly".to_string()),
                updates,
            );
        }

        info!(
            "Research run finished as {:?} in {:?}",
            run.phase,
            start_time.elapsed()
        );
        run
    }
}

/// Awaits `work` unless every subscriber leaves first, in which case the
/// work is dropped and `None` is returned.
async fn watched<T>(
    updates: &watch::Sender<ResearchRun>,
    work: impl Future<Output = T>,
) -> Option<T> {
    if updates.is_closed() {
        return None;
    }
    tokio::select! {
        biased;
        _ = updates.closed() => None,
        output = work => Some(output),
    }
}

fn abandon(mut run: ResearchRun, updates: &watch::Sender<ResearchRun>) -> ResearchRun {
    warn!("Research run abandoned by its subscriber");
    advance(&mut run, Event::Abandoned, updates);
    run
}

/// Applies `event` and publishes the new state. Returns whether the run can
/// take further events.
fn advance(run: &mut ResearchRun, event: Event, updates: &watch::Sender<ResearchRun>) -> bool {
    match step(run, event) {
        Ok(next) => {
            *run = next;
            updates.send_replace(run.clone());
            !run.phase.is_terminal()
        }
        Err(err) => {
            error!("Research run rejected event: {}", err);
            false
        }
    }
}
