//! Research run state and its transition function.
//!
//! A run moves `Planning -> {Searching(i) -> Analyzing(i)} for each topic ->
//! Compiling -> Done`, with `Failed` and `Abandoned` reachable from every
//! non-terminal phase.
//! [`step`] is pure: it takes the current run and one event and returns the
//! next run, so the orchestrator and the tests drive the same code.

use serde::Serialize;
use thiserror::Error;

use crate::models::{ResearchTopic, Source, StepEvent, UsageReport};

pub const SEARCHING_STEP: &str = "Searching resources...";
pub const READING_STEP: &str = "Reading resources...";
pub const COMPILING_STEP: &str = "Compiling research result...";
/// Title of the synthetic last topic that marks the compile phase.
pub const COMPILE_TOPIC: &str = "compile research result";

const PLANNED_PROGRESS: u8 = 10;
const RAMP: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "detail", rename_all = "camelCase")]
pub enum Phase {
    Planning,
    Searching(usize),
    Analyzing(usize),
    Compiling,
    Done,
    Failed(String),
    /// Nobody is watching the run any more.
    Abandoned,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed(_) | Phase::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Planned(Vec<String>),
    Searched(Vec<Source>),
    Analyzed(Vec<String>),
    /// A piece of the compiled answer.
    Drafted(String),
    Compiled(UsageReport),
    Failed(String),
    Abandoned,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Planned(_) => "planned",
            Event::Searched(_) => "searched",
            Event::Analyzed(_) => "analyzed",
            Event::Drafted(_) => "drafted",
            Event::Compiled(_) => "compiled",
            Event::Failed(_) => "failed",
            Event::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event `{event}` is not valid while {phase:?}")]
    Unexpected { phase: Phase, event: &'static str },

    #[error("run already finished as {0:?}")]
    Finished(Phase),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRun {
    pub prompt: String,
    /// Planned topics followed by the synthetic compile topic.
    pub topics: Vec<ResearchTopic>,
    pub cursor: usize,
    pub progress: u8,
    #[serde(flatten)]
    pub phase: Phase,
    pub answer: String,
    pub usage: Option<UsageReport>,
}

impl ResearchRun {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            topics: Vec::new(),
            cursor: 0,
            progress: 0,
            phase: Phase::Planning,
            answer: String::new(),
            usage: None,
        }
    }

    /// Number of planned topics, not counting the compile topic.
    pub fn planned_topics(&self) -> usize {
        self.topics.len().saturating_sub(1)
    }

    /// Every topic's learnings, in topic order.
    pub fn learnings(&self) -> Vec<String> {
        self.topics
            .iter()
            .flat_map(|topic| topic.learnings.iter().cloned())
            .collect()
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.phase {
            Phase::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Progress once sub-step `sub` (1 = searched, 2 = analyzed) of `topic` is done.
pub fn progress_after(topic: usize, sub: usize, topics: usize) -> u8 {
    let ramp = ((topic * 2 + sub) * RAMP)
        .checked_div(topics * 2)
        .unwrap_or(RAMP)
        .min(RAMP);
    PLANNED_PROGRESS + ramp as u8
}

pub fn step(run: &ResearchRun, event: Event) -> Result<ResearchRun, TransitionError> {
    if run.phase.is_terminal() {
        return Err(TransitionError::Finished(run.phase.clone()));
    }

    let mut next = run.clone();
    match (&run.phase, event) {
        (_, Event::Failed(reason)) => fail(&mut next, reason),

        (_, Event::Abandoned) => next.phase = Phase::Abandoned,

        (Phase::Planning, Event::Planned(titles)) => {
            if titles.is_empty() {
                fail(&mut next, "No research topics could be planned".to_string());
                return Ok(next);
            }
            next.topics = titles.into_iter().map(ResearchTopic::new).collect();
            next.topics.push(ResearchTopic::new(COMPILE_TOPIC));
            next.progress = PLANNED_PROGRESS;
            enter_searching(&mut next, 0);
        }

        (Phase::Searching(i), Event::Searched(sources)) => {
            let i = *i;
            next.topics[i].sources = sources;
            next.progress = progress_after(i, 1, next.planned_topics());
            next.phase = Phase::Analyzing(i);
            next.topics[i]
                .research_steps
                .push(StepEvent::progress(READING_STEP));
        }

        (Phase::Analyzing(i), Event::Analyzed(learnings)) => {
            let i = *i;
            next.topics[i].learnings = learnings;
            next.progress = progress_after(i, 2, next.planned_topics());
            if i + 1 < next.planned_topics() {
                enter_searching(&mut next, i + 1);
            } else {
                let compile = next.planned_topics();
                next.cursor = compile;
                next.phase = Phase::Compiling;
                next.topics[compile]
                    .research_steps
                    .push(StepEvent::progress(COMPILING_STEP));
            }
        }

        (Phase::Compiling, Event::Drafted(text)) => next.answer.push_str(&text),

        (Phase::Compiling, Event::Compiled(usage)) => {
            next.usage = Some(usage);
            next.progress = 100;
            next.cursor = next.topics.len();
            next.phase = Phase::Done;
        }

        (phase, event) => {
            return Err(TransitionError::Unexpected {
                phase: phase.clone(),
                event: event.name(),
            })
        }
    }
    Ok(next)
}

fn enter_searching(run: &mut ResearchRun, topic: usize) {
    run.cursor = topic;
    run.phase = Phase::Searching(topic);
    run.topics[topic]
        .research_steps
        .push(StepEvent::progress(SEARCHING_STEP));
}

fn fail(run: &mut ResearchRun, reason: String) {
    if let Some(topic) = run.topics.get_mut(run.cursor) {
        topic.research_steps.push(StepEvent::failure(reason.clone()));
    }
    run.phase = Phase::Failed(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepKind;
    use pretty_assertions::assert_eq;

    fn source(content: &str) -> Source {
        Source {
            url: format!("https://example.com/{content}"),
            content: content.to_string(),
            ..Source::default()
        }
    }

    fn planned(titles: &[&str]) -> ResearchRun {
        let run = ResearchRun::new("Explain quantum tunnelling");
        step(&run, Event::Planned(titles.iter().map(|t| t.to_string()).collect())).unwrap()
    }

    #[test]
    fn three_topics_ramp_from_10_to_100() {
        let mut run = planned(&["History", "Physics", "Applications"]);
        let mut seen = vec![run.progress];
        for i in 0..3 {
            run = step(&run, Event::Searched(vec![source(&format!("s{i}"))])).unwrap();
            seen.push(run.progress);
            run = step(&run, Event::Analyzed(vec![format!("l{i}")])).unwrap();
            seen.push(run.progress);
        }
        assert_eq!(run.phase, Phase::Compiling);
        run = step(&run, Event::Drafted("Tunnelling is ".into())).unwrap();
        run = step(&run, Event::Drafted("quantum.".into())).unwrap();
        run = step(&run, Event::Compiled(UsageReport::default())).unwrap();
        seen.push(run.progress);

        assert_eq!(seen, vec![10, 23, 36, 50, 63, 76, 90, 100]);
        assert_eq!(run.phase, Phase::Done);
        assert_eq!(run.cursor, run.topics.len());
        assert_eq!(run.answer, "Tunnelling is quantum.");
        assert_eq!(run.learnings(), vec!["l0", "l1", "l2"]);
    }

    #[test]
    fn progress_after_analyze_is_strictly_increasing() {
        for n in 1..=5 {
            let values: Vec<u8> = (0..n).map(|i| progress_after(i, 2, n)).collect();
            assert!(values.windows(2).all(|w| w[0] < w[1]), "n = {n}: {values:?}");
            assert_eq!(values.last(), Some(&90));
        }
        assert_eq!(progress_after(0, 1, 0), 90);
    }

    #[test]
    fn zero_topics_fail_immediately() {
        let run = step(&ResearchRun::new("?"), Event::Planned(Vec::new())).unwrap();
        assert!(run.failure().is_some());
        assert!(run.topics.is_empty());
    }

    #[test]
    fn compile_topic_is_appended_and_stays_empty() {
        let mut run = planned(&["Only"]);
        assert_eq!(run.topics.len(), 2);
        assert_eq!(run.topics[1].title, COMPILE_TOPIC);

        run = step(&run, Event::Searched(vec![source("a")])).unwrap();
        run = step(&run, Event::Analyzed(vec!["fact".into()])).unwrap();
        assert_eq!(run.cursor, 1);
        let compile = &run.topics[1];
        assert!(compile.sources.is_empty() && compile.learnings.is_empty());
        assert_eq!(compile.research_steps, vec![StepEvent::progress(COMPILING_STEP)]);
    }

    #[test]
    fn sources_and_learnings_wait_for_their_step() {
        let mut run = planned(&["A", "B"]);
        assert!(run.topics.iter().all(|t| t.sources.is_empty()));

        run = step(&run, Event::Searched(vec![source("a")])).unwrap();
        assert_eq!(run.topics[0].sources.len(), 1);
        assert!(run.topics[0].learnings.is_empty());
        assert!(run.topics[1].sources.is_empty());

        run = step(&run, Event::Analyzed(vec!["fact".into()])).unwrap();
        assert_eq!(run.topics[0].learnings, vec!["fact"]);
        assert!(run.topics[1].sources.is_empty());
        assert_eq!(run.phase, Phase::Searching(1));
        assert_eq!(
            run.topics[0]
                .research_steps
                .iter()
                .map(|s| s.message.as_str())
                .collect::<Vec<_>>(),
            vec![SEARCHING_STEP, READING_STEP]
        );
    }

    #[test]
    fn failure_keeps_completed_topics() {
        let mut run = planned(&["A", "B"]);
        run = step(&run, Event::Searched(vec![source("a")])).unwrap();
        run = step(&run, Event::Analyzed(vec!["fact".into()])).unwrap();
        run = step(&run, Event::Failed("search exploded".into())).unwrap();

        assert_eq!(run.failure(), Some("search exploded"));
        assert_eq!(run.topics[0].learnings, vec!["fact"]);
        let last = run.topics[1].research_steps.last().unwrap();
        assert_eq!(last.kind, StepKind::Failure);
        assert_eq!(run.progress, progress_after(0, 2, 2));
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let run = planned(&["A"]);
        assert_eq!(
            step(&run, Event::Analyzed(Vec::new())),
            Err(TransitionError::Unexpected {
                phase: Phase::Searching(0),
                event: "analyzed"
            })
        );

        let failed = step(&run, Event::Failed("x".into())).unwrap();
        assert!(matches!(
            step(&failed, Event::Searched(Vec::new())),
            Err(TransitionError::Finished(_))
        ));
    }

    #[test]
    fn abandoned_run_keeps_progress_and_takes_no_more_events() {
        let mut run = planned(&["A", "B"]);
        run = step(&run, Event::Searched(vec![source("a")])).unwrap();
        run = step(&run, Event::Abandoned).unwrap();

        assert_eq!(run.phase, Phase::Abandoned);
        assert_eq!(run.progress, progress_after(0, 1, 2));
        assert_eq!(run.topics[0].sources.len(), 1);
        assert!(matches!(
            step(&run, Event::Analyzed(Vec::new())),
            Err(TransitionError::Finished(Phase::Abandoned))
        ));
    }

    #[test]
    fn snapshot_serializes_for_clients() {
        let run = planned(&["A"]);
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["phase"], "searching");
        assert_eq!(value["detail"], 0);
        assert_eq!(value["progress"], 10);
        assert_eq!(value["topics"][0]["researchSteps"][0]["researchStep"], SEARCHING_STEP);
    }
}
