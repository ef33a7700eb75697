mod orchestrator;
mod state;

pub use orchestrator::{ResearchJob, ResearchOrchestrator};
pub use state::{
    progress_after, step, Event, Phase, ResearchRun, TransitionError, COMPILE_TOPIC,
};
