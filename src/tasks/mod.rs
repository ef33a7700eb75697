mod analyzer;
mod compiler;
mod planner;
mod searcher;

pub use analyzer::{Analysis, ResourceAnalyzer};
pub use compiler::{CompileRequest, CompiledReport, ReportCompiler};
pub use planner::{TopicPlan, TopicPlanner};
pub use searcher::{sources_from_hits, ResourceSearcher, SearchBatch};
