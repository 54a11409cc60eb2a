pub mod llm;
pub mod registry;
pub mod types;

pub use llm::LlmExtractionExecutor;
pub use registry::ExecutorRegistry;
pub use types::{AnalysisExecutor, StepOutput};
