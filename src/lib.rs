pub mod buildspec;
pub mod error;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod process;
pub mod recipe;
pub mod release;
pub mod retry;
pub mod security;
pub mod stages;
pub mod trigger;
pub mod validation;

pub use error::{ErrorKind, StageError};
pub use pipeline::{Artifact, PipelineExecutor, PipelineRun, RunStatus, StageRegistry};
pub use recipe::Recipe;
pub use trigger::{TagPattern, TriggerEvent};
