//! Kiln Config
//!
//! Serializable build script types. A build script describes a tree of steps
//! (lists, commands, wait barriers) plus prerequisite edges between steps
//! identified by id. The CLI loads a script from JSON, validates it, and turns
//! it into an engine step graph.

mod error;
mod script;
mod step;

pub use error::ScriptError;
pub use script::BuildScriptDef;
pub use step::{StepDef, StepType};
