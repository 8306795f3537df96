//! Kiln Build Engine
//!
//! Incremental build orchestration: a graph of build steps is executed by a
//! priority-ordered cooperative scheduler on a fixed pool of worker threads.
//! Command steps are skipped when a cached result exists for their command
//! hash and every input they read still hashes the same.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Builder                            │
//! │  - owns the root list step and the build database           │
//! │  - run(mode) spawns worker threads, tallies leaf statuses   │
//! │  - write_index_file() persists internal outputs             │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RunState / Executor                      │
//! │  - one task per scheduled step, ordered by priority         │
//! │  - waits for prerequisites, classifies failures             │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ExecuteContext / CommandContext             │
//! │  - input hashing, output publication, sub-scheduling        │
//! │  - result cache lookups and in-flight command registry      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use kiln_engine::{BuildMode, BuildStep, Builder, BuilderConfig};
//!
//! let builder = Builder::new(BuilderConfig::new("/path/to/build"))?;
//! builder.register_command::<MyCommand>("my-command");
//! builder.add_step(Arc::new(BuildStep::command(Arc::new(my_command))))?;
//!
//! let report = builder.run(BuildMode::Build)?;
//! builder.write_index_file(false)?;
//! ```

mod builder;
mod cache;
mod command;
mod context;
mod dynamic;
mod error;
mod events;
mod executor;
mod list;
mod log;
mod scheduler;
mod status;
mod step;

pub use builder::{
  BuildReport, Builder, BuilderConfig, CACHE_FORMAT_VERSION, DO_NOT_COMPRESS_TAG, DO_NOT_PACK_TAG,
};
pub use cache::{ResultCache, ResultEntry};
pub use command::{Command, CommandRecord, CommandRegistry, CommandStep};
pub use context::{CommandContext, ExecuteContext};
pub use dynamic::{BuildStepProvider, DynamicStep};
pub use error::{BuildError, StepError};
pub use events::{BuildEvent, BuildNotifier, ChannelNotifier, NoopNotifier};
pub use list::ListStep;
pub use log::{LogLevel, LogMessage, StepLog};
pub use status::{BuildMode, BuildResultCode, ResultStatus, StepCounter, StepCounts};
pub use step::{BuildStep, DEFAULT_PRIORITY, HIGHEST_PRIORITY, OutputGroup, OutputObject, StepKind, StepWork};

pub use kiln_storage::{ObjectId, ObjectUrl, UrlType};
