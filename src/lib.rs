//! nemostage library
//!
//! Staging and driving of resumable multi-year NEMO runs: resolve a run type
//! to its inputs, build an isolated run directory, patch its namelists,
//! prepare the grid, and write the batch drivers and run manifest.

pub mod batch;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod namelist;
pub mod orchestrator;
pub mod process_guard;
pub mod resolver;
pub mod stager;
pub mod state;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use batch::{BatchScripts, GeneratorSettings, generate};
pub use config::StageConfig;
pub use domain::{DomainPlan, prepare_domain};
pub use error::{Result, StageError};
pub use manifest::{LaunchLedger, append_ledger, write_manifest};
pub use namelist::{ConfigDocument, Patch, Value};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use resolver::{RunSpec, VariantParams, resolve};
pub use stager::{RunDirectory, stage};
pub use state::YearState;
pub use types::{DomainMode, RunType, ScriptKind, SubmitTarget};
