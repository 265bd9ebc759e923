use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::Member;
use crate::types::{DomainMode, SubmitTarget};

/// nemostage - stage and drive resumable multi-year NEMO runs
#[derive(Parser)]
#[command(name = "nemostage")]
#[command(about = "Stages NEMO run directories and writes resumable Slurm drivers")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: stage everything but only log external tools and sbatch.
    ///
    /// The run directory, scripts and manifest are still written so the
    /// result can be inspected. ncks/ncrename are not run, so the ice-shelf
    /// bathymetry is not verified.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Stage configuration (JSON). Built-in defaults when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stage, script and submit one or more ensemble members
    Launch {
        /// Run type (SVM, AJTOY, ASF, SR_ML)
        #[arg(short, long)]
        run_type: String,
        /// Case identifier, zero-padded to five characters
        #[arg(long)]
        case: String,
        /// Ensemble member as NUM or NUM:FLX (repeatable)
        #[arg(short = 'm', long = "member", required = true)]
        members: Vec<Member>,
        /// First simulated year
        #[arg(long, default_value_t = 1)]
        start_year: u32,
        /// Last simulated year
        #[arg(long)]
        max_year: u32,
        /// Run description recorded in README and rPARAMS.py
        #[arg(short, long)]
        description: Option<String>,
        /// Years of production output at the end of a production run
        #[arg(long)]
        production_offset: Option<u32>,
        /// default, hacked:<hook> or external:<domain_cfg.nc>
        #[arg(long)]
        domain_mode: Option<DomainMode>,
        /// Script handed to sbatch (quick, long, production, none)
        #[arg(long, default_value_t = SubmitTarget::Production)]
        submit: SubmitTarget,
    },
    /// Apply group.param=value assignments to a namelist
    Patch {
        /// Namelist to patch
        document: PathBuf,
        /// Assignment, e.g. namtrd.ln_dyn_trd=.true. (repeatable)
        #[arg(short = 's', long = "set", required = true)]
        assignments: Vec<String>,
        /// Write the result here instead of patching in place
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(value_name = "CONFIG")]
        file: PathBuf,
    },
    /// Write the built-in configuration to a file
    InitConfig {
        /// Destination (must not exist)
        path: PathBuf,
    },
    /// Report the year state of every run launched from a template directory
    Status {
        /// Template directory holding rfiles/runme
        template_dir: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
