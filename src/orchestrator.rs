//! Launch orchestration: resolve → stage → domain → scripts → manifest →
//! ledger → submit, once per ensemble member.
//!
//! This is the binary's edge, so it speaks `anyhow` and attaches the member
//! being launched as context. The typed [`StageError`](crate::error::StageError)
//! underneath stays reachable through `downcast_ref`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::batch::{self, GeneratorSettings};
use crate::config::StageConfig;
use crate::domain::{self, DomainPlan};
use crate::manifest::{self, LaunchLedger, PARAMS_JSON};
use crate::namelist::{self, Patch, parse_assignment};
use crate::resolver::{self, RunSpec, VariantParams};
use crate::stager::{self, RunDirectory};
use crate::state::YearState;
use crate::tools::{SbatchArgs, run_tool_safe};
use crate::types::{DomainMode, SubmitTarget};

/// One ensemble member, `NUM[:FLX]` on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub number: String,
    pub flux: Option<String>,
}

impl FromStr for Member {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (number, flux) = match s.split_once(':') {
            Some((n, f)) => (n.trim(), Some(f.trim())),
            None => (s.trim(), None),
        };
        if number.is_empty() || flux.is_some_and(str::is_empty) {
            return Err(format!("Invalid member '{}'. Expected NUM or NUM:FLX", s));
        }
        Ok(Self {
            number: number.to_string(),
            flux: flux.map(str::to_string),
        })
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.flux {
            Some(flux) => write!(f, "{}:{}", self.number, flux),
            None => write!(f, "{}", self.number),
        }
    }
}

/// Everything `nemostage launch` was asked to do
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_type: String,
    pub case: String,
    pub members: Vec<Member>,
    pub start_year: u32,
    pub max_year: u32,
    pub description: Option<String>,
    pub production_offset: Option<u32>,
    pub domain_mode: Option<DomainMode>,
    pub submit: SubmitTarget,
}

impl LaunchRequest {
    fn variant(&self, member: &Member) -> VariantParams {
        VariantParams {
            case: self.case.clone(),
            number: member.number.clone(),
            flux: member.flux.clone(),
            start_year: self.start_year,
            max_year: self.max_year,
            description: self.description.clone(),
            domain_mode: self.domain_mode.clone(),
            production_offset: self.production_offset,
        }
    }
}

/// Result of launching one member
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub spec: RunSpec,
    pub run: RunDirectory,
    pub plan: DomainPlan,
    pub scripts: Vec<PathBuf>,
    pub ledger: PathBuf,
    /// Scheduler job ID, when a script was actually submitted
    pub job_id: Option<u64>,
}

pub struct Orchestrator<'a> {
    config: &'a StageConfig,
    /// Binary the production script calls back for the diagnostic patch
    patch_tool: PathBuf,
    dry_run: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a StageConfig, patch_tool: PathBuf, dry_run: bool) -> Self {
        Self {
            config,
            patch_tool,
            dry_run,
        }
    }

    /// Launch every member in order, stopping at the first failure
    pub fn launch(&self, request: &LaunchRequest) -> Result<Vec<LaunchOutcome>> {
        if request.members.is_empty() {
            anyhow::bail!("no ensemble members given");
        }
        let mut outcomes = Vec::with_capacity(request.members.len());
        for member in &request.members {
            let outcome = self.launch_member(request, member).with_context(|| {
                format!(
                    "launching {} case {} member {}",
                    request.run_type, request.case, member
                )
            })?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn launch_member(&self, request: &LaunchRequest, member: &Member) -> Result<LaunchOutcome> {
        let spec = resolver::resolve(self.config, &request.run_type, &request.variant(member))?;
        info!(
            "Launching {} ({}), years {}..={}",
            spec.run_name(),
            spec.run_type,
            spec.start_year,
            spec.max_year
        );

        // every input is checked before the run directory exists
        domain::check_preconditions(&spec, self.config)?;
        let run = stager::stage(&spec)?;
        let plan = domain::prepare_domain(&spec, &run, self.config, self.dry_run)?;

        let settings = GeneratorSettings::from_config(self.config, self.patch_tool.clone());
        let scripts = batch::generate(&spec, &plan, &settings)?.write_all(&run.root)?;

        manifest::write_manifest(&spec, &run)?;
        let ledger = manifest::append_ledger(&spec.paths.template_dir, &run.root, spec.year_count())?;

        let job_id = match request.submit.script() {
            Some(kind) => {
                let args = SbatchArgs {
                    program: self.config.tools.sbatch.clone(),
                    script: PathBuf::from(kind.file_name()),
                };
                let output = run_tool_safe(&args, &run.root, self.dry_run)?;
                output.ensure_success("sbatch")?;
                let id = output.batch_job_id();
                match id {
                    Some(id) => info!("Submitted {} as job {}", kind.file_name(), id),
                    None if output.dry_run => {}
                    None => warn!("sbatch gave no job ID: {}", output.stdout.trim()),
                }
                id
            }
            None => {
                info!("Not submitting {}", spec.run_name());
                None
            }
        };

        Ok(LaunchOutcome {
            spec,
            run,
            plan,
            scripts,
            ledger,
            job_id,
        })
    }
}

/// `nemostage patch`: apply `group.param=value` assignments to a namelist
pub fn patch_document(document: &Path, assignments: &[String], out: Option<&Path>) -> Result<()> {
    let mut patch = Patch::new();
    for raw in assignments {
        let (group, name, value) = parse_assignment(raw).map_err(|e| anyhow::anyhow!(e))?;
        patch.entry(group).or_default().insert(name, value);
    }
    namelist::patch_to(document, &patch, out.unwrap_or(document))?;
    Ok(())
}

/// Progress of one run listed in a launch ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub run_dir: PathBuf,
    /// `None` when the run directory is gone
    pub year: Option<u32>,
    pub max_year: Option<u32>,
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        match (self.year, self.max_year) {
            (Some(year), Some(max)) => YearState { year }.is_complete(max),
            _ => false,
        }
    }
}

fn recorded_max_year(run_dir: &Path) -> Option<u32> {
    let text = fs::read_to_string(run_dir.join(PARAMS_JSON)).ok()?;
    let map: BTreeMap<String, String> = serde_json::from_str(&text).ok()?;
    map.get("rP_YEAR_MAX")?.parse().ok()
}

/// `nemostage status`: year state of every run in a template's ledger
pub fn status(template_dir: &Path) -> Result<(LaunchLedger, Vec<RunStatus>)> {
    let ledger = LaunchLedger::load(template_dir)?;
    let mut runs = Vec::with_capacity(ledger.runs.len());
    for run_dir in &ledger.runs {
        let year = if run_dir.is_dir() {
            Some(YearState::load(run_dir)?.year)
        } else {
            None
        };
        runs.push(RunStatus {
            run_dir: run_dir.clone(),
            year,
            max_year: recorded_max_year(run_dir),
        });
    }
    Ok((ledger, runs))
}
