//! Artifact resolver: run type + variant identifiers → [`RunSpec`]
//!
//! Pure selection logic over [`StageConfig::run_types`]. Nothing here touches
//! the filesystem; existence of the resolved inputs is the stager's concern.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::config::{FileRename, IceShelfRemoval, StageConfig};
use crate::error::{Result, StageError};
use crate::namelist::Patch;
use crate::types::{DomainMode, RunType};

/// Identifiers of one ensemble member
#[derive(Debug, Clone, Default)]
pub struct VariantParams {
    /// Case identifier, zero-padded to five characters
    pub case: String,
    /// Experiment number substituted into config names and input file names
    pub number: String,
    /// Flux forcing index, required when the run type uses flux forcing
    pub flux: Option<String>,
    pub start_year: u32,
    pub max_year: u32,
    pub description: Option<String>,
    pub domain_mode: Option<DomainMode>,
    pub production_offset: Option<u32>,
}

/// Input artifacts of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPaths {
    pub template_dir: PathBuf,
    pub executable: PathBuf,
    pub bathymetry: PathBuf,
    pub temperature_salinity: PathBuf,
    pub flux_forcing: Option<PathBuf>,
}

/// Everything needed to stage and drive one run. Built once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct RunSpec {
    pub run_type: RunType,
    pub case_id: String,
    pub number: String,
    pub config_name: String,
    pub start_year: u32,
    pub max_year: u32,
    pub ocean_cores: u32,
    pub nodes: u32,
    pub paths: RunPaths,
    pub description: String,
    pub namelist_patches: Patch,
    pub domain_patches: Patch,
    pub domain_mode: DomainMode,
    pub work_dir: PathBuf,
    pub stock_dir: PathBuf,
    pub project: String,
    pub days_per_year: u32,
    pub kill_ice_shelf: Option<IceShelfRemoval>,
    pub production_offset: u32,
    pub reference_namelist: Option<String>,
    pub spinup_renames: Vec<FileRename>,
    pub production_renames: Vec<FileRename>,
    pub rebuild_tool: PathBuf,
    pub psi_tool: PathBuf,
}

impl RunSpec {
    /// Number of simulated years, `start_year..=max_year`
    pub fn year_count(&self) -> u32 {
        self.max_year - self.start_year + 1
    }

    /// Last year (exclusive) of the production script's spin-up phase
    pub fn spinup_end(&self) -> u32 {
        self.max_year.saturating_sub(self.production_offset)
    }

    /// `<config>_<case>`
    pub fn run_name(&self) -> String {
        format!("{}_{}", self.config_name, self.case_id)
    }

    /// Archive directory the cleanup step fills
    pub fn output_dir(&self) -> PathBuf {
        self.stock_dir.join(self.run_name())
    }
}

struct Placeholders<'a> {
    case: &'a str,
    num: &'a str,
    num5: String,
    flx: Option<&'a str>,
    config: Option<&'a str>,
}

impl Placeholders<'_> {
    fn expand(&self, what: &str, pattern: &str) -> Result<String> {
        let mut out = pattern
            .replace("{case}", self.case)
            .replace("{num5}", &self.num5)
            .replace("{num}", self.num);
        if out.contains("{flx}") {
            let flx = self.flx.ok_or_else(|| {
                StageError::config(format!("{} '{}' needs a flux forcing index", what, pattern))
            })?;
            out = out.replace("{flx}", flx);
        }
        if out.contains("{config}") {
            let config = self.config.ok_or_else(|| {
                StageError::config(format!("{} '{}' cannot refer to {{config}}", what, pattern))
            })?;
            out = out.replace("{config}", config);
        }
        Ok(out)
    }
}

fn pad5(s: &str) -> String {
    format!("{:0>5}", s)
}

fn known_run_types() -> String {
    RunType::iter()
        .map(|rt| rt.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve a run type and variant into a [`RunSpec`].
///
/// # Errors
///
/// - `UnrecognizedConfiguration` for an unknown selector, or one with no
///   profile in `config`
/// - `Config` for an invalid year range, an empty case, or a missing flux index
pub fn resolve(config: &StageConfig, run_type: &str, variant: &VariantParams) -> Result<RunSpec> {
    let parsed = RunType::from_str(run_type.trim()).map_err(|_| {
        StageError::UnrecognizedConfiguration {
            selector: run_type.to_string(),
            known: known_run_types(),
        }
    })?;
    let profile = config
        .run_types
        .get(&parsed)
        .ok_or_else(|| StageError::UnrecognizedConfiguration {
            selector: run_type.to_string(),
            known: config
                .run_types
                .keys()
                .map(|rt| rt.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })?;

    let case = variant.case.trim();
    if case.is_empty() || case.contains('/') {
        return Err(StageError::config(format!(
            "case identifier '{}' is not a valid directory component",
            variant.case
        )));
    }
    if variant.start_year < 1 {
        return Err(StageError::config("start_year must be at least 1"));
    }
    if variant.max_year < variant.start_year {
        return Err(StageError::config(format!(
            "max_year ({}) is before start_year ({})",
            variant.max_year, variant.start_year
        )));
    }

    let case_id = pad5(case);
    let mut vars = Placeholders {
        case: &case_id,
        num: &variant.number,
        num5: pad5(&variant.number),
        flx: variant.flux.as_deref(),
        config: None,
    };
    let config_name = vars.expand("config_name", &profile.config_name)?;
    vars.config = Some(&config_name);

    let input = |what: &str, pattern: &str| -> Result<PathBuf> {
        let expanded = vars.expand(what, pattern)?;
        Ok(profile.input_dir.join(expanded))
    };

    let paths = RunPaths {
        template_dir: profile.template_dir.clone(),
        executable: profile.executable.clone(),
        bathymetry: input("bathymetry", &profile.bathymetry)?,
        temperature_salinity: input("temperature_salinity", &profile.temperature_salinity)?,
        flux_forcing: profile
            .flux_forcing
            .as_deref()
            .map(|p| input("flux_forcing", p))
            .transpose()?,
    };

    let work_dir = config
        .run_root
        .join(format!("{}_{}", config_name, case_id));

    let spec = RunSpec {
        run_type: parsed,
        case_id,
        number: variant.number.clone(),
        config_name,
        start_year: variant.start_year,
        max_year: variant.max_year,
        ocean_cores: profile.ocean_cores,
        nodes: profile.nodes,
        paths,
        description: variant
            .description
            .clone()
            .unwrap_or_else(|| profile.description.clone()),
        namelist_patches: profile.namelist_patch.clone(),
        domain_patches: profile.domain_patch.clone(),
        domain_mode: variant
            .domain_mode
            .clone()
            .unwrap_or_else(|| profile.domain_mode.clone()),
        work_dir,
        stock_dir: config.stock_dir.clone(),
        project: config.project.clone(),
        days_per_year: config.days_per_year,
        kill_ice_shelf: profile.kill_ice_shelf.clone(),
        production_offset: variant
            .production_offset
            .unwrap_or(profile.production_offset),
        reference_namelist: profile.reference_namelist.clone(),
        spinup_renames: profile.spinup_renames.clone(),
        production_renames: profile.production_renames.clone(),
        rebuild_tool: config.rebuild_tool.clone(),
        psi_tool: config.psi_tool.clone(),
    };

    debug!(
        "Resolved {} case {} → {}",
        spec.run_type,
        spec.case_id,
        spec.work_dir.display()
    );
    Ok(spec)
}

/// `<flux>` minus `.nc`, the stem the three grid files hang off
pub fn flux_stem(flux: &Path) -> String {
    let s = flux.to_string_lossy();
    s.strip_suffix(".nc").unwrap_or(&s).to_string()
}
