//! Domain/grid preparation.
//!
//! The model reads its grid from `domain_cfg.nc` in the run root. That file is
//! either generated at job time from `domaincfg/` (default), generated and then
//! rewritten by a hook (hacked), or supplied from outside (external). This
//! module stages whatever the chosen mode needs; the batch scripts do the
//! generation itself.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{IceShelfRemoval, StageConfig};
use crate::error::{IoContext, Result, StageError};
use crate::namelist;
use crate::resolver::RunSpec;
use crate::stager::{ACTIVE_NAMELIST, RunDirectory, copy_flat};
use crate::tools::{NcksExcludeArgs, NcrenameArgs, ToolArgs, ToolOutput, run_tool_safe};
use crate::types::DomainMode;

pub const DOMAIN_DIR: &str = "domaincfg";
pub const DOMAIN_ARTIFACT: &str = "domain_cfg.nc";
pub const HACKED_ARTIFACT: &str = "domain_cfg_hckd.nc";
pub const GRID_EXECUTABLE: &str = "make_domain_cfg.exe";

/// What the batch scripts have to do to obtain `domain_cfg.nc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPlan {
    pub mode: DomainMode,
    /// `<run>/domaincfg` when the grid is generated at job time
    pub domain_dir: Option<PathBuf>,
    /// The bathymetry in `domaincfg/` had its ice-shelf cavity removed
    pub ice_shelf_removed: bool,
}

impl DomainPlan {
    pub fn generates_grid(&self) -> bool {
        self.mode.generates_grid()
    }

    pub fn hook(&self) -> Option<&Path> {
        match &self.mode {
            DomainMode::Hacked { hook } => Some(hook.as_path()),
            _ => None,
        }
    }
}

/// Verify what the domain mode needs before the run directory is created. Touches nothing.
pub fn check_preconditions(spec: &RunSpec, config: &StageConfig) -> Result<()> {
    match &spec.domain_mode {
        DomainMode::External { artifact } => {
            if !artifact.exists() {
                return Err(StageError::precondition("external domain_cfg.nc", artifact));
            }
        }
        DomainMode::Default | DomainMode::Hacked { .. } => {
            if !config.domain_executable.exists() {
                return Err(StageError::precondition(
                    "grid generator executable",
                    &config.domain_executable,
                ));
            }
            let template = spec.paths.template_dir.join(DOMAIN_DIR);
            if !template.is_dir() {
                return Err(StageError::precondition("domaincfg template directory", template));
            }
            if let DomainMode::Hacked { hook } = &spec.domain_mode {
                if !hook.exists() {
                    return Err(StageError::precondition("domain hook script", hook));
                }
            }
        }
    }
    Ok(())
}

fn describe(output: &ToolOutput, args: &impl ToolArgs) -> String {
    format!(
        "{} {} exited with {:?}: {}",
        args.tool_name(),
        args.to_cli_args().join(" "),
        output.exit_code,
        output.stderr.trim()
    )
}

/// Derive `bathy_meter.nc` without the ice-shelf draft:
/// copy → drop the draft variable → rename the bathymetry field.
fn remove_ice_shelf(
    bathymetry: &Path,
    dir: &Path,
    removal: &IceShelfRemoval,
    config: &StageConfig,
    dry_run: bool,
) -> Result<()> {
    let template = dir.join("bathy_meter_template.nc");
    let middle = dir.join("bathy_meter_middle.nc");
    let result = dir.join("bathy_meter.nc");

    fs::copy(bathymetry, &template).at(&template)?;

    let ncks = NcksExcludeArgs {
        program: config.tools.ncks.clone(),
        variable: removal.drop_variable.clone(),
        input: PathBuf::from("bathy_meter_template.nc"),
        output: PathBuf::from("bathy_meter_middle.nc"),
    };
    let out = run_tool_safe(&ncks, dir, dry_run)
        .map_err(|e| StageError::tool(ncks.tool_name(), format!("{:#}", e)))?;
    let mut context = vec![describe(&out, &ncks)];

    if out.success {
        let ncrename = NcrenameArgs {
            program: config.tools.ncrename.clone(),
            from: removal.rename_from.clone(),
            to: removal.rename_to.clone(),
            input: PathBuf::from("bathy_meter_middle.nc"),
            output: PathBuf::from("bathy_meter.nc"),
        };
        let out = run_tool_safe(&ncrename, dir, dry_run)
            .map_err(|e| StageError::tool(ncrename.tool_name(), format!("{:#}", e)))?;
        context.push(describe(&out, &ncrename));
    }

    if dry_run {
        warn!("[dry-run] ice-shelf removal not executed, bathy_meter.nc not verified");
    } else if !result.exists() {
        return Err(StageError::verification(
            result,
            format!(
                "ice-shelf removal from {}: {}",
                bathymetry.display(),
                context.join("; ")
            ),
        ));
    } else {
        info!("Removed the ice-shelf cavity from {}", bathymetry.display());
    }

    for intermediate in [&middle, &template] {
        if intermediate.exists() {
            fs::remove_file(intermediate).at(intermediate)?;
        }
    }
    Ok(())
}

/// Stage the domain sub-directory (or external artifact) of a staged run.
///
/// # Errors
///
/// - `Precondition` for a missing generator, hook, template or artifact
///   (checked before anything is created)
/// - `PatchVerification` if the ice-shelf removal produced no `bathy_meter.nc`
/// - `MissingDocument` if domain patches are set but `domaincfg/namelist_cfg` is absent
pub fn prepare_domain(
    spec: &RunSpec,
    run: &RunDirectory,
    config: &StageConfig,
    dry_run: bool,
) -> Result<DomainPlan> {
    check_preconditions(spec, config)?;

    if let DomainMode::External { artifact } = &spec.domain_mode {
        let link = run.path(DOMAIN_ARTIFACT);
        std::os::unix::fs::symlink(artifact, &link).at(&link)?;
        info!("Using external domain file {}", artifact.display());
        return Ok(DomainPlan {
            mode: spec.domain_mode.clone(),
            domain_dir: None,
            ice_shelf_removed: false,
        });
    }

    let dir = run.path(DOMAIN_DIR);
    fs::create_dir(&dir).at(&dir)?;
    let copied = copy_flat(&spec.paths.template_dir.join(DOMAIN_DIR), &dir)?;
    info!("Copied {} files into {}/", copied.len(), DOMAIN_DIR);

    let exe = dir.join(GRID_EXECUTABLE);
    std::os::unix::fs::symlink(&config.domain_executable, &exe).at(&exe)?;

    let ice_shelf_removed = match &spec.kill_ice_shelf {
        Some(removal) => {
            remove_ice_shelf(&spec.paths.bathymetry, &dir, removal, config, dry_run)?;
            true
        }
        None => {
            for name in ["isf_draft_meter.nc", "bathy_meter.nc"] {
                let link = dir.join(name);
                std::os::unix::fs::symlink(&spec.paths.bathymetry, &link).at(&link)?;
            }
            false
        }
    };

    namelist::patch(&dir.join(ACTIVE_NAMELIST), &spec.domain_patches)?;

    if let DomainMode::Hacked { hook } = &spec.domain_mode {
        info!("Grid will be post-processed by {}", hook.display());
    }

    Ok(DomainPlan {
        mode: spec.domain_mode.clone(),
        domain_dir: Some(dir),
        ice_shelf_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_hook() {
        let plan = DomainPlan {
            mode: DomainMode::Hacked {
                hook: PathBuf::from("/h.py"),
            },
            domain_dir: None,
            ice_shelf_removed: false,
        };
        assert!(plan.generates_grid());
        assert_eq!(plan.hook(), Some(Path::new("/h.py")));

        let plan = DomainPlan {
            mode: DomainMode::External {
                artifact: PathBuf::from("/d.nc"),
            },
            domain_dir: None,
            ice_shelf_removed: false,
        };
        assert!(!plan.generates_grid());
        assert_eq!(plan.hook(), None);
    }
}
