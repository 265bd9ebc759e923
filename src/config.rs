//! Stage configuration: where things live on the cluster and how each run type
//! is assembled.
//!
//! The configuration is a JSON file (`nemostage init-config` writes the
//! defaults). The defaults reproduce the ARCHER2 setup the tool was built for.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::namelist::{Patch, Value, single_group_patch};
use crate::types::{DomainMode, RunType, ScriptKind};

/// Rename applied to a staged file (`from` → `to`, both relative to the run directory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRename {
    pub from: String,
    pub to: String,
}

impl FileRename {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Derive a cavity-free bathymetry by dropping the ice-shelf draft variable
/// and renaming the bathymetry field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceShelfRemoval {
    pub drop_variable: String,
    pub rename_from: String,
    pub rename_to: String,
}

impl Default for IceShelfRemoval {
    fn default() -> Self {
        Self {
            drop_variable: "isf_draft".to_string(),
            rename_from: "Bathymetry_isf".to_string(),
            rename_to: "Bathymetry".to_string(),
        }
    }
}

/// Everything that differs between run families.
///
/// Path fields are patterns: `{case}`, `{num}`, `{num5}`, `{flx}` and
/// `{config}` are substituted by the resolver. Relative patterns are joined to
/// `input_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTypeProfile {
    pub description: String,
    /// Run-name pattern, e.g. `asf_c{num}`
    pub config_name: String,
    /// Directory holding namelists, XML and helper scripts copied into each run
    pub template_dir: PathBuf,
    /// Base directory of the input files
    pub input_dir: PathBuf,
    pub executable: PathBuf,
    pub bathymetry: String,
    pub temperature_salinity: String,
    #[serde(default)]
    pub flux_forcing: Option<String>,
    pub ocean_cores: u32,
    pub nodes: u32,
    /// Template file renamed to `namelist_ref`. When unset, the stock
    /// candidate `namelist_ref_ajtoy` is removed instead.
    #[serde(default)]
    pub reference_namelist: Option<String>,
    /// Output-definition renames applied at staging time
    #[serde(default)]
    pub spinup_renames: Vec<FileRename>,
    /// Output-definition renames applied when production output begins
    #[serde(default)]
    pub production_renames: Vec<FileRename>,
    #[serde(default)]
    pub namelist_patch: Patch,
    #[serde(default)]
    pub domain_patch: Patch,
    #[serde(default)]
    pub domain_mode: DomainMode,
    #[serde(default)]
    pub kill_ice_shelf: Option<IceShelfRemoval>,
    /// Production runs stop spin-up `production_offset` years before the last year
    #[serde(default = "default_production_offset")]
    pub production_offset: u32,
}

fn default_production_offset() -> u32 {
    9
}

/// Per-script scheduler directives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLimits {
    /// Job-name pattern (`{config}`, `{case}`)
    pub job_name: String,
    pub time: String,
    pub qos: String,
}

/// How the generated scripts talk to the scheduler and the machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerProfile {
    pub partition: String,
    pub quick: JobLimits,
    pub long: JobLimits,
    pub production: JobLimits,
    /// Shell lines run right after the directives (module loads, exports)
    pub environment: Vec<String>,
    /// Prefix for the model launch; `{cores}` is substituted
    pub parallel_launcher: String,
    /// Prefix for the serial cleanup step
    pub serial_launcher: String,
    /// Prefix for the grid generator
    pub grid_launcher: String,
    /// Re-derives the active namelist before every year
    pub pre_run: String,
    /// Moves output and restarts away after every year
    pub cleanup: String,
    /// Interpreter the domain hook is run with (may be empty)
    pub hook_interpreter: String,
}

impl SchedulerProfile {
    pub fn limits(&self, kind: ScriptKind) -> &JobLimits {
        match kind {
            ScriptKind::Quick => &self.quick,
            ScriptKind::Long => &self.long,
            ScriptKind::Production => &self.production,
        }
    }
}

impl Default for SchedulerProfile {
    fn default() -> Self {
        Self {
            partition: "standard".to_string(),
            quick: JobLimits {
                job_name: "nemo_test".to_string(),
                time: "00:20:00".to_string(),
                qos: "short".to_string(),
            },
            long: JobLimits {
                job_name: "{config}_{case}".to_string(),
                time: "47:57:02".to_string(),
                qos: "long".to_string(),
            },
            production: JobLimits {
                job_name: "{config}_{case}".to_string(),
                time: "23:57:02".to_string(),
                qos: "standard".to_string(),
            },
            environment: vec![
                "module restore".to_string(),
                "module load cray-hdf5-parallel".to_string(),
                "module load cray-netcdf-hdf5parallel".to_string(),
                "module load xpmem".to_string(),
                "module load perftools-base".to_string(),
                "export OMP_NUM_THREADS=1".to_string(),
                "export PYTHONPATH=/work/n02/n02/chbull/anaconda3/pkgs;export PATH=/work/n02/n02/chbull/anaconda3/bin:$PATH;source activate root".to_string(),
            ],
            parallel_launcher: "srun --ntasks={cores}".to_string(),
            serial_launcher: "srun --ntasks=1 --tasks-per-node=1 --cpus-per-task=1".to_string(),
            grid_launcher: "srun -n 1".to_string(),
            pre_run: "python preNEMO.py".to_string(),
            cleanup: "python postNEMO.py".to_string(),
            hook_interpreter: "python".to_string(),
        }
    }
}

/// Post-processing run once the production phase has finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessing {
    /// Invoked as `<interpreter> <script> <output_dir> <output_dir>` from its own directory
    pub script: PathBuf,
    pub interpreter: String,
    #[serde(default)]
    pub environment: Vec<String>,
}

/// External programs the stager itself runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub ncks: PathBuf,
    pub ncrename: PathBuf,
    pub sbatch: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ncks: PathBuf::from("ncks"),
            ncrename: PathBuf::from("ncrename"),
            sbatch: PathBuf::from("sbatch"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Parent of every run directory
    pub run_root: PathBuf,
    /// Restart and output archive
    pub stock_dir: PathBuf,
    /// Scheduler account
    pub project: String,
    pub days_per_year: u32,
    /// Grid generator linked into `domaincfg/`
    pub domain_executable: PathBuf,
    /// Recorded in the parameter manifest for the cleanup step
    pub rebuild_tool: PathBuf,
    /// Recorded in the parameter manifest for the cleanup step
    pub psi_tool: PathBuf,
    #[serde(default)]
    pub postprocessing: Option<PostProcessing>,
    /// Applied to `namelist_ref` when production output begins
    #[serde(default)]
    pub diagnostic_patch: Patch,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub scheduler: SchedulerProfile,
    pub run_types: BTreeMap<RunType, RunTypeProfile>,
}

const TEMPLATE_DIR: &str = "/work/n02/n02/chbull/repos/nemo_wed_analysis/ajtoy/configs/rnemoARCHER2";
const NEMO4: &str = "/mnt/lustre/a2fs-work2/work/n02/n02/chbull/nemo/models/NEMO4";

fn asf_profile() -> RunTypeProfile {
    let mut namelist_patch = Patch::new();
    namelist_patch.extend(single_group_patch(
        "namdyn_hpg",
        [
            ("ln_hpg_isf", Value::Bool(false)),
            ("ln_hpg_sco", Value::Bool(true)),
        ],
    ));
    namelist_patch.extend(single_group_patch("namsbc", [("ln_isf", Value::Bool(false))]));
    namelist_patch.extend(single_group_patch(
        "namtra_eiv",
        [
            ("ln_ldfeiv", Value::Bool(true)),
            ("ln_ldfeiv_dia", Value::Bool(true)),
        ],
    ));

    let mut domain_patch = Patch::new();
    domain_patch.extend(single_group_patch(
        "namcfg",
        [
            ("jpiglo", Value::Int(257)),
            ("jpidta", Value::Int(257)),
            ("jpjglo", Value::Int(385)),
            ("jpjdta", Value::Int(385)),
            ("jpkdta", Value::Int(75)),
            ("jperio", Value::Int(1)),
        ],
    ));
    domain_patch.extend(single_group_patch(
        "namdom",
        [
            ("ppkth", Value::Float(15.3510137)),
            ("ppacr", Value::Float(7.0)),
            ("ppdzmin", Value::Int(0)),
            ("pphmax", Value::Int(0)),
            ("ppsur", Value::Float(-3958.951371276829)),
            ("ppa0", Value::Float(103.9530096)),
            ("ppa1", Value::Float(2.415951269)),
            ("ldbletanh", Value::Bool(true)),
            ("ppa2", Value::Float(100.7609285)),
            ("ppkth2", Value::Float(48.02989372)),
            ("ppacr2", Value::Float(13.0)),
        ],
    ));
    domain_patch.extend(single_group_patch("namzgr", [("ln_isfcav", Value::Bool(false))]));

    RunTypeProfile {
        description: "ASF channel: tanh shelf with single width walls, re-entrant zonal \
                      boundary, WOA initial conditions and restoring, GM and eddy heat \
                      transport diagnostics"
            .to_string(),
        config_name: "asf_c{num}".to_string(),
        template_dir: PathBuf::from(TEMPLATE_DIR),
        input_dir: PathBuf::from("/work/n02/n02/chbull/nemo/bld_configs/input_ASF"),
        executable: PathBuf::from(
            "/work/n02/n02/chbull/nemo/models/NEMO404_MO/tests/asfdyn/BLD/bin/nemo.exe",
        ),
        bathymetry: "new_bathy_ASF_c39_deeprid_oowall.nc".to_string(),
        temperature_salinity: "TS_init_c03_woa2018.nc".to_string(),
        flux_forcing: Some("flxforce_case{flx}_grid_.nc".to_string()),
        ocean_cores: 1024,
        nodes: 8,
        reference_namelist: Some("namelist_ref_asf".to_string()),
        spinup_renames: vec![FileRename::new(
            "file_def_nemo-oce_spin.xml",
            "file_def_nemo-oce.xml",
        )],
        production_renames: vec![
            FileRename::new("file_def_nemo-oce_asfmo.xml", "file_def_nemo-oce.xml"),
            FileRename::new("field_def_nemo-oce_asfmo.xml", "field_def_nemo-oce.xml"),
        ],
        namelist_patch,
        domain_patch,
        domain_mode: DomainMode::Hacked {
            hook: PathBuf::from(
                "/mnt/lustre/a2fs-work2/work/n02/n02/chbull/repos/nemo_wed_analysis/ajtoy/diagnostics/mk_domaincfg.py",
            ),
        },
        kill_ice_shelf: None,
        production_offset: default_production_offset(),
    }
}

fn ajtoy_profile() -> RunTypeProfile {
    RunTypeProfile {
        description: "AJTOY run using NEMO 4.0.4 on ARCHER2, sloped forcing and flat bottom"
            .to_string(),
        config_name: "ajtoy_10Fsl_FB_MOVIE".to_string(),
        template_dir: PathBuf::from(TEMPLATE_DIR),
        input_dir: PathBuf::from("/work/n02/n02/chbull/nemo/bld_configs/input_ajtoy"),
        executable: PathBuf::from(format!("{NEMO4}/tests/aj_ts_melt_off2/BLD/bin/nemo.exe")),
        bathymetry: "new_bathy_FB.nc".to_string(),
        temperature_salinity: "TS_init_rho1_uHoz_uVert_10slpd.nc".to_string(),
        flux_forcing: None,
        ocean_cores: 20,
        nodes: 1,
        reference_namelist: Some("namelist_ref_ajtoy".to_string()),
        spinup_renames: Vec::new(),
        production_renames: Vec::new(),
        namelist_patch: Patch::new(),
        domain_patch: Patch::new(),
        domain_mode: DomainMode::Default,
        kill_ice_shelf: None,
        production_offset: default_production_offset(),
    }
}

fn svm_profile() -> RunTypeProfile {
    let mut domain_patch = single_group_patch(
        "namcfg",
        [
            ("jpiglo", Value::Int(10)),
            ("jpidta", Value::Int(10)),
            ("jpjglo", Value::Int(50)),
            ("jpjdta", Value::Int(50)),
        ],
    );
    domain_patch.extend(single_group_patch("namdom", [("pphmax", Value::Float(2000.0))]));

    RunTypeProfile {
        description: "slope versus melt idealised shelf".to_string(),
        config_name: "svm_c{num}".to_string(),
        template_dir: PathBuf::from(TEMPLATE_DIR),
        input_dir: PathBuf::from("/work/n02/n02/chbull/nemo/bld_configs/input_ajtoy"),
        executable: PathBuf::from(format!("{NEMO4}/tests/slopeVmelt/BLD/bin/nemo.exe")),
        bathymetry: "20200804_slopeVmelt/new_bathy_c31_0glidx_-37ifidx_982_0glw_w10.nc"
            .to_string(),
        temperature_salinity: "20200804_slopeVmelt/TS_init_c31_WARM_slopeVmelt_w10.nc"
            .to_string(),
        flux_forcing: None,
        ocean_cores: 20,
        nodes: 1,
        reference_namelist: None,
        spinup_renames: Vec::new(),
        production_renames: Vec::new(),
        namelist_patch: Patch::new(),
        domain_patch,
        domain_mode: DomainMode::Default,
        kill_ice_shelf: None,
        production_offset: default_production_offset(),
    }
}

fn sr_ml_profile() -> RunTypeProfile {
    let mut domain_patch = single_group_patch(
        "namcfg",
        [
            ("jpiglo", Value::Int(64)),
            ("jpidta", Value::Int(64)),
            ("jpjglo", Value::Int(64)),
            ("jpjdta", Value::Int(64)),
        ],
    );
    domain_patch.extend(single_group_patch("namdom", [("pphmax", Value::Float(2000.0))]));

    RunTypeProfile {
        description: "64x64 machine-learning geometry ensemble".to_string(),
        config_name: "sr_ml_e{num}".to_string(),
        template_dir: PathBuf::from(TEMPLATE_DIR),
        input_dir: PathBuf::from("/mnt/lustre/a2fs-work2/work/n02/shared/shrr/output_tests_v2"),
        executable: PathBuf::from(format!("{NEMO4}/tests/slopeVmelt/BLD/bin/nemo.exe")),
        bathymetry: "bathy_meter_Exp{num5}.nc".to_string(),
        temperature_salinity: "TS_init_Exp{num5}.nc".to_string(),
        flux_forcing: None,
        ocean_cores: 20,
        nodes: 1,
        reference_namelist: None,
        spinup_renames: Vec::new(),
        production_renames: Vec::new(),
        namelist_patch: Patch::new(),
        domain_patch,
        domain_mode: DomainMode::Default,
        kill_ice_shelf: None,
        production_offset: default_production_offset(),
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        let mut run_types = BTreeMap::new();
        run_types.insert(RunType::Svm, svm_profile());
        run_types.insert(RunType::Ajtoy, ajtoy_profile());
        run_types.insert(RunType::Asf, asf_profile());
        run_types.insert(RunType::SrMl, sr_ml_profile());

        Self {
            run_root: PathBuf::from("/work/n02/n02/chbull/nemo/run"),
            stock_dir: PathBuf::from("/work/n02/n02/chbull/nemo/nemo_output"),
            project: "n02-PROPHET".to_string(),
            days_per_year: 365,
            domain_executable: PathBuf::from(format!(
                "{NEMO4}/tools/DOMAINcfg/BLD/bin/make_domain_cfg.exe"
            )),
            rebuild_tool: PathBuf::from(format!("{NEMO4}/tools/REBUILD_NEMO/rebuild_nemo")),
            psi_tool: PathBuf::from(
                "/work/n02/n02/chbull/nemo/bld_configs/input_ajtoy/ncj_psi/post_grid_UV",
            ),
            postprocessing: Some(PostProcessing {
                script: PathBuf::from(
                    "/work/n02/n02/chbull/repos/nemo_wed_analysis/ajtoy/diagnostics/mk_nemo_spinup.py",
                ),
                interpreter: "python".to_string(),
                environment: vec![
                    "export PYTHONPATH=/work/n02/n02/chbull/anaconda2/pkgs;export PATH=/work/n02/n02/chbull/anaconda2/bin:$PATH;source activate root".to_string(),
                ],
            }),
            diagnostic_patch: single_group_patch("namtrd", [("ln_dyn_trd", Value::Bool(true))]),
            tools: ToolPaths::default(),
            scheduler: SchedulerProfile::default(),
            run_types,
        }
    }
}

impl StageConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load from `path` when given, otherwise use the built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.run_root.as_os_str().is_empty() {
            anyhow::bail!("run_root must be specified");
        }
        if self.project.trim().is_empty() {
            anyhow::bail!("project (scheduler account) must be specified");
        }
        if self.days_per_year == 0 {
            anyhow::bail!("days_per_year must be positive");
        }
        if self.run_types.is_empty() {
            anyhow::bail!("at least one run type must be configured");
        }
        if !self.scheduler.parallel_launcher.is_empty()
            && !self.scheduler.parallel_launcher.contains("{cores}")
        {
            anyhow::bail!("scheduler.parallel_launcher must contain the {{cores}} placeholder");
        }

        for (run_type, profile) in &self.run_types {
            if profile.config_name.trim().is_empty() {
                anyhow::bail!("{}: config_name must be specified", run_type);
            }
            if profile.config_name.contains('/') {
                anyhow::bail!("{}: config_name must not contain '/'", run_type);
            }
            if profile.ocean_cores == 0 {
                anyhow::bail!("{}: ocean_cores must be positive", run_type);
            }
            if profile.nodes == 0 {
                anyhow::bail!("{}: nodes must be positive", run_type);
            }
            if let Some(flux) = &profile.flux_forcing {
                if !flux.ends_with(".nc") {
                    anyhow::bail!("{}: flux_forcing must name a .nc file, got '{}'", run_type, flux);
                }
            }
            for rename in profile.spinup_renames.iter().chain(&profile.production_renames) {
                if rename.from.contains('/') || rename.to.contains('/') {
                    anyhow::bail!(
                        "{}: output-definition renames must be plain file names ({} -> {})",
                        run_type,
                        rename.from,
                        rename.to
                    );
                }
            }
        }

        Ok(())
    }
}
