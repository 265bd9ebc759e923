//! Shared fixture: a miniature cluster layout inside a temp directory.
//!
//! The ASF profile is pointed at a template directory, input files and
//! executables that exist under the fixture root, so staging can run for real.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nemostage::config::{SchedulerProfile, StageConfig};
use nemostage::resolver::VariantParams;
use nemostage::types::{DomainMode, RunType};
use tempfile::TempDir;

pub const REFERENCE: &str = "\
&namrun
   nn_it000 = 1      !  first time step
   cn_exp = 'asf'
/
&namsbc
   ln_isf = .true.   ! ice shelf melting
/
&namdyn_hpg
   ln_hpg_isf = .true.
   ln_hpg_sco = .false.
/
&namtra_eiv
   ln_ldfeiv = .false.
/
&namtrd
   ln_dyn_trd = .false.   ! momentum trends
/
";

pub const DOMAIN_NAMELIST: &str = "\
&namcfg
   ln_read_cfg = .false.
   jpiglo = 10
   jpjglo = 10
/
&namdom
   ppkth = 0.0
/
&namzgr
   ln_isfcav = .true.
/
";

pub struct Fixture {
    pub root: TempDir,
    pub config: StageConfig,
}

pub fn write_executable(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/bash\n{}\n", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

impl Fixture {
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn template(&self) -> PathBuf {
        self.path("template")
    }

    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.path("run").join(name)
    }

    pub fn variant(&self, case: &str, number: &str, max_year: u32) -> VariantParams {
        VariantParams {
            case: case.to_string(),
            number: number.to_string(),
            flux: Some("18".to_string()),
            start_year: 1,
            max_year,
            ..Default::default()
        }
    }
}

/// Fixture with the ASF profile using the default (generated) grid
pub fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let base = root.path();

    let template = base.join("template");
    fs::create_dir_all(template.join("domaincfg")).unwrap();
    fs::write(template.join("namelist_ref_asf"), REFERENCE).unwrap();
    fs::write(template.join("namelist_ref_ajtoy"), "&namrun\n/\n").unwrap();
    fs::write(template.join("file_def_nemo-oce_spin.xml"), "<spin/>").unwrap();
    fs::write(template.join("file_def_nemo-oce_asfmo.xml"), "<asfmo/>").unwrap();
    fs::write(template.join("field_def_nemo-oce_asfmo.xml"), "<fields/>").unwrap();
    fs::write(template.join("iodef.xml"), "<iodef/>").unwrap();
    fs::write(template.join("domaincfg/namelist_cfg"), DOMAIN_NAMELIST).unwrap();
    fs::write(template.join("domaincfg/namelist_ref"), "&namcfg\n/\n").unwrap();
    fs::write(template.join("domaincfg/grid_notes.txt"), "grid only").unwrap();

    let input = base.join("input");
    fs::create_dir(&input).unwrap();
    for name in [
        "bathy.nc",
        "ts.nc",
        "flxforce_case18_grid_T.nc",
        "flxforce_case18_grid_U.nc",
        "flxforce_case18_grid_V.nc",
    ] {
        fs::write(input.join(name), name).unwrap();
    }

    write_executable(&base.join("nemo.exe"), "echo \"model ran\" >> model.log");
    write_executable(&base.join("make_domain_cfg.exe"), "touch domain_cfg.nc");

    let mut config = StageConfig::default();
    config.run_root = base.join("run");
    config.stock_dir = base.join("stock");
    config.domain_executable = base.join("make_domain_cfg.exe");
    config.postprocessing = None;
    config.scheduler = SchedulerProfile {
        environment: Vec::new(),
        parallel_launcher: String::new(),
        serial_launcher: String::new(),
        grid_launcher: String::new(),
        pre_run: String::new(),
        cleanup: "echo \"$year\" >> cleanup.log".to_string(),
        hook_interpreter: "bash".to_string(),
        ..SchedulerProfile::default()
    };

    if let Some(asf) = config.run_types.get_mut(&RunType::Asf) {
        asf.template_dir = template;
        asf.input_dir = input;
        asf.executable = base.join("nemo.exe");
        asf.bathymetry = "bathy.nc".to_string();
        asf.temperature_salinity = "ts.nc".to_string();
        asf.domain_mode = DomainMode::Default;
    }

    Fixture { root, config }
}
