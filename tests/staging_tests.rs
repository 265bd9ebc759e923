//! Staging integration tests: resolver → stager → domain preparation against
//! a real (temporary) filesystem.

mod common;

use std::fs;
use std::path::PathBuf;

use nemostage::config::IceShelfRemoval;
use nemostage::domain::{check_preconditions as check_domain_preconditions, prepare_domain};
use nemostage::error::StageError;
use nemostage::namelist::{ConfigDocument, Value};
use nemostage::orchestrator::{LaunchRequest, Orchestrator};
use nemostage::resolver::resolve;
use nemostage::stager::stage;
use nemostage::types::{DomainMode, RunType, SubmitTarget};

use common::fixture;

#[test]
fn test_stage_and_prepare_domain_produce_run_tree() {
    let fx = fixture();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();
    let plan = prepare_domain(&spec, &run, &fx.config, false).unwrap();

    let root = fx.run_dir("asf_c83_00008");
    assert_eq!(run.root, root);

    for name in ["README", "env_rec", "namelist_ref", "namelist_cfg", "iodef.xml"] {
        assert!(root.join(name).is_file(), "{} missing", name);
    }
    // candidate renamed, spin-up output definitions in place
    assert!(!root.join("namelist_ref_asf").exists());
    assert!(!root.join("file_def_nemo-oce_spin.xml").exists());
    assert_eq!(
        fs::read_to_string(root.join("file_def_nemo-oce.xml")).unwrap(),
        "<spin/>"
    );
    // production definitions wait for the transition
    assert!(root.join("file_def_nemo-oce_asfmo.xml").exists());

    assert_eq!(
        fs::read_link(root.join("nemo.exe")).unwrap(),
        fx.path("nemo.exe")
    );
    for (link, target) in [
        ("bathy_meter.nc", "input/bathy.nc"),
        ("isf_draft_meter.nc", "input/bathy.nc"),
        ("TS_init.nc", "input/ts.nc"),
        ("resto.nc", "input/ts.nc"),
    ] {
        assert_eq!(fs::read_link(root.join(link)).unwrap(), fx.path(target));
    }

    // main namelist: patched leaves changed, everything else byte-identical
    let reference = fs::read_to_string(root.join("namelist_ref")).unwrap();
    let doc = ConfigDocument::parse(&reference, &root.join("namelist_ref")).unwrap();
    assert_eq!(doc.get("namsbc", "ln_isf"), Some(Value::Bool(false)));
    assert_eq!(doc.get("namdyn_hpg", "ln_hpg_sco"), Some(Value::Bool(true)));
    assert_eq!(doc.get("namtra_eiv", "ln_ldfeiv_dia"), Some(Value::Bool(true)));
    assert!(reference.contains("   nn_it000 = 1      !  first time step\n"));
    assert!(reference.contains("   ln_dyn_trd = .false.   ! momentum trends\n"));
    assert_eq!(
        fs::read_to_string(root.join("namelist_cfg")).unwrap(),
        reference
    );

    // template subdirectories are not flattened into the run root
    assert!(!root.join("grid_notes.txt").exists());

    // domain staging
    let domain = root.join("domaincfg");
    assert_eq!(plan.domain_dir.as_deref(), Some(domain.as_path()));
    assert!(plan.generates_grid());
    assert_eq!(
        fs::read_link(domain.join("make_domain_cfg.exe")).unwrap(),
        fx.path("make_domain_cfg.exe")
    );
    assert_eq!(
        fs::read_link(domain.join("bathy_meter.nc")).unwrap(),
        fx.path("input/bathy.nc")
    );
    let domain_doc = ConfigDocument::load(&domain.join("namelist_cfg")).unwrap();
    assert_eq!(domain_doc.get("namcfg", "jpiglo"), Some(Value::Int(257)));
    assert_eq!(domain_doc.get("namcfg", "jpkdta"), Some(Value::Int(75)));
    assert_eq!(domain_doc.get("namzgr", "ln_isfcav"), Some(Value::Bool(false)));
    assert_eq!(
        domain_doc.get("namcfg", "ln_read_cfg"),
        Some(Value::Bool(false))
    );
    assert!(!domain.join("namelist_cfg_new").exists());
    assert!(domain.join("grid_notes.txt").is_file());
}

#[test]
fn test_flux_links_cover_run_plus_extra_years() {
    let fx = fixture();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();

    assert_eq!(run.flux_links, 171);
    let flux = run.root.join("flxfce");
    assert_eq!(fs::read_dir(&flux).unwrap().count(), 171);
    for role in ["T", "U", "V"] {
        for year in [1, 57] {
            let link = flux.join(format!("flxforce_grid_{}_y{:04}.nc", role, year));
            assert_eq!(
                fs::read_link(&link).unwrap(),
                fx.path(&format!("input/flxforce_case18_grid_{}.nc", role))
            );
        }
    }
    assert!(!flux.join("flxforce_grid_T_y0058.nc").exists());
    assert!(!flux.join("flxforce_grid_T_y0000.nc").exists());
}

#[test]
fn test_second_stage_is_a_conflict() {
    let fx = fixture();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();
    let readme = fs::read_to_string(run.root.join("README")).unwrap();
    fs::write(run.root.join("time.year.step"), "year=4\n").unwrap();

    let err = stage(&spec).unwrap_err();
    assert!(matches!(err, StageError::DirectoryConflict { .. }));
    assert_eq!(err.kind(), "DirectoryConflictError");

    assert_eq!(fs::read_to_string(run.root.join("README")).unwrap(), readme);
    assert_eq!(
        fs::read_to_string(run.root.join("time.year.step")).unwrap(),
        "year=4\n"
    );
}

#[test]
fn test_unknown_run_type_mutates_nothing() {
    let fx = fixture();
    let err = resolve(&fx.config, "MISOMIP", &fx.variant("8", "83", 5)).unwrap_err();
    assert!(matches!(err, StageError::UnrecognizedConfiguration { .. }));
    assert!(err.to_string().contains("ASF"));
    assert!(!fx.path("run").exists());
}

#[test]
fn test_missing_input_is_a_precondition_before_mutation() {
    let fx = fixture();
    fs::remove_file(fx.path("input/flxforce_case18_grid_V.nc")).unwrap();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();

    let err = stage(&spec).unwrap_err();
    match err {
        StageError::Precondition { path, .. } => {
            assert_eq!(path, fx.path("input/flxforce_case18_grid_V.nc"))
        }
        other => panic!("expected Precondition, got {:?}", other),
    }
    assert!(!fx.path("run").exists());
}

#[test]
fn test_missing_reference_candidate_is_missing_document() {
    let fx = fixture();
    fs::remove_file(fx.template().join("namelist_ref_asf")).unwrap();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    assert!(matches!(
        stage(&spec),
        Err(StageError::MissingDocument { .. })
    ));
}

#[test]
fn test_external_domain_is_linked() {
    let fx = fixture();
    let artifact = fx.path("input/domain_cfg.nc");
    fs::write(&artifact, "grid").unwrap();

    let mut variant = fx.variant("9", "83", 5);
    variant.domain_mode = Some(DomainMode::External {
        artifact: artifact.clone(),
    });
    let spec = resolve(&fx.config, "ASF", &variant).unwrap();
    let run = stage(&spec).unwrap();
    let plan = prepare_domain(&spec, &run, &fx.config, false).unwrap();

    assert!(!plan.generates_grid());
    assert_eq!(plan.domain_dir, None);
    assert_eq!(fs::read_link(run.path("domain_cfg.nc")).unwrap(), artifact);
    assert!(!run.path("domaincfg").exists());
}

fn single_member_request(case: &str, domain_mode: DomainMode) -> LaunchRequest {
    LaunchRequest {
        run_type: "ASF".to_string(),
        case: case.to_string(),
        members: vec!["83:18".parse().unwrap()],
        start_year: 1,
        max_year: 5,
        description: None,
        production_offset: None,
        domain_mode: Some(domain_mode),
        submit: SubmitTarget::None,
    }
}

#[test]
fn test_missing_hook_fails_before_anything_is_staged() {
    let fx = fixture();
    let hook = DomainMode::Hacked {
        hook: fx.path("no_such_hook.py"),
    };

    let mut variant = fx.variant("9", "83", 5);
    variant.domain_mode = Some(hook.clone());
    let spec = resolve(&fx.config, "ASF", &variant).unwrap();
    assert!(matches!(
        check_domain_preconditions(&spec, &fx.config),
        Err(StageError::Precondition { .. })
    ));

    let orchestrator = Orchestrator::new(&fx.config, PathBuf::from("/usr/bin/nemostage"), true);
    let err = orchestrator
        .launch(&single_member_request("9", hook))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::Precondition { .. })
    ));
    assert!(!fx.run_dir("asf_c83_00009").exists());
}

#[test]
fn test_missing_external_domain_can_be_retried() {
    let fx = fixture();
    let artifact = fx.path("input/domain_cfg.nc");
    let external = DomainMode::External {
        artifact: artifact.clone(),
    };
    let orchestrator = Orchestrator::new(&fx.config, PathBuf::from("/usr/bin/nemostage"), true);

    let err = orchestrator
        .launch(&single_member_request("9", external.clone()))
        .unwrap_err();
    match err.downcast_ref::<StageError>() {
        Some(StageError::Precondition { path, .. }) => assert_eq!(path, &artifact),
        other => panic!("expected Precondition, got {:?}", other),
    }
    assert!(!fx.run_dir("asf_c83_00009").exists());

    fs::write(&artifact, "grid").unwrap();
    let outcomes = orchestrator
        .launch(&single_member_request("9", external))
        .unwrap();
    assert_eq!(
        fs::read_link(outcomes[0].run.path("domain_cfg.nc")).unwrap(),
        artifact
    );
}

#[test]
fn test_template_readme_does_not_replace_run_record() {
    let fx = fixture();
    fs::write(fx.template().join("README"), "template notes\n").unwrap();
    fs::write(fx.template().join("env_rec"), "template env\n").unwrap();
    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();

    let readme = fs::read_to_string(run.path("README")).unwrap();
    assert!(readme.contains("NEMO SIMULATION"));
    assert!(!readme.contains("template notes"));
    let env = fs::read_to_string(run.path("env_rec")).unwrap();
    assert!(env.contains("record of current env"));
    assert!(!run.copied.iter().any(|c| c == "README" || c == "env_rec"));
    assert!(run.copied.iter().any(|c| c == "iodef.xml"));
}

#[test]
fn test_ice_shelf_removal_with_stub_tools() {
    let mut fx = fixture();
    let ncks = fx.path("ncks");
    let ncrename = fx.path("ncrename");
    // ncks -x -v VAR IN OUT / ncrename -v A,B IN OUT
    common::write_executable(&ncks, "cp \"$4\" \"$5\"");
    common::write_executable(&ncrename, "cp \"$3\" \"$4\"");
    fx.config.tools.ncks = ncks;
    fx.config.tools.ncrename = ncrename;
    if let Some(asf) = fx.config.run_types.get_mut(&RunType::Asf) {
        asf.kill_ice_shelf = Some(IceShelfRemoval::default());
    }

    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();
    let plan = prepare_domain(&spec, &run, &fx.config, false).unwrap();

    assert!(plan.ice_shelf_removed);
    let domain = run.path("domaincfg");
    let bathy = domain.join("bathy_meter.nc");
    assert!(bathy.is_file());
    assert!(fs::read_link(&bathy).is_err());
    assert!(!domain.join("bathy_meter_template.nc").exists());
    assert!(!domain.join("bathy_meter_middle.nc").exists());
}

#[test]
fn test_failed_ice_shelf_removal_is_a_verification_error() {
    let mut fx = fixture();
    let ncks = fx.path("ncks");
    common::write_executable(&ncks, "echo 'no such variable' >&2; exit 1");
    fx.config.tools.ncks = ncks;
    if let Some(asf) = fx.config.run_types.get_mut(&RunType::Asf) {
        asf.kill_ice_shelf = Some(IceShelfRemoval::default());
    }

    let spec = resolve(&fx.config, "ASF", &fx.variant("8", "83", 5)).unwrap();
    let run = stage(&spec).unwrap();
    match prepare_domain(&spec, &run, &fx.config, false) {
        Err(StageError::PatchVerification { context, .. }) => {
            assert!(context.contains("no such variable"), "{}", context)
        }
        other => panic!("expected PatchVerification, got {:?}", other),
    }
}

#[test]
fn test_dry_run_launch_writes_everything_but_submits_nothing() {
    let fx = fixture();
    let orchestrator = Orchestrator::new(&fx.config, PathBuf::from("/usr/bin/nemostage"), true);
    let request = LaunchRequest {
        run_type: "asf".to_string(),
        case: "8".to_string(),
        members: vec!["83:18".parse().unwrap(), "84:18".parse().unwrap()],
        start_year: 1,
        max_year: 30,
        description: Some("two-member ensemble".to_string()),
        production_offset: None,
        domain_mode: None,
        submit: SubmitTarget::Production,
    };

    let outcomes = orchestrator.launch(&request).unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.job_id, None);
        assert_eq!(outcome.scripts.len(), 3);
        assert!(outcome.run.path("goNEMOproduction.sh").is_file());
        assert!(outcome.run.path("rPARAMS.py").is_file());
        assert!(outcome.run.path("run_params.json").is_file());
    }

    let ledger = fs::read_to_string(fx.template().join("rfiles/runme")).unwrap();
    let expected = format!(
        "30\n{}/\n{}/\n",
        fx.run_dir("asf_c83_00008").display(),
        fx.run_dir("asf_c84_00008").display()
    );
    assert_eq!(ledger, expected);

    let params = fs::read_to_string(fx.run_dir("asf_c84_00008").join("rPARAMS.py")).unwrap();
    assert!(params.contains("rP_DESC='two-member ensemble'"));
}

#[test]
fn test_launch_stops_at_first_failing_member() {
    let fx = fixture();
    let orchestrator = Orchestrator::new(&fx.config, PathBuf::from("/usr/bin/nemostage"), true);
    let request = LaunchRequest {
        run_type: "ASF".to_string(),
        case: "8".to_string(),
        members: vec![
            "83:18".parse().unwrap(),
            "83:18".parse().unwrap(),
            "85:18".parse().unwrap(),
        ],
        start_year: 1,
        max_year: 3,
        description: None,
        production_offset: None,
        domain_mode: None,
        submit: SubmitTarget::None,
    };

    let err = orchestrator.launch(&request).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::DirectoryConflict { .. })
    ));
    assert!(format!("{:#}", err).contains("member 83:18"));
    assert!(!fx.run_dir("asf_c85_00008").exists());
}
