//! Run manifest writer and launch ledger.
//!
//! Every staged run carries a self-describing parameter module, `rPARAMS.py`,
//! which the per-year helper scripts import, plus the same values as
//! `run_params.json`. The template directory keeps an append-only ledger of
//! every run launched from it (`rfiles/runme`).

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{IoContext, Result, StageError};
use crate::resolver::RunSpec;
use crate::stager::RunDirectory;

pub const PARAMS_MODULE: &str = "rPARAMS.py";
pub const PARAMS_JSON: &str = "run_params.json";
pub const LEDGER_DIR: &str = "rfiles";
pub const LEDGER_FILE: &str = "runme";

/// The `rP_*` values, in module order
pub fn manifest_entries(spec: &RunSpec) -> Vec<(&'static str, String)> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    vec![
        ("OCEANCORES", spec.ocean_cores.to_string()),
        ("STOCKDIR", path(&spec.stock_dir)),
        ("WORKDIR", path(&spec.work_dir)),
        ("RBUILD_NEMO", path(&spec.rebuild_tool)),
        ("MKPSI", path(&spec.psi_tool)),
        ("PROJ", spec.project.clone()),
        ("CONFIG", spec.config_name.clone()),
        ("CASE", spec.case_id.clone()),
        ("DESC", spec.description.clone()),
        ("NDAYS", spec.days_per_year.to_string()),
        ("YEAR0", spec.start_year.to_string()),
        ("YEAR_MAX", spec.max_year.to_string()),
    ]
}

/// Python single-quoted string literal
fn py_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str(r"\\"),
            '\'' => out.push_str(r"\'"),
            '\n' => out.push_str(r"\n"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render the importable parameter module
pub fn render_params_module(spec: &RunSpec) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str("\"\"\"\n");
    out.push_str(
        "Key run parameters of this run, imported by the per-year helper scripts\n",
    );
    out.push_str("\"\"\"\n\n");
    for (name, value) in manifest_entries(spec) {
        out.push_str(&format!("rP_{}={}\n", name, py_literal(&value)));
    }
    out.push('\n');
    out.push_str("if __name__ == '__main__':\n");
    out.push_str("    print('This script is designed to be imported...')\n");
    out
}

/// Write `rPARAMS.py` and `run_params.json` into the run directory
pub fn write_manifest(spec: &RunSpec, run: &RunDirectory) -> Result<()> {
    let module = run.path(PARAMS_MODULE);
    fs::write(&module, render_params_module(spec)).at(&module)?;

    let map: BTreeMap<String, String> = manifest_entries(spec)
        .into_iter()
        .map(|(name, value)| (format!("rP_{}", name), value))
        .collect();
    let json = run.path(PARAMS_JSON);
    fs::write(&json, serde_json::to_string_pretty(&map)?).at(&json)?;

    debug!("Wrote {} and {}", module.display(), json.display());
    Ok(())
}

/// `<template>/rfiles/runme`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchLedger {
    pub path: PathBuf,
    /// Year count of the first run ever launched from the template
    pub year_count: u32,
    /// Staged run directories, in launch order
    pub runs: Vec<PathBuf>,
}

impl LaunchLedger {
    pub fn path_for(template_dir: &Path) -> PathBuf {
        template_dir.join(LEDGER_DIR).join(LEDGER_FILE)
    }

    /// Read the ledger of `template_dir`
    pub fn load(template_dir: &Path) -> Result<Self> {
        let path = Self::path_for(template_dir);
        let text = fs::read_to_string(&path).at(&path)?;
        let mut lines = text.lines();
        let year_count = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| {
                StageError::consistency(format!(
                    "{} does not start with a year count",
                    path.display()
                ))
            })?;
        let runs = lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| PathBuf::from(l.trim_end_matches('/')))
            .collect();
        Ok(Self {
            path,
            year_count,
            runs,
        })
    }
}

/// Record a launched run in the template's ledger.
///
/// The header line is only written by whoever creates the file.
pub fn append_ledger(template_dir: &Path, run_dir: &Path, year_count: u32) -> Result<PathBuf> {
    let path = LaunchLedger::path_for(template_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut f) => {
            writeln!(f, "{}", year_count).at(&path)?;
            info!("Started launch ledger {}", path.display());
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(StageError::Io { path, source: e }),
    }

    let mut f = OpenOptions::new().append(true).open(&path).at(&path)?;
    writeln!(f, "{}/", run_dir.display()).at(&path)?;
    Ok(path)
}
