//! Directory stager: builds a fresh run directory from a [`RunSpec`].
//!
//! The run directory's existence is the only "already initialized" marker, so
//! staging never merges into or overwrites an existing directory. All
//! preconditions are checked before the first mutation; after that any
//! failure is fatal and the partial directory is left for inspection.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{IoContext, Result, StageError};
use crate::namelist;
use crate::resolver::{RunSpec, flux_stem};

/// Stock reference candidate removed when a run type names none
pub const DEFAULT_REFERENCE_CANDIDATE: &str = "namelist_ref_ajtoy";
pub const REFERENCE_NAMELIST: &str = "namelist_ref";
pub const ACTIVE_NAMELIST: &str = "namelist_cfg";
pub const FLUX_DIR: &str = "flxfce";
/// Extra forcing years linked past `max_year`
pub const FLUX_EXTRA_YEARS: u32 = 52;
const FLUX_ROLES: [&str; 3] = ["T", "U", "V"];

/// A staged run directory
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub root: PathBuf,
    /// Template files copied into the root, sorted
    pub copied: Vec<String>,
    /// Number of forcing symlinks under `flxfce/`
    pub flux_links: usize,
}

impl RunDirectory {
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Symlinks the model expects in the run root: (link name, target)
fn role_links(spec: &RunSpec) -> [(&'static str, &Path); 4] {
    [
        ("isf_draft_meter.nc", spec.paths.bathymetry.as_path()),
        ("bathy_meter.nc", spec.paths.bathymetry.as_path()),
        ("TS_init.nc", spec.paths.temperature_salinity.as_path()),
        ("resto.nc", spec.paths.temperature_salinity.as_path()),
    ]
}

/// `<stem>T.nc`, `<stem>U.nc`, `<stem>V.nc`
pub fn flux_role_files(flux: &Path) -> Vec<(&'static str, PathBuf)> {
    let stem = flux_stem(flux);
    FLUX_ROLES
        .iter()
        .map(|role| (*role, PathBuf::from(format!("{}{}.nc", stem, role))))
        .collect()
}

/// Verify every input of `spec` exists. Touches nothing.
pub fn check_preconditions(spec: &RunSpec) -> Result<()> {
    let required = [
        ("template directory", &spec.paths.template_dir),
        ("model executable", &spec.paths.executable),
        ("bathymetry file", &spec.paths.bathymetry),
        ("temperature/salinity file", &spec.paths.temperature_salinity),
    ];
    for (what, path) in required {
        if !path.exists() {
            return Err(StageError::precondition(what, path));
        }
    }
    if let Some(flux) = &spec.paths.flux_forcing {
        for (role, path) in flux_role_files(flux) {
            if !path.exists() {
                return Err(StageError::precondition(
                    format!("flux forcing grid_{} file", role),
                    path,
                ));
            }
        }
    }
    Ok(())
}

/// Written once per run directory, never taken from the template
const RECORD_FILES: [&str; 2] = ["README", "env_rec"];

fn exists_or_dangling(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn link(target: &Path, link: &Path) -> Result<()> {
    symlink(target, link).at(link)
}

/// Write a file that must not exist yet
fn write_once(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .at(path)?;
    file.write_all(content.as_bytes()).at(path)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn readme(spec: &RunSpec, date: &str) -> String {
    let mut rows: Vec<(&str, String)> = vec![
        ("project", spec.project.clone()),
        ("config", spec.config_name.clone()),
        ("config_type", spec.run_type.to_string()),
        ("case", spec.case_id.clone()),
        ("desc", spec.description.clone()),
        ("date", date.to_string()),
        ("executable", spec.paths.executable.display().to_string()),
        ("template_dir", spec.paths.template_dir.display().to_string()),
        ("bathymetry", spec.paths.bathymetry.display().to_string()),
        (
            "temperature_salinity",
            spec.paths.temperature_salinity.display().to_string(),
        ),
    ];
    if let Some(flux) = &spec.paths.flux_forcing {
        rows.push(("flux_forcing", flux.display().to_string()));
    }
    rows.extend([
        ("year0", spec.start_year.to_string()),
        ("year_max", spec.max_year.to_string()),
        ("ocean_cores", spec.ocean_cores.to_string()),
        ("nodes", spec.nodes.to_string()),
        ("domain_mode", spec.domain_mode.to_string()),
        ("production_offset", spec.production_offset.to_string()),
        ("work_dir", spec.work_dir.display().to_string()),
        ("stock_dir", spec.stock_dir.display().to_string()),
    ]);

    let mut out = String::from("*****************************************************\n");
    out.push_str("*          NEMO SIMULATION\n");
    for (key, value) in rows {
        out.push_str(&format!("*   {:<22}{}\n", key, value));
    }
    out.push_str("*****************************************************\n");
    out
}

fn env_record(date: &str) -> String {
    let var = |name: &str| std::env::var(name).unwrap_or_else(|_| "None".to_string());
    format!(
        "*   Date      {}\n*   record of current env:\n{}\n\n*   record of current path:\n{}\n\n*   loaded modules:\n{}\n",
        date,
        var("ENV"),
        var("PATH"),
        var("LOADEDMODULES")
    )
}

/// Flat-copy every regular top-level file of `src` into `dst`.
///
/// Subdirectories are skipped. Returns the copied names, sorted.
pub fn copy_flat(src: &Path, dst: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(src).at(src)? {
        let entry = entry.at(src)?;
        let path = entry.path();
        // follows symlinks: a link to a file counts as a file
        if fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    for name in &names {
        let to = dst.join(name);
        fs::copy(src.join(name), &to).at(&to)?;
    }
    Ok(names)
}

fn rename_in(root: &Path, from: &str, to: &str) -> Result<()> {
    let src = root.join(from);
    if !src.exists() {
        return Err(StageError::missing_document(src));
    }
    let dst = root.join(to);
    fs::rename(&src, &dst).at(&dst)?;
    debug!("Renamed {} -> {}", from, to);
    Ok(())
}

fn select_reference(spec: &RunSpec, root: &Path) -> Result<()> {
    match &spec.reference_namelist {
        Some(candidate) => {
            rename_in(root, candidate, REFERENCE_NAMELIST)?;
            info!("Using {} as {}", candidate, REFERENCE_NAMELIST);
        }
        None => {
            let stock = root.join(DEFAULT_REFERENCE_CANDIDATE);
            if stock.exists() {
                fs::remove_file(&stock).at(&stock)?;
                debug!("Removed unused {}", DEFAULT_REFERENCE_CANDIDATE);
            }
        }
    }
    for rename in &spec.spinup_renames {
        rename_in(root, &rename.from, &rename.to)?;
        info!("Spin-up output definitions: {} -> {}", rename.from, rename.to);
    }
    Ok(())
}

fn link_flux_forcing(spec: &RunSpec, root: &Path, flux: &Path) -> Result<usize> {
    let dir = root.join(FLUX_DIR);
    fs::create_dir(&dir).at(&dir)?;
    let roles = flux_role_files(flux);
    let last = spec.max_year + FLUX_EXTRA_YEARS;
    let mut count = 0;
    for year in spec.start_year..=last {
        for (role, target) in &roles {
            let name = format!("flxforce_grid_{}_y{:04}.nc", role, year);
            link(target, &dir.join(name))?;
            count += 1;
        }
    }
    info!(
        "Linked {} flux forcing files for years {}..={}",
        count, spec.start_year, last
    );
    Ok(count)
}

/// Make sure `link` is a symlink to `target`, creating it when absent.
///
/// Returns true when the link had to be created.
pub fn ensure_link(target: &Path, link_path: &Path) -> Result<bool> {
    match fs::read_link(link_path) {
        Ok(existing) if existing == target => Ok(false),
        Ok(existing) => Err(StageError::consistency(format!(
            "{} points at {}, expected {}",
            link_path.display(),
            existing.display(),
            target.display()
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            link(target, link_path)?;
            Ok(true)
        }
        Err(_) if exists_or_dangling(link_path) => Err(StageError::consistency(format!(
            "{} exists but is not a symlink",
            link_path.display()
        ))),
        Err(e) => Err(StageError::Io {
            path: link_path.to_path_buf(),
            source: e,
        }),
    }
}

/// Build the run directory for `spec`.
///
/// # Errors
///
/// - `Precondition` if an input is missing (nothing has been created)
/// - `DirectoryConflict` if the run directory exists (it is not touched)
/// - `MissingDocument` if the reference namelist or a renamed output
///   definition is absent from the template
/// - `Io`/`Namelist` for anything failing after creation
pub fn stage(spec: &RunSpec) -> Result<RunDirectory> {
    check_preconditions(spec)?;

    let root = spec.work_dir.clone();
    if exists_or_dangling(&root) {
        return Err(StageError::conflict(&root));
    }
    if let Some(parent) = root.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    // create_dir, not create_dir_all: losing a race must still be a conflict
    match fs::create_dir(&root) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(StageError::conflict(&root));
        }
        Err(e) => return Err(StageError::Io { path: root, source: e }),
    }
    info!("Created run directory {}", root.display());

    let mut copied = copy_flat(&spec.paths.template_dir, &root)?;
    if copied.is_empty() {
        warn!(
            "Template directory {} has no top-level files",
            spec.paths.template_dir.display()
        );
    }
    info!("Copied {} template files", copied.len());

    // the run's own records are written after the copy and never overwritten
    for name in RECORD_FILES {
        if copied.iter().any(|c| c == name) {
            warn!("Template file {} is replaced by the run record", name);
            let path = root.join(name);
            fs::remove_file(&path).at(&path)?;
        }
    }
    copied.retain(|c| !RECORD_FILES.contains(&c.as_str()));

    let date = timestamp();
    write_once(&root.join("README"), &readme(spec, &date))?;
    write_once(&root.join("env_rec"), &env_record(&date))?;

    select_reference(spec, &root)?;

    link(&spec.paths.executable, &root.join("nemo.exe"))?;
    for (name, target) in role_links(spec) {
        link(target, &root.join(name))?;
    }

    let flux_links = match &spec.paths.flux_forcing {
        Some(flux) => link_flux_forcing(spec, &root, flux)?,
        None => 0,
    };

    let reference = root.join(REFERENCE_NAMELIST);
    if !reference.exists() {
        return Err(StageError::missing_document(reference));
    }
    namelist::patch(&reference, &spec.namelist_patches)?;
    let active = root.join(ACTIVE_NAMELIST);
    fs::copy(&reference, &active).at(&active)?;
    debug!("Copied {} to {}", REFERENCE_NAMELIST, ACTIVE_NAMELIST);

    for (name, target) in role_links(spec) {
        if ensure_link(target, &root.join(name))? {
            warn!("Role link {} was missing and has been created", name);
        }
    }

    Ok(RunDirectory {
        root,
        copied,
        flux_links,
    })
}
