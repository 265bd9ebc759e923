//! Batch script generator.
//!
//! All three drivers (quick, long, production) come out of one
//! [`ScriptTemplate`], parameterized by the list of phases to run. The scripts
//! are resumable: every completed year is recorded in `time.year.step`, so a
//! job that hits its wall-clock limit can simply be resubmitted.
//!
//! Iteration order inside a year is fixed: pre-run step, parallel model launch,
//! serial cleanup, `wait`, then the state advance. A job killed at any point
//! before the advance repeats that year on resubmission.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{PostProcessing, SchedulerProfile, StageConfig};
use crate::domain::{DOMAIN_ARTIFACT, DOMAIN_DIR, DomainPlan, GRID_EXECUTABLE, HACKED_ARTIFACT};
use crate::error::{IoContext, Result, StageError};
use crate::namelist::{Patch, staging_path};
use crate::resolver::RunSpec;
use crate::stager::REFERENCE_NAMELIST;
use crate::state::STATE_FILE;
use crate::types::ScriptKind;

/// Single-quote `s` for bash
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

/// Join a (possibly empty) launcher prefix and a command
fn launch(prefix: &str, command: &str) -> String {
    format!("{} {}", prefix.trim(), command.trim())
        .trim()
        .to_string()
}

/// What the generator needs besides the run itself
#[derive(Debug, Clone)]
pub struct GeneratorSettings<'a> {
    pub scheduler: &'a SchedulerProfile,
    /// Applied to `namelist_ref` when production output begins
    pub diagnostic_patch: &'a Patch,
    pub postprocessing: Option<&'a PostProcessing>,
    /// The nemostage binary, invoked by the production script as `<tool> patch ...`
    pub patch_tool: PathBuf,
}

impl<'a> GeneratorSettings<'a> {
    pub fn from_config(config: &'a StageConfig, patch_tool: PathBuf) -> Self {
        Self {
            scheduler: &config.scheduler,
            diagnostic_patch: &config.diagnostic_patch,
            postprocessing: config.postprocessing.as_ref(),
            patch_tool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// One iteration, state not advanced
    Once,
    /// `while [ $year -lt <until> ]`
    Loop { label: &'static str, until: u32 },
    /// Switch spin-up output to production output
    Transition,
    /// Post-processing iff the final state is `max_year + 1`
    Finish,
}

/// One parameterized driver
struct ScriptTemplate<'a> {
    kind: ScriptKind,
    spec: &'a RunSpec,
    plan: &'a DomainPlan,
    settings: &'a GeneratorSettings<'a>,
    phases: Vec<Phase>,
}

/// Line buffer with indentation
#[derive(Default)]
struct Script {
    text: String,
}

impl Script {
    fn line(&mut self, indent: usize, s: impl AsRef<str>) {
        for _ in 0..indent {
            self.text.push_str("    ");
        }
        self.text.push_str(s.as_ref());
        self.text.push('\n');
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }
}

impl<'a> ScriptTemplate<'a> {
    fn new(
        kind: ScriptKind,
        spec: &'a RunSpec,
        plan: &'a DomainPlan,
        settings: &'a GeneratorSettings<'a>,
    ) -> Self {
        let last = spec.max_year + 1;
        let phases = match kind {
            ScriptKind::Quick => vec![Phase::Once],
            ScriptKind::Long => vec![Phase::Loop {
                label: "all years",
                until: last,
            }],
            ScriptKind::Production => vec![
                Phase::Loop {
                    label: "Phase 1: spin-up",
                    until: spec.spinup_end(),
                },
                Phase::Transition,
                Phase::Loop {
                    label: "Phase 2: production output",
                    until: last,
                },
                Phase::Finish,
            ],
        };
        Self {
            kind,
            spec,
            plan,
            settings,
            phases,
        }
    }

    fn workdir(&self) -> String {
        quote_path(&self.spec.work_dir)
    }

    fn render(&self) -> String {
        let mut s = Script::default();
        self.header(&mut s);
        if self.plan.generates_grid() {
            self.grid_prologue(&mut s);
        }
        self.read_state(&mut s);
        for phase in &self.phases {
            match *phase {
                Phase::Once => self.iteration(&mut s, 0, false),
                Phase::Loop { label, until } => self.year_loop(&mut s, label, until),
                Phase::Transition => self.transition(&mut s),
                Phase::Finish => self.finish(&mut s),
            }
        }
        s.line(0, r#"echo "Current Date and Time is (end): " `date`"#);
        s.text
    }

    fn header(&self, s: &mut Script) {
        let sched = self.settings.scheduler;
        let limits = sched.limits(self.kind);
        let job_name = limits
            .job_name
            .replace("{config}", &self.spec.config_name)
            .replace("{case}", &self.spec.case_id);

        s.line(0, "#!/bin/bash");
        s.line(0, format!("#SBATCH --job-name={}", job_name));
        s.line(0, format!("#SBATCH --time={}", limits.time));
        s.line(0, format!("#SBATCH --nodes={}", self.spec.nodes));
        s.line(0, format!("#SBATCH --ntasks={}", self.spec.ocean_cores));
        s.line(0, format!("#SBATCH --account={}", self.spec.project));
        s.line(0, format!("#SBATCH --partition={}", sched.partition));
        s.line(0, format!("#SBATCH --qos={}", limits.qos));
        for env in &sched.environment {
            s.line(0, env);
        }
        s.line(0, "#");
        s.line(
            0,
            format!(
                "# {} driver for {} ({}), years {}..{}",
                self.kind,
                self.spec.run_name(),
                self.spec.run_type,
                self.spec.start_year,
                self.spec.max_year
            ),
        );
        s.line(0, r#"echo "Current Date and Time is (start): " `date`"#);
        s.blank();
    }

    fn grid_prologue(&self, s: &mut Script) {
        let wd = self.workdir();
        s.line(0, format!("# create {}", DOMAIN_ARTIFACT));
        s.line(0, format!("cd {}/{}", wd, DOMAIN_DIR));
        s.line(
            0,
            launch(
                &self.settings.scheduler.grid_launcher,
                &format!("./{}", GRID_EXECUTABLE),
            ),
        );
        s.line(0, format!("if [ -f {} ]; then", DOMAIN_ARTIFACT));
        s.line(1, format!("mv {} ../", DOMAIN_ARTIFACT));
        s.line(0, "else");
        s.line(1, format!(r#"echo "ERROR: {} NOT created, stopping.""#, DOMAIN_ARTIFACT));
        s.line(1, "exit 1");
        s.line(0, "fi");
        s.line(0, format!("cd {}", wd));

        if let Some(hook) = self.plan.hook() {
            let input = self.spec.work_dir.join(DOMAIN_ARTIFACT);
            let output = self.spec.work_dir.join(HACKED_ARTIFACT);
            s.line(
                0,
                launch(
                    &self.settings.scheduler.hook_interpreter,
                    &format!(
                        "{} {} {}",
                        quote_path(hook),
                        quote_path(&input),
                        quote_path(&output)
                    ),
                ),
            );
            s.line(0, format!("if [ -f {} ]; then", HACKED_ARTIFACT));
            s.line(1, r#"echo "hacked domain_cfg created.""#);
            s.line(1, format!("rm {}", DOMAIN_ARTIFACT));
            s.line(1, format!("mv {} {}", HACKED_ARTIFACT, DOMAIN_ARTIFACT));
            s.line(0, "else");
            s.line(1, r#"echo "ERROR: hacked domain_cfg NOT created, stopping.""#);
            s.line(1, "exit 1");
            s.line(0, "fi");
        }
        s.blank();
    }

    fn read_state(&self, s: &mut Script) {
        s.line(0, format!("cd {}", self.workdir()));
        s.line(0, format!("if [ -f {} ]; then", STATE_FILE));
        s.line(1, format!("source ./{}", STATE_FILE));
        s.line(0, "else");
        s.line(1, format!("echo 'year=1' > {}", STATE_FILE));
        s.line(1, format!("source ./{}", STATE_FILE));
        s.line(0, "fi");
        s.line(
            0,
            format!(r#"echo "Running year: "$year" out of {}""#, self.spec.max_year),
        );
        s.blank();
    }

    fn iteration(&self, s: &mut Script, indent: usize, advance: bool) {
        let sched = self.settings.scheduler;
        let cores = self.spec.ocean_cores.to_string();
        s.line(indent, r#"echo "Current Date and Time is ("$year" start): " `date`"#);
        s.line(indent, format!("cd {}", self.workdir()));
        if !sched.pre_run.trim().is_empty() {
            s.line(indent, sched.pre_run.trim());
        }
        s.line(
            indent,
            launch(&sched.parallel_launcher.replace("{cores}", &cores), "./nemo.exe"),
        );
        if !sched.cleanup.trim().is_empty() {
            s.line(indent, launch(&sched.serial_launcher, &sched.cleanup));
        }
        s.line(indent, "wait");
        s.line(indent, r#"echo "Current Date and Time is ("$year" end): " `date`"#);
        if advance {
            s.line(indent, "year=$((year+1))");
            s.line(indent, format!(r#"echo "year=$year" > {}.tmp"#, STATE_FILE));
            s.line(indent, format!("mv {}.tmp {}", STATE_FILE, STATE_FILE));
        }
    }

    fn year_loop(&self, s: &mut Script, label: &str, until: u32) {
        s.line(0, format!(r#"echo "--- {} start ---""#, label));
        s.line(0, format!("while [ $year -lt {} ]", until));
        s.line(0, "do");
        self.iteration(s, 1, true);
        s.line(0, "done");
        s.line(0, format!(r#"echo "--- {} end ---""#, label));
        s.blank();
    }

    /// Replays safely when a resubmitted job passes through it again
    fn transition(&self, s: &mut Script) {
        s.line(0, r#"echo "Switching to production output""#);
        s.line(0, format!("cd {}", self.workdir()));
        for rename in &self.spec.production_renames {
            s.line(0, format!("if [ -f {} ]; then", shell_quote(&rename.from)));
            s.line(
                1,
                format!("mv {} {}", shell_quote(&rename.from), shell_quote(&rename.to)),
            );
            s.line(0, "fi");
        }

        if self.settings.diagnostic_patch.values().any(|p| !p.is_empty()) {
            let staged = staging_path(Path::new(REFERENCE_NAMELIST));
            let staged = staged.to_string_lossy();
            let mut cmd = format!(
                "{} patch {}",
                quote_path(&self.settings.patch_tool),
                REFERENCE_NAMELIST
            );
            for (group, params) in self.settings.diagnostic_patch {
                for (name, value) in params {
                    cmd.push_str(&format!(
                        " --set {}",
                        shell_quote(&format!("{}.{}={}", group, name, value.to_fortran()))
                    ));
                }
            }
            cmd.push_str(&format!(" --out {}", staged));
            s.line(0, r#"echo "Turning on production diagnostics""#);
            s.line(0, cmd);
            s.line(0, format!("if [ -f {} ]; then", staged));
            s.line(1, format!(r#"echo "{} patched.""#, REFERENCE_NAMELIST));
            s.line(0, "else");
            s.line(1, r#"echo "ERROR: patched namelist NOT created, stopping.""#);
            s.line(1, "exit 1");
            s.line(0, "fi");
            s.line(0, format!("mv {} {}", staged, REFERENCE_NAMELIST));
        }
        s.blank();
    }

    fn finish(&self, s: &mut Script) {
        let last = self.spec.max_year + 1;
        s.line(0, format!("if [ $year -eq {} ]; then", last));
        s.line(1, r#"echo "All years complete, starting post-processing""#);
        match self.settings.postprocessing {
            Some(post) => {
                for env in &post.environment {
                    s.line(1, env);
                }
                if let Some(dir) = post.script.parent() {
                    s.line(1, format!("cd {}", quote_path(dir)));
                }
                let out = format!("{}/", self.spec.output_dir().to_string_lossy());
                s.line(
                    1,
                    launch(
                        &post.interpreter,
                        &format!(
                            "{} {} {}",
                            quote_path(&post.script),
                            shell_quote(&out),
                            shell_quote(&out)
                        ),
                    ),
                );
            }
            None => s.line(1, r#"echo "No post-processing configured""#),
        }
        s.line(0, "else");
        s.line(
            1,
            format!(
                r#"echo "ERROR: expected year={} after the production phase, found year="$year"""#,
                last
            ),
        );
        s.line(1, "exit 1");
        s.line(0, "fi");
    }
}

/// The three rendered drivers
#[derive(Debug, Clone)]
pub struct BatchScripts {
    pub quick: String,
    pub long: String,
    pub production: String,
}

impl BatchScripts {
    pub fn get(&self, kind: ScriptKind) -> &str {
        match kind {
            ScriptKind::Quick => &self.quick,
            ScriptKind::Long => &self.long,
            ScriptKind::Production => &self.production,
        }
    }

    /// Write all scripts into `dir` and make them user-executable
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for kind in [ScriptKind::Quick, ScriptKind::Long, ScriptKind::Production] {
            let path = dir.join(kind.file_name());
            fs::write(&path, self.get(kind)).at(&path)?;
            let mut perms = fs::metadata(&path).at(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o100);
            fs::set_permissions(&path, perms).at(&path)?;
            debug!("Wrote {}", path.display());
            written.push(path);
        }
        info!("Wrote batch scripts to {}", dir.display());
        Ok(written)
    }
}

/// Render the quick, long and production drivers for a staged run.
///
/// # Errors
///
/// `Precondition` if a post-processing script is configured but missing.
pub fn generate(
    spec: &RunSpec,
    plan: &DomainPlan,
    settings: &GeneratorSettings<'_>,
) -> Result<BatchScripts> {
    if let Some(post) = settings.postprocessing {
        if !post.script.exists() {
            return Err(StageError::precondition(
                "post-processing script",
                &post.script,
            ));
        }
    }

    let render = |kind| ScriptTemplate::new(kind, spec, plan, settings).render();
    Ok(BatchScripts {
        quick: render(ScriptKind::Quick),
        long: render(ScriptKind::Long),
        production: render(ScriptKind::Production),
    })
}
