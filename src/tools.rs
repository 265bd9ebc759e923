//! Typed invocations of external tools.
//!
//! Every external program nemostage itself runs (the NCO tools for the
//! ice-shelf removal, `sbatch` for submission) is described by a struct that
//! implements [`ToolArgs`], and executed only through [`run_tool_safe`]. That
//! keeps argument order in one place per tool and guarantees every child is
//! process-group isolated and tracked by [`ChildRegistry`].
//!
//! The generated batch scripts run their own commands; they never come through here.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// CLI contract of one external tool
pub trait ToolArgs {
    /// Program to execute (a bare name is looked up on `PATH`)
    fn program(&self) -> &Path;

    /// Arguments exactly as the tool expects them
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment for the tool
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Short name used in logs and errors
    fn tool_name(&self) -> &'static str;
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// `ncks -x -v <variable> <input> <output>`: copy a file without one variable
#[derive(Debug, Clone)]
pub struct NcksExcludeArgs {
    pub program: PathBuf,
    pub variable: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl ToolArgs for NcksExcludeArgs {
    fn program(&self) -> &Path {
        &self.program
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-x".to_string(),
            "-v".to_string(),
            self.variable.clone(),
            path_arg(&self.input),
            path_arg(&self.output),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "ncks"
    }
}

/// `ncrename -v <from>,<to> <input> <output>`: rename a variable
#[derive(Debug, Clone)]
pub struct NcrenameArgs {
    pub program: PathBuf,
    pub from: String,
    pub to: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl ToolArgs for NcrenameArgs {
    fn program(&self) -> &Path {
        &self.program
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-v".to_string(),
            format!("{},{}", self.from, self.to),
            path_arg(&self.input),
            path_arg(&self.output),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "ncrename"
    }
}

/// `sbatch <script>`
#[derive(Debug, Clone)]
pub struct SbatchArgs {
    pub program: PathBuf,
    pub script: PathBuf,
}

impl ToolArgs for SbatchArgs {
    fn program(&self) -> &Path {
        &self.program
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![path_arg(&self.script)]
    }

    fn tool_name(&self) -> &'static str {
        "sbatch"
    }
}

/// Output of a tool run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the tool was killed by a signal, or never ran
    pub exit_code: Option<i32>,
    pub success: bool,
    /// The command was only logged
    pub dry_run: bool,
}

impl ToolOutput {
    /// Turn a non-zero exit into an error carrying the tool's stderr
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                self.exit_code.unwrap_or(-1),
                self.stderr.trim()
            )
        }
    }

    /// Job ID from sbatch's `Submitted batch job <id>` line
    pub fn batch_job_id(&self) -> Option<u64> {
        self.stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("Submitted batch job "))
            .and_then(|id| id.trim().parse().ok())
    }
}

/// Run a tool in `cwd`, isolated in its own process group.
///
/// With `dry_run` the command is logged and reported successful without
/// being spawned. A non-zero exit is returned as `Ok` with `success: false`;
/// use [`ToolOutput::ensure_success`] when failure is fatal.
pub fn run_tool_safe<T: ToolArgs>(args: &T, cwd: &Path, dry_run: bool) -> Result<ToolOutput> {
    let name = args.tool_name();
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    if dry_run {
        info!(
            "[dry-run] {} {} (in {})",
            program.display(),
            cli_args.join(" "),
            cwd.display()
        );
        return Ok(ToolOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            success: true,
            dry_run: true,
        });
    }

    info!(
        "run_tool_safe: {} args={:?} env={:?} cwd={}",
        program.display(),
        cli_args,
        env_vars,
        cwd.display()
    );

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {} ({})", name, program.display()))?;
    let pid = child.id();
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let waited = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
    let output = waited.with_context(|| format!("Failed waiting for {}", name))?;

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
        dry_run: false,
    };
    if result.success {
        info!("{} finished successfully", name);
    } else {
        warn!(
            "{} failed with exit code {}",
            name,
            result.exit_code.unwrap_or(-1)
        );
    }
    Ok(result)
}
