//! nemostage - main entry point
//!
//! Thin dispatcher over the library: every subcommand maps to one library
//! call, and every fatal error is reported once as `✗ <kind>: <detail>`.

use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use nemostage::cli::{Cli, Commands};
use nemostage::config::StageConfig;
use nemostage::error::StageError;
use nemostage::orchestrator::{self, LaunchRequest, Orchestrator};
use nemostage::process_guard::{self, ProcessGuard};

/// Initialize the logger: stderr, `RUST_LOG` overrides the `info` default
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Label for the diagnostic line: the typed kind when there is one
fn error_kind(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StageError>())
        .map(StageError::kind)
        .unwrap_or("Error")
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StageConfig> {
    let config = StageConfig::load_or_default(path)?;
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Launch {
            run_type,
            case,
            members,
            start_year,
            max_year,
            description,
            production_offset,
            domain_mode,
            submit,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let patch_tool = std::env::current_exe()?;
            let request = LaunchRequest {
                run_type,
                case,
                members,
                start_year,
                max_year,
                description,
                production_offset,
                domain_mode,
                submit,
            };
            let outcomes = Orchestrator::new(&config, patch_tool, cli.dry_run).launch(&request)?;
            for outcome in outcomes {
                println!("✓ Staged {}", outcome.run.root.display());
                if let Some(id) = outcome.job_id {
                    println!("✓ Submitted as job {}", id);
                }
            }
        }
        Commands::Patch {
            document,
            assignments,
            out,
        } => {
            orchestrator::patch_document(&document, &assignments, out.as_deref())?;
            println!(
                "✓ Patched {}",
                out.as_deref().unwrap_or(&document).display()
            );
        }
        Commands::Validate { file } => {
            info!("Validating configuration file: {:?}", file);
            let config = load_config(Some(&file))?;
            println!(
                "✓ Configuration file is valid: {} run type(s)",
                config.run_types.len()
            );
        }
        Commands::InitConfig { path } => {
            if path.exists() {
                anyhow::bail!("{} already exists, not overwriting it", path.display());
            }
            StageConfig::default().save_to_file(&path)?;
            println!("✓ Wrote default configuration to {}", path.display());
        }
        Commands::Status { template_dir } => {
            let (ledger, runs) = orchestrator::status(&template_dir)?;
            println!(
                "{} ({} run(s), first run spans {} years)",
                ledger.path.display(),
                runs.len(),
                ledger.year_count
            );
            for run in runs {
                let progress = match (run.year, run.max_year) {
                    (None, _) => "missing".to_string(),
                    _ if run.is_complete() => "complete".to_string(),
                    (Some(year), Some(max)) => format!("year {} of {}", year, max),
                    (Some(year), None) => format!("year {}", year),
                };
                println!("  {}  {}", run.run_dir.display(), progress);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logger();
    debug!("nemostage starting up");

    // External tools are terminated with us on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {}: {:#}", error_kind(&e), e);
            ExitCode::FAILURE
        }
    }
}
