//! vmexec command-line interface.
//!
//! Reads configuration from the environment and `.env`, logs in to the
//! management endpoint, runs the script on the target VM and writes the
//! output to `<output-dir>/<vm>.txt`.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vmexec::guest::GuestOperations;
use vmexec::run::{Orchestrator, RunConfig, RunFailure, RunReport, read_script};
use vmexec::shutdown::install_shutdown_handler;
use vmexec::transfer::HttpTransfer;
use vmexec::vsphere::{Session, VsphereError, VsphereGuest, endpoint_url};
use vmexec_common::config::{Severity, Sourced, validate_config};
use vmexec_common::util::humanize_duration;
use vmexec_common::{LogConfig, RunRequest, Settings, VmTarget, init_logging};

/// Exit status when the run could not take place.
const EXIT_COULD_NOT_RUN: u8 = 1;

#[derive(Parser)]
#[command(name = "vmexec")]
#[command(author, version, about = "Run a shell script inside a VM guest via vSphere guest operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path of the .env file to read
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload and run the script, then download its output
    Run {
        /// Target VM name (overrides VM_NAME)
        #[arg(long)]
        vm: Option<String>,

        /// Local script to run (overrides VMEXEC_SCRIPT)
        #[arg(long)]
        script: Option<PathBuf>,

        /// Directory for the <vm>.txt output file
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Seconds to wait for the guest process to finish
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=86_400))]
        completion_timeout: Option<u64>,

        /// Overall time budget for the run in seconds
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=86_400))]
        budget: Option<u64>,

        /// Run the script without sudo
        #[arg(long)]
        no_sudo: bool,
    },

    /// Log in, locate the VM and validate guest credentials without changing anything
    Check {
        /// Target VM name (overrides VM_NAME)
        #[arg(long)]
        vm: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load_with_dotenv(&cli.env_file) {
        Ok(settings) => settings,
        Err(e) => {
            eprint!("{}", e.code().entry().format_full());
            eprintln!("\n{e}");
            return ExitCode::from(EXIT_COULD_NOT_RUN);
        }
    };
    apply_overrides(&mut settings, &cli.command);

    let mut log_config = LogConfig::new(settings.log.level.clone()).with_json(settings.log.json);
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("warning: {e}");
    }

    for finding in validate_config(&settings) {
        match finding.severity {
            Severity::Warning => warn!(field = %finding.field, "{}", finding.message),
            Severity::Info => info!(field = %finding.field, "{}", finding.message),
        }
    }

    let result = match cli.command {
        Commands::Run { .. } => run_command(&settings, install_shutdown_handler()).await,
        Commands::Check { .. } => check_command(&settings).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_COULD_NOT_RUN)
        }
    }
}

fn apply_overrides(settings: &mut Settings, command: &Commands) {
    match command {
        Commands::Run {
            vm,
            script,
            output_dir,
            completion_timeout,
            budget,
            no_sudo,
        } => {
            if let Some(vm) = vm {
                settings.target = Sourced::from_cli(VmTarget::new(vm.clone()));
            }
            if let Some(script) = script {
                settings.run.script_path = Sourced::from_cli(script.clone());
            }
            if let Some(dir) = output_dir {
                settings.run.output_dir = Sourced::from_cli(dir.clone());
            }
            if let Some(secs) = completion_timeout {
                settings.run.completion_timeout = Sourced::from_cli(Duration::from_secs(*secs));
            }
            if let Some(secs) = budget {
                settings.run.run_budget = Sourced::from_cli(Duration::from_secs(*secs));
            }
            if *no_sudo {
                settings.run.use_sudo = false;
            }
        }
        Commands::Check { vm } => {
            if let Some(vm) = vm {
                settings.target = Sourced::from_cli(VmTarget::new(vm.clone()));
            }
        }
    }
}

/// Attach the catalog entry to a management API error.
fn coded(e: VsphereError) -> anyhow::Error {
    let brief = e.code().entry().format_brief();
    anyhow::Error::new(e).context(brief)
}

async fn login(settings: &Settings) -> Result<Session> {
    let endpoint = endpoint_url(&settings.vcenter.host.value).map_err(coded)?;
    Session::login(
        &endpoint,
        &settings.vcenter.user,
        &settings.vcenter.password,
        settings.vcenter.insecure.value,
    )
    .await
    .map_err(coded)
    .with_context(|| format!("logging in to {} as {}", endpoint, settings.vcenter.user))
}

async fn logout(session: Session) {
    if let Err(e) = session.logout().await {
        warn!(error = %e, "failed to close management session");
    }
}

async fn run_command(settings: &Settings, cancel: CancellationToken) -> Result<u8> {
    let script_path = &settings.run.script_path;
    let script = read_script(&script_path.value)
        .await
        .with_context(|| format!("script path from {}", script_path.describe()))?;
    let request = RunRequest::new(settings.target.value.clone(), settings.guest.clone(), script);

    let session = login(settings).await?;
    let result = run_with_session(&session, settings, &request, cancel).await;
    logout(session).await;
    result
}

async fn run_with_session(
    session: &Session,
    settings: &Settings,
    request: &RunRequest,
    cancel: CancellationToken,
) -> Result<u8> {
    let vm = session
        .find_vm(request.target.as_str(), settings.vcenter.datacenter.as_deref())
        .await
        .map_err(coded)?;
    let guest = VsphereGuest::new(session, vm);
    let transfer = HttpTransfer::with_client(session.client().clone());

    let orchestrator = Orchestrator::new(&guest, &transfer, RunConfig::from(&settings.run))
        .with_cancellation(cancel);

    match orchestrator.run(request).await {
        Ok(report) => {
            print_report(&report);
            Ok(u8::try_from(report.exit_status()).unwrap_or(EXIT_COULD_NOT_RUN))
        }
        Err(failure) => {
            print_failure(&failure);
            Ok(EXIT_COULD_NOT_RUN)
        }
    }
}

async fn check_command(settings: &Settings) -> Result<u8> {
    let session = login(settings).await?;
    let result = check_with_session(&session, settings).await;
    logout(session).await;
    result
}

async fn check_with_session(session: &Session, settings: &Settings) -> Result<u8> {
    let target = &settings.target;
    let vm = session
        .find_vm(target.value.as_str(), settings.vcenter.datacenter.as_deref())
        .await
        .map_err(coded)
        .with_context(|| format!("VM name from {}", target.describe()))?;
    let vm_id = vm.id.clone();

    let guest = VsphereGuest::new(session, vm);
    guest
        .validate_credentials(&settings.guest)
        .await
        .with_context(|| format!("guest user '{}' on {}", settings.guest.username, target.value))?;

    println!(
        "OK: {} ({}) accepts guest user '{}'",
        target.value, vm_id, settings.guest.username
    );
    Ok(0)
}

fn print_report(report: &RunReport) {
    println!(
        "{}: {} in {}",
        report.target,
        report.outcome,
        humanize_duration(report.elapsed.as_secs())
    );
    if let Some(code) = report.script_exit_code {
        println!("  script exit code: {code}");
    }
    println!(
        "  output: {} ({} bytes)",
        report.output_path.display(),
        report.output_bytes
    );
    for path in report.cleanup.leftovers() {
        println!("  not cleaned up: {path}");
    }
}

fn print_failure(failure: &RunFailure) {
    eprint!("{}", failure.error.code().entry().format_full());
    eprintln!("\n{}", failure.error);
    if failure.process_left_running {
        eprintln!("The guest process may still be running.");
    }
    for path in failure.cleanup.leftovers() {
        eprintln!("Not cleaned up on the guest: {path}");
    }
}
