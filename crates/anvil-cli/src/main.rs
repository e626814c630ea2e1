//! Anvil CLI - verify generated tool code in a sandbox
//!
//! ## Commands
//!
//! - `verify`: Statically check a tool file, then execute it in isolation
//! - `doctor`: Report which isolation backends this host can use
//! - `status`: Show the driver a manager would select right now

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use anvil_sandbox::{
    telemetry, ContainerDriver, EngineConfig, LocalDriver, RemoteDriver, SandboxDriver,
    SandboxManager, SecurityPolicy, VerificationResult, METRICS,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, Level};

/// Characters of captured output shown in the human-readable verdict.
const OUTPUT_PREVIEW_CHARS: usize = 500;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed verification for generated tool code", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a tool file: static analysis, then sandboxed execution
    Verify {
        /// Path to the tool's Python source
        tool_file: PathBuf,

        /// Permit network access (and network-capable imports)
        #[arg(long)]
        allow_network: bool,

        /// Permit filesystem writes (and filesystem-mutating imports)
        #[arg(long)]
        allow_fs_write: bool,

        /// Wall-clock limit for execution
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Memory cap in MiB (container driver only)
        #[arg(long)]
        memory_mb: Option<u64>,

        /// CPU cap in cores (container driver only)
        #[arg(long)]
        cpus: Option<f64>,

        /// Skip the container driver even if a runtime is available
        #[arg(long)]
        no_container: bool,

        /// Print the verdict as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Check which isolation backends are usable on this host
    Doctor,

    /// Show the driver that would be selected
    Status {
        /// Skip the container driver even if a runtime is available
        #[arg(long)]
        no_container: bool,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    telemetry::init_tracing(cli.log_json, level);

    let code = match cli.command {
        Commands::Verify {
            tool_file,
            allow_network,
            allow_fs_write,
            timeout_secs,
            memory_mb,
            cpus,
            no_container,
            json,
        } => {
            let mut builder = SecurityPolicy::builder()
                .allow_network(allow_network)
                .allow_filesystem_write(allow_fs_write)
                .timeout(Duration::from_secs(timeout_secs));
            if let Some(mb) = memory_mb {
                builder = builder.memory_limit_bytes(mb.saturating_mul(1024 * 1024));
            }
            if let Some(cpus) = cpus {
                builder = builder.cpu_limit(cpus);
            }
            let policy = builder.build().context("Invalid security policy")?;
            cmd_verify(&tool_file, policy, !no_container, json).await?
        }
        Commands::Doctor => cmd_doctor().await?,
        Commands::Status { no_container, json } => cmd_status(!no_container, json).await?,
    };

    METRICS.flush();
    Ok(code)
}

/// Drop a managed header: everything up to and including the first line
/// starting with `# ---`. Files without such a line are returned unchanged.
fn strip_managed_header(source: &str) -> &str {
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        offset += line.len();
        if line.starts_with("# ---") {
            return &source[offset..];
        }
    }
    source
}

fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn cmd_verify(
    tool_file: &Path,
    policy: SecurityPolicy,
    prefer_container: bool,
    json: bool,
) -> Result<ExitCode> {
    let source = std::fs::read_to_string(tool_file)
        .with_context(|| format!("Failed to read tool file {}", tool_file.display()))?;
    let code = strip_managed_header(&source);
    debug!(file = %tool_file.display(), bytes = code.len(), "loaded tool");

    let manager = SandboxManager::new(policy, prefer_container)
        .await
        .context("Failed to initialise sandbox")?;

    if !json {
        println!("Verifying: {}", tool_file.display());
        println!("  Sandbox: {}", manager.get_status().active_driver);
        println!();
    }

    let result = manager.verify(code).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_verdict(&result);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_verdict(result: &VerificationResult) {
    if result.success {
        println!("✓ Code passed verification");
        if !result.output.is_empty() {
            println!("\n  Output:\n{}", preview(&result.output, OUTPUT_PREVIEW_CHARS));
        }
    } else {
        println!("✗ Code failed verification");
        if let Some(status) = result.exit_status {
            println!("\n  Status: {status}");
        }
        if let Some(error) = &result.error {
            println!("  Error: {error}");
        }
        if !result.security_violations.is_empty() {
            println!("\n  Security violations:");
            for violation in &result.security_violations {
                println!("    - {violation}");
            }
        }
    }
    if let Some(from) = &result.fallback_from {
        println!("\n  Note: {from} driver failed; ran on {} instead", result.active_driver);
    }
    println!("\n  Duration: {:.1}ms", result.duration_ms());
}

#[derive(Serialize)]
struct DoctorReport {
    version: &'static str,
    python: bool,
    network_namespaces: bool,
    container_runtime: bool,
    remote_credentials: bool,
}

async fn cmd_doctor() -> Result<ExitCode> {
    let config = EngineConfig::from_env();

    let local = LocalDriver::new(config.local.clone());
    let container = ContainerDriver::new(config.container.clone());
    let remote_credentials = match config.remote.clone() {
        Some(remote) => match RemoteDriver::new(remote) {
            Ok(driver) => driver.is_available().await,
            Err(err) => {
                println!("  ! remote configuration rejected: {err}");
                false
            }
        },
        None => false,
    };

    let report = DoctorReport {
        version: anvil_sandbox::VERSION,
        python: local.is_available().await,
        network_namespaces: local.network_isolation_supported().await,
        container_runtime: container.is_available().await,
        remote_credentials,
    };

    println!("Anvil {}", report.version);
    println!();
    check_line(&format!("Python interpreter ({})", config.local.python), report.python);
    check_line("Network namespaces (local isolation)", report.network_namespaces);
    check_line(
        &format!("Container runtime ({})", config.container.runtime),
        report.container_runtime,
    );
    check_line("Remote sandbox credentials (DAYTONA_API_KEY)", report.remote_credentials);

    if !report.python {
        println!("\nNo Python interpreter found; set ANVIL_PYTHON or install python3.");
        return Ok(ExitCode::FAILURE);
    }
    if !report.container_runtime && !report.remote_credentials {
        println!("\nOnly the local driver is usable; isolation is reduced.");
    }
    Ok(ExitCode::SUCCESS)
}

fn check_line(label: &str, ok: bool) {
    let mark = if ok { "✓" } else { "✗" };
    println!("  {mark} {label}");
}

async fn cmd_status(prefer_container: bool, json: bool) -> Result<ExitCode> {
    let manager = SandboxManager::new(SecurityPolicy::default(), prefer_container)
        .await
        .context("Failed to initialise sandbox")?;
    let status = manager.get_status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Active driver: {}", status.active_driver);
        println!("Isolation:     {:?}", status.isolation);
        println!(
            "Fallback:      {}",
            if status.fallback_available {
                "local"
            } else {
                "none"
            }
        );
    }
    Ok(ExitCode::SUCCESS)
}
