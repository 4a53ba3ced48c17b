//! LittleFS Browser CLI - Command line interface for LittleFS images.
//!
//! This CLI provides one-shot commands (list devices, detect, list a
//! directory, extract) and a daemon mode that keeps mounts alive between
//! signed requests.

mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use littlefs_browser_core::executor::{ExecutionContext, PrivilegeEscalation};
use littlefs_browser_core::walker::format_size;
use littlefs_browser_core::{BrowserConfig, Error, Geometry, GeometryCandidates, SessionManager};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// LittleFS Browser CLI tool.
#[derive(Parser)]
#[command(name = "littlefs-browser-cli")]
#[command(about = "Browse and extract LittleFS images on block devices", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory under which mount points are created.
    #[arg(long, global = true)]
    mount_base: Option<PathBuf>,

    /// LittleFS FUSE driver binary.
    #[arg(long, global = true)]
    driver: Option<String>,

    /// Use exactly this geometry, as BLOCK:READ:PROG, instead of probing.
    #[arg(long, global = true)]
    geometry: Option<Geometry>,

    /// Probe the extended geometry range.
    #[arg(long, global = true, conflicts_with = "geometry")]
    extended: bool,

    /// How to run driver and unmount commands.
    #[arg(long, global = true, value_enum, default_value_t = Escalation::None)]
    escalation: Escalation,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices that could hold a LittleFS image.
    Devices,
    /// Detect the geometry of a device without mounting it.
    Detect { device: PathBuf },
    /// Mount a device and list one directory.
    Ls {
        device: PathBuf,
        /// Directory relative to the filesystem root.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Mount a device and copy its whole tree to the export directory.
    Extract {
        device: PathBuf,
        /// Export base directory (defaults to ~/Downloads/littlefs_export).
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Reclaim stale mount points left by earlier runs.
    Sweep,
    /// Run as a daemon, accepting signed commands via stdin.
    ///
    /// This mode is intended to be launched via pkexec or sudo,
    /// keeping mounts alive across requests without repeated
    /// authentication.
    Daemon,
}

#[derive(Clone, Copy, ValueEnum)]
enum Escalation {
    None,
    Sudo,
    Pkexec,
}

impl From<Escalation> for PrivilegeEscalation {
    fn from(value: Escalation) -> Self {
        match value {
            Escalation::None => PrivilegeEscalation::None,
            Escalation::Sudo => PrivilegeEscalation::Sudo,
            Escalation::Pkexec => PrivilegeEscalation::Pkexec,
        }
    }
}

/// Logs go to stderr so the daemon's stdout stays a clean protocol channel.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<BrowserConfig, Error> {
    let mut config = match &cli.config {
        Some(path) => BrowserConfig::load(path)?,
        None => BrowserConfig::default(),
    };
    if let Some(base) = &cli.mount_base {
        config = config.with_mount_base(base);
    }
    if let Some(driver) = &cli.driver {
        config = config.with_driver_program(driver);
    }
    if cli.extended {
        config = config.with_candidates(GeometryCandidates::extended());
    }
    if let Some(geometry) = cli.geometry {
        geometry.validate()?;
        config = config.with_geometry(geometry);
    }
    if let Commands::Extract {
        dest: Some(dest), ..
    } = &cli.command
    {
        config = config.with_export_base(dest);
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value).map_err(|e| Error::Generic {
        message: "failed to serialize output".to_string(),
        source: Some(Box::new(e)),
    })?;
    println!("{json}");
    Ok(())
}

fn run(cli: Cli) -> Result<(), Error> {
    let config = load_config(&cli)?;
    let ctx = ExecutionContext::with_escalation(cli.escalation.into());

    let manager = SessionManager::with_lfs(config, ctx);
    match cli.command {
        Commands::Devices => {
            let statuses = manager.device_statuses()?;
            if cli.json {
                return print_json(&statuses);
            }
            if statuses.is_empty() {
                println!("No candidate devices found.");
            }
            for status in statuses {
                let device = &status.device;
                println!(
                    "{:<16} {:>10}  {:<5} {:<16} {}",
                    device.path.display(),
                    format_size(device.size),
                    device.device_type,
                    device.display_label(),
                    status
                        .mount_point
                        .map(|p| format!("mounted at {}", p.display()))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Detect { device } => {
            let detection = manager.detect(&device)?;
            if cli.json {
                return print_json(&detection);
            }
            println!("Geometry: {}", detection.geometry);
            println!("{}", detection.info.trim_end());
        }
        Commands::Ls { device, path } => {
            let session = manager.mount(&device)?;
            let listing = manager.list(&device, &path);
            manager.unmount(&device)?;
            let nodes = listing?;

            if cli.json {
                return print_json(&nodes);
            }
            println!("{} ({})", device.display(), session.geometry);
            for node in nodes {
                let size = node.size.map(format_size).unwrap_or_else(|| "-".to_string());
                let modified = node
                    .modified
                    .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let suffix = if node.is_dir() { "/" } else { "" };
                println!("{:>10}  {:<16}  {}{}", size, modified, node.name, suffix);
            }
        }
        Commands::Extract { device, .. } => {
            manager.mount(&device)?;
            let extraction = manager.extract_all(&device);
            manager.unmount(&device)?;
            let result = extraction?;

            if cli.json {
                return print_json(&result);
            }
            println!(
                "Copied {} file(s), {} to {}",
                result.files_copied,
                format_size(result.bytes_copied),
                result.destination.display()
            );
        }
        Commands::Sweep => {
            let report = manager.sweep()?;
            if cli.json {
                return print_json(&report);
            }
            println!("Reclaimed {} stale mount point(s).", report.reclaimed_count());
            for failure in &report.failed {
                let hint = if failure.needs_privilege {
                    " (needs elevated privileges)"
                } else {
                    ""
                };
                println!("  failed: {}: {}{}", failure.path.display(), failure.message, hint);
            }
        }
        Commands::Daemon => {
            daemon::run_daemon(manager).map_err(|e| Error::Generic {
                message: "daemon I/O failed".to_string(),
                source: Some(Box::new(e)),
            })?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_permission_denied() {
                eprintln!("Hint: retry with --escalation sudo or --escalation pkexec");
            }
            ExitCode::FAILURE
        }
    }
}
