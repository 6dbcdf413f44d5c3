//! `seal_guard` — preflight/postflight/drift-check/quarantine operations
//! against a plane's installed packages.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use cp_cli::{exit_code, init_tracing, open_plane_ledger, plane_context_for_root, print_output, resolve_installed_dependency_tiers};
use cp_seal_guard::{drift_check, postflight, preflight, quarantine};

#[derive(Parser)]
#[command(name = "seal_guard", about = "Preflight, postflight, drift-check and quarantine for installed packages", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-validate an archive before it's trusted.
    Preflight {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        genesis: bool,
        #[arg(long)]
        json: bool,
    },
    /// Verify an installed package's receipt and on-disk files.
    Postflight {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        package: String,
        #[arg(long)]
        json: bool,
    },
    #[command(name = "drift-check")]
    /// Report file-hash drift across every installed package on a plane.
    DriftCheck {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Taint an installed package and record a `package_quarantine` entry.
    Quarantine {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        package: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("seal_guard: {e:#}");
            ExitCode::from(exit_code::USAGE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Preflight { archive, root, strict, genesis, json } => {
            let bytes = fs::read(&archive)?;
            let current_plane = plane_context_for_root(&root)?;
            let dependency_tiers = resolve_installed_dependency_tiers(&root)?;
            let policies_dir = root.join("policies");
            let reports = preflight(&bytes, &current_plane, &dependency_tiers, &policies_dir, strict, genesis)?;
            let passed = reports.iter().all(|r| r.passed);
            print_output(&reports, json);
            Ok(if passed { exit_code::OK } else { exit_code::FAILURE })
        }
        Command::Postflight { root, package, json } => {
            let report = postflight(&root, &package)?;
            print_output(&report, json);
            Ok(if report.passed { exit_code::OK } else { exit_code::FAILURE })
        }
        Command::DriftCheck { root, json } => {
            let reports = drift_check(&root)?;
            let passed = reports.iter().all(|r| r.passed);
            print_output(&reports, json);
            Ok(if passed { exit_code::OK } else { exit_code::FAILURE })
        }
        Command::Quarantine { root, package, reason, json } => {
            let current_plane = plane_context_for_root(&root)?;
            let (mut ledger, _manifest) = open_plane_ledger(&root)?;
            quarantine(&root, &current_plane.pristine_roots, &package, &reason, &mut ledger)?;
            print_output(&json!({"package": package, "quarantined": true, "reason": reason}), json);
            Ok(exit_code::OK)
        }
    }
}
