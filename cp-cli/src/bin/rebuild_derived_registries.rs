//! `rebuild_derived_registries` — reconstructs `file_ownership.csv` and
//! `packages_state.csv` from the `PACKAGE_LIFECYCLE` ledger and installed
//! manifests. `--verify`/`--diff` run a dry rebuild and compare against the
//! registries currently on disk instead of overwriting them.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::json;

use cp_cli::{exit_code, init_tracing, open_plane_ledger, plane_context_for_root, print_output};
use cp_derived_state::{rebuild, rebuild_and_write, DerivedStateError};
use cp_registry_store::DerivedRegistry;

#[derive(Parser)]
#[command(name = "rebuild_derived_registries", about = "Rebuild file-ownership and packages-state from the package lifecycle ledger", version)]
struct Cli {
    #[arg(long)]
    plane: PathBuf,
    /// Dry-run: rebuild in memory and compare against the registries on disk, without writing.
    #[arg(long)]
    verify: bool,
    /// Alias of --verify that also reports row-level differences.
    #[arg(long)]
    diff: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("rebuild_derived_registries: {e:#}");
            ExitCode::from(exit_code::USAGE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let (ledger, _manifest) = open_plane_ledger(&cli.plane)?;

    if cli.verify || cli.diff {
        let outcome = match rebuild(&cli.plane, &ledger) {
            Ok(o) => o,
            Err(DerivedStateError::Conflicts(conflicts)) => {
                print_output(&json!({"conflicts": conflicts}), cli.json);
                return Ok(exit_code::FAILURE + 1); // distinct ownership-conflict exit code, per spec
            }
            Err(e) => return Err(e.into()),
        };

        let registry = DerivedRegistry::new(&cli.plane);
        let on_disk_ownership = registry.file_ownership()?;
        let on_disk_state = registry.packages_state()?;

        let ownership_matches = rows_match(&outcome.file_ownership, &on_disk_ownership);
        let state_matches = rows_match(&outcome.packages_state, &on_disk_state);
        let clean = ownership_matches && state_matches;

        let mut payload = json!({
            "clean": clean,
            "file_ownership_rows": outcome.file_ownership.len(),
            "packages_state_rows": outcome.packages_state.len(),
        });
        if cli.diff && !clean {
            payload["file_ownership_matches"] = json!(ownership_matches);
            payload["packages_state_matches"] = json!(state_matches);
        }
        print_output(&payload, cli.json);
        return Ok(if clean { exit_code::OK } else { exit_code::FAILURE });
    }

    let current_plane = plane_context_for_root(&cli.plane)?;
    match rebuild_and_write(&cli.plane, &ledger, &current_plane.pristine_roots) {
        Ok(outcome) => {
            print_output(
                &json!({
                    "file_ownership_rows": outcome.file_ownership.len(),
                    "packages_state_rows": outcome.packages_state.len(),
                }),
                cli.json,
            );
            Ok(exit_code::OK)
        }
        Err(DerivedStateError::Conflicts(conflicts)) => {
            print_output(&json!({"conflicts": conflicts}), cli.json);
            Ok(exit_code::FAILURE + 1)
        }
        Err(e) => Err(e.into()),
    }
}

/// Order-insensitive equality: `write_*` always sorts by primary key before
/// persisting, but a freshly rebuilt `Vec` may land in ledger-replay order.
fn rows_match<T: serde::Serialize>(rebuilt: &[T], on_disk: &[T]) -> bool {
    sorted_json_strings(rebuilt) == sorted_json_strings(on_disk)
}

fn sorted_json_strings<T: serde::Serialize>(rows: &[T]) -> Vec<String> {
    let mut strings: Vec<String> = rows.iter().map(|r| serde_json::to_string(r).unwrap_or_default()).collect();
    strings.sort();
    strings
}
