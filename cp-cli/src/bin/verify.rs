//! `verify` — runs the four-level read-only verification harness: gates,
//! unit tests, import smoke, and (opt-in) e2e smoke.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use cp_cli::{init_tracing, print_output};
use cp_verify::run_all;

#[derive(Parser)]
#[command(name = "verify", about = "Run the multi-level verification harness against a plane", version)]
struct Cli {
    #[arg(long)]
    root: PathBuf,
    /// Opt into the e2e smoke level (requires the configured API-key env var).
    #[arg(long)]
    e2e: bool,
    /// Run only the gates level; skip unit tests, import smoke, and e2e.
    #[arg(long)]
    gates_only: bool,
    #[arg(long)]
    json: bool,
    #[arg(long, default_value = "python3")]
    python_bin: String,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let code = run(cli);
    ExitCode::from(code as u8)
}

fn run(cli: Cli) -> i32 {
    let installed_dir = cli.root.join("installed");
    let mut package_ids = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&installed_dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                package_ids.push(name.to_string());
            }
        }
    }
    let mut packages: HashMap<PathBuf, Vec<String>> = HashMap::new();
    if !package_ids.is_empty() {
        packages.insert(cli.root.clone(), package_ids);
    }

    let unit_test_roots = if cli.gates_only { vec![] } else { vec![cli.root.join("HOT"), cli.root.join("HO2"), cli.root.join("HO1")] };
    let import_modules: Vec<String> = vec![];
    let timeout = Duration::from_secs(cli.timeout_secs);

    let report = run_all(&packages, &unit_test_roots, &cli.python_bin, &import_modules, cli.e2e && !cli.gates_only, "CONTROL_PLANE_E2E_API_KEY", None, timeout);

    print_output(&report.levels, cli.json);
    report.exit_code()
}
