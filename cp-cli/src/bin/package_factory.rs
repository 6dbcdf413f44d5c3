//! `package_factory` — runs the G1-G9 gate pipeline against a package
//! source directory: validate, pack deterministically, sign, attest,
//! register, and (optionally) install. Every gate's report is written to
//! the plane ledger as it runs, so a failing run leaves an audit trail too.

use std::path::PathBuf;
use std::process::ExitCode;

use serde_json::json;

use clap::Parser;

use cp_cli::{exit_code, init_tracing, open_plane_ledger, plane_context_for_root, print_output, resolve_installed_dependency_tiers};
use cp_config::ControlPlaneConfig;
use cp_derived_state::rebuild_and_write;
use cp_ledger_engine::NewEntry;
use cp_package_factory::{run_pipeline, FactoryContext, FactoryOptions};
use cp_registry_store::{CuratedRegistry, DerivedRegistry};

#[derive(Parser)]
#[command(name = "package_factory", about = "Validate, pack, sign, attest, register and install a package", version)]
struct Cli {
    #[arg(long)]
    id: String,
    #[arg(long)]
    src: PathBuf,
    #[arg(long)]
    root: PathBuf,
    #[arg(long)]
    sign: bool,
    #[arg(long)]
    attest: bool,
    #[arg(long)]
    install: bool,
    #[arg(long)]
    genesis: bool,
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("package_factory: {e:#}");
            ExitCode::from(exit_code::USAGE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = ControlPlaneConfig::from_env(Some(cli.root.clone()))?;
    let current_plane = plane_context_for_root(&cli.root)?;
    let curated = CuratedRegistry::new(&cli.root);
    let derived = DerivedRegistry::new(&cli.root);
    let dependency_tiers = resolve_installed_dependency_tiers(&cli.root)?;
    let (mut ledger, _manifest) = open_plane_ledger(&cli.root)?;

    let manifest_path = cli.src.join("manifest.json");
    let signing_key = if cli.sign { Some(config.require_signing_key()?.to_string()) } else { None };

    let mut ctx = FactoryContext {
        manifest_path,
        source_dir: cli.src.clone(),
        plane_root: cli.root.clone(),
        governed_roots: current_plane.pristine_roots.clone(),
        current_plane: &current_plane,
        dependency_tiers,
        curated: &curated,
        derived: &derived,
        builder: whoami_builder(),
        signing_key,
        package_id: cli.id.clone(),
        ledger: &mut ledger,
        options: FactoryOptions {
            allow_unsigned: config.allow_unsigned,
            allow_unattested: !cli.attest,
            is_genesis: cli.genesis,
        },
    };

    let outcome = run_pipeline(&mut ctx, chrono::Utc::now())?;
    let passed = outcome.passed();

    if passed && cli.install {
        let version = outcome.manifest.as_ref().map(|m| m.version.clone()).unwrap_or_default();
        let mut metadata = serde_json::Map::new();
        metadata.insert("version".to_string(), serde_json::Value::String(version));
        ledger.write(NewEntry::new("PACKAGE_LIFECYCLE", &cli.id, "INSTALLED", format!("installed via package_factory from {}", cli.src.display())).with_metadata(metadata))?;
        rebuild_and_write(&cli.root, &ledger, &current_plane.pristine_roots)?;
    }

    print_output(
        &json!({
            "package_id": cli.id,
            "passed": passed,
            "gates": outcome.reports,
            "archive_digest": outcome.archive_digest,
            "signature": outcome.signature,
            "attestation": outcome.attestation,
        }),
        cli.json,
    );

    Ok(if passed { exit_code::OK } else { exit_code::FAILURE })
}

fn whoami_builder() -> String {
    std::env::var("USER").unwrap_or_else(|_| "package_factory".to_string())
}
