//! `cp_plane` — create and operate on planes and their instances: tier
//! creation, work-order/session instantiation, chain verification, and the
//! cross-ledger chain operations (summarize-up, push-policy, apply-policy).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use cp_chain_ops::{apply_policy, push_policy, summarize_up};
use cp_cli::{cursor_dir_for_root, exit_code, init_tracing, open_plane_ledger, parse_tier, print_output};
use cp_cursor_manager::CursorManager;
use cp_ledger_factory::{create_session_instance, create_tier, create_work_order_instance, list_instances};

#[derive(Parser)]
#[command(name = "cp_plane", about = "Create and operate on control-plane tiers and instances", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a brand-new tier plane.
    Create {
        #[arg(long, value_parser = parse_tier)]
        tier: cp_types::Tier,
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        parent: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List work-order/session instances under a base plane root.
    List {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print a plane's `tier.json` and current ledger entry count.
    Info {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Verify a plane's ledger hash chain.
    Verify {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create a work-order instance under a HO2 base plane.
    CreateWorkOrder {
        #[arg(long)]
        id: String,
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create a session instance under a HO1 base plane.
    CreateSession {
        #[arg(long)]
        id: String,
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Verify a plane's ledger hash chain (alias of `verify`).
    VerifyChain {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Roll up every child instance's new ledger activity into the parent.
    SummarizeUp {
        #[arg(long)]
        parent: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Push a policy version down to every child instance of a parent plane.
    PushPolicy {
        #[arg(long)]
        policy: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        parent: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Apply every pushed-but-unapplied policy on one instance.
    ApplyPolicy {
        #[arg(long)]
        root: PathBuf,
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
            eprintln!("cp_plane: {e:#}");
            ExitCode::from(exit_code::USAGE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Create { tier, root, parent, json } => {
            let client = create_tier(tier, &root, parent.as_deref(), None)?;
            print_output(&json!({"tier": tier.as_str(), "root": root, "entries": client.count()}), json);
            Ok(exit_code::OK)
        }
        Command::List { root, json } => {
            let instances = list_instances(&root)?;
            let rows: Vec<_> = instances
                .iter()
                .map(|(path, manifest)| json!({"path": path, "tier": manifest.tier, "status": manifest.status}))
                .collect();
            print_output(&rows, json);
            Ok(exit_code::OK)
        }
        Command::Info { root, json } => {
            let (client, manifest) = open_plane_ledger(&root)?;
            print_output(&json!({"manifest": manifest, "entry_count": client.count()}), json);
            Ok(exit_code::OK)
        }
        Command::Verify { root, json } | Command::VerifyChain { root, json } => {
            let (client, _manifest) = open_plane_ledger(&root)?;
            let (ok, issues) = client.verify_chain();
            print_output(&json!({"valid": ok, "issues": issues}), json);
            Ok(if ok { exit_code::OK } else { exit_code::FAILURE })
        }
        Command::CreateWorkOrder { id, base, json } => {
            let client = create_work_order_instance(&base, &id)?;
            print_output(&json!({"work_order_id": id, "base": base, "entries": client.count()}), json);
            Ok(exit_code::OK)
        }
        Command::CreateSession { id, base, json } => {
            let client = create_session_instance(&base, &id)?;
            print_output(&json!({"session_id": id, "base": base, "entries": client.count()}), json);
            Ok(exit_code::OK)
        }
        Command::SummarizeUp { parent, json } => {
            let (mut parent_ledger, _parent_manifest) = open_plane_ledger(&parent)?;
            let instances = list_instances(&parent)?;
            let cursor_mgr = CursorManager::new(&cursor_dir_for_root(&parent))?;
            let mut summaries = Vec::new();
            for (instance_path, instance_manifest) in instances {
                let ledger_rel = instance_manifest.ledger_path.clone();
                let ledger_path = instance_path.join(&ledger_rel);
                let child_ledger = cp_ledger_engine::LedgerClient::with_default_options(&ledger_path, None)?;
                let child_tier = instance_manifest.tier()?;
                let instance_id = instance_manifest.work_order_id.clone().or(instance_manifest.session_id.clone()).unwrap_or_else(|| instance_path.display().to_string());
                let uri = ledger_path.display().to_string();
                if let Some(written) = summarize_up(&cursor_mgr, &mut parent_ledger, &child_ledger, &uri, child_tier, &instance_id)? {
                    summaries.push(json!({"instance": instance_id, "entries_summarized": written.entry_count}));
                }
            }
            print_output(&summaries, json);
            Ok(exit_code::OK)
        }
        Command::PushPolicy { policy, version, parent, json } => {
            let instances = list_instances(&parent)?;
            let mut pushed_to = Vec::new();
            for (instance_path, instance_manifest) in instances {
                let ledger_rel = instance_manifest.ledger_path.clone();
                let ledger_path = instance_path.join(&ledger_rel);
                let mut child_ledger = cp_ledger_engine::LedgerClient::with_default_options(&ledger_path, None)?;
                let instance_id = instance_manifest.work_order_id.clone().or(instance_manifest.session_id.clone()).unwrap_or_else(|| instance_path.display().to_string());
                if push_policy(&mut child_ledger, &policy, &version, &instance_id)? {
                    pushed_to.push(instance_id);
                }
            }
            print_output(&json!({"policy": policy, "version": version, "pushed_to": pushed_to}), json);
            Ok(exit_code::OK)
        }
        Command::ApplyPolicy { root, json } => {
            let (mut ledger, manifest) = open_plane_ledger(&root)?;
            let instance_id = manifest.work_order_id.clone().or(manifest.session_id.clone()).unwrap_or_else(|| root.display().to_string());
            let applied = apply_policy(&mut ledger, &instance_id)?;
            print_output(&json!({"instance": instance_id, "applied_count": applied}), json);
            Ok(exit_code::OK)
        }
    }
}
