//! Relay settlement maintenance tool.
//!
//! Offline inspection of the on-disk state a relayer node leaves behind:
//!
//! ```text
//! relay_settlement [--env dev] inspect-wal <path>   # replay a mined-relay WAL
//! relay_settlement [--env dev] list-backups         # newest snapshot per session
//! relay_settlement --version
//! ```

use anyhow::{Context, Result, bail};
use relay_settlement::backup::BackupManager;
use relay_settlement::config::AppConfig;
use relay_settlement::mined_relay_wal::rebuild_smst;

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Positional arguments with `--env <value>` removed.
fn positional(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args.iter().skip(1) {
        if skip {
            skip = false;
            continue;
        }
        if arg == "--env" || arg == "-e" {
            skip = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn usage() -> &'static str {
    "usage: relay_settlement [--env <env>] <inspect-wal <path> | list-backups>"
}

// ============================================================
// COMMANDS
// ============================================================

fn inspect_wal(path: &str) -> Result<()> {
    let recovery = rebuild_smst(path).with_context(|| format!("replaying WAL {}", path))?;
    let root = recovery.smst.root();
    println!("wal:          {}", path);
    println!("entries:      {}", recovery.entries);
    println!("leaves:       {}", root.count());
    println!("total weight: {}", root.sum());
    println!("root:         {}", root);
    Ok(())
}

fn list_backups(config: &AppConfig) -> Result<()> {
    let manager = BackupManager::new(config.backup.clone()).context("opening backup directory")?;
    let snapshots = manager.restore_all().context("scanning backups")?;
    if snapshots.is_empty() {
        println!("no backups under {}", manager.backup_dir().display());
        return Ok(());
    }
    for snapshot in snapshots {
        let ts = chrono::DateTime::from_timestamp(snapshot.backup_timestamp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| snapshot.backup_timestamp.to_string());
        println!(
            "{}/{} end={} claimed={} claiming={} entries={} at {}",
            snapshot.supplier_operator_address,
            snapshot.session_id(),
            snapshot.session_header.session_end_block_height,
            snapshot.claimed_root.is_some(),
            snapshot.is_claiming,
            snapshot.smt_entries.len(),
            ts
        );
    }
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("relay_settlement {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        return Ok(());
    }

    let env = get_env(&args);
    let config = AppConfig::load(&env).with_context(|| format!("loading config for env {}", env))?;
    let _log_guard = relay_settlement::logging::init_logging(&config);

    tracing::info!(env = %env, "relay_settlement starting");

    let positional = positional(&args);
    match positional.first().map(String::as_str) {
        Some("inspect-wal") => match positional.get(1) {
            Some(path) => inspect_wal(path),
            None => bail!(usage()),
        },
        Some("list-backups") => list_backups(&config),
        _ => bail!(usage()),
    }
}
