use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use ledgerguard::clock::SystemClock;
use ledgerguard::logging::{log, obj, v_num, v_str, Domain, Level};
use ledgerguard::model::CandidateTransaction;
use ledgerguard::storage::SqliteLedger;
use ledgerguard::verify::invariants;
use ledgerguard::{Config, IntegrityEngine};

/// Either a bare array or `{"transactions": [...]}` as sent by devices.
#[derive(Deserialize)]
#[serde(untagged)]
enum SyncRequest {
    Bare(Vec<CandidateTransaction>),
    Wrapped { transactions: Vec<CandidateTransaction> },
}

impl SyncRequest {
    fn into_candidates(self) -> Vec<CandidateTransaction> {
        match self {
            SyncRequest::Bare(txs) | SyncRequest::Wrapped { transactions: txs } => txs,
        }
    }
}

fn print_usage() {
    eprintln!("Usage: ledgerguard <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  sync <file|->              Reconcile a batch of transactions (JSON)");
    eprintln!("  anomalies [hours]          Run the anomaly sweep (default 24h, max 720h)");
    eprintln!("  trust <user> [hours]       Current trust score and advisory adjustment");
    eprintln!("  user <user> [pubkey_hex]   Provision a user (trust 1.0)");
    eprintln!("  ledger <user> [limit]      Most recent entries involving a user");
    eprintln!("  audit                      Check ledger invariants");
    eprintln!();
    eprintln!("Environment: SQLITE_PATH, LOG_LEVEL, LOG_DOMAINS, LOG_DIR, and risk/anomaly knobs");
}

fn parse_opt<T: std::str::FromStr>(arg: Option<&String>, what: &str) -> Result<Option<T>> {
    match arg {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(_) => bail!("invalid {}: {}", what, raw),
        },
    }
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))
    }
}

fn emit(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cfg = Config::from_env();
    let store = Arc::new(
        SqliteLedger::open(&cfg.sqlite_path).with_context(|| format!("opening {}", cfg.sqlite_path))?,
    );
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("command", v_str(&args[1])),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("simulated_signatures", json!(cfg.risk.allow_simulated_signatures)),
        ]),
    );
    let engine = IntegrityEngine::sqlite(store.clone(), Arc::new(SystemClock), cfg);

    match args[1].as_str() {
        "sync" => {
            let path = args.get(2).map(String::as_str).unwrap_or("-");
            let request: SyncRequest =
                serde_json::from_str(&read_input(path)?).context("parsing transaction batch")?;
            let candidates = request.into_candidates();
            let submitted = candidates.len();
            let results = engine.sync_batch(candidates).await;
            log(
                Level::Info,
                Domain::Reconcile,
                "batch_done",
                obj(&[
                    ("submitted", v_num(submitted as f64)),
                    ("reconciled", v_num(results.iter().filter(|r| r.result().is_some()).count() as f64)),
                ]),
            );
            emit(&json!({ "status": "synced", "results": results }))?;
        }
        "anomalies" => {
            let hours = parse_opt(args.get(2), "window hours")?;
            let sweep = engine.detect_anomalies(hours)?;
            emit(&json!({
                "window_hours": sweep.window_hours,
                "total": sweep.total(),
                "anomalies": sweep.reports,
                "failed_detectors": sweep.failed_detectors,
            }))?;
        }
        "trust" => {
            let Some(user) = args.get(2) else {
                bail!("usage: ledgerguard trust <user> [hours]");
            };
            let hours = parse_opt(args.get(3), "window hours")?;
            let current = engine.trust_score(user)?;
            let adjustment = engine.trust_adjustment(user, hours)?;
            emit(&json!({
                "user_id": user,
                "trust_score": current,
                "suggested_adjustment": adjustment,
            }))?;
        }
        "user" => {
            let Some(user) = args.get(2) else {
                bail!("usage: ledgerguard user <user> [pubkey_hex]");
            };
            let public_key = args.get(3).map(String::as_str);
            store.upsert_user(user, public_key, 1.0)?;
            emit(&json!({ "user_id": user, "trust_score": 1.0, "has_public_key": public_key.is_some() }))?;
        }
        "ledger" => {
            let Some(user) = args.get(2) else {
                bail!("usage: ledgerguard ledger <user> [limit]");
            };
            let limit = parse_opt(args.get(3), "limit")?.unwrap_or(50);
            let entries = engine.ledger_for(user, limit)?;
            emit(&json!({ "user_id": user, "entries": entries }))?;
        }
        "audit" => {
            let report = invariants::audit(&store)?;
            let clean = report.is_clean();
            emit(&serde_json::to_value(&report)?)?;
            if !clean {
                log(
                    Level::Error,
                    Domain::System,
                    "audit_failed",
                    obj(&[("violations", v_num(report.violations.len() as f64))]),
                );
                std::process::exit(2);
            }
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}
