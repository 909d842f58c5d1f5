use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use badge_registry::{BadgeContract, WorldState};

/// Local host for the badge registry contract.
///
/// Each command runs as one transaction against the world state snapshot;
/// writes are persisted only when the contract function succeeds.
#[derive(Parser, Debug)]
#[command(name = "badge-registry", version)]
struct Cli {
    /// World state snapshot file
    #[arg(long, env = "BADGE_STATE_FILE", default_value = "world_state.json")]
    state_file: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "BADGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Transaction id (derived from the invocation when omitted)
    #[arg(long, env = "BADGE_TX_ID")]
    tx_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed the registry with the sample badges
    InitLedger,
    /// Issue a new badge
    Create {
        id: String,
        publisher_id: String,
        description: String,
        #[arg(allow_negative_numbers = true)]
        validity: i64,
    },
    /// Print one badge
    Read { id: String },
    /// Replace every field of an existing badge
    Update {
        id: String,
        publisher_id: String,
        description: String,
        #[arg(allow_negative_numbers = true)]
        validity: i64,
    },
    /// Remove a badge
    Delete { id: String },
    /// Print whether a badge exists
    Exists { id: String },
    /// Print every badge in key order
    List,
    /// Call a contract function by name with raw string arguments
    Invoke {
        function: String,
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the height and digest of the committed world state
    StateRoot,
}

impl Command {
    /// Contract function name and string arguments for this command.
    fn invocation(&self) -> Option<(String, Vec<String>)> {
        let call = match self {
            Command::InitLedger => ("InitLedger".to_string(), vec![]),
            Command::Create {
                id,
                publisher_id,
                description,
                validity,
            } => (
                "CreateBadge".to_string(),
                vec![
                    id.clone(),
                    publisher_id.clone(),
                    description.clone(),
                    validity.to_string(),
                ],
            ),
            Command::Read { id } => ("ReadBadge".to_string(), vec![id.clone()]),
            Command::Update {
                id,
                publisher_id,
                description,
                validity,
            } => (
                "UpdateBadge".to_string(),
                vec![
                    id.clone(),
                    publisher_id.clone(),
                    description.clone(),
                    validity.to_string(),
                ],
            ),
            Command::Delete { id } => ("DeleteBadge".to_string(), vec![id.clone()]),
            Command::Exists { id } => ("BadgeExists".to_string(), vec![id.clone()]),
            Command::List => ("GetAllBadge".to_string(), vec![]),
            Command::Invoke { function, args } => (function.clone(), args.clone()),
            Command::StateRoot => return None,
        };
        Some(call)
    }
}

/// Deterministic id for an invocation at a given state height.
fn derive_tx_id(function: &str, args: &[String], height: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"badge-tx");
    hasher.update(height.to_le_bytes());
    hasher.update(function.as_bytes());
    for arg in args {
        hasher.update((arg.len() as u64).to_le_bytes());
        hasher.update(arg.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn run(cli: Cli) -> anyhow::Result<Value> {
    let mut state = WorldState::load(&cli.state_file)
        .with_context(|| format!("loading {}", cli.state_file.display()))?;

    let Some((function, args)) = cli.command.invocation() else {
        return Ok(json!({
            "height": state.height(),
            "entries": state.len(),
            "state_root": hex::encode(state.state_root()),
        }));
    };

    let tx_id = cli
        .tx_id
        .unwrap_or_else(|| derive_tx_id(&function, &args, state.height()));
    let contract = BadgeContract::new();

    if BadgeContract::is_read_only(&function) {
        debug!(%tx_id, %function, "evaluating query");
        let payload = state.evaluate(tx_id, |tx| contract.invoke(tx, &function, &args))?;
        return Ok(payload);
    }

    debug!(%tx_id, %function, "submitting transaction");
    let payload = state.submit(tx_id, |tx| contract.invoke(tx, &function, &args))?;
    state
        .save(&cli.state_file)
        .with_context(|| format!("saving {}", cli.state_file.display()))?;
    Ok(payload)
}

/// Writes the payload to `out`, or the error chain to `err`, and returns
/// whether the command succeeded. The error is written directly so it is
/// visible whatever the log filter is.
fn report(result: anyhow::Result<Value>, out: &mut impl Write, err: &mut impl Write) -> bool {
    let rendered = result.and_then(|payload| Ok(serde_json::to_string_pretty(&payload)?));
    let failure = match rendered {
        Ok(text) => match writeln!(out, "{text}") {
            Ok(()) => return true,
            Err(io) => anyhow::Error::from(io).context("writing output"),
        },
        Err(failure) => failure,
    };
    error!("{failure:#}");
    let _ = writeln!(err, "error: {failure:#}");
    false
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("badge_registry={},warn", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if report(run(cli), &mut std::io::stdout(), &mut std::io::stderr()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(state_file: &std::path::Path, argv: &[&str]) -> Cli {
        let mut full = vec!["badge-registry", "--state-file"];
        full.push(state_file.to_str().unwrap());
        full.extend_from_slice(argv);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn commands_map_to_contract_functions() {
        let cmd = Command::Create {
            id: "B1".into(),
            publisher_id: "T1".into(),
            description: "d".into(),
            validity: -2,
        };
        let (function, args) = cmd.invocation().unwrap();
        assert_eq!(function, "CreateBadge");
        assert_eq!(args, ["B1", "T1", "d", "-2"]);
        assert!(Command::StateRoot.invocation().is_none());
    }

    #[test]
    fn tx_ids_depend_on_invocation_and_height() {
        let args = vec!["B1".to_string()];
        let a = derive_tx_id("ReadBadge", &args, 1);
        assert_eq!(a, derive_tx_id("ReadBadge", &args, 1));
        assert_ne!(a, derive_tx_id("ReadBadge", &args, 2));
        assert_ne!(a, derive_tx_id("DeleteBadge", &args, 1));
    }

    #[test]
    fn failures_are_written_without_a_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (mut out, mut err) = (Vec::new(), Vec::new());

        assert!(!report(run(cli(&path, &["read", "B404"])), &mut out, &mut err));
        assert!(out.is_empty());
        let message = String::from_utf8(err).unwrap();
        assert!(message.starts_with("error: "));
        assert!(message.contains("the badge B404 does not exist"));

        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert!(report(run(cli(&path, &["exists", "B404"])), &mut out, &mut err));
        assert_eq!(String::from_utf8(out).unwrap(), "false\n");
        assert!(err.is_empty());
    }

    #[test]
    fn commands_persist_only_successful_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        run(cli(&path, &["init-ledger"])).unwrap();
        run(cli(&path, &["create", "B9", "T9", "Ninth Badge", "1"])).unwrap();
        let err = run(cli(&path, &["create", "B9", "T0", "dup", "2"])).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let badge = run(cli(&path, &["read", "B9"])).unwrap();
        assert_eq!(badge["PublisherID"], "T9");

        let all = run(cli(&path, &["list"])).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 8);

        run(cli(&path, &["delete", "B9"])).unwrap();
        let exists = run(cli(&path, &["invoke", "BadgeExists", "B9"])).unwrap();
        assert_eq!(exists, Value::Bool(false));

        let root = run(cli(&path, &["state-root"])).unwrap();
        assert_eq!(root["height"], 3);
        assert_eq!(root["entries"], 7);
    }
}
