//! tabula command-line tool.
//!
//! Usage:
//!   tabula init
//!   tabula read A1:C10
//!   tabula explain D4
//!   tabula update --turn turn.json --cell B2 --value 42
//!   tabula persist --conversation c1 turn.json
//!   tabula history c1
//!   tabula reconcile < turn.json
//!   tabula normalize '$b$3:a1'
//!
//! Updates still need an approved `confirmAction` grant inside the turn file;
//! the CLI has no way around the gate.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use tabula_kernel::{Kernel, TabulaConfig, reconcile_messages};
use tabula_types::{CellValue, Message, UpdateCellPayload, normalize_range, parse_mention};

#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(about = "Inspect and update a tabula workbook")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/tabula/tabula.ron)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sheet to address (default: the configured sheet)
    #[arg(long, global = true)]
    sheet: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the workbook if it does not exist
    Init,
    /// Print a range as a JSON grid
    Read { range: String },
    /// Print the formula stored in a cell
    Explain { cell: String },
    /// Write one cell, authorized by a grant in a recorded turn
    Update {
        /// JSON array of messages holding the user's grant
        #[arg(long)]
        turn: PathBuf,
        #[arg(long)]
        cell: String,
        /// JSON value; bare words are taken as text
        #[arg(long)]
        value: String,
    },
    /// Store a turn (JSON array of messages) under a conversation
    Persist {
        #[arg(long)]
        conversation: String,
        file: PathBuf,
    },
    /// Print a stored conversation
    History { conversation: String },
    /// Merge tool-call fragments in a turn read from a file or stdin
    Reconcile { file: Option<PathBuf> },
    /// Print the canonical form of a range or a `Sheet!A1` mention
    Normalize { text: String },
    /// Print the effective configuration
    Config,
    /// Forget consumed confirmations older than N days
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = TabulaConfig::resolve(args.config.as_deref()).context("loading config")?;
    let sheet = args.sheet.clone().unwrap_or_else(|| config.sheet.clone());

    match args.command {
        Command::Config => print!("{}", config.to_ron()?),
        Command::Normalize { text } => println!("{}", normalize(&text)?),
        Command::Reconcile { file } => {
            let messages = read_messages(file.as_deref())?;
            let merged = reconcile_messages(&messages);
            println!("{}", serde_json::to_string_pretty(&*merged)?);
        }
        command => {
            let kernel = Kernel::open(&config)?;
            run_with_kernel(&kernel, &sheet, command).await?;
        }
    }
    Ok(())
}

async fn run_with_kernel(kernel: &Kernel, sheet: &str, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let created = kernel.documents().create_if_missing()?;
            tracing::info!(created, path = %kernel.documents().path().display(), "workbook ready");
        }
        Command::Read { range } => {
            let grid = kernel.read_range(sheet, &range)?;
            println!("{}", serde_json::to_string(&grid)?);
        }
        Command::Explain { cell } => println!("{}", kernel.explain_formula(sheet, &cell)?),
        Command::Update { turn, cell, value } => {
            let turn = read_messages(Some(&turn))?;
            let payload = UpdateCellPayload {
                sheet: sheet.to_string(),
                cell,
                value: parse_value(&value),
            };
            match kernel.update_cell(&turn, payload.clone()).await {
                Ok(update) => println!("{}", serde_json::to_string(&update)?),
                Err(e) => {
                    if let Some(outcome) = e.confirmation_outcome() {
                        let request = kernel.propose(payload);
                        eprintln!("{}: {}", outcome.as_str(), request.prompt);
                    }
                    return Err(e.into());
                }
            }
        }
        Command::Persist { conversation, file } => {
            let messages = read_messages(Some(&file))?;
            let summary = kernel.persist_turn(&conversation, &messages)?;
            tracing::info!(
                conversation = %conversation,
                inserted = summary.inserted,
                updated = summary.updated,
                "turn persisted"
            );
        }
        Command::History { conversation } => {
            let messages = kernel.load_turns(&conversation)?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Command::Purge { older_than_days } => {
            let cutoff = tabula_types::now_millis() - i64::from(older_than_days) * 86_400_000;
            let removed = kernel.gate().ledger().purge_older_than(cutoff)?;
            tracing::info!(removed, "ledger purged");
        }
        Command::Config | Command::Normalize { .. } | Command::Reconcile { .. } => {}
    }
    Ok(())
}

fn normalize(text: &str) -> Result<String> {
    if text.contains('!') {
        let mention = parse_mention(text)?;
        return Ok(match mention.sheet {
            Some(sheet) => format!("{sheet}!{}", mention.range),
            None => mention.range.to_string(),
        });
    }
    Ok(normalize_range(text)?)
}

fn parse_value(raw: &str) -> CellValue {
    serde_json::from_str(raw).unwrap_or_else(|_| CellValue::Text(raw.to_string()))
}

fn read_messages(path: Option<&Path>) -> Result<Vec<Message>> {
    let text = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    serde_json::from_str(&text).context("parsing messages")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_parse_as_json_or_text() {
        assert_eq!(parse_value("42"), CellValue::Number(42.0));
        assert_eq!(parse_value("true"), CellValue::Bool(true));
        assert_eq!(parse_value("null"), CellValue::Null);
        assert_eq!(parse_value("=SUM(A1:A2)"), CellValue::from("=SUM(A1:A2)"));
        assert_eq!(parse_value("\"007\""), CellValue::from("007"));
    }

    #[test]
    fn test_normalize_ranges_and_mentions() {
        assert_eq!(normalize("$b$3:a1").unwrap(), "A1:B3");
        assert_eq!(normalize("Sheet1!c2").unwrap(), "Sheet1!C2");
        assert!(normalize("A0").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["tabula", "--sheet", "Data", "read", "A1:B2"]).unwrap();
        assert_eq!(args.sheet.as_deref(), Some("Data"));
        assert!(matches!(args.command, Command::Read { ref range } if range == "A1:B2"));
    }
}
