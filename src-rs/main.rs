mod acquire;
mod config;
mod credential;
mod error;
mod fsutil;
mod inference;
mod report;
mod session;
mod table;
mod text;

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::credential::{CredentialStore, FileCredentialStore};
use crate::fsutil::abs_path;
use crate::inference::{GeminiClient, InferenceBackend};
use crate::report::ExportedReport;
use crate::session::SessionController;
use crate::table::{ResultTable, TotalState};

#[derive(Parser, Debug)]
#[command(
    name = "groundcover",
    version,
    about = "Extract ground cover shares from hand-drawn urban forest plot diagrams and export an annotated report"
)]
struct Cli {
    /// Only log errors
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    quiet: bool,
    /// Log debug detail
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::enum_variant_names)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Manage the stored Gemini API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Analyze one diagram, optionally relabel rows, and export the report image
    Analyze(AnalyzeArgs),
    /// Interactive session reading commands from stdin
    Session(SessionArgs),
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Save the API key (read from stdin when omitted)
    Save { token: Option<String> },
    /// Show whether a key is stored
    Status {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Diagram image; only the first path is used
    #[arg(required = true)]
    images: Vec<PathBuf>,
    /// Replace the label of a row before export, e.g. `--rename 2=clover` (rows count from 1)
    #[arg(long = "rename", value_name = "N=LABEL", value_parser = parse_rename)]
    renames: Vec<(usize, String)>,
    /// Directory for the exported report (default: report.out_dir or the working directory)
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Print the table without writing a report image
    #[arg(long, action = ArgAction::SetTrue)]
    no_download: bool,
    /// Print the result as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Directory for exported reports
    #[arg(long)]
    out_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;
    dispatch(cli.command).await
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Commands => print_commands(),
        Commands::Key { action } => {
            let (_, store) = load_setup()?;
            command_key(action, store)
        }
        Commands::Analyze(args) => {
            let (config, store) = load_setup()?;
            command_analyze(args, &config, store).await
        }
        Commands::Session(args) => {
            let (config, store) = load_setup()?;
            command_session(args, &config, store).await
        }
    }
}

fn load_setup() -> Result<(Config, FileCredentialStore)> {
    let config = Config::load().context("failed to load configuration")?;
    let store = FileCredentialStore::from_config(&config)?;
    Ok((config, store))
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("GROUNDCOVER_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "key save",
            "description": "Persist the Gemini API key used for analysis.",
        }),
        json!({
            "name": "key status",
            "description": "Report whether an API key is stored.",
        }),
        json!({
            "name": "analyze",
            "description": "Analyze a plot diagram, relabel rows, export analysis_result_<millis>.jpg.",
        }),
        json!({
            "name": "session",
            "description": "Interactive open/analyze/rename/download/reset loop on stdin.",
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_key(action: KeyAction, mut store: FileCredentialStore) -> Result<()> {
    match action {
        KeyAction::Save { token } => {
            let token = match token {
                Some(token) => token,
                None => {
                    let mut line = String::new();
                    std::io::stdin()
                        .read_line(&mut line)
                        .context("failed to read API key from stdin")?;
                    line
                }
            };
            store.save(&token)?;
            println!("API key saved to {}", abs_path(store.path()).display());
        }
        KeyAction::Status { json } => {
            let token = store.load();
            if json {
                let payload = json!({
                    "saved": token.is_some(),
                    "key": token.as_deref().map(mask_token),
                    "path": abs_path(store.path()).display().to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if let Some(token) = token {
                println!("API key saved ({})", mask_token(&token));
            } else {
                println!("no API key saved: run `groundcover key save <KEY>`");
            }
        }
    }
    Ok(())
}

async fn command_analyze(
    args: AnalyzeArgs,
    config: &Config,
    store: FileCredentialStore,
) -> Result<()> {
    let backend = GeminiClient::new(&config.inference)?;
    tracing::info!(model = backend.model(), "using model");
    let out_dir = args.out_dir.clone().unwrap_or_else(|| config.out_dir());
    let mut session = SessionController::new(store, backend, config.report.clone(), out_dir);

    session.choose_file(&args.images).await?;
    session.analyze().await?;
    for (row, label) in &args.renames {
        session
            .rename(row - 1, label)
            .with_context(|| format!("failed to rename row {row}"))?;
    }

    let exported = if args.no_download {
        None
    } else {
        Some(session.download()?)
    };

    let table = session
        .state()
        .table()
        .context("analysis finished without a result table")?;
    if table.is_empty() {
        tracing::warn!("model returned no ground cover items");
    }
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result_payload(table, exported.as_ref()))?
        );
    } else {
        println!("{}", table.to_text());
        if let Some(exported) = &exported {
            println!("{}", abs_path(&exported.image_path).display());
        }
    }
    Ok(())
}

fn result_payload(table: &ResultTable, exported: Option<&ExportedReport>) -> Value {
    json!({
        "rows": table.rows(),
        "total": table.total(),
        "total_text": table.total_text(),
        "total_state": table.total_state(),
        "image_path": exported.map(|e| abs_path(&e.image_path).display().to_string()),
        "sidecar_path": exported
            .and_then(|e| e.sidecar_path.as_deref())
            .map(|p| abs_path(p).display().to_string()),
    })
}

/// Parse `N=LABEL` with `N` counting from 1.
fn parse_rename(raw: &str) -> std::result::Result<(usize, String), String> {
    let (row, label) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected N=LABEL, got `{raw}`"))?;
    let row = parse_row_number(row)?;
    Ok((row, label.trim().to_string()))
}

fn parse_row_number(raw: &str) -> std::result::Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(format!("row must be a number from 1, got `{}`", raw.trim())),
    }
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}...{tail}")
}

// --- Interactive session ---

const SESSION_HELP: &str = "commands:
  key <TOKEN>          save the API key
  open <PATH>          load a diagram image
  analyze              send the image for analysis
  show                 print the current result table
  rename <N> <LABEL>   replace the label of row N
  download             export the report image
  reset                clear image and result
  status               show session state
  help                 show this help
  quit                 leave the session";

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionCommand {
    Key(String),
    Open(PathBuf),
    Analyze,
    Show,
    Rename { row: usize, label: String },
    Download,
    Reset,
    Status,
    Help,
    Quit,
}

/// `Ok(None)` for blank lines.
fn parse_session_command(line: &str) -> std::result::Result<Option<SessionCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word.to_ascii_lowercase().as_str() {
        "key" if !rest.is_empty() => SessionCommand::Key(rest.to_string()),
        "key" => return Err("usage: key <TOKEN>".to_string()),
        "open" if !rest.is_empty() => SessionCommand::Open(PathBuf::from(rest)),
        "open" => return Err("usage: open <PATH>".to_string()),
        "analyze" => SessionCommand::Analyze,
        "show" => SessionCommand::Show,
        "rename" => {
            let (row, label) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: rename <N> <LABEL>".to_string())?;
            SessionCommand::Rename {
                row: parse_row_number(row)?,
                label: label.trim().to_string(),
            }
        }
        "download" => SessionCommand::Download,
        "reset" => SessionCommand::Reset,
        "status" => SessionCommand::Status,
        "help" | "?" => SessionCommand::Help,
        "quit" | "exit" => SessionCommand::Quit,
        other => return Err(format!("unknown command `{other}` (try `help`)")),
    };
    Ok(Some(command))
}

async fn command_session(
    args: SessionArgs,
    config: &Config,
    store: FileCredentialStore,
) -> Result<()> {
    let backend = GeminiClient::new(&config.inference)?;
    let out_dir = args.out_dir.unwrap_or_else(|| config.out_dir());
    let mut session = SessionController::new(store, backend, config.report.clone(), out_dir);

    println!("groundcover session: type `help` for commands");
    if session.state().settings_open() {
        println!("no API key saved yet: use `key <TOKEN>` first");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        let command = match parse_session_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("error: {message}");
                continue;
            }
        };
        if command == SessionCommand::Quit {
            break;
        }
        if let Err(err) = run_session_command(&mut session, command).await {
            eprintln!("error: {err:#}");
        }
    }
    Ok(())
}

async fn run_session_command<S, B>(
    session: &mut SessionController<S, B>,
    command: SessionCommand,
) -> Result<()>
where
    S: CredentialStore,
    B: InferenceBackend,
{
    match command {
        SessionCommand::Key(token) => {
            session.save_key(&token)?;
            println!("API key saved");
        }
        SessionCommand::Open(path) => {
            session.choose_file(&[path]).await?;
            if let Some(image) = session.state().image() {
                println!(
                    "loaded {} ({}x{})",
                    image.source().display(),
                    image.width(),
                    image.height()
                );
            }
        }
        SessionCommand::Analyze => {
            println!("analyzing...");
            let table = session.analyze().await.map_err(|err| {
                anyhow::Error::new(err).context("check the API key or the image and try again")
            })?;
            println!("{}", table.to_text());
        }
        SessionCommand::Show => {
            let Some(table) = session.state().table() else {
                bail!("no analysis result yet");
            };
            println!("{}", table.to_text());
        }
        SessionCommand::Rename { row, label } => {
            session.rename(row - 1, &label)?;
            if let Some(table) = session.state().table() {
                println!("{}", table.to_text());
            }
        }
        SessionCommand::Download => {
            let exported = session.download()?;
            println!("{}", abs_path(&exported.image_path).display());
        }
        SessionCommand::Reset => {
            session.reset();
            println!("session cleared");
        }
        SessionCommand::Status => {
            let state = session.state();
            let payload = json!({
                "phase": state.phase(),
                "focus": state.focus(),
                "settings_open": state.settings_open(),
                "image": state.image().map(|img| img.source().display().to_string()),
                "rows": state.table().map(ResultTable::len),
                "total_warning": state.table().map(|t| t.total_state() == TotalState::Warning),
                "api_key_saved": session.has_credential(),
                "out_dir": abs_path(session.out_dir()).display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        SessionCommand::Help => println!("{SESSION_HELP}"),
        SessionCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn only_commands_listing_skips_configuration() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(".groundcover.toml", "[report]\nquality = \"high\"\n")?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();

            assert!(runtime.block_on(dispatch(Commands::Commands)).is_ok());
            let status = Commands::Key {
                action: KeyAction::Status { json: true },
            };
            let err = runtime.block_on(dispatch(status)).unwrap_err();
            assert!(format!("{err:#}").contains("failed to load configuration"));
            Ok(())
        });
    }

    #[test]
    fn analyze_args_collect_renames() {
        let cli = Cli::try_parse_from([
            "groundcover",
            "analyze",
            "plot.jpg",
            "--rename",
            "1=lawn",
            "--rename",
            "2= white clover ",
            "--no-download",
        ])
        .unwrap();
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.images, vec![PathBuf::from("plot.jpg")]);
        assert_eq!(
            args.renames,
            vec![(1, "lawn".to_string()), (2, "white clover".to_string())]
        );
        assert!(args.no_download);
    }

    #[test]
    fn rename_rows_count_from_one() {
        assert!(parse_rename("0=lawn").is_err());
        assert!(parse_rename("lawn").is_err());
        assert!(parse_rename("x=lawn").is_err());
        assert_eq!(parse_rename("3=포장"), Ok((3, "포장".to_string())));
    }

    #[test]
    fn session_commands_parse() {
        assert_eq!(parse_session_command("   "), Ok(None));
        assert_eq!(
            parse_session_command("open  my plot.png"),
            Ok(Some(SessionCommand::Open(PathBuf::from("my plot.png"))))
        );
        assert_eq!(
            parse_session_command("rename 2 white clover"),
            Ok(Some(SessionCommand::Rename {
                row: 2,
                label: "white clover".to_string(),
            }))
        );
        assert_eq!(parse_session_command("ANALYZE"), Ok(Some(SessionCommand::Analyze)));
        assert_eq!(parse_session_command("exit"), Ok(Some(SessionCommand::Quit)));
        assert!(parse_session_command("key").is_err());
        assert!(parse_session_command("rename 2").is_err());
        assert!(parse_session_command("fly").is_err());
    }

    #[test]
    fn tokens_are_masked() {
        assert_eq!(mask_token("AIzaSyExample42"), "AIza...42");
        assert_eq!(mask_token("short"), "*****");
    }
}
