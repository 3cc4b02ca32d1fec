mod actions;
mod backend;
mod config;
mod error;
mod host;
mod lifecycle;
mod logging;
mod render;

use crate::actions::{completion_script, dispatch, report_error, Batch, ExitStatus, ACTIONS};
use crate::backend::Capabilities;
use crate::config::Config;
use crate::error::Result;
use crate::host::{HostInfo, HttpServerApi, ProcFs, ShellExecutor};
use crate::lifecycle::{Controller, StartupWait};
use clap::{CommandFactory, FromArgMatches, Parser};
use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_QLEVERFILE: &str = "Qleverfile.yaml";
const QLEVERFILE_ENV: &str = "QLEVER_FILE";
const AUTOCOMPLETION_TOKEN: &str = "setup-autocompletion";
const LOG_LEVEL_PREFIX: &str = "general.log_level=";

#[derive(Parser, Debug)]
#[command(
    name = "qlever",
    version,
    about = "Build, start and stop QLever instances described by a Qleverfile"
)]
struct Cli {
    /// Qleverfile to read [default: $QLEVER_FILE or ./Qleverfile.yaml]
    #[arg(long)]
    qleverfile: Option<PathBuf>,
    /// Seconds `start` waits for the server to answer, 0 waits forever
    #[arg(long, default_value_t = 600)]
    startup_timeout_sec: u64,
    /// Actions and SECTION.OPTION=VALUE assignments, optionally followed by `show`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    tokens: Vec<String>,
}

fn actions_help() -> String {
    let mut help = String::from("Actions:\n");
    for action in ACTIONS {
        help.push_str(&format!("  {:<12} {}\n", action.name, action.help));
    }
    help.push_str("\nEnd the command line with `show` to print the commands without running them.");
    help
}

fn parse_cli() -> Cli {
    let matches = Cli::command().after_help(actions_help()).get_matches();
    Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
}

fn main() {
    let cli = parse_cli();

    if matches!(cli.tokens.as_slice(), [only] if only == AUTOCOMPLETION_TOKEN) {
        print!("{}", completion_script());
        return;
    }

    match run(cli) {
        Ok(status) => std::process::exit(status.code()),
        Err(err) => {
            report_error(&err, &mut io::stderr());
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let mut tokens = cli.tokens;

    // A leading log level applies before anything else happens.
    let level_override = tokens
        .first()
        .and_then(|token| token.strip_prefix(LOG_LEVEL_PREFIX))
        .map(logging::parse_level)
        .transpose()?;
    if level_override.is_some() {
        tokens.remove(0);
    }

    let batch = Batch::parse(&tokens)?;
    let path = resolve_qleverfile(cli.qleverfile);
    let cfg = Config::load(&path)?;

    let level = match level_override {
        Some(level) => level,
        None => logging::parse_level(&cfg.get("general", "log_level")?)?,
    };
    logging::init(level);
    debug!("Log level set to {level}");
    debug!(
        "Parsed Qleverfile {}, sections are: {}",
        path.display(),
        cfg.sections().collect::<Vec<_>>().join(", ")
    );

    let cwd = env::current_dir()?;
    let executor = ShellExecutor::new(cwd.clone());
    let server = HttpServerApi::new()?;
    let processes = ProcFs::new();
    let caps = Capabilities::probe(&cfg, &executor, &processes);
    let wait = StartupWait {
        poll_interval: Duration::from_secs(1),
        timeout: (cli.startup_timeout_sec > 0).then(|| Duration::from_secs(cli.startup_timeout_sec)),
    };
    let controller = Controller::new(
        &executor,
        &server,
        &processes,
        caps,
        HostInfo::detect(cwd),
        wait,
    );

    let mut out = io::stdout();
    let mut err_out = io::stderr();
    Ok(dispatch(cfg, batch, &controller, &mut out, &mut err_out))
}

fn resolve_qleverfile(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| env::var_os(QLEVERFILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_QLEVERFILE))
}
