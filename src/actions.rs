//! The action registry and the sequential batch dispatcher.

use crate::config::Config;
use crate::error::{ErrorKind, QleverError, Result};
use crate::lifecycle::Controller;
use dialoguer::console::style;
use regex::Regex;
use std::error::Error as _;
use std::io::Write;
use tracing::info;

/// Trailing token that turns every action of the batch into a preview.
pub const SHOW_TOKEN: &str = "show";

const ASSIGNMENT_PATTERN: &str = r"^(\w+)\.(\w+)=(.*)$";

/// Assignments offered by shell completion next to the action names.
const COMPLETION_ASSIGNMENTS: [&str; 4] = [
    "docker.USE_DOCKER=true",
    "docker.USE_DOCKER=false",
    "index.BINARY=IndexBuilderMain",
    "server.BINARY=ServerMain",
];

pub type ActionFn = fn(&Controller<'_>, &Config, bool, &mut dyn Write) -> Result<()>;

pub struct Action {
    pub name: &'static str,
    pub help: &'static str,
    run: ActionFn,
}

impl Action {
    pub fn run(
        &self,
        controller: &Controller<'_>,
        cfg: &Config,
        only_show: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        (self.run)(controller, cfg, only_show, out)
    }
}

/// Registered actions. Position is rank: completion and error messages list
/// them in this order.
pub const ACTIONS: &[Action] = &[
    Action {
        name: "show-config",
        help: "Show the configuration including default values",
        run: |ctl, cfg, only_show, out| ctl.show_config(cfg, only_show, out),
    },
    Action {
        name: "get-data",
        help: "Download the input data with data.GET_DATA_CMD",
        run: |ctl, cfg, only_show, out| ctl.get_data(cfg, only_show, out),
    },
    Action {
        name: "index",
        help: "Build the index for the dataset",
        run: |ctl, cfg, only_show, out| ctl.index(cfg, only_show, out),
    },
    Action {
        name: "start",
        help: "Start the server and wait until it answers",
        run: |ctl, cfg, only_show, out| ctl.start(cfg, only_show, out),
    },
    Action {
        name: "stop",
        help: "Stop the server container or process for the dataset",
        run: |ctl, cfg, only_show, out| ctl.stop(cfg, only_show, out),
    },
    Action {
        name: "status",
        help: "Show all server and index builder processes",
        run: |ctl, cfg, only_show, out| ctl.status(cfg, only_show, out),
    },
];

pub fn list_actions() -> Vec<&'static str> {
    ACTIONS.iter().map(|action| action.name).collect()
}

pub fn find_action(name: &str) -> Option<&'static Action> {
    ACTIONS.iter().find(|action| action.name == name)
}

pub enum Token {
    Assign {
        section: String,
        option: String,
        value: String,
    },
    Run(&'static Action),
}

/// A validated command line: every token is known before anything runs.
pub struct Batch {
    pub tokens: Vec<Token>,
    pub only_show: bool,
}

impl Batch {
    pub fn parse(args: &[String]) -> Result<Self> {
        let (args, only_show) = match args.split_last() {
            Some((last, rest)) if last == SHOW_TOKEN => (rest, true),
            _ => (args, false),
        };
        let assignment = Regex::new(ASSIGNMENT_PATTERN)?;
        let tokens = args
            .iter()
            .map(|arg| classify(&assignment, arg))
            .collect::<Result<_>>()?;
        Ok(Batch { tokens, only_show })
    }
}

fn classify(assignment: &Regex, arg: &str) -> Result<Token> {
    if let Some(caps) = assignment.captures(arg) {
        return Ok(Token::Assign {
            section: caps[1].to_string(),
            option: caps[2].to_string(),
            value: caps[3].to_string(),
        });
    }
    if let Some(action) = find_action(arg) {
        return Ok(Token::Run(action));
    }
    if arg.contains('=') {
        return Err(QleverError::InvalidAssignment(arg.to_string()));
    }
    Err(QleverError::UnknownAction {
        name: arg.to_string(),
        available: list_actions(),
    })
}

/// Process exit status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

/// Applies assignments and runs actions in order, stopping at the first
/// failure.
pub fn dispatch(
    mut cfg: Config,
    batch: Batch,
    controller: &Controller<'_>,
    out: &mut dyn Write,
    err_out: &mut dyn Write,
) -> ExitStatus {
    for token in batch.tokens {
        match token {
            Token::Assign {
                section,
                option,
                value,
            } => {
                info!("Setting config value: {section}.{option}={value}");
                cfg = match cfg.set(&section, &option, &value) {
                    Ok(updated) => updated,
                    Err(err) => return fail(&err, out, err_out),
                };
            }
            Token::Run(action) => {
                info!("");
                info!("Action: \"{}\"", action.name);
                info!("");
                if let Err(err) = action.run(controller, &cfg, batch.only_show, out) {
                    return fail(&err, out, err_out);
                }
            }
        }
    }
    info!("");
    ExitStatus::Success
}

fn fail(err: &QleverError, out: &mut dyn Write, err_out: &mut dyn Write) -> ExitStatus {
    let _ = out.flush();
    report_error(err, err_out);
    ExitStatus::Failure
}

/// Prints an error the way its kind asks for.
pub fn report_error(err: &QleverError, err_out: &mut dyn Write) {
    let _ = match err.kind() {
        ErrorKind::Configuration | ErrorKind::Precondition => {
            writeln!(err_out, "{}", style(err).red())
        }
        ErrorKind::Unexpected => write_internal_error(err, err_out),
    };
}

fn write_internal_error(err: &QleverError, err_out: &mut dyn Write) -> std::io::Result<()> {
    let location = err
        .location()
        .map(|location| format!("{}:{}", location.file(), location.line()))
        .unwrap_or_else(|| "unknown location".to_string());
    writeln!(
        err_out,
        "{}",
        style(format!("Internal error at {location}: {err}")).red()
    )?;
    // The message already includes the immediate source.
    let mut source = err.source().and_then(|cause| cause.source());
    while let Some(cause) = source {
        writeln!(err_out, "  caused by: {cause}")?;
        source = cause.source();
    }
    Ok(())
}

/// Bash completion for the action names in rank order plus a few common
/// assignments.
pub fn completion_script() -> String {
    let words: Vec<&str> = list_actions()
        .into_iter()
        .chain(COMPLETION_ASSIGNMENTS)
        .collect();
    format!(
        "_qlever_completion() {{\n  local cur=${{COMP_WORDS[COMP_CWORD]}}\n  COMPREPLY=( $(compgen -W \"{}\" -- $cur) )\n}}\ncomplete -o nosort -F _qlever_completion qlever\n",
        words.join(" ")
    )
}
