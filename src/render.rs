//! Turns the merged configuration into the shell command lines the
//! lifecycle actions execute. Nothing in here touches the host.

use crate::backend::{resolve_backend, Backend};
use crate::config::Config;
use crate::error::{QleverError, Result};
use crate::host::HostInfo;
use std::fmt;

/// Above this total input size the open-files soft limit is raised.
pub const LARGE_INPUT_BYTES: u64 = 10_000_000_000;
pub const OPEN_FILES_LIMIT: u64 = 1_048_576;

/// Matches the command line of any server or index-builder process.
pub const STATUS_PATTERN: &str = r"^(\S*/)?(ServerMain|IndexBuilderMain)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextIndex {
    None,
    FromTextRecords,
    FromLiterals,
    FromTextRecordsAndLiterals,
}

impl TextIndex {
    fn parse(cfg: &Config, section: &str) -> Result<Self> {
        let value = cfg.get(section, "with_text_index")?;
        match value.as_str() {
            "from_text_records" => Ok(TextIndex::FromTextRecords),
            "from_literals" => Ok(TextIndex::FromLiterals),
            "from_text_records_and_literals" => Ok(TextIndex::FromTextRecordsAndLiterals),
            "" | "no" | "false" | "0" => Ok(TextIndex::None),
            other => Err(QleverError::invalid_value(
                section,
                "with_text_index",
                other,
                "expected no, from_text_records, from_literals or from_text_records_and_literals",
            )),
        }
    }

    fn uses_records(self) -> bool {
        matches!(
            self,
            TextIndex::FromTextRecords | TextIndex::FromTextRecordsAndLiterals
        )
    }

    fn uses_literals(self) -> bool {
        matches!(
            self,
            TextIndex::FromLiterals | TextIndex::FromTextRecordsAndLiterals
        )
    }
}

/// Quotes `value` for bash: single quotes unless every character is safe.
pub fn shell_single_quote(value: &str) -> String {
    let safe = |ch: char| ch.is_ascii_alphanumeric() || "@%+=:,./-_".contains(ch);
    if !value.is_empty() && value.chars().all(safe) {
        return value.to_string();
    }
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// A single program invocation with optional `> file 2>&1` redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    redirect: Option<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            redirect: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn redirect_to(mut self, path: impl Into<String>) -> Self {
        self.redirect = Some(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_single_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_single_quote(arg))?;
        }
        if let Some(path) = &self.redirect {
            write!(f, " > {} 2>&1", shell_single_quote(path))?;
        }
        Ok(())
    }
}

/// The full text handed to `bash -c`:
/// `[prelude; ][nohup ][input | ]command[ | tee file][ &]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellScript {
    prelude: Option<String>,
    input: Option<String>,
    command: CommandLine,
    tee: Option<String>,
    detach: bool,
}

impl ShellScript {
    pub fn new(command: CommandLine) -> Self {
        Self {
            prelude: None,
            input: None,
            command,
            tee: None,
            detach: false,
        }
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    fn with_prelude(mut self, prelude: impl Into<String>) -> Self {
        self.prelude = Some(prelude.into());
        self
    }

    fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    fn with_tee(mut self, path: impl Into<String>) -> Self {
        self.tee = Some(path.into());
        self
    }

    fn detached(mut self) -> Self {
        self.detach = true;
        self
    }
}

impl fmt::Display for ShellScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prelude) = &self.prelude {
            write!(f, "{prelude}; ")?;
        }
        if self.detach {
            write!(f, "nohup ")?;
        }
        if let Some(input) = &self.input {
            write!(f, "{input} | ")?;
        }
        write!(f, "{}", self.command)?;
        if let Some(path) = &self.tee {
            write!(f, " | tee {}", shell_single_quote(path))?;
        }
        if self.detach {
            write!(f, " &")?;
        }
        Ok(())
    }
}

/// Which container a command runs in, and how.
#[derive(Clone, Copy)]
enum ContainerRole<'a> {
    Indexer,
    Server { port: &'a str },
}

fn wrap_in_container(
    cfg: &Config,
    host: &HostInfo,
    role: ContainerRole<'_>,
    inner: &ShellScript,
) -> Result<ShellScript> {
    let image = cfg.get_required("docker", "image")?;
    let mut docker = CommandLine::new("docker").arg("run");
    let name = match role {
        ContainerRole::Indexer => {
            if host.interactive {
                docker = docker.arg("-it");
            }
            docker = docker.arg("--rm");
            cfg.get_required("docker", "container_indexer")?
        }
        ContainerRole::Server { .. } => {
            docker = docker.args(["-d", "--restart=unless-stopped"]);
            cfg.get_required("docker", "container_server")?
        }
    };
    docker = docker.args(["-u".to_string(), format!("{}:{}", host.uid, host.gid)]);
    if host.interactive && matches!(role, ContainerRole::Server { .. }) {
        docker = docker.arg("-it");
    }
    docker = docker
        .args(["-v", "/etc/localtime:/etc/localtime:ro", "-v"])
        .arg(format!("{}:/index", host.cwd.display()));
    if let ContainerRole::Server { port } = role {
        docker = docker.arg("-p").arg(format!("{port}:{port}"));
    }
    docker = docker
        .args(["-w", "/index", "--entrypoint", "bash", "--name"])
        .arg(name)
        .arg(image)
        .arg("-c")
        .arg(inner.to_string());
    Ok(ShellScript::new(docker))
}

/// `cat_files | IndexBuilderMain ... | tee <name>.index-log.txt`, wrapped in
/// `docker run` for the container backend. `input_bytes` is the total size
/// of the files named by `index.file_names`.
pub fn render_index(cfg: &Config, host: &HostInfo, input_bytes: u64) -> Result<ShellScript> {
    let name = cfg.name()?;
    let cat_files = cfg.get_required("index", "cat_files")?;
    let text_index = TextIndex::parse(cfg, "index")?;

    let mut builder = CommandLine::new(cfg.get_required("index", "binary")?)
        .args(["-F", "ttl", "-f", "-", "-i"])
        .arg(name.as_str())
        .arg("-s")
        .arg(format!("{name}.settings.json"));
    let only_pso_pos = cfg.is_true("index", "only_pso_and_pos_permutations")?;
    if only_pso_pos {
        builder = builder.args(["--only-pso-and-pos-permutations", "--no-patterns"]);
    } else if cfg.is_true("index", "no_patterns")? {
        builder = builder.arg("--no-patterns");
    }
    if text_index.uses_records() {
        builder = builder
            .arg("-w")
            .arg(format!("{name}.wordsfile.tsv"))
            .arg("-d")
            .arg(format!("{name}.docsfile.tsv"));
    }
    if text_index.uses_literals() {
        builder = builder.arg("--text-words-from-literals");
    }
    if let Some(memory) = cfg.get_optional("index", "stxxl_memory_gb")? {
        builder = builder.arg("--stxxl-memory-gb").arg(memory);
    }

    let mut script = ShellScript::new(builder)
        .with_input(cat_files)
        .with_tee(format!("{name}.index-log.txt"));
    if input_bytes > LARGE_INPUT_BYTES {
        script = script.with_prelude(format!("ulimit -Sn {OPEN_FILES_LIMIT}"));
    }

    match resolve_backend(cfg)? {
        Backend::Native => Ok(script),
        Backend::Container => wrap_in_container(cfg, host, ContainerRole::Indexer, &script),
    }
}

/// The server invocation, detached with `nohup ... &` natively or via
/// `docker run -d` for the container backend.
pub fn render_start(cfg: &Config, host: &HostInfo) -> Result<ShellScript> {
    let name = cfg.name()?;
    let port = cfg.get_required("server", "port")?;
    let text_index = TextIndex::parse(cfg, "server")?;

    let mut server = CommandLine::new(cfg.get_required("server", "binary")?)
        .arg("-i")
        .arg(name.as_str());
    for (flag, option) in [
        ("-j", "num_threads"),
        ("-p", "port"),
        ("-m", "memory_for_queries_gb"),
        ("-c", "cache_max_size_gb"),
        ("-e", "cache_max_size_gb_single_entry"),
        ("-k", "cache_max_num_entries"),
    ] {
        server = server.arg(flag).arg(cfg.get_required("server", option)?);
    }
    if let Some(token) = cfg.get_optional("server", "access_token")? {
        server = server.arg("-a").arg(token);
    }
    if cfg.is_true("server", "only_pso_and_pos_permutations")? {
        server = server.arg("--only-pso-and-pos-permutations");
    }
    if cfg.is_true("server", "no_patterns")? {
        server = server.arg("--no-patterns");
    }
    if text_index != TextIndex::None {
        server = server.arg("-t");
    }
    let script = ShellScript::new(server.redirect_to(server_log_name(&name)));

    match resolve_backend(cfg)? {
        Backend::Native => Ok(script.detached()),
        Backend::Container => {
            wrap_in_container(cfg, host, ContainerRole::Server { port: &port }, &script)
        }
    }
}

pub fn server_log_name(name: &str) -> String {
    format!("{name}.server-log.txt")
}

/// The operator's own download command, passed through verbatim.
pub fn render_get_data(cfg: &Config) -> Result<String> {
    cfg.get_required("data", "get_data_cmd")
}

/// Where `stop` looks for a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPlan {
    pub container: String,
    pub process_pattern: String,
}

impl StopPlan {
    pub fn docker_stop(&self) -> CommandLine {
        CommandLine::new("docker").arg("stop").arg(self.container.as_str())
    }

    pub fn docker_rm(&self) -> CommandLine {
        CommandLine::new("docker").arg("rm").arg(self.container.as_str())
    }
}

pub fn render_stop(cfg: &Config) -> Result<StopPlan> {
    let name = cfg.name()?;
    let binary = cfg.get_required("server", "binary")?;
    Ok(StopPlan {
        container: cfg.get_required("docker", "container_server")?,
        process_pattern: format!(
            r"^\S*{}\S* -i [^ ]*{}(\s|$)",
            regex::escape(&binary),
            regex::escape(&name)
        ),
    })
}
