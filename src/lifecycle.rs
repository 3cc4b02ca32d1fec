use crate::backend::{resolve_backend, Capabilities, Capability};
use crate::config::{Config, DEFAULT_SECTION};
use crate::error::{QleverError, Result};
use crate::host::{
    index_artifacts_exist, total_file_size, Executor, FollowGuard, HostInfo, ProcessInfo,
    ProcessTable, ServerApi,
};
use crate::render::{
    render_get_data, render_index, render_start, render_stop, server_log_name, StopPlan,
    STATUS_PATTERN,
};
use chrono::{DateTime, Local};
use dialoguer::console::style;
use regex::Regex;
use std::fs;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `start` waits for the server to answer its ping.
#[derive(Debug, Clone, Copy)]
pub struct StartupWait {
    pub poll_interval: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for StartupWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Executes the lifecycle actions against the host. Holds no state of its
/// own: every call re-discovers processes, ports and files.
pub struct Controller<'a> {
    executor: &'a dyn Executor,
    server: &'a dyn ServerApi,
    processes: &'a dyn ProcessTable,
    caps: Capabilities,
    host: HostInfo,
    wait: StartupWait,
}

impl<'a> Controller<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        server: &'a dyn ServerApi,
        processes: &'a dyn ProcessTable,
        caps: Capabilities,
        host: HostInfo,
        wait: StartupWait,
    ) -> Self {
        Self {
            executor,
            server,
            processes,
            caps,
            host,
            wait,
        }
    }

    fn run(&self, script: &str) -> Result<()> {
        let output = self.executor.run_script(script)?;
        if !output.success() {
            return Err(QleverError::CommandFailed {
                command: script.to_string(),
                status: output.status_code,
            });
        }
        Ok(())
    }

    /// Prints the configuration including defaults for options not set in
    /// the Qleverfile. Read-only, so `only_show` changes nothing.
    pub fn show_config(&self, cfg: &Config, _only_show: bool, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "{}",
            style(
                "Showing the current configuration, including default values for options that are not set explicitly in the Qleverfile"
            )
            .blue()
        )?;
        let inherited: Vec<&str> = cfg
            .own_options(DEFAULT_SECTION)
            .into_iter()
            .map(|(option, _)| option)
            .collect();
        let sections = std::iter::once(DEFAULT_SECTION).chain(cfg.sections());
        for section in sections {
            let options: Vec<&str> = cfg
                .own_options(section)
                .into_iter()
                .map(|(option, _)| option)
                .filter(|option| section == DEFAULT_SECTION || !inherited.contains(option))
                .collect();
            writeln!(out)?;
            writeln!(out, "[{section}]")?;
            let width = options
                .iter()
                .chain(inherited.iter())
                .map(|option| option.len())
                .max()
                .unwrap_or(0);
            for option in options {
                let value = cfg.get(section, option)?;
                writeln!(out, "{:<width$} = {}", option.to_uppercase(), value)?;
            }
        }
        writeln!(out)?;
        Ok(())
    }

    /// Runs `data.get_data_cmd` and reports the size of the input files.
    pub fn get_data(&self, cfg: &Config, only_show: bool, out: &mut dyn Write) -> Result<()> {
        let cmdline = render_get_data(cfg)?;
        writeln!(out, "{}", style(&cmdline).blue())?;
        if only_show {
            return Ok(());
        }
        writeln!(out)?;
        self.run(&cmdline)?;
        if let Some(file_names) = cfg.get_optional("index", "file_names")? {
            let total = total_file_size(&file_names, &self.host.cwd)?;
            writeln!(out, "Total file size: {:.1} GB", total as f64 / 1e9)?;
        }
        Ok(())
    }

    /// Builds the index. Refuses to overwrite existing index files.
    pub fn index(&self, cfg: &Config, only_show: bool, out: &mut dyn Write) -> Result<()> {
        let name = cfg.name()?;
        let file_names = cfg.get_required("index", "file_names")?;
        let input_bytes = total_file_size(&file_names, &self.host.cwd)?;
        let backend = resolve_backend(cfg)?;
        let rendered = render_index(cfg, &self.host, input_bytes)?;
        let script = rendered.to_string();
        writeln!(out, "{}", style(&script).blue())?;
        if only_show {
            return Ok(());
        }
        writeln!(out)?;
        self.caps.warn_if_unsupported(backend);

        debug!(
            "Running {} with the {backend} backend",
            rendered.command().program()
        );
        if index_artifacts_exist(&self.host.cwd, &name)? {
            return Err(QleverError::precondition(format!(
                "Index files for dataset {name} already exist, please delete them if you want to rebuild the index"
            )));
        }

        let settings = cfg.get("index", "settings_json")?;
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&settings) {
            return Err(QleverError::invalid_value(
                "index",
                "settings_json",
                &settings,
                err.to_string(),
            ));
        }
        let settings_path = self.host.cwd.join(format!("{name}.settings.json"));
        fs::write(&settings_path, settings)?;
        debug!("Wrote {}", settings_path.display());

        self.run(&script)
    }

    /// Launches the server unless one already answers on the port, then
    /// follows its log until it is ready.
    pub fn start(&self, cfg: &Config, only_show: bool, out: &mut dyn Write) -> Result<()> {
        let name = cfg.name()?;
        let port = cfg.get_required("server", "port")?;
        let backend = resolve_backend(cfg)?;
        let rendered = render_start(cfg, &self.host)?;
        let script = rendered.to_string();
        writeln!(out, "{}", style(&script).blue())?;
        if only_show {
            return Ok(());
        }
        writeln!(out)?;
        self.caps.warn_if_unsupported(backend);

        debug!(
            "Running {} with the {backend} backend",
            rendered.command().program()
        );
        if self.server.is_alive(&port) {
            return Err(QleverError::precondition(format!(
                "QLever server already running on port {port}"
            )));
        }
        self.check_port_free(&port)?;

        self.run(&script)?;

        let log_name = server_log_name(&name);
        writeln!(
            out,
            "Follow {log_name} until the server is ready (Ctrl-C stops following the log, but not the server)"
        )?;
        writeln!(out)?;
        out.flush()?;
        let _follow = match self.executor.follow(&self.host.cwd.join(&log_name)) {
            Ok(follower) => FollowGuard::new(follower),
            Err(err) => {
                warn!("Cannot follow {log_name}: {err}");
                FollowGuard::none()
            }
        };
        self.wait_until_alive(&port, &log_name)?;
        info!("QLever server is up on port {port}");

        let token = cfg.get_optional("server", "access_token")?;
        for (option, field) in [
            ("index_description", "index-description"),
            ("text_description", "text-description"),
        ] {
            let Some(description) = cfg.get_optional("data", option)? else {
                continue;
            };
            if let Err(err) =
                self.server
                    .set_description(&port, field, &description, token.as_deref())
            {
                warn!("Setting {field} failed: {err}");
            }
        }
        Ok(())
    }

    fn check_port_free(&self, port: &str) -> Result<()> {
        if self.caps.connections != Capability::Available {
            return Ok(());
        }
        let number: u16 = port
            .parse()
            .map_err(|_| QleverError::invalid_value("server", "port", port, "not a port number"))?;
        match self.processes.ports_in_use() {
            Ok(ports) if ports.contains(&number) => Err(QleverError::precondition(format!(
                "Port {port} is already in use by another process"
            ))),
            Ok(_) => Ok(()),
            Err(err) => {
                debug!("Skipping the port check, cannot list connections: {err}");
                Ok(())
            }
        }
    }

    fn wait_until_alive(&self, port: &str, log_name: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.server.is_alive(port) {
                return Ok(());
            }
            if let Some(timeout) = self.wait.timeout {
                if started.elapsed() >= timeout {
                    return Err(QleverError::StartupTimeout {
                        port: port.to_string(),
                        seconds: timeout.as_secs(),
                        log: log_name.to_string(),
                    });
                }
            }
            thread::sleep(self.wait.poll_interval);
        }
    }

    /// Stops the server container, or else kills the first matching server
    /// process. Having nothing to stop is an error.
    pub fn stop(&self, cfg: &Config, only_show: bool, out: &mut dyn Write) -> Result<()> {
        let plan = render_stop(cfg)?;
        writeln!(
            out,
            "{}",
            style(format!(
                "Checking for Docker container with name \"{}\" and for processes matching: {}",
                plan.container, plan.process_pattern
            ))
            .blue()
        )?;
        if only_show {
            return Ok(());
        }
        writeln!(out)?;

        if self.caps.docker == Capability::Available && self.stop_container(&plan) {
            writeln!(
                out,
                "Docker container with name \"{}\" stopped and removed",
                plan.container
            )?;
            return Ok(());
        }

        let pattern = Regex::new(&plan.process_pattern)?;
        let found = self
            .processes
            .processes()?
            .into_iter()
            .find(|process| pattern.is_match(&process.cmdline));
        let Some(process) = found else {
            return Err(QleverError::precondition(
                "No matching Docker container or process found",
            ));
        };
        writeln!(
            out,
            "Found process {} from user {} with command line: {}",
            process.pid,
            process.user.as_deref().unwrap_or("?"),
            process.cmdline
        )?;
        writeln!(out)?;
        self.processes.kill(process.pid).map_err(|err| {
            QleverError::precondition(format!(
                "Could not kill process with PID {}: {err}",
                process.pid
            ))
        })?;
        writeln!(out, "{}", style(format!("Killed process {}", process.pid)).red())?;
        Ok(())
    }

    fn stop_container(&self, plan: &StopPlan) -> bool {
        for command in [plan.docker_stop(), plan.docker_rm()] {
            let args: Vec<&str> = command.arguments().iter().map(String::as_str).collect();
            match self.executor.run_quiet(command.program(), &args, None) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!("\"{command}\" exited with status {}", output.status_code);
                    return false;
                }
                Err(err) => {
                    debug!("Error running \"{command}\": {err}");
                    return false;
                }
            }
        }
        true
    }

    /// Lists every server and index-builder process on this machine.
    pub fn status(&self, _cfg: &Config, only_show: bool, out: &mut dyn Write) -> Result<()> {
        writeln!(
            out,
            "{}",
            style(format!(
                "All processes on this machine where the command line matches {STATUS_PATTERN}"
            ))
            .blue()
        )?;
        writeln!(out)?;
        if only_show {
            writeln!(out, "{}", style("If executed, show the matching processes").blue())?;
            return Ok(());
        }
        let pattern = Regex::new(STATUS_PATTERN)?;
        let matching: Vec<ProcessInfo> = self
            .processes
            .processes()?
            .into_iter()
            .filter(|process| pattern.is_match(&process.cmdline))
            .collect();
        if matching.is_empty() {
            writeln!(out, "No processes found")?;
            return Ok(());
        }
        let now = Local::now();
        writeln!(out, "{:<8} {:<8} {:>5}  {:>5}  {}", "PID", "USER", "START", "RSS", "COMMAND")?;
        for process in matching {
            let start = process
                .start_time
                .map(|start| format_start_time(start, now))
                .unwrap_or_else(|| "?".to_string());
            writeln!(
                out,
                "{:<8} {:<8} {:>5}  {:>5}  {}",
                process.pid,
                process.user.unwrap_or_default(),
                start,
                format!("{:.0} G", process.rss_bytes as f64 / 1e9),
                process.cmdline
            )?;
        }
        Ok(())
    }
}

/// `HH:MM` for processes started today, `MonDD` otherwise.
pub fn format_start_time(start: DateTime<Local>, now: DateTime<Local>) -> String {
    if start.date_naive() == now.date_naive() {
        start.format("%H:%M").to_string()
    } else {
        start.format("%b%d").to_string()
    }
}
