use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const QLEVERFILE: &str = "\
DEFAULT:
  name: olympics
data:
  get_data_cmd: echo fetching
index:
  cat_files: cat olympics.nt
  file_names: olympics.nt
server:
  port: 7019
  memory_for_queries_gb: 4
";

fn bin(dir: &Path) -> Command {
    let path = assert_cmd::cargo::cargo_bin!("qlever");
    let mut cmd = Command::new(path);
    cmd.current_dir(dir).env_remove("QLEVER_FILE");
    cmd
}

fn write_qleverfile(dir: &Path) -> PathBuf {
    let path = dir.join("Qleverfile.yaml");
    fs::write(&path, QLEVERFILE).unwrap();
    path
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn autocompletion_needs_no_qleverfile() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .arg("setup-autocompletion")
        .assert()
        .success()
        .stdout(contains("compgen -W \"show-config get-data index start stop status"))
        .stdout(contains("complete -o nosort -F _qlever_completion qlever"));
}

#[test]
fn missing_qleverfile_fails() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("cannot read Qleverfile Qleverfile.yaml"));
}

#[test]
fn unknown_action_lists_available_actions() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .args(["status", "restart"])
        .assert()
        .failure()
        .stderr(contains(
            "Action \"restart\" does not exist, available actions are: show-config, get-data, index, start, stop, status",
        ));
}

#[test]
fn unknown_option_assignment_fails() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .args(["server.nope=1", "start", "show"])
        .assert()
        .failure()
        .stderr(contains("Option NOPE does not exist in section [server] in Qleverfile"))
        .stdout(contains("ServerMain").not());
}

#[test]
fn start_show_prints_command_without_side_effects() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    let before = entries(dir.path());
    bin(dir.path())
        .args(["start", "show"])
        .assert()
        .success()
        .stdout(contains(
            "nohup ServerMain -i olympics -j 8 -p 7019 -m 4 -c 5 -e 1 -k 100 > olympics.server-log.txt 2>&1 &",
        ));
    assert_eq!(entries(dir.path()), before);
}

#[test]
fn docker_assignments_switch_the_backend() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .args(["docker.use_docker=true", "docker.image=myimg", "start", "show"])
        .assert()
        .success()
        .stdout(contains("docker run -d --restart=unless-stopped"))
        .stdout(contains("-p 7019:7019"))
        .stdout(contains("--name qlever.server.olympics myimg -c"))
        .stdout(contains("nohup").not());
}

#[test]
fn index_show_writes_no_settings() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .args(["index", "show"])
        .assert()
        .success()
        .stdout(contains("cat olympics.nt | IndexBuilderMain -F ttl -f - -i olympics"));
    assert!(!dir.path().join("olympics.settings.json").exists());
}

#[test]
fn index_refuses_to_overwrite_existing_index() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    fs::write(dir.path().join("olympics.nt"), "<s> <p> <o> .\n").unwrap();
    fs::write(dir.path().join("olympics.index.pso"), "").unwrap();
    bin(dir.path())
        .arg("index")
        .assert()
        .failure()
        .stderr(contains("Index files for dataset olympics already exist"));
    assert!(!dir.path().join("olympics.settings.json").exists());
    assert!(!dir.path().join("olympics.index-log.txt").exists());
}

#[test]
fn show_config_includes_defaults() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .arg("show-config")
        .assert()
        .success()
        .stdout(contains("[DEFAULT]\nNAME = olympics\n"))
        .stdout(contains("[docker]"))
        .stdout(contains("qlever.indexer.olympics"));
}

#[test]
fn leading_log_level_is_validated() {
    let dir = tempdir().unwrap();
    write_qleverfile(dir.path());
    bin(dir.path())
        .args(["general.log_level=chatty", "status", "show"])
        .assert()
        .failure()
        .stderr(contains("Invalid log level: \"CHATTY\""));
}

#[test]
fn qleverfile_location_can_be_overridden() {
    let dir = tempdir().unwrap();
    let elsewhere = tempdir().unwrap();
    let path = write_qleverfile(elsewhere.path());

    bin(dir.path())
        .arg("--qleverfile")
        .arg(&path)
        .args(["stop", "show"])
        .assert()
        .success()
        .stdout(contains("Checking for Docker container with name \"qlever.server.olympics\""));

    bin(dir.path())
        .env("QLEVER_FILE", &path)
        .args(["status", "show"])
        .assert()
        .success()
        .stdout(contains("All processes on this machine"));
}
