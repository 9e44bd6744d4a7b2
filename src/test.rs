use std::fs;
use std::path::PathBuf;

use chrono::Utc;

use crate::bootstrap::{BootstrapError, REMOTE_SCRIPT};
use crate::command::CommandError;
use crate::fakes::{FakeConnector, Fail, ScriptedExecutor};
use crate::git::{GitError, VersionSource};
use crate::ledger::VersionLedger;
use crate::pipeline::{Pipeline, SetupError, SetupResult};
use crate::step::Step;

const HASH: &str = "abc1234";
const IMAGE: &str = "app:abc1234";
const REFERENCE: &str = "registry.example.com/me/app:abc1234";

struct FixedVersion;

impl VersionSource for FixedVersion {
    fn latest_commit_hash(&self) -> Result<String, GitError> {
        Ok(HASH.to_string())
    }
    fn latest_commit_message(&self) -> Result<String, GitError> {
        Ok("Add login page".to_string())
    }
}

struct Project {
    dir: tempfile::TempDir,
    config: PathBuf,
}

impl Project {
    fn new() -> Project {
        Project::with("", "")
    }

    // `top` goes before the [registry] table, `registry` inside it
    fn with(top: &str, registry: &str) -> Project {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("ship.toml");
        fs::write(
            &config,
            format!(
                "image = \"app\"\nservice = \"web\"\nservers = [\"203.0.113.10\"]\n{top}\n\
                 [registry]\nserver = \"registry.example.com/me\"\n{registry}\n"
            ),
        )
        .unwrap();
        Project { dir, config }
    }

    fn ledger(&self) -> VersionLedger {
        VersionLedger::new(self.dir.path().join("ship.lock"))
    }

    fn run(&self, local: &ScriptedExecutor, remote: &FakeConnector) -> SetupResult {
        Pipeline::new(local, remote, &FixedVersion, &self.config).run_setup()
    }
}

fn aborted(result: SetupResult) -> SetupError {
    match result {
        SetupResult::Aborted(err) => err,
        SetupResult::Success(entry) => panic!("expected abort, deployed {entry:?}"),
    }
}

fn assert_handles_released(remote: &FakeConnector) {
    let log = remote.log();
    assert_eq!(log.shells_opened, log.shells_released, "{log:?}");
    assert_eq!(log.sftp_opened, log.sftp_released, "{log:?}");
}

#[test]
fn fresh_server_with_docker_deploys_and_records() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let before = Utc::now();
    let entry = match project.run(&local, &remote) {
        SetupResult::Success(entry) => entry,
        SetupResult::Aborted(err) => panic!("aborted: {err}"),
    };
    let after = Utc::now();

    assert_eq!(entry.version, HASH);
    assert_eq!(entry.image, IMAGE);
    assert_eq!(entry.message, "Add login page");
    assert!(before <= entry.date && entry.date <= after);
    assert_eq!(project.ledger().entries().unwrap(), vec![entry]);

    let calls = local.calls();
    assert_eq!(calls[0], "docker --version");
    assert_eq!(calls[1], "docker version");
    assert!(calls[2].starts_with(&format!("docker build -t {IMAGE} ")));
    assert_eq!(calls[3], format!("docker tag {IMAGE} {REFERENCE}"));
    assert_eq!(calls[4], format!("docker push {REFERENCE}"));
    assert_eq!(calls.len(), 5);

    let log = remote.log();
    assert_eq!(
        log.commands,
        vec![
            "docker --version".to_string(),
            format!("docker pull {REFERENCE}"),
            format!("docker run -d --name web -p 3000:3000 {REFERENCE}"),
        ]
    );
    assert!(log.uploads.is_empty());
    assert_eq!((log.connects, log.closes), (1, 1));
    assert_handles_released(&remote);
}

#[test]
fn missing_config_aborts_without_touching_the_network() {
    let project = Project::new();
    fs::remove_file(&project.config).unwrap();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let result = project.run(&local, &remote);
    assert!(!result.is_live());
    let reason = result.reason().unwrap();
    assert!(reason.contains("config missing"), "{reason}");
    let err = aborted(result);
    assert_eq!(err.step(), Step::ReadConfig);

    assert_eq!(remote.log().connects, 0);
    assert!(!local.ran("docker build"));
    assert!(project.ledger().entries().unwrap().is_empty());
}

#[test]
fn malformed_config_aborts_at_read_config() {
    let project = Project::new();
    fs::write(&project.config, "image = ").unwrap();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let err = aborted(project.run(&local, &remote));
    assert!(matches!(err, SetupError::Config(_)), "{err:?}");
    assert_eq!(remote.log().connects, 0);
}

#[test]
fn local_docker_missing_or_stopped_aborts_first() {
    for (prefix, fail) in [
        ("docker --version", Fail::Spawn),
        ("docker version", Fail::Exit(1)),
    ] {
        let project = Project::new();
        let local = ScriptedExecutor::default().fail(prefix, fail);
        let remote = FakeConnector::default();

        let err = aborted(project.run(&local, &remote));
        assert!(
            matches!(err, SetupError::LocalEnvironment { .. }),
            "{prefix}: {err:?}"
        );
        assert!(!local.ran("docker build"));
        assert_eq!(remote.log().connects, 0);
    }
}

#[test]
fn failed_build_stops_before_registry_and_ssh() {
    let project = Project::new();
    let local = ScriptedExecutor::default().fail("docker build", Fail::Exit(1));
    let remote = FakeConnector::default();

    let err = aborted(project.run(&local, &remote));
    assert!(matches!(err, SetupError::Build(CommandError::Exit { .. })));
    assert!(!local.ran("docker tag"));
    assert!(!local.ran("docker push"));
    assert_eq!(remote.log().connects, 0);
    assert!(project.ledger().entries().unwrap().is_empty());
}

#[test]
fn registry_failures_never_open_a_session() {
    for (prefix, step) in [
        ("docker tag", Step::TagImage),
        ("docker push", Step::PushImage),
    ] {
        let project = Project::new();
        let local = ScriptedExecutor::default().fail(prefix, Fail::Exit(1));
        let remote = FakeConnector::default();

        let err = aborted(project.run(&local, &remote));
        assert!(matches!(err, SetupError::Registry { .. }), "{err:?}");
        assert_eq!(err.step(), step);
        assert_eq!(remote.log().connects, 0);
        assert!(project.ledger().entries().unwrap().is_empty());
    }
}

#[test]
fn version_failure_aborts_before_build() {
    struct NoRepo;
    impl VersionSource for NoRepo {
        fn latest_commit_hash(&self) -> Result<String, GitError> {
            Err(GitError::Empty("rev-parse"))
        }
        fn latest_commit_message(&self) -> Result<String, GitError> {
            Err(GitError::Empty("log"))
        }
    }

    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();
    let result = Pipeline::new(&local, &remote, &NoRepo, &project.config).run_setup();

    assert!(matches!(aborted(result), SetupError::Version(_)));
    assert!(!local.ran("docker build"));
    assert_eq!(remote.log().connects, 0);
}

#[test]
fn unreachable_server_is_a_connection_error() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default().refuse();

    let err = aborted(project.run(&local, &remote));
    assert!(matches!(err, SetupError::Connection { .. }), "{err:?}");
    assert!(err.to_string().contains("203.0.113.10"));
    assert_eq!(remote.log().connects, 1);
    assert!(project.ledger().entries().unwrap().is_empty());
}

#[test]
fn missing_remote_docker_is_bootstrapped_then_deployed() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default().fail("docker --version", Fail::NotFound);

    let result = project.run(&local, &remote);
    assert!(result.is_success(), "{:?}", result.reason());

    let log = remote.log();
    assert_eq!(
        log.uploads,
        vec![(
            project.dir.path().join("scripts/setup.sh"),
            REMOTE_SCRIPT.to_string()
        )]
    );
    let install = log.position("./setup.sh").unwrap();
    let pull = log.position("docker pull").unwrap();
    assert!(install < pull);
    // probed once, not again after installing; one pull, one run
    assert_eq!(log.ran("docker --version"), 1);
    assert_eq!(log.ran("docker pull"), 1);
    assert_eq!(log.ran("docker run"), 1);
    assert_eq!(log.closes, 1);
    assert_handles_released(&remote);

    let entries = project.ledger().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].version, HASH);
}

#[test]
fn failed_script_upload_aborts_and_releases_everything() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default()
        .fail("docker --version", Fail::NotFound)
        .fail_transfer();

    let err = aborted(project.run(&local, &remote));
    assert!(
        matches!(err, SetupError::Bootstrap(BootstrapError::Transfer { .. })),
        "{err:?}"
    );

    let log = remote.log();
    assert_eq!((log.sftp_opened, log.sftp_released), (1, 1));
    assert_handles_released(&remote);
    assert_eq!(log.ran("./setup.sh"), 0);
    assert_eq!(log.ran("docker pull"), 0);
    assert_eq!(log.closes, 1);
    assert!(project.ledger().entries().unwrap().is_empty());
}

#[test]
fn failed_install_script_aborts() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default()
        .fail("docker --version", Fail::NotFound)
        .fail("./setup.sh", Fail::Exit(100));

    let err = aborted(project.run(&local, &remote));
    assert!(matches!(
        err,
        SetupError::Bootstrap(BootstrapError::Install(_))
    ));
    let log = remote.log();
    assert_eq!(log.ran("docker pull"), 0);
    assert_eq!(log.closes, 1);
    assert_handles_released(&remote);
}

#[test]
fn ambiguous_probe_failure_aborts_without_bootstrap() {
    for fail in [Fail::Exit(126), Fail::Transport] {
        let project = Project::new();
        let local = ScriptedExecutor::default();
        let remote = FakeConnector::default().fail("docker --version", fail);

        let err = aborted(project.run(&local, &remote));
        assert!(matches!(err, SetupError::RemoteProbe(_)), "{fail:?}: {err:?}");

        let log = remote.log();
        assert_eq!(log.sftp_opened, 0);
        assert_eq!(log.ran("docker pull"), 0);
        assert_eq!(log.closes, 1);
        assert_handles_released(&remote);
    }
}

#[test]
fn remote_failures_after_connect_close_the_session_once() {
    for (prefix, step) in [
        ("docker pull", Step::PullImage),
        ("docker run", Step::RunContainer),
    ] {
        let project = Project::new();
        let local = ScriptedExecutor::default();
        let remote = FakeConnector::default().fail(prefix, Fail::Exit(1));

        let err = aborted(project.run(&local, &remote));
        assert_eq!(err.step(), step);
        assert!(!err.is_live());

        let log = remote.log();
        assert_eq!((log.connects, log.closes), (1, 1));
        assert_handles_released(&remote);
        assert!(project.ledger().entries().unwrap().is_empty());
    }
}

#[test]
fn ledger_failure_is_reported_as_live_but_unrecorded() {
    let project = Project::with("ledger = \"blocker/ship.lock\"", "");
    fs::write(project.dir.path().join("blocker"), "").unwrap();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let result = project.run(&local, &remote);
    assert!(!result.is_success());
    assert!(result.is_live());
    assert!(result
        .reason()
        .unwrap()
        .contains("deployment succeeded but ledger write failed"));

    let err = aborted(result);
    assert_eq!(err.step(), Step::AppendLedgerEntry);
    match &err {
        SetupError::LedgerWrite { entry, .. } => assert_eq!(entry.image, IMAGE),
        other => panic!("unexpected {other:?}"),
    }
    let log = remote.log();
    assert_eq!(log.ran("docker run"), 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn deploy_after_a_torn_ledger_write_is_still_readable() {
    let project = Project::new();
    fs::write(project.ledger().path(), "{\"version\":\"aaa1").unwrap();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let entry = match project.run(&local, &remote) {
        SetupResult::Success(entry) => entry,
        SetupResult::Aborted(err) => panic!("aborted: {err}"),
    };
    assert_eq!(project.ledger().entries().unwrap(), vec![entry]);
}

#[test]
fn repeated_runs_append_in_order() {
    let project = Project::new();
    let local = ScriptedExecutor::default();

    for _ in 0..2 {
        let remote = FakeConnector::default();
        assert!(project.run(&local, &remote).is_success());
    }
    let entries = project.ledger().entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].date <= entries[1].date);
}

const PASSWORD: &str = "s3cr3t-pw";

fn with_credentials() -> Project {
    Project::with("", &format!("username = \"me\"\npassword = \"{PASSWORD}\""))
}

#[test]
fn registry_credentials_log_in_on_both_sides_without_exposing_the_password() {
    let project = with_credentials();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    assert!(project.run(&local, &remote).is_success());

    let login = "docker login -u me --password-stdin registry.example.com/me";
    let calls = local.calls();
    let local_login = calls.iter().position(|c| c == login).unwrap();
    let push = calls.iter().position(|c| c.starts_with("docker push")).unwrap();
    assert!(local_login < push);
    assert_eq!(local.inputs(), vec![PASSWORD]);

    let log = remote.log();
    assert!(log.position(login).unwrap() < log.position("docker pull").unwrap());
    assert_eq!(log.inputs, vec![PASSWORD]);

    for line in calls.iter().chain(&log.commands) {
        assert!(!line.contains(PASSWORD), "{line}");
    }
}

#[test]
fn failed_login_is_a_registry_error_on_the_right_side() {
    let project = with_credentials();
    let local = ScriptedExecutor::default().fail("docker login", Fail::Exit(1));
    let remote = FakeConnector::default();

    let result = project.run(&local, &remote);
    let reason = result.reason().unwrap();
    assert!(!reason.contains(PASSWORD), "{reason}");
    let err = aborted(result);
    assert!(matches!(err, SetupError::Registry { .. }), "{err:?}");
    assert_eq!(err.step(), Step::PushImage);
    assert!(!local.ran("docker push"));
    assert_eq!(remote.log().connects, 0);

    let project = with_credentials();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default().fail("docker login", Fail::Exit(1));

    let result = project.run(&local, &remote);
    let reason = result.reason().unwrap();
    assert!(!reason.contains(PASSWORD), "{reason}");
    let err = aborted(result);
    assert_eq!(err.step(), Step::PullImage);
    let log = remote.log();
    assert_eq!(log.ran("docker pull"), 0);
    assert_eq!(log.closes, 1);
    assert_handles_released(&remote);
    assert!(project.ledger().entries().unwrap().is_empty());
}

#[test]
fn dry_run_never_writes_the_ledger() {
    let project = Project::new();
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    let result = Pipeline::new(&local, &remote, &FixedVersion, &project.config)
        .dry_run()
        .run_setup();
    assert!(result.is_success());
    assert!(!project.ledger().path().exists());
}

#[test]
fn relative_paths_follow_the_config_file() {
    let project = Project::with("context = \"app\"", "");
    let local = ScriptedExecutor::default();
    let remote = FakeConnector::default();

    assert!(project.run(&local, &remote).is_success());
    let expected = project.dir.path().join("app");
    assert!(local
        .calls()
        .iter()
        .any(|c| c.ends_with(&*expected.to_string_lossy())));
}
