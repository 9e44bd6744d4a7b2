//! First-time setup of a server: build, push, connect, install docker if
//! needed, pull, run, record.
//!
//! Strictly one pass. The first failing step ends the run and is reported as
//! [`SetupResult::Aborted`]; nothing is retried or rolled back. The only branch
//! is installing docker on the server when the probe says it is missing.

use std::path::Path;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapError, BootstrapInstaller};
use crate::command::{CommandError, Executor};
use crate::config::{self, Config, ConfigError};
use crate::docker;
use crate::git::{GitError, VersionSource};
use crate::ledger::{LedgerError, VersionEntry, VersionLedger};
use crate::remote::{Connector, RemoteSession, Target};
use crate::ssh::SshError;
use crate::step::Step;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{reason}: {source}")]
    LocalEnvironment {
        reason: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("config missing or unreadable: {0}")]
    Config(#[from] ConfigError),

    #[error("could not read version: {0}")]
    Version(#[from] GitError),

    #[error("could not build image: {0}")]
    Build(#[source] CommandError),

    #[error("{step} failed: {source}")]
    Registry {
        step: Step,
        #[source]
        source: CommandError,
    },

    #[error("cannot reach server {target}: {source}")]
    Connection {
        target: Target,
        #[source]
        source: SshError,
    },

    #[error("cannot verify remote runtime: {0}")]
    RemoteProbe(#[source] CommandError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("could not run container: {0}")]
    RuntimeStart(#[source] CommandError),

    #[error(
        "deployment succeeded but ledger write failed; {} is running but not recorded: {source}",
        entry.image
    )]
    LedgerWrite {
        entry: VersionEntry,
        #[source]
        source: LedgerError,
    },
}

impl SetupError {
    pub fn step(&self) -> Step {
        match self {
            SetupError::LocalEnvironment { .. } => Step::LocalPrecheck,
            SetupError::Config(_) => Step::ReadConfig,
            SetupError::Version(_) => Step::ComputeVersion,
            SetupError::Build(_) => Step::BuildImage,
            SetupError::Registry { step, .. } => *step,
            SetupError::Connection { .. } => Step::ConnectRemote,
            SetupError::RemoteProbe(_) => Step::ProbeRemoteRuntime,
            SetupError::Bootstrap(_) => Step::Bootstrap,
            SetupError::RuntimeStart(_) => Step::RunContainer,
            SetupError::LedgerWrite { .. } => Step::AppendLedgerEntry,
        }
    }

    /// True when the container was started before the failure.
    pub fn is_live(&self) -> bool {
        matches!(self, SetupError::LedgerWrite { .. })
    }
}

#[derive(Debug)]
pub enum SetupResult {
    Success(VersionEntry),
    Aborted(SetupError),
}

impl SetupResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SetupResult::Success(_))
    }

    /// True when the new container is running, recorded or not.
    pub fn is_live(&self) -> bool {
        match self {
            SetupResult::Success(_) => true,
            SetupResult::Aborted(err) => err.is_live(),
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            SetupResult::Success(_) => None,
            SetupResult::Aborted(err) => Some(err.to_string()),
        }
    }
}

impl From<Result<VersionEntry, SetupError>> for SetupResult {
    fn from(res: Result<VersionEntry, SetupError>) -> Self {
        match res {
            Ok(entry) => SetupResult::Success(entry),
            Err(err) => SetupResult::Aborted(err),
        }
    }
}

// What this run ships.
#[derive(Debug, Clone)]
struct Release {
    hash: String,
    message: String,
    // <image>:<hash>
    image: String,
    // <registry>/<image>:<hash>
    reference: String,
}

pub struct Pipeline<'a> {
    local: &'a dyn Executor,
    connector: &'a dyn Connector,
    versions: &'a dyn VersionSource,
    config_path: &'a Path,
    record: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        local: &'a dyn Executor,
        connector: &'a dyn Connector,
        versions: &'a dyn VersionSource,
        config_path: &'a Path,
    ) -> Self {
        Pipeline {
            local,
            connector,
            versions,
            config_path,
            record: true,
        }
    }

    // Everything runs except the ledger append.
    pub fn dry_run(mut self) -> Self {
        self.record = false;
        self
    }

    pub fn run_setup(&self) -> SetupResult {
        let result: SetupResult = self.run().into();
        if let SetupResult::Aborted(err) = &result {
            error!(step = %err.step(), "{err}");
        }
        result
    }

    fn run(&self) -> Result<VersionEntry, SetupError> {
        info!("setting up your server");
        self.local_precheck()?;
        let config = self.read_config()?;
        let release = self.compute_version(&config)?;
        self.build_and_push(&config, &release)?;

        let target = Target {
            host: config.server().to_string(),
            port: config.ssh.port,
            user: config.ssh_user().to_string(),
        };
        info!(step = %Step::ConnectRemote, "connecting to {target}");
        let mut session = self
            .connector
            .connect(&target)
            .map_err(|source| SetupError::Connection {
                target: target.clone(),
                source,
            })?;
        info!("connected to {}", target.host);

        // close before looking at the result, so every remote failure closes too
        let deployed = self.deploy_remote(session.as_ref(), &config, &release);
        session.close();
        deployed?;

        self.append_ledger_entry(&config, release)
    }

    fn local_precheck(&self) -> Result<(), SetupError> {
        debug!(step = %Step::LocalPrecheck, "checking local docker");
        docker::is_installed()
            .run_on(self.local)
            .map_err(|source| SetupError::LocalEnvironment {
                reason: "docker is not installed locally",
                source,
            })?;
        docker::is_running()
            .run_on(self.local)
            .map_err(|source| SetupError::LocalEnvironment {
                reason: "docker daemon is not running locally",
                source,
            })?;
        Ok(())
    }

    fn read_config(&self) -> Result<Config, SetupError> {
        info!(step = %Step::ReadConfig, "reading {}", self.config_path.display());
        if !config::exists(self.config_path) {
            return Err(ConfigError::NotFound(self.config_path.to_path_buf()).into());
        }
        Ok(config::read(self.config_path)?)
    }

    fn compute_version(&self, config: &Config) -> Result<Release, SetupError> {
        // both now, so nothing about git can fail once the container runs
        let hash = self.versions.latest_commit_hash()?;
        let message = self.versions.latest_commit_message()?;
        let image = format!("{}:{hash}", config.image);
        let reference = docker::with_registry(&config.registry.server, &image);
        debug!(step = %Step::ComputeVersion, "version {hash}: {message}");
        self.note_previous(config, &hash);
        Ok(Release {
            hash,
            message,
            image,
            reference,
        })
    }

    // Informational only. A ledger that can't be read now fails the append later.
    fn note_previous(&self, config: &Config, hash: &str) {
        match VersionLedger::new(config.ledger_path()).latest() {
            Ok(Some(prev)) if prev.version == hash => {
                warn!("{hash} was already deployed on {}; deploying it again", prev.date)
            }
            Ok(Some(prev)) => info!("replacing {}", prev.image),
            Ok(None) => debug!("first deployment"),
            Err(err) => warn!("{err}"),
        }
    }

    fn build_and_push(&self, config: &Config, release: &Release) -> Result<(), SetupError> {
        info!(step = %Step::BuildImage, "building {}", release.image);
        let context = config.context_path();
        docker::build_image(&release.image, &context.to_string_lossy())
            .run_on(self.local)
            .map_err(SetupError::Build)?;

        debug!(step = %Step::TagImage, "tagging {}", release.reference);
        docker::tag(&release.image, &config.registry.server)
            .run_on(self.local)
            .map_err(registry_err(Step::TagImage))?;

        if let Some((user, password)) = config.registry_credentials() {
            docker::login(&config.registry.server, user, password)
                .run_on(self.local)
                .map_err(registry_err(Step::PushImage))?;
        }
        info!(step = %Step::PushImage, "pushing {}", release.reference);
        docker::push(&release.reference)
            .run_on(self.local)
            .map_err(registry_err(Step::PushImage))?;
        Ok(())
    }

    fn deploy_remote(
        &self,
        session: &dyn RemoteSession,
        config: &Config,
        release: &Release,
    ) -> Result<(), SetupError> {
        self.ensure_remote_runtime(session, config)?;

        if let Some((user, password)) = config.registry_credentials() {
            docker::login(&config.registry.server, user, password)
                .run_remote(session)
                .map_err(registry_err(Step::PullImage))?;
        }
        info!(step = %Step::PullImage, "pulling {} on the server", release.reference);
        docker::pull(&release.reference)
            .run_remote(session)
            .map_err(registry_err(Step::PullImage))?;

        info!(step = %Step::RunContainer, "starting {}", config.service);
        docker::run_container(config.port, &config.service, &release.reference)
            .run_remote(session)
            .map_err(SetupError::RuntimeStart)?;
        Ok(())
    }

    // Only "not found" installs docker. Anything else about the probe is a
    // server we don't understand, so stop.
    fn ensure_remote_runtime(
        &self,
        session: &dyn RemoteSession,
        config: &Config,
    ) -> Result<(), SetupError> {
        debug!(step = %Step::ProbeRemoteRuntime, "checking docker on the server");
        match docker::is_installed().run_remote(session) {
            Ok(_) => Ok(()),
            Err(CommandError::NotFound { .. }) => {
                warn!(step = %Step::Bootstrap, "docker is not installed on the server; installing");
                let script = config.bootstrap_script_path();
                BootstrapInstaller::new(&script).install(session)?;
                info!("docker installed");
                Ok(())
            }
            Err(
                err @ (CommandError::Exit { .. }
                | CommandError::Transport { .. }
                | CommandError::Spawn { .. }),
            ) => Err(SetupError::RemoteProbe(err)),
        }
    }

    fn append_ledger_entry(
        &self,
        config: &Config,
        release: Release,
    ) -> Result<VersionEntry, SetupError> {
        let entry = VersionEntry {
            version: release.hash,
            image: release.image,
            message: release.message,
            date: Utc::now(),
        };
        let ledger = VersionLedger::new(config.ledger_path());
        if !self.record {
            info!(
                "would append {} to {}",
                entry.version,
                ledger.path().display()
            );
            return Ok(entry);
        }
        ledger
            .append(&entry)
            .map_err(|source| SetupError::LedgerWrite {
                entry: entry.clone(),
                source,
            })?;
        info!(step = %Step::AppendLedgerEntry, "deployed {}", entry.image);
        Ok(entry)
    }
}

fn registry_err(step: Step) -> impl Fn(CommandError) -> SetupError {
    move |source| SetupError::Registry { step, source }
}
