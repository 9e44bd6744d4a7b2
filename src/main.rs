use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::Context;
use clap::arg;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

mod bootstrap;
mod command;
mod config;
mod docker;
mod git;
mod ledger;
mod output;
mod pipeline;
mod remote;
mod ssh;
mod step;

#[cfg(test)]
mod fakes;
#[cfg(test)]
mod test;

use command::{DryRunExecutor, LocalExecutor};
use git::Git;
use ledger::VersionLedger;
use pipeline::Pipeline;
use ssh::{LogLevel, MockSSH, SshConnector, SSH};

const DESC: &str = r#"Example: ship setup --config ./ship.toml
Builds the image for the current commit, pushes it to the registry, then runs
it on the first server in the config, installing docker there if needed."#;

// Container is up but the ledger doesn't know about it.
const EXIT_UNRECORDED: i32 = 3;

fn common_args() -> [clap::Arg<'static>; 2] {
    [
        arg!(-c --config <FILE> "Path to ship.toml")
            .required(false)
            .default_value(config::DEFAULT_PATH),
        arg!(-v --verbose "Debug level output").required(false),
    ]
}

fn main() -> Result<(), anyhow::Error> {
    let args = clap::Command::new("ship")
        .about(DESC)
        .subcommand_required(true)
        .subcommand(
            clap::Command::new("setup")
                .about("First deploy to a server: build, push, install docker, run")
                .args(common_args())
                .arg(arg!(--"dry-run" "Show what we would do without doing it").required(false)),
        )
        .subcommand(
            clap::Command::new("versions")
                .about("List deployed versions, oldest first")
                .args(common_args()),
        )
        .subcommand(
            clap::Command::new("init")
                .about("Write a starter ship.toml and provisioning script")
                .args(common_args()),
        )
        .get_matches();

    let (name, sub) = match args.subcommand() {
        Some(s) => s,
        None => unreachable!("subcommand_required"),
    };
    let verbose = sub.is_present("verbose");
    let config_path = PathBuf::from(sub.value_of("config").unwrap_or(config::DEFAULT_PATH));

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match name {
        "setup" => setup(&config_path, sub.is_present("dry-run"), verbose),
        "versions" => versions(&config_path),
        "init" => init(&config_path),
        _ => unreachable!(),
    }
}

fn setup(config_path: &Path, is_dry_run: bool, verbose: bool) -> Result<(), anyhow::Error> {
    debug!("Using libssh {}", SSH::version());
    let log_level = if verbose {
        LogLevel::WARNING
    } else {
        LogLevel::NOLOG
    };
    let git = Git::new(project_dir(config_path));

    let t_start = Instant::now();
    let result = if is_dry_run {
        Pipeline::new(&DryRunExecutor {}, &MockSSH {}, &git, config_path)
            .dry_run()
            .run_setup()
    } else {
        Pipeline::new(
            &LocalExecutor::default(),
            &SshConnector { log_level },
            &git,
            config_path,
        )
        .run_setup()
    };

    let summary = output::setup_summary(&result, t_start.elapsed());
    if result.is_success() {
        print!("{summary}");
        return Ok(());
    }
    eprint!("{summary}");
    process::exit(if result.is_live() { EXIT_UNRECORDED } else { 1 });
}

fn versions(config_path: &Path) -> Result<(), anyhow::Error> {
    let config = config::read(config_path)?;
    let ledger = VersionLedger::new(config.ledger_path());
    let entries = ledger
        .entries()
        .with_context(|| format!("reading {}", ledger.path().display()))?;
    print!("{}", output::versions_table(&entries));
    Ok(())
}

fn init(config_path: &Path) -> Result<(), anyhow::Error> {
    config::write_template(config_path)?;
    println!("Wrote {}", config_path.display());

    let script = project_dir(config_path).join(config::DEFAULT_BOOTSTRAP_SCRIPT);
    if bootstrap::write_default_script(&script)? {
        println!("Wrote {}", script.display());
    }
    Ok(())
}

// Directory holding the config, which is also the git checkout.
fn project_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
