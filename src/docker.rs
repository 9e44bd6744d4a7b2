// Docker invocations. Each returns a DualCommand; nothing here runs anything.

use crate::command::DualCommand;

const DOCKER: &str = "docker";

// `docker --version` works without a daemon, so it only says the CLI is there.
pub fn is_installed() -> DualCommand {
    DualCommand::new(DOCKER, ["--version"])
}

// `docker version` talks to the daemon and fails if it is not running.
pub fn is_running() -> DualCommand {
    DualCommand::new(DOCKER, ["version"])
}

pub fn build_image(image: &str, context: &str) -> DualCommand {
    DualCommand::new(DOCKER, ["build", "-t", image, context])
}

// Tags `image` as `<registry>/<image>`.
pub fn tag(image: &str, registry: &str) -> DualCommand {
    let tagged = with_registry(registry, image);
    DualCommand::new(DOCKER, ["tag", image, tagged.as_str()])
}

pub fn push(reference: &str) -> DualCommand {
    DualCommand::new(DOCKER, ["push", reference])
}

pub fn pull(reference: &str) -> DualCommand {
    DualCommand::new(DOCKER, ["pull", reference])
}

// Password on stdin so it never shows in a command line.
pub fn login(server: &str, username: &str, password: &str) -> DualCommand {
    DualCommand::new(DOCKER, ["login", "-u", username, "--password-stdin", server])
        .with_stdin(password)
}

// Creates and starts a new container; there is no earlier one to restart on a fresh host.
pub fn run_container(port: u16, service: &str, reference: &str) -> DualCommand {
    let publish = format!("{port}:{port}");
    DualCommand::new(
        DOCKER,
        ["run", "-d", "--name", service, "-p", publish.as_str(), reference],
    )
}

pub fn with_registry(registry: &str, image: &str) -> String {
    format!("{}/{image}", registry.trim_end_matches('/'))
}
