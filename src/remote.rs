use std::fmt;
use std::path::Path;

use crate::ssh::SshError;

// Where to connect. Built from the first server in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

// What a remote command left behind. `status` is the remote exit status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Opens authenticated sessions. The pipeline holds one of these instead of
/// calling SSH::connect directly, so tests and dry runs can swap it out.
pub trait Connector {
    fn connect(&self, target: &Target) -> Result<Box<dyn RemoteSession>, SshError>;
}

/// One authenticated connection to a single host.
///
/// Sub-handles borrow the session and are released when dropped, so they
/// can never outlive it. `close` must be safe to call more than once.
pub trait RemoteSession {
    fn new_shell_session(&self) -> Result<Box<dyn ShellSession + '_>, SshError>;
    fn new_sftp_client(&self) -> Result<Box<dyn SftpClient + '_>, SshError>;
    fn close(&mut self);
}

// A channel that runs exactly one command. `stdin`, if any, is sent before EOF.
pub trait ShellSession {
    fn exec(&mut self, cmd: &str, stdin: Option<&str>) -> Result<ExecOutput, SshError>;
}

pub trait SftpClient {
    // Upload `src` to `dst`, keeping the local permission bits (so scripts stay executable).
    fn transfer_executable(&mut self, src: &Path, dst: &str) -> Result<(), SshError>;
}
