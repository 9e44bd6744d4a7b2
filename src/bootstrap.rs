//! Installs the container runtime on a server that doesn't have it.
//!
//! Two steps, each acquiring and releasing its own handle: upload the
//! provisioning script over sftp, then run it in a shell session. Nothing is
//! retried; the script is expected to be safe to run again from the start.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::command::{CommandError, DualCommand};
use crate::remote::RemoteSession;
use crate::ssh::SshError;

// Relative to the login directory of the ssh user.
pub const REMOTE_SCRIPT: &str = "setup.sh";

// Written by `ship init` so a fresh project has something to upload.
const DEFAULT_SCRIPT: &str = include_str!("../scripts/setup.sh");

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("could not upload {} to the server: {source}", script.display())]
    Transfer {
        script: PathBuf,
        #[source]
        source: SshError,
    },

    #[error("provisioning script failed: {0}")]
    Install(#[source] CommandError),
}

pub struct BootstrapInstaller<'a> {
    script: &'a Path,
}

impl<'a> BootstrapInstaller<'a> {
    pub fn new(script: &'a Path) -> Self {
        BootstrapInstaller { script }
    }

    pub fn install(&self, session: &dyn RemoteSession) -> Result<(), BootstrapError> {
        self.transfer(session)?;
        info!("running {REMOTE_SCRIPT} on the server");
        DualCommand::new(&format!("./{REMOTE_SCRIPT}"), Vec::<String>::new())
            .run_remote(session)
            .map_err(BootstrapError::Install)?;
        Ok(())
    }

    fn transfer(&self, session: &dyn RemoteSession) -> Result<(), BootstrapError> {
        let transfer_err = |source| BootstrapError::Transfer {
            script: self.script.to_path_buf(),
            source,
        };
        info!("uploading {} to {REMOTE_SCRIPT}", self.script.display());
        // sftp client dropped at the end of this fn on every path
        let mut sftp = session.new_sftp_client().map_err(transfer_err)?;
        sftp.transfer_executable(self.script, REMOTE_SCRIPT)
            .map_err(transfer_err)
    }
}

/// Writes the stock provisioning script to `path` unless something is already there.
/// Returns whether it wrote.
pub fn write_default_script(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, DEFAULT_SCRIPT)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(true)
}
