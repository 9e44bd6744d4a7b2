//! A command that runs the same way on this machine or on a server.
//!
//! A [`DualCommand`] is just a program and its arguments. Where it runs is
//! picked by the [`Executor`] it is handed to: [`LocalExecutor`] spawns a
//! process, [`RemoteExecutor`] runs it through a shell session on an
//! already-connected [`RemoteSession`].
//!
//! Secrets go in through [`DualCommand::with_stdin`], never as arguments, so
//! they stay out of the command line that gets logged and put in errors.

use std::fmt;
use std::io::{self, Write};
use std::process::{self, Stdio};

use tracing::{debug, info};

use crate::remote::RemoteSession;
use crate::ssh::SshError;

// POSIX shells exit with this when the program is not on PATH.
pub const EXIT_NOT_FOUND: i32 = 127;

#[derive(Clone, PartialEq, Eq)]
pub struct DualCommand {
    program: String,
    args: Vec<String>,
    // fed to the program's standard input, then closed
    stdin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("could not start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` not found")]
    NotFound { program: String },

    #[error("`{command}` exited with status {status}: {stderr}")]
    Exit {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("connection failed while running `{command}`: {source}")]
    Transport {
        command: String,
        #[source]
        source: SshError,
    },
}

impl DualCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DualCommand {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: &str) -> Self {
        self.stdin = Some(input.to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// The command as one line for a remote shell, each word quoted only if it must be.
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| quote_arg(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run_on(&self, executor: &dyn Executor) -> Result<Output, CommandError> {
        executor.execute(self)
    }

    pub fn run_local(&self) -> Result<Output, CommandError> {
        self.run_on(&LocalExecutor {})
    }

    pub fn run_remote(&self, session: &dyn RemoteSession) -> Result<Output, CommandError> {
        self.run_on(&RemoteExecutor::new(session))
    }
}

impl fmt::Display for DualCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

// stdin is usually a password
impl fmt::Debug for DualCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Somewhere a [`DualCommand`] can run.
pub trait Executor {
    fn execute(&self, cmd: &DualCommand) -> Result<Output, CommandError>;
}

// Spawns processes in our own working directory.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor {}

impl Executor for LocalExecutor {
    fn execute(&self, cmd: &DualCommand) -> Result<Output, CommandError> {
        debug!("local: {cmd}");
        let spawn_err = |source| CommandError::Spawn {
            program: cmd.program.clone(),
            source,
        };
        let mut proc = process::Command::new(&cmd.program);
        proc.args(&cmd.args)
            .stdin(match cmd.stdin() {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = proc.spawn().map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (cmd.stdin(), child.stdin.take()) {
            // a program that exits without reading shows up in its exit status
            if let Err(err) = pipe.write_all(input.as_bytes()) {
                debug!("writing stdin of {}: {err}", cmd.program);
            }
            // pipe dropped here, the program sees EOF
        }
        let out = child.wait_with_output().map_err(spawn_err)?;
        // killed by a signal has no code
        let status = out.status.code().unwrap_or(-1);
        into_result(
            cmd,
            status,
            String::from_utf8_lossy(&out.stdout).into_owned(),
            String::from_utf8_lossy(&out.stderr).into_owned(),
        )
    }
}

/// Runs commands over a session somebody else opened and will close.
pub struct RemoteExecutor<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(session: &'a dyn RemoteSession) -> Self {
        RemoteExecutor { session }
    }
}

impl Executor for RemoteExecutor<'_> {
    fn execute(&self, cmd: &DualCommand) -> Result<Output, CommandError> {
        let line = cmd.to_shell();
        debug!("remote: {line}");
        let transport = |source| CommandError::Transport {
            command: line.clone(),
            source,
        };
        // the shell session is released when it goes out of scope, whatever exec returned
        let out = {
            let mut shell = self.session.new_shell_session().map_err(transport)?;
            shell.exec(&line, cmd.stdin()).map_err(transport)?
        };
        into_result(cmd, out.status, out.stdout, out.stderr)
    }
}

// Logs instead of spawning. Used for --dry-run.
#[derive(Debug, Default)]
pub struct DryRunExecutor {}

impl Executor for DryRunExecutor {
    fn execute(&self, cmd: &DualCommand) -> Result<Output, CommandError> {
        info!("would run '{cmd}'");
        Ok(Output::default())
    }
}

fn into_result(
    cmd: &DualCommand,
    status: i32,
    stdout: String,
    stderr: String,
) -> Result<Output, CommandError> {
    match status {
        0 => Ok(Output { stdout, stderr }),
        EXIT_NOT_FOUND => Err(CommandError::NotFound {
            program: cmd.program().to_string(),
        }),
        status => Err(CommandError::Exit {
            command: cmd.to_shell(),
            status,
            stderr: stderr.trim().to_string(),
        }),
    }
}

// Characters that make a shell word need quoting
const SHELL_META: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}', '<',
    '>', '|', '&', ';', '#', '~',
];

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}
