//! In-memory stand-ins for the local machine and the server.
//!
//! Every command is recorded. Commands that start with a registered prefix
//! fail the way they were told to. Sessions count how many shell and sftp
//! handles were opened and released, so tests can check nothing leaks.

use std::cell::RefCell;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::command::{CommandError, DualCommand, Executor, Output, EXIT_NOT_FOUND};
use crate::remote::{Connector, ExecOutput, RemoteSession, SftpClient, ShellSession, Target};
use crate::ssh::SshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    NotFound,
    Exit(i32),
    Spawn,
    Transport,
}

fn rule_for(rules: &[(String, Fail)], line: &str) -> Option<Fail> {
    rules
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        .map(|(_, fail)| *fail)
}

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: RefCell<Vec<String>>,
    inputs: RefCell<Vec<String>>,
    rules: Vec<(String, Fail)>,
}

impl ScriptedExecutor {
    pub fn fail(mut self, prefix: &str, fail: Fail) -> Self {
        self.rules.push((prefix.to_string(), fail));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.borrow().clone()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.starts_with(prefix))
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, cmd: &DualCommand) -> Result<Output, CommandError> {
        let line = cmd.to_shell();
        self.calls.borrow_mut().push(line.clone());
        self.inputs.borrow_mut().extend(cmd.stdin().map(str::to_string));
        match rule_for(&self.rules, &line) {
            None => Ok(Output::default()),
            Some(Fail::NotFound) => Err(CommandError::NotFound {
                program: cmd.program().to_string(),
            }),
            Some(Fail::Exit(status)) => Err(CommandError::Exit {
                command: line,
                status,
                stderr: "failed".to_string(),
            }),
            Some(Fail::Spawn) => Err(CommandError::Spawn {
                program: cmd.program().to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
            Some(Fail::Transport) => Err(CommandError::Transport {
                command: line,
                source: SshError::Channel("connection lost".to_string()),
            }),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionLog {
    pub connects: usize,
    pub closes: usize,
    pub shells_opened: usize,
    pub shells_released: usize,
    pub sftp_opened: usize,
    pub sftp_released: usize,
    pub commands: Vec<String>,
    // stdin payloads, kept apart from the command lines
    pub inputs: Vec<String>,
    pub uploads: Vec<(PathBuf, String)>,
}

impl SessionLog {
    pub fn ran(&self, prefix: &str) -> usize {
        self.commands.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
pub struct FakeConnector {
    log: Rc<RefCell<SessionLog>>,
    rules: Vec<(String, Fail)>,
    refuse: bool,
    fail_transfer: bool,
}

impl FakeConnector {
    pub fn fail(mut self, prefix: &str, fail: Fail) -> Self {
        self.rules.push((prefix.to_string(), fail));
        self
    }

    pub fn refuse(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn fail_transfer(mut self) -> Self {
        self.fail_transfer = true;
        self
    }

    pub fn log(&self) -> SessionLog {
        self.log.borrow().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, target: &Target) -> Result<Box<dyn RemoteSession>, SshError> {
        self.log.borrow_mut().connects += 1;
        if self.refuse {
            return Err(SshError::Connect {
                host: target.host.clone(),
                port: target.port,
                reason: "Connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            log: self.log.clone(),
            rules: self.rules.clone(),
            fail_transfer: self.fail_transfer,
            closed: false,
        }))
    }
}

struct FakeSession {
    log: Rc<RefCell<SessionLog>>,
    rules: Vec<(String, Fail)>,
    fail_transfer: bool,
    closed: bool,
}

impl RemoteSession for FakeSession {
    fn new_shell_session(&self) -> Result<Box<dyn ShellSession + '_>, SshError> {
        if self.closed {
            return Err(SshError::Closed);
        }
        self.log.borrow_mut().shells_opened += 1;
        Ok(Box::new(FakeShell { session: self }))
    }

    fn new_sftp_client(&self) -> Result<Box<dyn SftpClient + '_>, SshError> {
        if self.closed {
            return Err(SshError::Closed);
        }
        self.log.borrow_mut().sftp_opened += 1;
        Ok(Box::new(FakeSftp { session: self }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.borrow_mut().closes += 1;
        }
    }
}

struct FakeShell<'a> {
    session: &'a FakeSession,
}

impl ShellSession for FakeShell<'_> {
    fn exec(&mut self, cmd: &str, stdin: Option<&str>) -> Result<ExecOutput, SshError> {
        {
            let mut log = self.session.log.borrow_mut();
            log.commands.push(cmd.to_string());
            log.inputs.extend(stdin.map(str::to_string));
        }
        let status = match rule_for(&self.session.rules, cmd) {
            None => 0,
            Some(Fail::NotFound) => EXIT_NOT_FOUND,
            Some(Fail::Exit(status)) => status,
            Some(Fail::Spawn) => 1,
            Some(Fail::Transport) => {
                return Err(SshError::Channel("connection lost".to_string()))
            }
        };
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: if status == 0 {
                String::new()
            } else {
                format!("sh: {cmd}: failed")
            },
            status,
        })
    }
}

impl Drop for FakeShell<'_> {
    fn drop(&mut self) {
        self.session.log.borrow_mut().shells_released += 1;
    }
}

struct FakeSftp<'a> {
    session: &'a FakeSession,
}

impl SftpClient for FakeSftp<'_> {
    fn transfer_executable(&mut self, src: &Path, dst: &str) -> Result<(), SshError> {
        if self.session.fail_transfer {
            return Err(SshError::Sftp {
                op: "write",
                path: dst.to_string(),
                reason: "No space left on device".to_string(),
            });
        }
        self.session
            .log
            .borrow_mut()
            .uploads
            .push((src.to_path_buf(), dst.to_string()));
        Ok(())
    }
}

impl Drop for FakeSftp<'_> {
    fn drop(&mut self) {
        self.session.log.borrow_mut().sftp_released += 1;
    }
}
