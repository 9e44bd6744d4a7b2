#![allow(dead_code)]
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use std::ffi::{CStr, CString, NulError};
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::{debug, info, warn};

use crate::remote::{Connector, ExecOutput, RemoteSession, SftpClient, ShellSession, Target};

// From fcntl.h
const O_WRONLY: c_uint = 1;
const O_CREAT: c_uint = 0o100;
const O_TRUNC: c_uint = 0o1000;

// Give libssh data in chunks of 128 KiB. I think an sftp packet is 32 KiB.
// Has to be under 256 KiB or things start to break.
const SFTP_CHUNK_SIZE: usize = 128 * 1024;

const SSH_CMD_BUF_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("ssh_new returned null")]
    Alloc,

    #[error("connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("unknown host {host}: {state}. ssh to it manually first to accept key")]
    UnknownHost { host: String, state: String },

    #[error("auth for {user} failed: {reason}. Is ssh-agent running?")]
    Auth { user: String, reason: String },

    #[error("session already closed")]
    Closed,

    #[error("channel: {0}")]
    Channel(String),

    #[error("sftp {op} {path}: {reason}")]
    Sftp {
        op: &'static str,
        path: String,
        reason: String,
    },

    #[error("short write to {path}: {written} / {expected}")]
    ShortWrite {
        path: String,
        written: usize,
        expected: usize,
    },

    #[error("local file {}: {source}", path.display())]
    Local { path: PathBuf, source: io::Error },

    #[error("argument contains a NUL byte: {0}")]
    Nul(#[from] NulError),
}

//
// Public API
// Start with: SSH::connect
//

pub struct SSH {
    session: SSHSessionWrap,
    target: Target,
}

impl SSH {
    // libssh version
    pub fn version() -> String {
        unsafe { CStr::from_ptr(ssh_version(0)) }
            .to_string_lossy()
            .into_owned()
    }

    // connect and authenticate
    pub fn connect(target: &Target, log_level: LogLevel) -> Result<SSH, SshError> {
        let host = CString::new(target.host.as_str())?;
        let username = CString::new(target.user.as_str())?;
        let port = c_uint::from(target.port);

        unsafe { ssh_set_log_level(log_level) };
        let raw = unsafe { ssh_new() };
        if raw.is_null() {
            return Err(SshError::Alloc);
        }
        // wrapped straight away so every early return below frees it
        let session = SSHSessionWrap(raw);
        unsafe {
            ssh_options_set(raw, SSHOption::HOST, host.as_ptr() as *const c_void);
            ssh_options_set(raw, SSHOption::PORT, &port as *const c_uint as *const c_void);
            ssh_options_set(raw, SSHOption::USER, username.as_ptr() as *const c_void);
        }
        let connect_ret = unsafe { ssh_connect(raw) };
        if matches!(connect_ret, SSHResult::ERROR) {
            return Err(SshError::Connect {
                host: target.host.clone(),
                port: target.port,
                reason: session.last_error(),
            });
        }

        let is_known = unsafe { ssh_session_is_known_server(raw) };
        if !matches!(is_known, SSHKnownHostsResult::HOSTS_OK) {
            return Err(SshError::UnknownHost {
                host: target.host.clone(),
                state: format!("{is_known:?}"),
            });
        }

        let auth_ret = unsafe { ssh_userauth_agent(raw, username.as_ptr()) };
        if !matches!(auth_ret, SSHAuthResult::SUCCESS) {
            debug!("agent auth: {auth_ret:?}, trying default keys");
            let auth_ret =
                unsafe { ssh_userauth_publickey_auto(raw, username.as_ptr(), ptr::null()) };
            if !matches!(auth_ret, SSHAuthResult::SUCCESS) {
                return Err(SshError::Auth {
                    user: target.user.clone(),
                    reason: format!("{auth_ret:?}: {}", session.last_error()),
                });
            }
        }

        Ok(SSH {
            session,
            target: target.clone(),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    fn live_session(&self) -> Result<SSHSession, SshError> {
        if self.session.0.is_null() {
            return Err(SshError::Closed);
        }
        Ok(self.session.0)
    }
}

impl RemoteSession for SSH {
    fn new_shell_session(&self) -> Result<Box<dyn ShellSession + '_>, SshError> {
        let session = self.live_session()?;
        let channel = unsafe { ssh_channel_new(session) };
        if channel.is_null() {
            return Err(SshError::Channel(format!(
                "ssh_channel_new: {}",
                self.session.last_error()
            )));
        }
        // from here on Drop closes and frees the channel
        let channel = Channel {
            channel,
            ssh: self,
        };
        let ses_ret = unsafe { ssh_channel_open_session(channel.channel) };
        if matches!(ses_ret, SSHResult::ERROR) {
            return Err(SshError::Channel(format!(
                "ssh_channel_open_session: {}",
                self.session.last_error()
            )));
        }
        Ok(Box::new(channel))
    }

    fn new_sftp_client(&self) -> Result<Box<dyn SftpClient + '_>, SshError> {
        let session = self.live_session()?;
        let sftp_session = unsafe { sftp_new(session) };
        if sftp_session.is_null() {
            return Err(SshError::Sftp {
                op: "new",
                path: String::new(),
                reason: self.session.last_error(),
            });
        }
        let sftp = SFTP {
            session: sftp_session,
            ssh: self,
        };
        let sftp_init_ret = unsafe { sftp_init(sftp.session) };
        if matches!(sftp_init_ret, SSHResult::ERROR) {
            return Err(sftp.error("init", ""));
        }
        Ok(Box::new(sftp))
    }

    fn close(&mut self) {
        self.session.close();
    }
}

/// Opens real connections with libssh.
#[derive(Debug, Clone, Copy)]
pub struct SshConnector {
    pub log_level: LogLevel,
}

impl Connector for SshConnector {
    fn connect(&self, target: &Target) -> Result<Box<dyn RemoteSession>, SshError> {
        Ok(Box::new(SSH::connect(target, self.log_level)?))
    }
}

// Wrap the pointer so we can implement Drop
struct SSHSessionWrap(SSHSession);

impl SSHSessionWrap {
    fn last_error(&self) -> String {
        if self.0.is_null() {
            return "session closed".to_string();
        }
        unsafe { CStr::from_ptr(ssh_get_error(self.0)) }
            .to_string_lossy()
            .into_owned()
    }

    fn close(&mut self) {
        if self.0.is_null() {
            return;
        }
        unsafe {
            ssh_disconnect(self.0);
            ssh_free(self.0);
        }
        self.0 = ptr::null_mut();
    }
}

impl Drop for SSHSessionWrap {
    fn drop(&mut self) {
        self.close();
    }
}

// One exec channel. Closed and freed on drop.
pub struct Channel<'a> {
    channel: SSHChannel,
    ssh: &'a SSH,
}

impl Channel<'_> {
    fn read_stream(&self, is_stderr: c_uint) -> Result<String, SshError> {
        let mut output = String::new();
        let mut buffer = vec![0u8; SSH_CMD_BUF_SIZE];
        loop {
            let nbytes = unsafe {
                ssh_channel_read(
                    self.channel,
                    buffer.as_mut_ptr(),
                    buffer.len() as u32,
                    is_stderr,
                )
            };
            if nbytes == 0 {
                break;
            }
            if nbytes < 0 {
                return Err(SshError::Channel(format!(
                    "ssh_channel_read: {}",
                    self.ssh.session.last_error()
                )));
            }
            output += &String::from_utf8_lossy(&buffer[..nbytes as usize]);
        }
        Ok(output)
    }

    fn write_all(&self, mut data: &[u8]) -> Result<(), SshError> {
        while !data.is_empty() {
            let n = unsafe {
                ssh_channel_write(self.channel, data.as_ptr() as *const c_void, data.len() as u32)
            };
            if n <= 0 {
                return Err(SshError::Channel(format!(
                    "ssh_channel_write: {}",
                    self.ssh.session.last_error()
                )));
            }
            data = &data[n as usize..];
        }
        Ok(())
    }
}

// No status but still connected means the remote process died from a signal.
// Reported like a local process killed by one.
fn exit_status(raw: c_int, connected: bool) -> Option<i32> {
    match (raw, connected) {
        (status, _) if status >= 0 => Some(status),
        (_, true) => Some(-1),
        (_, false) => None,
    }
}

impl ShellSession for Channel<'_> {
    fn exec(&mut self, cmd: &str, stdin: Option<&str>) -> Result<ExecOutput, SshError> {
        let c_cmd = CString::new(cmd)?;
        let rc = unsafe { ssh_channel_request_exec(self.channel, c_cmd.as_ptr()) };
        if matches!(rc, SSHResult::ERROR) {
            return Err(SshError::Channel(format!(
                "ssh_channel_request_exec '{cmd}': {}",
                self.ssh.session.last_error()
            )));
        }

        if let Some(input) = stdin {
            self.write_all(input.as_bytes())?;
        }
        unsafe { ssh_channel_send_eof(self.channel) };
        let stdout = self.read_stream(0)?;
        let stderr = self.read_stream(1)?;

        let raw = unsafe { ssh_channel_get_exit_status(self.channel) };
        let connected = unsafe { ssh_is_connected(self.ssh.session.0) } != 0;
        let status = exit_status(raw, connected).ok_or_else(|| {
            SshError::Channel(format!(
                "connection lost running '{cmd}': {}",
                self.ssh.session.last_error()
            ))
        })?;
        Ok(ExecOutput {
            stdout,
            stderr,
            status,
        })
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        unsafe {
            ssh_channel_close(self.channel);
            ssh_channel_free(self.channel);
        }
    }
}

pub struct SFTP<'a> {
    session: SFTPSession,
    ssh: &'a SSH,
}

impl SFTP<'_> {
    pub fn open(&self, filename: &str, mode: u32, perms: u32) -> Result<SFTPFile<'_>, SshError> {
        let remote_filename = CString::new(filename)?;
        let handle = unsafe { sftp_open(self.session, remote_filename.as_ptr(), mode, perms) };
        if handle.is_null() {
            return Err(self.error("open", filename));
        }
        Ok(SFTPFile {
            handle,
            _sftp: PhantomData,
        })
    }

    fn error(&self, op: &'static str, path: &str) -> SshError {
        let sftp_err_num = unsafe { sftp_get_error(self.session) };
        SshError::Sftp {
            op,
            path: path.to_string(),
            reason: format!(
                "{}. SFTP err num: {:?}.",
                self.ssh.session.last_error(),
                sftp_err_num
            ),
        }
    }
}

impl SftpClient for SFTP<'_> {
    // src: local path of the file to upload
    // dst: remote path of destination file to create or overwrite
    fn transfer_executable(&mut self, src: &Path, dst: &str) -> Result<(), SshError> {
        let local_err = |source| SshError::Local {
            path: src.to_path_buf(),
            source,
        };
        let data = fs::read(src).map_err(local_err)?;
        let perms = fs::metadata(src).map_err(local_err)?.permissions().mode() & 0o7777;

        {
            let sfile = self.open(dst, O_WRONLY | O_CREAT | O_TRUNC, perms)?;
            for chunk in data.chunks(SFTP_CHUNK_SIZE) {
                let ret = sfile.write(chunk);
                if ret < 0 {
                    return Err(self.error("write", dst));
                }
                let bytes_written = ret as usize;
                if bytes_written != chunk.len() {
                    return Err(SshError::ShortWrite {
                        path: dst.to_string(),
                        written: bytes_written,
                        expected: chunk.len(),
                    });
                }
            }
        }

        // open only applies perms to new files, and the remote umask may strip them
        let c_dst = CString::new(dst)?;
        let ret = unsafe { sftp_chmod(self.session, c_dst.as_ptr(), perms) };
        if ret < 0 {
            return Err(self.error("chmod", dst));
        }
        debug!("uploaded {} -> {dst} ({perms:o})", src.display());
        Ok(())
    }
}

impl Drop for SFTP<'_> {
    fn drop(&mut self) {
        unsafe {
            sftp_free(self.session);
        }
    }
}

pub struct SFTPFile<'a> {
    handle: SFTPFileHandle,
    _sftp: PhantomData<&'a ()>,
}

impl SFTPFile<'_> {
    pub fn write(&self, data: &[u8]) -> i32 {
        unsafe { sftp_write(self.handle, data.as_ptr(), data.len() as u32) }
    }
}

impl Drop for SFTPFile<'_> {
    fn drop(&mut self) {
        let sftp_close_ret = unsafe { sftp_close(self.handle) };
        if matches!(sftp_close_ret, SSHResult::ERROR) {
            warn!("sftp_close err");
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(i32)]
pub enum LogLevel {
    NOLOG = 0, // No logging at all
    WARNING,   // Only warnings
    PROTOCOL,  // High level protocol information
    PACKET,    // Lower level protocol infomations, packet level
    FUNCTIONS, // Every function path
}

// Stands in for a server on --dry-run: reports what would happen and succeeds.
pub struct MockSSH {}

impl Connector for MockSSH {
    fn connect(&self, target: &Target) -> Result<Box<dyn RemoteSession>, SshError> {
        info!("would connect to {target}");
        Ok(Box::new(MockSSH {}))
    }
}

impl RemoteSession for MockSSH {
    fn new_shell_session(&self) -> Result<Box<dyn ShellSession + '_>, SshError> {
        Ok(Box::new(MockSSH {}))
    }
    fn new_sftp_client(&self) -> Result<Box<dyn SftpClient + '_>, SshError> {
        Ok(Box::new(MockSSH {}))
    }
    fn close(&mut self) {}
}

impl ShellSession for MockSSH {
    fn exec(&mut self, cmd: &str, _stdin: Option<&str>) -> Result<ExecOutput, SshError> {
        info!("would run remote cmd '{cmd}'");
        Ok(ExecOutput::default())
    }
}

impl SftpClient for MockSSH {
    fn transfer_executable(&mut self, src: &Path, dst: &str) -> Result<(), SshError> {
        info!("would upload {} -> {dst}", src.display());
        Ok(())
    }
}

//
// Internal
//

type SSHSession = *mut c_void;
type SSHChannel = *mut c_void;
type SFTPSession = *mut c_void;
type SFTPFileHandle = *mut c_void;

#[repr(u32)]
enum SSHOption {
    HOST = 0,
    PORT,
    PORT_STR,
    FD,
    USER,
    SSH_DIR,
    IDENTITY,
    ADD_IDENTITY,
    KNOWNHOSTS,
}

#[repr(i32)]
enum SSHResult {
    ERROR = -1,
    OK = 0,
}

#[derive(Debug)]
#[repr(i32)]
enum SSHKnownHostsResult {
    // There had been an error checking the host.
    HOSTS_ERROR = -2,

    // The known host file does not exist. The host is thus unknown. File will
    // be created if host key is accepted.
    SSH_KNOWN_HOSTS_NOT_FOUND = -1,

    // The server is unknown. User should confirm the public key hash is correct.
    HOSTS_UNKNOWN = 0,

    // The server is known and has not changed.
    HOSTS_OK = 1,

    // The server key has changed. Either you are under attack or the
    // administrator changed the key. You HAVE to warn the user about a
    // possible attack.
    HOSTS_CHANGED = 2,

    // The server gave use a key of a type while we had an other type recorded.
    // It is a possible attack.
    HOSTS_OTHER = 3,
}

#[derive(Debug, PartialEq)]
#[repr(u32)]
enum SFTPError {
    /** No error */
    SSH_FX_OK = 0,
    /** End-of-file encountered */
    SSH_FX_EOF = 1,
    /** File doesn't exist */
    SSH_FX_NO_SUCH_FILE = 2,
    /** Permission denied */
    SSH_FX_PERMISSION_DENIED = 3,
    /** Generic failure */
    SSH_FX_FAILURE = 4,
    /** Garbage received from server */
    SSH_FX_BAD_MESSAGE = 5,
    /** No connection has been set up */
    SSH_FX_NO_CONNECTION = 6,
    /** There was a connection, but we lost it */
    SSH_FX_CONNECTION_LOST = 7,
    /** Operation not supported by the server */
    SSH_FX_OP_UNSUPPORTED = 8,
    /** Invalid file handle */
    SSH_FX_INVALID_HANDLE = 9,
    /** No such file or directory path exists */
    SSH_FX_NO_SUCH_PATH = 10,
    /** An attempt to create an already existing file or directory has been made */
    SSH_FX_FILE_ALREADY_EXISTS = 11,
    /** We are trying to write on a write-protected filesystem */
    SSH_FX_WRITE_PROTECT = 12,
    /** No media in remote drive */
    SSH_FX_NO_MEDIA = 13,
}

#[derive(Debug)]
#[repr(i32)]
enum SSHAuthResult {
    SUCCESS = 0,
    DENIED,
    PARTIAL,
    INFO,
    AGAIN,
    ERROR = -1,
}

//
// FFI
// Wrap libssh. The below is from /usr/include/libssh/libssh.h and sftp.h

#[link(name = "ssh")]
extern "C" {
    fn ssh_version(min: c_uint) -> *const c_char;
    fn ssh_set_log_level(level: LogLevel) -> c_int;
    fn ssh_options_set(s: SSHSession, opt_type: SSHOption, value: *const c_void) -> c_int;

    fn ssh_new() -> SSHSession;
    fn ssh_free(s: SSHSession);

    fn ssh_connect(s: SSHSession) -> SSHResult;
    fn ssh_disconnect(s: SSHSession);

    fn ssh_get_error(s: SSHSession) -> *const c_char;
    fn ssh_is_connected(s: SSHSession) -> c_int;
    fn ssh_session_is_known_server(s: SSHSession) -> SSHKnownHostsResult;

    fn ssh_userauth_agent(s: SSHSession, username: *const c_char) -> SSHAuthResult;
    fn ssh_userauth_publickey_auto(
        s: SSHSession,
        username: *const c_char,
        passphrase: *const c_char,
    ) -> SSHAuthResult;

    fn ssh_channel_new(s: SSHSession) -> SSHChannel;
    fn ssh_channel_free(c: SSHChannel);
    fn ssh_channel_open_session(c: SSHChannel) -> SSHResult;
    fn ssh_channel_request_exec(c: SSHChannel, cmd: *const c_char) -> SSHResult;
    fn ssh_channel_read(c: SSHChannel, dest: *mut u8, count: u32, is_stderr: c_uint) -> c_int;
    fn ssh_channel_write(c: SSHChannel, data: *const c_void, len: u32) -> c_int;
    fn ssh_channel_send_eof(c: SSHChannel) -> c_int;
    fn ssh_channel_close(c: SSHChannel) -> c_int;
    fn ssh_channel_get_exit_status(c: SSHChannel) -> c_int;

    fn sftp_new(s: SSHSession) -> SFTPSession;
    fn sftp_free(sftp: SFTPSession);
    fn sftp_init(sftp: SFTPSession) -> SSHResult;
    fn sftp_get_error(sftp: SFTPSession) -> SFTPError;
    fn sftp_chmod(sftp: SFTPSession, file: *const c_char, mode: c_uint) -> c_int;

    fn sftp_open(
        sftp: SFTPSession,
        file: *const c_char,
        accesstype: c_uint,
        mode: c_uint,
    ) -> SFTPFileHandle;
    fn sftp_write(sfile: SFTPFileHandle, buf: *const u8, count: c_uint) -> i32;
    fn sftp_close(sfile: SFTPFileHandle) -> SSHResult;
}
