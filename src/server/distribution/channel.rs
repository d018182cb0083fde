//! Running commands and moving files on the hosts that receive
//! certificates.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::commons::error::CustodyIoError;
use crate::commons::util::file;

use super::DistributionError;

/// What ssh exits with when it could not connect or log in.
const SSH_FAILURE: i32 = 255;

/// What the remote read script exits with when there is no file.
const MISSING_FILE: i32 = 3;


//------------ FileMode ------------------------------------------------------

/// Permissions and ownership of an installed file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileMode {
    pub mode: u32,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl FileMode {
    pub fn new(mode: u32) -> Self {
        FileMode { mode, owner: None, group: None }
    }

    pub fn with_owner(mut self, owner: Option<String>, group: Option<String>) -> Self {
        self.owner = owner;
        self.group = group;
        self
    }

    /// The argument for `chown`, if ownership is to be changed at all.
    fn chown_spec(&self) -> Option<String> {
        match (&self.owner, &self.group) {
            (None, None) => None,
            (Some(owner), None) => Some(owner.clone()),
            (None, Some(group)) => Some(format!(":{}", group)),
            (Some(owner), Some(group)) => Some(format!("{}:{}", owner, group)),
        }
    }
}


//------------ CommandOutput -------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// The exit code, `None` if the command was killed.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Turns a non-zero exit into an error naming `what` was run.
    pub fn check(self, what: &str) -> Result<Self, DistributionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(DistributionError::Command {
                command: what.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}


//------------ RemoteChannel -------------------------------------------------

/// Shell access to a host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Whether the channel runs on the host that generated the keys.
    ///
    /// Keys of templates that do not allow export are only handed to
    /// local channels.
    fn is_local(&self) -> bool;

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, DistributionError>;

    /// Reads a file, `None` if there is none.
    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, DistributionError>;

    /// Replaces a file in one rename so a service never reads a half
    /// written certificate.
    async fn write_file(&self, path: &Path, content: &[u8], mode: &FileMode) -> Result<(), DistributionError>;

    /// Removes a file. A missing file is fine.
    async fn remove_file(&self, path: &Path) -> Result<(), DistributionError>;
}

async fn execute(mut command: Command, stdin: Option<&[u8]>) -> std::io::Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
        }
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        status: output.status.code(),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quotes a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}


//------------ LocalChannel --------------------------------------------------

/// The host this daemon runs on.
#[derive(Clone, Debug, Default)]
pub struct LocalChannel;

impl LocalChannel {
    async fn blocking<T, F>(op: F) -> Result<T, DistributionError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CustodyIoError> + Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| DistributionError::Io(e.to_string()))?
            .map_err(|e| DistributionError::Io(e.to_string()))
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    fn is_local(&self) -> bool {
        true
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, DistributionError> {
        trace!("Running locally: {}", command);
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command);
        execute(shell, stdin)
            .await
            .map_err(|e| DistributionError::Io(format!("cannot run '{}': {}", command, e)))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, DistributionError> {
        let path = path.to_path_buf();
        Self::blocking(move || file::read_optional(&path)).await
    }

    async fn write_file(&self, path: &Path, content: &[u8], mode: &FileMode) -> Result<(), DistributionError> {
        let target = path.to_path_buf();
        let content = content.to_vec();
        let unix_mode = mode.mode;
        Self::blocking(move || file::save_atomic(&content, &target, Some(unix_mode))).await?;

        if let Some(spec) = mode.chown_spec() {
            let command = format!("chown {} {}", shell_quote(&spec), quote_path(path));
            self.run(&command, None).await?.check(&command)?;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), DistributionError> {
        let path = path.to_path_buf();
        Self::blocking(move || file::delete_file(&path)).await
    }
}


//------------ SshChannel ----------------------------------------------------

/// A host reached through the system's `ssh` client.
///
/// Authentication is left to the ssh configuration of the user running
/// the daemon; the client runs in batch mode and never prompts. The file
/// operations expect a POSIX shell on the far end.
#[derive(Clone)]
pub struct SshChannel {
    host: String,
    user: Option<String>,
    port: Option<u16>,
}

impl SshChannel {
    pub fn new(host: impl Into<String>) -> Self {
        SshChannel { host: host.into(), user: None, port: None }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=15"]);
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command.arg(self.destination()).arg("--").arg(remote);
        command
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn is_local(&self) -> bool {
        false
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, DistributionError> {
        debug!("Running on {}: {}", self.destination(), command);
        let output = execute(self.command(command), stdin)
            .await
            .map_err(|e| DistributionError::Io(format!("cannot start ssh: {}", e)))?;

        if output.status == Some(SSH_FAILURE) {
            let msg = format!("{}: {}", self.destination(), output.stderr.trim());
            return Err(if output.stderr.contains("Permission denied") {
                DistributionError::Authentication(msg)
            } else {
                DistributionError::Unreachable(msg)
            });
        }
        Ok(output)
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, DistributionError> {
        let quoted = quote_path(path);
        let command = format!("if [ -f {0} ]; then cat -- {0}; else exit {1}; fi", quoted, MISSING_FILE);
        let output = self.run(&command, None).await?;
        if output.status == Some(MISSING_FILE) {
            return Ok(None);
        }
        Ok(Some(output.check(&format!("read {}", path.display()))?.stdout))
    }

    async fn write_file(&self, path: &Path, content: &[u8], mode: &FileMode) -> Result<(), DistributionError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let template = format!("{}/.custodian.XXXXXX", dir.display());
        let mut script = format!(
            "set -e; umask 077; tmp=$(mktemp {}); trap 'rm -f \"$tmp\"' EXIT; cat > \"$tmp\"; chmod {:o} \"$tmp\"",
            shell_quote(&template),
            mode.mode
        );
        if let Some(spec) = mode.chown_spec() {
            script.push_str(&format!("; chown {} \"$tmp\"", shell_quote(&spec)));
        }
        script.push_str(&format!("; mv -f \"$tmp\" {}", quote_path(path)));

        self.run(&script, Some(content))
            .await?
            .check(&format!("write {}", path.display()))?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), DistributionError> {
        let command = format!("rm -f -- {}", quote_path(path));
        self.run(&command, None).await?.check(&command)?;
        Ok(())
    }
}

impl fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SshChannel({})", self.destination())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(FileMode::new(0o600).chown_spec(), None);
        assert_eq!(
            FileMode::new(0o600).with_owner(None, Some("ssl-cert".into())).chown_spec(),
            Some(":ssl-cert".to_string())
        );
    }

    #[test]
    fn ssh_destination() {
        let channel = SshChannel::new("web1.example.com").with_user(Some("deploy".into())).with_port(Some(2222));
        assert_eq!(channel.destination(), "deploy@web1.example.com");
        assert!(!channel.is_local());
        assert_eq!(format!("{:?}", channel), "SshChannel(deploy@web1.example.com)");
    }

    #[tokio::test]
    async fn local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tls").join("server.key");
        let channel = LocalChannel;

        assert_eq!(channel.read_file(&path).await.unwrap(), None);
        channel.write_file(&path, b"secret", &FileMode::new(0o600)).await.unwrap();
        assert_eq!(channel.read_file(&path).await.unwrap(), Some(b"secret".to_vec()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        channel.remove_file(&path).await.unwrap();
        channel.remove_file(&path).await.unwrap();
        assert_eq!(channel.read_file(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_commands() {
        let channel = LocalChannel;
        let output = channel.run("cat", Some(b"hello")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello");

        let err = channel.run("echo oops >&2; exit 4", None).await.unwrap().check("oops").unwrap_err();
        assert_eq!(
            err,
            DistributionError::Command { command: "oops".into(), status: Some(4), stderr: "oops".into() }
        );
    }
}
