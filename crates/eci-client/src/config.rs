//! Client configuration and host executable resolution.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Overrides the whole host command line (whitespace separated).
pub const HOST_COMMAND_ENV: &str = "ECI_HOST_COMMAND";
/// Directory holding the bundled host executable.
pub const HOST_DIR_ENV: &str = "ECI_HOST_DIR";
/// Directory the host writes its log file into.
pub const LOG_DIR_ENV: &str = "ECI_LOG_DIR";

/// File name of the bundled host executable.
#[cfg(windows)]
pub const HOST_EXECUTABLE: &str = "eci-host.exe";
/// File name of the bundled host executable.
#[cfg(not(windows))]
pub const HOST_EXECUTABLE: &str = "eci-host";

/// Tunables for the engine client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full host command line; takes priority over `host_dir`.
    pub host_command: Option<String>,
    /// Directory searched for [`HOST_EXECUTABLE`] before `PATH`.
    pub host_dir: Option<PathBuf>,
    /// Passed to the host as `--log-dir`.
    pub log_dir: PathBuf,
    /// How long a synchronous command waits for its response.
    pub reply_timeout: Duration,
    /// How long startup waits for the host to connect back and authenticate.
    pub connect_timeout: Duration,
    /// Bound on joining the receiver thread during shutdown.
    pub receiver_join_timeout: Duration,
    /// Bound on joining the audio and synthesis workers.
    pub worker_join_timeout: Duration,
    /// Grace period between graceful and forced termination.
    pub terminate_grace: Duration,
    /// Maximum queued audio chunks before the receiver blocks.
    pub audio_queue_capacity: usize,
    /// Playback buffering target for the output device.
    pub device_buffer_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_command: None,
            host_dir: None,
            log_dir: env::temp_dir(),
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            receiver_join_timeout: Duration::from_secs(2),
            worker_join_timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(2),
            audio_queue_capacity: 512,
            device_buffer_ms: 1500,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `ECI_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Blank values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(command) = get(HOST_COMMAND_ENV) {
            config.host_command = Some(command);
        }
        if let Some(dir) = get(HOST_DIR_ENV) {
            config.host_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = get(LOG_DIR_ENV) {
            config.log_dir = PathBuf::from(dir);
        }
        config
    }

    /// Locate the host executable.
    ///
    /// Resolution order:
    /// 1. `host_command` (program plus leading arguments, split with shell
    ///    quoting rules)
    /// 2. `<host_dir>/eci-host`
    /// 3. `eci-host` on `PATH`
    pub fn resolve_host(&self) -> Result<HostCommand> {
        if let Some(line) = &self.host_command {
            let words = shlex::split(line).ok_or_else(|| {
                ClientError::HostMissing(format!("{HOST_COMMAND_ENV} has unbalanced quotes"))
            })?;
            let mut parts = words.into_iter();
            let program = parts
                .next()
                .ok_or_else(|| ClientError::HostMissing(format!("{HOST_COMMAND_ENV} is empty")))?;
            return Ok(HostCommand {
                program: PathBuf::from(program),
                args: parts.collect(),
                source: HostSource::Command,
            });
        }

        if let Some(dir) = &self.host_dir {
            let candidate = dir.join(HOST_EXECUTABLE);
            if candidate.is_file() {
                return Ok(HostCommand::bare(candidate, HostSource::HostDir));
            }
        }

        which::which(HOST_EXECUTABLE)
            .map(|path| HostCommand::bare(path, HostSource::Path))
            .map_err(|_| {
                let searched = self
                    .host_dir
                    .as_deref()
                    .map_or_else(|| "PATH".to_string(), |d| format!("{} and PATH", d.display()));
                ClientError::HostMissing(format!("{HOST_EXECUTABLE} not found in {searched}"))
            })
    }
}

/// Where the host command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSource {
    /// [`HOST_COMMAND_ENV`] / `host_command`.
    Command,
    /// The configured host directory.
    HostDir,
    /// Found on `PATH`.
    Path,
}

/// Resolved host program plus any fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub source: HostSource,
}

impl HostCommand {
    const fn bare(program: PathBuf, source: HostSource) -> Self {
        Self {
            program,
            args: Vec::new(),
            source,
        }
    }

    /// Program path, for logging.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.reply_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.receiver_join_timeout, Duration::from_secs(2));
        assert_eq!(config.audio_queue_capacity, 512);
        assert!(config.host_command.is_none());
    }

    #[test]
    fn env_values_override_defaults_and_blanks_are_ignored() {
        let config = ClientConfig::from_lookup(lookup(&[
            (HOST_DIR_ENV, "/opt/eci"),
            (LOG_DIR_ENV, "  "),
        ]));
        assert_eq!(config.host_dir, Some(PathBuf::from("/opt/eci")));
        assert_eq!(config.log_dir, env::temp_dir());
    }

    #[test]
    fn host_command_is_split_into_program_and_args() {
        let config = ClientConfig::from_lookup(lookup(&[(
            HOST_COMMAND_ENV,
            "/usr/bin/wine  /opt/eci/eci-host.exe --verbose",
        )]));
        let host = config.resolve_host().unwrap();
        assert_eq!(host.source, HostSource::Command);
        assert_eq!(host.program, PathBuf::from("/usr/bin/wine"));
        assert_eq!(host.args, vec!["/opt/eci/eci-host.exe", "--verbose"]);
    }

    #[test]
    fn quoted_host_path_keeps_its_spaces() {
        let config = ClientConfig {
            host_command: Some(r#"wine "/opt/My Synth/eci-host.exe" --log 'a b'"#.into()),
            ..ClientConfig::default()
        };
        let host = config.resolve_host().unwrap();
        assert_eq!(host.program, PathBuf::from("wine"));
        assert_eq!(host.args, vec!["/opt/My Synth/eci-host.exe", "--log", "a b"]);
    }

    #[test]
    fn unbalanced_or_empty_host_command_is_rejected() {
        for line in [r#"wine "/opt/eci-host.exe"#, "   ", ""] {
            let config = ClientConfig {
                host_command: Some(line.into()),
                ..ClientConfig::default()
            };
            assert!(
                matches!(config.resolve_host(), Err(ClientError::HostMissing(_))),
                "accepted {line:?}"
            );
        }
    }

    #[test]
    fn host_dir_wins_over_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join(HOST_EXECUTABLE);
        fs::write(&exe, b"").unwrap();

        let config = ClientConfig {
            host_dir: Some(dir.path().to_path_buf()),
            ..ClientConfig::default()
        };
        let host = config.resolve_host().unwrap();
        assert_eq!(host.source, HostSource::HostDir);
        assert_eq!(host.program, exe);
        assert!(host.args.is_empty());
    }

    #[test]
    fn missing_host_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            host_dir: Some(dir.path().to_path_buf()),
            ..ClientConfig::default()
        };
        // Only meaningful when no eci-host is installed on the test machine.
        if which::which(HOST_EXECUTABLE).is_err() {
            assert!(matches!(
                config.resolve_host(),
                Err(ClientError::HostMissing(_))
            ));
        }
    }
}
