//! Process-spawn boundary: getting one side's `(address, auth key)` into a
//! freshly spawned peer before its first call.
//!
//! The initiator passes its bootstrap pair through environment variables
//! set on the child command; the child reads them once at startup with
//! [`BootstrapInfo::from_env`] and hands them to its channel.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::transport::AuthKey;

pub const ENV_PEER_ADDRESS: &str = "PEERLINK_PEER_ADDRESS";
pub const ENV_PEER_AUTH_KEY: &str = "PEERLINK_PEER_AUTH_KEY";
pub const ENV_PEER_NAME: &str = "PEERLINK_PEER_NAME";

const PROTOCOL_ENV_KEYS: [&str; 3] = [ENV_PEER_ADDRESS, ENV_PEER_AUTH_KEY, ENV_PEER_NAME];

/// The pair a peer needs to reach a server: where it listens and the
/// secret it requires.
#[derive(Debug, Clone)]
pub struct BootstrapInfo {
    pub address: String,
    pub auth_key: AuthKey,
}

impl BootstrapInfo {
    /// Read the pair a parent process left in the environment. Call once
    /// at peer startup, before the first remote call.
    pub fn from_env() -> Result<Self, RpcError> {
        let address = std::env::var(ENV_PEER_ADDRESS)
            .map_err(|_| RpcError::Bootstrap(format!("missing env var {ENV_PEER_ADDRESS}")))?;
        let auth_key = std::env::var(ENV_PEER_AUTH_KEY)
            .map_err(|_| RpcError::Bootstrap(format!("missing env var {ENV_PEER_AUTH_KEY}")))?;
        Ok(Self {
            address,
            auth_key: AuthKey::from(auth_key),
        })
    }

    pub fn env_vars(&self, peer_name: &str) -> Vec<(String, String)> {
        vec![
            (ENV_PEER_ADDRESS.to_string(), self.address.clone()),
            (ENV_PEER_AUTH_KEY.to_string(), self.auth_key.as_str().to_string()),
            (ENV_PEER_NAME.to_string(), peer_name.to_string()),
        ]
    }
}

/// Spawns the peer executable with the bootstrap pair in its environment
/// and its stdout/stderr forwarded into this process's log stream.
pub struct PeerProcessBuilder {
    program: PathBuf,
    peer_name: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
}

impl PeerProcessBuilder {
    pub fn new(program: impl Into<PathBuf>, peer_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            peer_name: peer_name.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    /// Spawn the current executable as the peer (the common single-binary
    /// setup: the child detects peer mode via [`ENV_PEER_NAME`]).
    pub fn current_exe(peer_name: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, peer_name))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Extra environment for the peer. Protocol-critical keys are refused
    /// so user values cannot shadow the bootstrap pair.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if PROTOCOL_ENV_KEYS.contains(&key.as_str()) {
            warn!(event = "bootstrap", status = "env_var_blocked", key = %key);
        } else {
            self.env_vars.push((key, value.into()));
        }
        self
    }

    /// Spawn the peer with `bootstrap` reaching it through the environment.
    pub fn spawn(self, bootstrap: &BootstrapInfo) -> std::io::Result<tokio::process::Child> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(std::env::vars());
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        // Protocol keys go last so nothing can override them.
        for (key, value) in bootstrap.env_vars(&self.peer_name) {
            cmd.env(key, value);
        }
        if let Ok(rust_log) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", rust_log);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        info!(event = "bootstrap", status = "spawned", peer = %self.peer_name, pid = child.id());

        if let Some(stdout) = child.stdout.take() {
            let peer = self.peer_name.clone();
            let mut lines = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "peer_stdout", peer = %peer, "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let peer = self.peer_name.clone();
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    error!(target: "peer_stderr", peer = %peer, "{line}");
                }
            });
        }
        Ok(child)
    }
}
