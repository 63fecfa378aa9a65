//! SSH session establishment.
//!
//! # Architecture
//!
//! - [`SessionFactory`]: opens an authenticated connection plus one execution
//!   channel with a pty. [`RusshSessionFactory`] is the russh implementation.
//! - [`RemoteSession`]: the execution channel as seen by the command executor.
//!   `close` consumes the session so it cannot be closed twice.
//! - [`HostKeyVerifier`]: russh client handler applying a [`HostKeyPolicy`].
//!
//! # Trust Boundary
//!
//! With [`HostKeyPolicy::AcceptAny`] the remote endpoint is not authenticated
//! at all (like `StrictHostKeyChecking=no`). Anyone able to intercept the TCP
//! connection can then receive the command and forge its output.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::{ChannelMsg, Disconnect, Pty, client, keys};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use super::credential::ClientCredential;
use super::error::ExecError;
use super::host::HostDetails;

/// Terminal type requested for every command
pub const PTY_TERM: &str = "xterm";
pub const PTY_WIDTH: u32 = 80;
pub const PTY_HEIGHT: u32 = 40;
/// Cosmetic line speed reported to the remote pty
pub const PTY_BAUD: u32 = 14400;

/// Terminal modes: echo off, fixed input/output speed.
pub const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, PTY_BAUD),
    (Pty::TTY_OP_OSPEED, PTY_BAUD),
];

/// How the server's host key is checked.
#[derive(Debug, Clone, Default)]
pub enum HostKeyPolicy {
    /// Key must already be listed in known_hosts.
    #[default]
    Strict,
    /// Unknown hosts are accepted and recorded; changed keys are rejected.
    TrustOnFirstUse,
    /// Key must equal this one.
    Pinned(keys::PublicKey),
    /// Any key is accepted. No authenticity check on the remote endpoint.
    AcceptAny,
}

impl FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix("pinned:") {
            // Accept both "AAAA..." and "ssh-ed25519 AAAA... comment"
            let encoded = key
                .split_whitespace()
                .find(|part| part.starts_with("AAAA"))
                .unwrap_or(key);
            return keys::parse_public_key_base64(encoded)
                .map(HostKeyPolicy::Pinned)
                .map_err(|e| format!("invalid pinned host key: {}", e));
        }

        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(HostKeyPolicy::Strict),
            "trust-on-first-use" | "tofu" => Ok(HostKeyPolicy::TrustOnFirstUse),
            "accept-any" | "insecure" => Ok(HostKeyPolicy::AcceptAny),
            other => Err(format!("unknown host key policy '{}'", other)),
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::Strict => f.write_str("strict"),
            HostKeyPolicy::TrustOnFirstUse => f.write_str("trust-on-first-use"),
            HostKeyPolicy::Pinned(_) => f.write_str("pinned"),
            HostKeyPolicy::AcceptAny => f.write_str("accept-any"),
        }
    }
}

/// russh client handler that verifies the server key against a policy.
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl HostKeyVerifier {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Option<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
            known_hosts,
        }
    }

    /// Decide whether `key` is acceptable for this host.
    pub fn verify(&self, key: &keys::PublicKey) -> bool {
        match &self.policy {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Pinned(pinned) => pinned.key_data() == key.key_data(),
            HostKeyPolicy::Strict => match self.check_known_hosts(key) {
                Ok(known) => known,
                Err(e) => {
                    warn!("Host key check for {}:{} failed: {}", self.host, self.port, e);
                    false
                }
            },
            HostKeyPolicy::TrustOnFirstUse => match self.check_known_hosts(key) {
                Ok(true) => true,
                Ok(false) => {
                    warn!(
                        "Trust-On-First-Use: accepting unknown host key for {}:{}",
                        self.host, self.port
                    );
                    if let Err(e) = self.learn(key) {
                        warn!("Failed to save host key to known_hosts: {}", e);
                    }
                    true
                }
                Err(keys::Error::KeyChanged { .. }) => {
                    warn!("Host key for {}:{} has changed", self.host, self.port);
                    false
                }
                Err(e) => {
                    warn!("Host key check for {}:{} failed: {}", self.host, self.port, e);
                    false
                }
            },
        }
    }

    fn check_known_hosts(&self, key: &keys::PublicKey) -> Result<bool, keys::Error> {
        match &self.known_hosts {
            Some(path) => check_known_hosts_path(&self.host, self.port, key, path),
            None => check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &keys::PublicKey) -> Result<(), keys::Error> {
        match &self.known_hosts {
            Some(path) => learn_known_hosts_path(&self.host, self.port, key, path),
            None => learn_known_hosts(&self.host, self.port, key),
        }
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.verify(server_public_key);
        debug!(
            "Host key for {}:{} {} by policy {}",
            self.host,
            self.port,
            if accepted { "accepted" } else { "rejected" },
            self.policy
        );
        Ok(accepted)
    }
}

/// One event read from an execution channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// stdout or stderr bytes, in arrival order
    Output(Bytes),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    /// The channel is gone; no further events follow.
    Closed,
}

/// An execution channel with an attached pty.
#[async_trait]
pub trait RemoteSession: Send + Sized {
    /// Start `command` on the channel.
    async fn exec(&mut self, command: &str) -> Result<(), String>;

    /// Wait for the next event.
    async fn next_event(&mut self) -> ChannelEvent;

    /// Close the channel and release the connection.
    async fn close(self);
}

/// Opens [`RemoteSession`]s for resolved hosts.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: RemoteSession + 'static;

    async fn open(
        &self,
        details: &HostDetails,
        credential: &ClientCredential,
    ) -> Result<Self::Session, ExecError>;
}

/// Build russh client configuration.
///
/// No inactivity timeout: commands may legitimately stay quiet for a long time
/// and the command deadline bounds them instead. Keepalives detect dead peers.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// [`SessionFactory`] backed by russh.
#[derive(Debug, Clone)]
pub struct RusshSessionFactory {
    connect_timeout: Duration,
    host_key_policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl RusshSessionFactory {
    pub fn new(
        connect_timeout: Duration,
        host_key_policy: HostKeyPolicy,
        known_hosts: Option<PathBuf>,
    ) -> Self {
        Self {
            connect_timeout,
            host_key_policy,
            known_hosts,
        }
    }
}

#[async_trait]
impl SessionFactory for RusshSessionFactory {
    type Session = RusshSession;

    /// Connect, authenticate, open a channel and request a pty.
    ///
    /// The whole sequence shares one deadline of `connect_timeout`. Expiry at
    /// any stage releases the connection and yields `DialFailed`.
    async fn open(
        &self,
        details: &HostDetails,
        credential: &ClientCredential,
    ) -> Result<RusshSession, ExecError> {
        let address = details.address();
        let deadline = Instant::now() + self.connect_timeout;
        let dial_failed = |reason: String| ExecError::DialFailed {
            address: address.clone(),
            reason,
        };
        let expired =
            |stage: &str| dial_failed(format!("{} timed out after {:?}", stage, self.connect_timeout));

        let verifier = HostKeyVerifier::new(
            details.host.clone(),
            details.port,
            self.host_key_policy.clone(),
            self.known_hosts.clone(),
        );
        let connect_future = client::connect(
            build_client_config(),
            (details.host.as_str(), details.port),
            verifier,
        );

        let mut handle = timeout_at(deadline, connect_future)
            .await
            .map_err(|_| expired("connection"))?
            .map_err(|e| dial_failed(e.to_string()))?;

        match timeout_at(deadline, credential.authenticate(&mut handle, &details.user)).await {
            Ok(Ok(true)) => debug!("Authenticated {}@{}", details.user, address),
            Ok(Ok(false)) => {
                disconnect(&handle).await;
                return Err(ExecError::AuthenticationRejected {
                    user: details.user.clone(),
                    address: address.clone(),
                });
            }
            Ok(Err(reason)) => {
                disconnect(&handle).await;
                return Err(dial_failed(reason));
            }
            Err(_) => {
                disconnect(&handle).await;
                return Err(expired("authentication"));
            }
        }

        let channel = match timeout_at(deadline, handle.channel_open_session()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                disconnect(&handle).await;
                return Err(ExecError::ChannelAllocationFailed(e.to_string()));
            }
            Err(_) => {
                disconnect(&handle).await;
                return Err(expired("channel allocation"));
            }
        };

        let mut session = RusshSession { handle, channel };
        match timeout_at(deadline, session.request_pty()).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(reason)) => {
                session.close().await;
                Err(ExecError::PtyRequestFailed(reason))
            }
            Err(_) => {
                session.close().await;
                Err(expired("pty request"))
            }
        }
    }
}

/// Upper bound on sending the disconnect message to an unresponsive peer
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

async fn disconnect<H: client::Handler>(handle: &client::Handle<H>) {
    match tokio::time::timeout(
        DISCONNECT_GRACE,
        handle.disconnect(Disconnect::ByApplication, "", "en"),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error during disconnect: {}", e),
        Err(_) => debug!("Disconnect not sent within {:?}", DISCONNECT_GRACE),
    }
}

/// Open connection plus its execution channel.
pub struct RusshSession {
    handle: client::Handle<HostKeyVerifier>,
    channel: russh::Channel<client::Msg>,
}

impl RusshSession {
    /// Request the pty and wait for the server's answer.
    async fn request_pty(&mut self) -> Result<(), String> {
        self.channel
            .request_pty(true, PTY_TERM, PTY_WIDTH, PTY_HEIGHT, 0, 0, PTY_MODES)
            .await
            .map_err(|e| e.to_string())?;

        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err("request denied by server".to_string()),
                Some(ChannelMsg::Close) | None => {
                    return Err("channel closed before reply".to_string());
                }
                Some(_) => {}
            }
        }
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn exec(&mut self, command: &str) -> Result<(), String> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| format!("Failed to execute command: {}", e))
    }

    async fn next_event(&mut self) -> ChannelEvent {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return ChannelEvent::Output(Bytes::copy_from_slice(&data));
                }
                // stderr is merged into the same stream
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return ChannelEvent::Output(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return ChannelEvent::ExitStatus(exit_status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    return ChannelEvent::ExitSignal(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => return ChannelEvent::Eof,
                Some(ChannelMsg::Close) | None => return ChannelEvent::Closed,
                Some(_) => {}
            }
        }
    }

    async fn close(self) {
        let _ = tokio::time::timeout(DISCONNECT_GRACE, self.channel.close()).await;
        disconnect(&self.handle).await;
    }
}
