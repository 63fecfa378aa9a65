//! Command execution over an open session.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::config::Settings;
use super::credential::load_credential;
use super::error::ExecError;
use super::host::HostResolver;
use super::session::{ChannelEvent, RemoteSession, RusshSessionFactory, SessionFactory};

/// Run `command` on `session`, writing its combined output into `sink`.
///
/// Every output packet is written and flushed before the next one is read.
/// The session is closed before this returns, whatever the outcome.
pub async fn run_command<S, W>(
    mut session: S,
    command: &str,
    sink: &mut W,
    deadline: Duration,
) -> Result<(), ExecError>
where
    S: RemoteSession,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let outcome = tokio::time::timeout(deadline, drive(&mut session, command, sink)).await;
    session.close().await;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!("Command timed out after {:?}", deadline);
            Err(ExecError::CommandTimedOut(deadline))
        }
    }
}

async fn drive<S, W>(session: &mut S, command: &str, sink: &mut W) -> Result<(), ExecError>
where
    S: RemoteSession,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    session
        .exec(command)
        .await
        .map_err(|e| ExecError::CommandFailed(format!("failed to start command: {}", e)))?;

    let sink_failed = |e: std::io::Error| ExecError::CommandFailed(format!("output sink closed: {}", e));
    let mut exit_status: Option<u32> = None;

    loop {
        match session.next_event().await {
            ChannelEvent::Output(data) => {
                sink.write_all(&data).await.map_err(sink_failed)?;
                sink.flush().await.map_err(sink_failed)?;
            }
            ChannelEvent::ExitStatus(code) => {
                exit_status = Some(code);
            }
            ChannelEvent::ExitSignal(signal) => {
                return Err(ExecError::CommandFailed(format!(
                    "terminated by signal {}",
                    signal
                )));
            }
            ChannelEvent::Eof => {
                // Exit status may still follow EOF
                if exit_status.is_some() {
                    break;
                }
            }
            ChannelEvent::Closed => break,
        }
    }

    match exit_status {
        Some(0) => Ok(()),
        Some(code) => Err(ExecError::CommandFailed(format!(
            "process exited with status {}",
            code
        ))),
        None => Err(ExecError::CommandFailed(
            "channel closed without an exit status".to_string(),
        )),
    }
}

/// Resolve, authenticate, connect and run; the single entry point for callers.
///
/// Immutable once built, so one instance is shared by all requests.
#[derive(Debug)]
pub struct Executor<F: SessionFactory = RusshSessionFactory> {
    resolver: HostResolver,
    factory: F,
    command_timeout: Duration,
}

impl Executor<RusshSessionFactory> {
    pub fn from_settings(settings: &Settings) -> Self {
        let factory = RusshSessionFactory::new(
            settings.connect_timeout,
            settings.host_key_policy.clone(),
            settings.known_hosts.clone(),
        );
        Self::new(
            HostResolver::from_env(settings.resolve_policy),
            factory,
            settings.command_timeout,
        )
    }
}

impl<F: SessionFactory> Executor<F> {
    pub fn new(resolver: HostResolver, factory: F, command_timeout: Duration) -> Self {
        Self {
            resolver,
            factory,
            command_timeout,
        }
    }

    /// Run `command` on the host named by `host`, streaming output into `sink`.
    pub async fn execute<W>(&self, host: &str, command: &str, sink: &mut W) -> Result<(), ExecError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if host.trim().is_empty() {
            return Err(ExecError::InvalidInput(
                "host identifier must not be empty".to_string(),
            ));
        }
        if command.trim().is_empty() {
            return Err(ExecError::InvalidInput("command must not be empty".to_string()));
        }

        let details = self.resolver.resolve(host).await?;
        debug!(
            "Resolved '{}' to {}@{} with key {}",
            host,
            details.user,
            details.address(),
            details.identity_file.display()
        );

        let credential = load_credential(&details.identity_file).await?;

        let session = self.factory.open(&details, &credential).await?;
        info!("Session opened to {}@{}", details.user, details.address());
        debug!("Running command: {}", command);

        let result = run_command(session, command, sink, self.command_timeout).await;
        match &result {
            Ok(()) => info!("Command on {} completed", details.address()),
            Err(e) => warn!("Command on {} failed: {}", details.address(), e),
        }
        result
    }
}
