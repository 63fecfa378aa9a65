//! In-memory transport for executor and server tests.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;

use super::credential::ClientCredential;
use super::error::ExecError;
use super::host::{HostDetails, HostResolver, LocalIdentity, ResolvePolicy};
use super::session::{ChannelEvent, RemoteSession, SessionFactory};

pub(crate) fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("testdata")
        .join(name)
}

/// Resolver that maps every host to the unencrypted fixture key.
///
/// The returned file must outlive the resolver.
pub(crate) fn fixture_resolver() -> (NamedTempFile, HostResolver) {
    let identity = fixture("id_ed25519_test");
    config_resolver(&format!("Host *\n    IdentityFile {}\n", identity.display()))
}

pub(crate) fn config_resolver(content: &str) -> (NamedTempFile, HostResolver) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();

    let resolver = HostResolver::new(
        Some(file.path().to_path_buf()),
        None,
        ResolvePolicy::ExactThenWildcard,
        Some(LocalIdentity {
            user: "tester".to_string(),
            home: PathBuf::from("/home/tester"),
        }),
    );
    (file, resolver)
}

pub(crate) fn output(text: &str) -> ChannelEvent {
    ChannelEvent::Output(Bytes::copy_from_slice(text.as_bytes()))
}

/// Scripted [`SessionFactory`] counting opens and closes.
#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    pub events: Vec<ChannelEvent>,
    pub exec_error: Option<String>,
    /// Fail `open` with `DialFailed`
    pub refuse: bool,
    /// Block forever once the scripted events are exhausted
    pub hang: bool,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub opened: Arc<Mutex<Vec<HostDetails>>>,
    pub executed: Arc<Mutex<Vec<String>>>,
}

impl FakeFactory {
    pub fn with_events(events: Vec<ChannelEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn open(
        &self,
        details: &HostDetails,
        _credential: &ClientCredential,
    ) -> Result<FakeSession, ExecError> {
        if self.refuse {
            return Err(ExecError::DialFailed {
                address: details.address(),
                reason: "connection refused".to_string(),
            });
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(details.clone());

        Ok(FakeSession {
            events: self.events.iter().cloned().collect(),
            exec_error: self.exec_error.clone(),
            hang: self.hang,
            closes: self.closes.clone(),
            executed: self.executed.clone(),
        })
    }
}

pub(crate) struct FakeSession {
    events: VecDeque<ChannelEvent>,
    exec_error: Option<String>,
    hang: bool,
    closes: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&mut self, command: &str) -> Result<(), String> {
        self.executed.lock().unwrap().push(command.to_string());
        match self.exec_error.take() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn next_event(&mut self) -> ChannelEvent {
        match self.events.pop_front() {
            Some(event) => event,
            None if self.hang => std::future::pending().await,
            None => ChannelEvent::Closed,
        }
    }

    async fn close(self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
