//! Fixtures shared by the agent tests

use super::{AgentOptions, UpdateAgent};
use crate::config::ServerConfig;
use crate::ddi::DdiClient;
use crate::installer::{Installer, LockKeeper, ProcessLock};
use async_trait::async_trait;
use mockito::ServerGuard;
use rauc_hawkbit_shared::DeploymentEvent;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PREFIX: &str = "/DEFAULT/controller/v1/test-target";
pub const BACKOFF: Duration = Duration::from_millis(300);

/// Base resource answering with `links` and a one second poll interval
pub async fn base_mock(server: &mut ServerGuard, links: Value) -> mockito::Mock {
    server
        .mock("GET", PREFIX)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "config": { "polling": { "sleep": "00:00:01" } },
                "_links": links
            })
            .to_string(),
        )
        .create_async()
        .await
}

/// Installer recording the bundles it was asked to install
#[derive(Default)]
pub struct MockInstaller {
    calls: Mutex<Vec<PathBuf>>,
    fail_with: Option<String>,
}

impl MockInstaller {
    pub fn failing(msg: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(msg.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Installer for MockInstaller {
    async fn install(&self, bundle: &Path) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(bundle.to_path_buf());
        match &self.fail_with {
            Some(msg) => anyhow::bail!("{}", msg),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Process lock recording every call made on it
#[derive(Default)]
pub struct RecordingLock {
    pub inner: ProcessLock,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingLock {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockKeeper for RecordingLock {
    async fn lock(&self, owner: &str) -> anyhow::Result<bool> {
        self.calls.lock().unwrap().push("lock");
        self.inner.lock(owner).await
    }

    async fn unlock(&self, owner: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push("unlock");
        self.inner.unlock(owner).await
    }
}

/// Request counter usable from mockito body callbacks
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    /// Count one request, returning the new total
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Body callback answering `body` and counting each request
    pub fn body(&self, body: Vec<u8>) -> impl Fn(&mockito::Request) -> Vec<u8> + Send + Sync + 'static {
        let counter = self.clone();
        move |_| {
            counter.increment();
            body.clone()
        }
    }

    pub async fn wait_for(&self, hits: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count() < hits {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for requests");
    }
}

pub struct Harness {
    pub agent: Arc<UpdateAgent>,
    pub installer: Arc<MockInstaller>,
    completions: Arc<Mutex<Vec<i32>>>,
    steps: Arc<Mutex<Vec<(i32, String)>>>,
    dir: TempDir,
}

impl Harness {
    pub fn new(server: &ServerGuard) -> Self {
        Self::build(server, MockInstaller::default(), None)
    }

    pub fn build(
        server: &ServerGuard,
        installer: MockInstaller,
        lock_keeper: Option<Arc<dyn LockKeeper>>,
    ) -> Self {
        let config = ServerConfig {
            host: server.host_with_port(),
            ssl: false,
            tenant_id: "DEFAULT".into(),
            target_name: "test-target".into(),
            auth_token: None,
            timeout_secs: 5,
        };
        let client = DdiClient::new(&config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let options = AgentOptions {
            attributes: BTreeMap::from([("vin".to_string(), "123".to_string())]),
            bundle_location: dir.path().join("bundle.raucb"),
            poll_error_backoff: BACKOFF,
            download_tries: 3,
            max_resumes: 2,
            owner: "test-target".into(),
        };

        let installer = Arc::new(installer);
        let completions = Arc::new(Mutex::new(Vec::new()));
        let steps = Arc::new(Mutex::new(Vec::new()));

        let completions_clone = completions.clone();
        let steps_clone = steps.clone();
        let mut agent = UpdateAgent::new(client, installer.clone(), options)
            .on_completion(move |code| completions_clone.lock().unwrap().push(code))
            .on_step(move |percentage, msg| {
                steps_clone
                    .lock()
                    .unwrap()
                    .push((percentage, msg.to_string()))
            });
        if let Some(lock_keeper) = lock_keeper {
            agent = agent.with_lock_keeper(lock_keeper);
        }

        Self {
            agent: Arc::new(agent),
            installer,
            completions,
            steps,
            dir,
        }
    }

    pub fn bundle(&self) -> PathBuf {
        self.dir.path().join("bundle.raucb")
    }

    pub fn completions(&self) -> Vec<i32> {
        self.completions.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<(i32, String)> {
        self.steps.lock().unwrap().clone()
    }

    /// Put the agent into the state of a triggered install for `action_id`
    pub async fn activate(&self, action_id: &str) {
        for event in [
            DeploymentEvent::DownloadStarted {
                action_id: action_id.to_string(),
            },
            DeploymentEvent::DownloadVerified,
            DeploymentEvent::InstallTriggered,
        ] {
            self.agent.transition(event).await;
        }
    }
}
