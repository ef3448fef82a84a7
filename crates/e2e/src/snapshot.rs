//! Visual snapshot recording
//!
//! Snapshots are captured for review elsewhere; nothing here diffs images.
//! A recorder receives the PNG (and DOM, when it asks for one) and returns a
//! record for the results file.

use async_trait::async_trait;
use image::GenericImageView;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{SnapshotConfig, SnapshotMode};
use crate::error::{E2eError, E2eResult};
use crate::spec::Viewport;

/// What the runner hands a recorder
#[derive(Debug, Clone)]
pub struct Capture {
    pub suite: String,
    pub scenario: String,
    pub name: String,
    pub url: String,
    pub viewport: Viewport,
    pub png: Vec<u8>,
    pub dom: Option<String>,
}

/// Where a snapshot ended up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub scenario: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub uploaded: bool,
}

#[async_trait]
pub trait SnapshotRecorder: Send + Sync {
    /// Whether captures must include a DOM serialization
    fn wants_dom(&self) -> bool {
        false
    }

    /// Whether captures are taken at all
    fn enabled(&self) -> bool {
        true
    }

    async fn record(&self, capture: Capture) -> E2eResult<SnapshotRecord>;

    /// Flush anything buffered at the end of a run
    async fn finish(&self) -> E2eResult<()> {
        Ok(())
    }
}

/// Build the recorder selected by configuration
pub async fn recorder_for(config: &SnapshotConfig) -> E2eResult<Box<dyn SnapshotRecorder>> {
    Ok(match config.mode {
        SnapshotMode::Disabled => Box::new(NoopRecorder),
        SnapshotMode::Directory => Box::new(DirectoryRecorder::new(config.dir.clone())?),
        SnapshotMode::Percy => Box::new(PercyRecorder::connect(&config.percy_server).await?),
    })
}

/// Drops every snapshot
pub struct NoopRecorder;

#[async_trait]
impl SnapshotRecorder for NoopRecorder {
    fn enabled(&self) -> bool {
        false
    }

    async fn record(&self, capture: Capture) -> E2eResult<SnapshotRecord> {
        Ok(SnapshotRecord {
            name: capture.name,
            scenario: capture.scenario,
            path: None,
            sha256: None,
            width: None,
            height: None,
            uploaded: false,
        })
    }
}

/// Writes PNGs under `<dir>/<suite>/<scenario>/<name>.png` and a manifest
pub struct DirectoryRecorder {
    dir: PathBuf,
    records: Mutex<Vec<SnapshotRecord>>,
}

impl DirectoryRecorder {
    pub fn new(dir: PathBuf) -> E2eResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }
}

#[async_trait]
impl SnapshotRecorder for DirectoryRecorder {
    async fn record(&self, capture: Capture) -> E2eResult<SnapshotRecord> {
        let (width, height) = image::load_from_memory(&capture.png)?.dimensions();

        let scenario_dir = self.dir.join(slug(&capture.suite)).join(slug(&capture.scenario));
        std::fs::create_dir_all(&scenario_dir)?;
        let path = scenario_dir.join(format!("{}.png", slug(&capture.name)));
        std::fs::write(&path, &capture.png)?;

        let record = SnapshotRecord {
            name: capture.name,
            scenario: capture.scenario,
            path: Some(path),
            sha256: Some(hash_bytes(&capture.png)),
            width: Some(width),
            height: Some(height),
            uploaded: false,
        };
        debug!("Snapshot '{}' written ({}x{})", record.name, width, height);
        self.records.lock().push(record.clone());
        Ok(record)
    }

    async fn finish(&self) -> E2eResult<()> {
        let records = self.records.lock().clone();
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(self.manifest_path(), json)?;
        info!("{} snapshot(s) recorded in {}", records.len(), self.dir.display());
        Ok(())
    }
}

/// Hands snapshots to a locally running Percy agent
pub struct PercyRecorder {
    client: reqwest::Client,
    server: String,
    available: AtomicBool,
}

impl PercyRecorder {
    /// Probe the agent; when it is not running snapshots are skipped
    pub async fn connect(server: &str) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let server = server.trim_end_matches('/').to_string();

        let available = match client.get(format!("{}/percy/healthcheck", server)).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Percy healthcheck returned {}; snapshots disabled", resp.status());
                false
            }
            Err(e) => {
                warn!("Percy is not running ({}); snapshots disabled", e);
                false
            }
        };

        Ok(Self {
            client,
            server,
            available: AtomicBool::new(available),
        })
    }
}

#[async_trait]
impl SnapshotRecorder for PercyRecorder {
    fn wants_dom(&self) -> bool {
        true
    }

    fn enabled(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn record(&self, capture: Capture) -> E2eResult<SnapshotRecord> {
        let dom = capture
            .dom
            .as_deref()
            .ok_or_else(|| E2eError::Snapshot(format!("'{}' captured without DOM", capture.name)))?;

        let body = serde_json::json!({
            "name": capture.name,
            "url": capture.url,
            "domSnapshot": dom,
            "widths": [capture.viewport.width],
            "clientInfo": concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        });

        let resp = self
            .client
            .post(format!("{}/percy/snapshot", self.server))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            self.available.store(false, Ordering::Relaxed);
            return Err(E2eError::Snapshot(format!(
                "Percy rejected '{}': {}",
                capture.name,
                resp.status()
            )));
        }

        Ok(SnapshotRecord {
            name: capture.name,
            scenario: capture.scenario,
            path: None,
            sha256: Some(hash_bytes(dom.as_bytes())),
            width: Some(capture.viewport.width),
            height: Some(capture.viewport.height),
            uploaded: true,
        })
    }
}

/// Filesystem-safe form of a snapshot or scenario name
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
