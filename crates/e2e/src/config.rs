//! Harness configuration
//!
//! Loaded from `e2e.toml` when present; every field has a default so an empty
//! or missing file yields a runnable configuration against a local dev stack.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::spec::Viewport;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Frontend origin that `visit` URLs are resolved against
    pub app_url: String,

    /// Backend origin used for fixtures and login
    pub api_url: String,

    /// Directory containing YAML suites
    pub specs_dir: PathBuf,

    /// Directory for results and snapshots
    pub output_dir: PathBuf,

    /// Default viewport (suites and scenarios may override)
    pub viewport: Viewport,

    /// Viewports narrower than this are treated as mobile
    pub mobile_breakpoint: u32,

    pub timeouts: TimeoutConfig,
    pub fixtures: FixtureConfig,
    pub browser: BrowserConfig,
    pub snapshots: SnapshotConfig,
    pub server: ServerConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:3000".to_string(),
            api_url: "http://localhost:3001".to_string(),
            specs_dir: PathBuf::from("specs"),
            output_dir: PathBuf::from("test-results"),
            viewport: Viewport::default(),
            mobile_breakpoint: 414,
            timeouts: TimeoutConfig::default(),
            fixtures: FixtureConfig::default(),
            browser: BrowserConfig::default(),
            snapshots: SnapshotConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> E2eResult<()> {
        for (key, url) in [("app_url", &self.app_url), ("api_url", &self.api_url)] {
            reqwest::Url::parse(url)
                .map_err(|e| E2eError::Config(format!("{} '{}' is not a valid URL: {}", key, url, e)))?;
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(E2eError::Config("timeouts.poll_interval_ms must be non-zero".to_string()));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(E2eError::Config("viewport dimensions must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn is_mobile(&self, viewport: &Viewport) -> bool {
        viewport.width < self.mobile_breakpoint
    }

    /// Resolve a path relative to the app origin
    pub fn app_endpoint(&self, path: &str) -> String {
        join_url(&self.app_url, path)
    }

    /// Resolve a path relative to the API origin
    pub fn api_endpoint(&self, path: &str) -> String {
        join_url(&self.api_url, path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Wait and retry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Retry window for assertions and element polling
    pub command_ms: u64,
    /// How long a waited alias may take to be requested
    pub request_ms: u64,
    /// How long a requested alias may take to complete
    pub response_ms: u64,
    pub poll_interval_ms: u64,
    /// Navigation (`visit` and the landing page) bound
    pub page_load_ms: u64,
    /// Whole-scenario bound
    pub scenario_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: 4000,
            request_ms: 5000,
            response_ms: 30000,
            poll_interval_ms: 50,
            page_load_ms: 60000,
            scenario_secs: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn page_load(&self) -> Duration {
        Duration::from_millis(self.page_load_ms)
    }

    pub fn scenario(&self) -> Duration {
        Duration::from_secs(self.scenario_secs)
    }
}

/// Test-data endpoints exposed by the application under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Password shared by every seeded user
    pub password: String,
    pub seed_path: String,
    pub users_path: String,
    pub login_path: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            password: "s3cret".to_string(),
            seed_path: "/testData/seed".to_string(),
            users_path: "/testData/users".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Playwright bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub kind: Browser,
    pub headless: bool,
    pub node_binary: PathBuf,
    /// `node_modules` directory that has `playwright` installed
    pub node_modules: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: Browser::Chromium,
            headless: true,
            node_binary: PathBuf::from("node"),
            node_modules: PathBuf::from("node_modules"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    Disabled,
    #[default]
    Directory,
    Percy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub mode: SnapshotMode,
    pub dir: PathBuf,
    pub percy_server: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            mode: SnapshotMode::Directory,
            dir: PathBuf::from("test-results/snapshots"),
            percy_server: "http://localhost:5338".to_string(),
        }
    }
}

/// Optional application process the harness starts itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program and arguments; empty means the app is already running
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub startup_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            cwd: None,
            startup_timeout_secs: 60,
        }
    }
}
