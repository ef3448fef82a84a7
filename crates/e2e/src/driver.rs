//! Browser driver seam
//!
//! The runner only talks to a page through [`Driver`]. The production
//! implementation is [`crate::playwright::PlaywrightDriver`]; tests plug in
//! an in-memory app.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::E2eResult;
use crate::fixtures::SessionCookie;
use crate::intercept::{NetworkEvent, Route};
use crate::selector::Target;
use crate::spec::Viewport;

/// Observable state of one matched element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub value: Option<String>,
}

impl ElementState {
    pub fn visible(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            visible: true,
            ..Default::default()
        }
    }
}

/// A single page in an isolated browser context
#[async_trait]
pub trait Driver: Send {
    /// Navigate to a path (or absolute URL) and wait for the load event
    async fn visit(&mut self, url: &str) -> E2eResult<()>;

    async fn click(&mut self, target: &Target) -> E2eResult<()>;

    /// Append text to the target's input, as a user typing
    async fn type_text(&mut self, target: &Target, text: &str) -> E2eResult<()>;

    async fn clear(&mut self, target: &Target) -> E2eResult<()>;

    async fn blur(&mut self, target: &Target) -> E2eResult<()>;

    /// Every element the target resolves to: the `index`-th selector match
    /// (or all of them), narrowed by `find`. Actions use the first entry.
    /// An empty vector means nothing matched.
    async fn query(&mut self, target: &Target) -> E2eResult<Vec<ElementState>>;

    /// Path of the current URL
    async fn pathname(&mut self) -> E2eResult<String>;

    async fn url(&mut self) -> E2eResult<String>;

    async fn add_cookies(&mut self, cookies: &[SessionCookie]) -> E2eResult<()>;

    /// Install a stubbed response for a route
    async fn stub_route(&mut self, route: &Route) -> E2eResult<()>;

    /// Network events observed since the last call
    async fn drain_network(&mut self) -> E2eResult<Vec<NetworkEvent>>;

    /// Full-page PNG of the current render
    async fn screenshot(&mut self) -> E2eResult<Vec<u8>>;

    /// Serialized DOM of the current page
    async fn dom_snapshot(&mut self) -> E2eResult<String>;

    async fn close(&mut self) -> E2eResult<()>;
}

/// Opens a fresh driver per scenario
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self, viewport: &Viewport) -> E2eResult<Box<dyn Driver>>;
}
