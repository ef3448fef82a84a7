//! Declarative YAML scenario suites
//!
//! A suite mirrors a `describe` block: one `before_each` hook shared by an
//! ordered list of scenarios, each a flat list of steps.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{E2eError, E2eResult};
use crate::intercept::Route;
use crate::selector::Target;

/// A suite of scenarios parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags applied to every scenario in the suite
    #[serde(default)]
    pub tags: Vec<String>,

    /// Overrides the harness viewport for the whole suite
    #[serde(default)]
    pub viewport: Option<Viewport>,

    #[serde(default)]
    pub before_each: Hooks,

    pub scenarios: Vec<ScenarioSpec>,
}

/// Preconditions established before every scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hooks {
    /// Reset the backing store
    #[serde(default = "default_true")]
    pub seed: bool,

    /// Log in as a seeded user before the first step
    #[serde(default = "default_true")]
    pub authenticate: bool,

    /// Username to log in as; the first seeded user when absent
    #[serde(default)]
    pub user: Option<String>,

    /// Routes aliased before navigation
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Page opened right after login; `null` stays on about:blank
    #[serde(default = "default_landing")]
    pub landing_url: Option<String>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            seed: true,
            authenticate: true,
            user: None,
            routes: Vec::new(),
            landing_url: default_landing(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_landing() -> Option<String> {
    Some("/".to_string())
}

/// One scenario (an `it` block)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub viewport: Option<Viewport>,

    #[serde(default)]
    pub skip: bool,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 1000 }
    }
}

/// A single step in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to the app origin)
    Visit { url: String },

    Click { target: Target },

    /// Type text into an input
    Type { target: Target, text: String },

    /// Clear an input's value
    Clear { target: Target },

    Blur { target: Target },

    /// Alias a route mid-scenario, optionally stubbing its response
    Route {
        method: String,
        path: String,
        alias: String,
        #[serde(default)]
        stub: Option<serde_json::Value>,
    },

    /// Block until the next request for an alias completes
    Wait {
        alias: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Poll until an element reaches a state
    WaitFor {
        target: Target,
        #[serde(default)]
        state: WaitState,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Assert something about the matched elements
    Assert {
        target: Target,
        #[serde(default)]
        count: Option<usize>,
        /// Picks one of the elements the target resolves to, after
        /// `target.index` and `find` have been applied
        #[serde(default)]
        index: Option<usize>,
        #[serde(default)]
        visible: Option<bool>,
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        disabled: Option<bool>,
        #[serde(default)]
        value: Option<String>,
    },

    /// Assert the current URL path
    Location { pathname: String },

    /// Capture a named visual snapshot
    Snapshot { name: String },

    /// Steps that only run on mobile-sized viewports
    WhenMobile { steps: Vec<Step> },

    /// Log a message (for debugging)
    Log { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl Step {
    /// The route a `route` step registers
    pub fn as_route(&self) -> Option<Route> {
        match self {
            Step::Route { method, path, alias, stub } => Some(Route {
                method: method.clone(),
                path: path.clone(),
                alias: alias.clone(),
                stub: stub.clone(),
            }),
            _ => None,
        }
    }

    /// Short label used in logs and results
    pub fn name(&self) -> String {
        match self {
            Step::Visit { url } => format!("visit:{}", url),
            Step::Click { target } => format!("click:{}", target),
            Step::Type { target, text } => format!("type:{}:{:?}", target, text),
            Step::Clear { target } => format!("clear:{}", target),
            Step::Blur { target } => format!("blur:{}", target),
            Step::Route { method, path, alias, .. } => format!("route:{} {} as @{}", method, path, alias),
            Step::Wait { alias, .. } => format!("wait:@{}", alias),
            Step::WaitFor { target, state, .. } => format!("wait_for:{}:{:?}", target, state),
            Step::Assert { target, .. } => format!("assert:{}", target),
            Step::Location { pathname } => format!("location:{}", pathname),
            Step::Snapshot { name } => format!("snapshot:{}", name),
            Step::WhenMobile { steps } => format!("when_mobile:{} step(s)", steps.len()),
            Step::Log { message } => format!("log:{}", message.chars().take(30).collect::<String>()),
        }
    }
}

impl SuiteSpec {
    /// Parse a suite from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let suite: Self = serde_yaml::from_str(yaml)?;
        suite.validate()?;
        Ok(suite)
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all suites from a directory, sorted by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    /// Check structural rules that serde cannot express
    pub fn validate(&self) -> E2eResult<()> {
        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(E2eError::SpecParse(format!(
                    "suite '{}' has duplicate scenario '{}'",
                    self.name, scenario.name
                )));
            }
            if scenario.steps.is_empty() {
                return Err(E2eError::SpecParse(format!(
                    "scenario '{}' has no steps",
                    scenario.name
                )));
            }

            let mut aliases: HashSet<&str> =
                self.before_each.routes.iter().map(|r| r.alias.as_str()).collect();
            check_aliases(&scenario.name, &scenario.steps, &mut aliases)?;
        }
        Ok(())
    }

    /// Effective tags of a scenario (suite tags first)
    pub fn tags_of<'a>(&'a self, scenario: &'a ScenarioSpec) -> impl Iterator<Item = &'a str> {
        self.tags.iter().chain(scenario.tags.iter()).map(String::as_str)
    }
}

fn check_aliases<'a>(
    scenario: &str,
    steps: &'a [Step],
    aliases: &mut HashSet<&'a str>,
) -> E2eResult<()> {
    for step in steps {
        match step {
            Step::Route { alias, .. } => {
                aliases.insert(alias.as_str());
            }
            Step::Wait { alias, .. } if !aliases.contains(alias.as_str()) => {
                return Err(E2eError::SpecParse(format!(
                    "scenario '{}' waits on @{} before it is routed",
                    scenario, alias
                )));
            }
            // Routes inside the block only exist at mobile widths
            Step::WhenMobile { steps } => check_aliases(scenario, steps, &mut aliases.clone())?,
            _ => {}
        }
    }
    Ok(())
}
