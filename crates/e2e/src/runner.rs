//! Main test runner that orchestrates fixtures, the browser driver and snapshots
//!
//! Per scenario: launch a fresh page, seed, register hook routes, log in,
//! then execute the steps in order. The first failing step aborts the
//! scenario; there are no retries and no partial success.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assertion::{wait_state_holds, Expectation, Mismatch, Retry};
use crate::config::HarnessConfig;
use crate::driver::{Driver, DriverLauncher};
use crate::error::{E2eError, E2eResult};
use crate::fixtures::{ApiFixtures, FixtureService};
use crate::intercept::{ordinal, AliasState, InterceptRegistry, InterceptedCall, Route};
use crate::playwright::PlaywrightLauncher;
use crate::selector::Target;
use crate::server::AppServer;
use crate::snapshot::{recorder_for, Capture, SnapshotRecord, SnapshotRecorder};
use crate::spec::{Hooks, ScenarioSpec, Step, SuiteSpec, Viewport};

/// Result of executing a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub step_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Why a scenario failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    /// Position of the failing step in execution order; `None` when the
    /// scenario never reached its first step
    pub step_index: Option<usize>,
    pub step: Option<String>,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl ScenarioFailure {
    fn from_error(step_index: Option<usize>, step: Option<String>, err: &E2eError) -> Self {
        let (expected, actual) = match err {
            E2eError::Assertion { expected, actual } => (Some(expected.clone()), Some(actual.clone())),
            E2eError::Timeout { what, timeout_ms } => {
                (Some(what.clone()), Some(format!("timed out after {}ms", timeout_ms)))
            }
            _ => (None, None),
        };
        Self {
            step_index,
            step,
            message: err.to_string(),
            expected,
            actual,
        }
    }
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub suite: String,
    pub name: String,
    pub success: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub viewport: Viewport,
    pub steps: Vec<StepResult>,
    pub snapshots: Vec<SnapshotRecord>,
    pub requests: Vec<InterceptedCall>,
    pub failure: Option<ScenarioFailure>,
}

impl ScenarioResult {
    fn skipped(suite: &SuiteSpec, scenario: &ScenarioSpec, viewport: Viewport) -> Self {
        Self {
            suite: suite.name.clone(),
            name: scenario.name.clone(),
            success: true,
            skipped: true,
            duration_ms: 0,
            viewport,
            steps: Vec::new(),
            snapshots: Vec::new(),
            requests: Vec::new(),
            failure: None,
        }
    }

    /// Index of the failing step, if a step failed
    pub fn failed_step(&self) -> Option<usize> {
        self.failure.as_ref().and_then(|f| f.step_index)
    }
}

/// Result of running all selected scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioResult>,
}

impl TestSuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Scenario selection
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Only scenarios carrying this tag (suite tags count)
    pub tag: Option<String>,
    /// Only scenarios whose "suite scenario" title contains this text
    pub grep: Option<String>,
}

impl Filter {
    pub fn selects(&self, suite: &SuiteSpec, scenario: &ScenarioSpec) -> bool {
        if let Some(tag) = &self.tag {
            if !suite.tags_of(scenario).any(|t| t == tag.as_str()) {
                return false;
            }
        }
        if let Some(grep) = &self.grep {
            let title = format!("{} {}", suite.name, scenario.name);
            if !title.contains(grep.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Main E2E test runner
pub struct TestRunner {
    config: HarnessConfig,
    launcher: Box<dyn DriverLauncher>,
    fixtures: Box<dyn FixtureService>,
    recorder: Box<dyn SnapshotRecorder>,
    server: Option<AppServer>,
}

impl TestRunner {
    /// Create a test runner from its collaborators
    pub fn new(
        config: HarnessConfig,
        launcher: Box<dyn DriverLauncher>,
        fixtures: Box<dyn FixtureService>,
        recorder: Box<dyn SnapshotRecorder>,
    ) -> Self {
        Self {
            config,
            launcher,
            fixtures,
            recorder,
            server: None,
        }
    }

    /// Playwright, the app's fixture endpoints and the configured recorder
    pub async fn from_config(config: HarnessConfig) -> E2eResult<Self> {
        config.validate()?;
        let launcher = PlaywrightLauncher::new(&config)?;
        let fixtures = ApiFixtures::new(&config)?;
        let recorder = recorder_for(&config.snapshots).await?;
        Ok(Self::new(config, Box::new(launcher), Box::new(fixtures), recorder))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Start the application when a server command is configured
    pub async fn start_server(&mut self) -> E2eResult<()> {
        if self.server.is_some() || self.config.server.command.is_empty() {
            return Ok(());
        }
        self.server = Some(AppServer::spawn(&self.config).await?);
        Ok(())
    }

    /// Stop the application
    pub fn stop_server(&mut self) -> E2eResult<()> {
        if let Some(mut server) = self.server.take() {
            server.stop()?;
        }
        Ok(())
    }

    /// Run every suite in the specs directory
    pub async fn run_all(&mut self, filter: &Filter) -> E2eResult<TestSuiteResult> {
        let suites = SuiteSpec::load_all(&self.config.specs_dir)?;
        if suites.is_empty() {
            warn!("No suites found in {}", self.config.specs_dir.display());
        }
        self.run_suites(&suites, filter).await
    }

    /// Run the selected scenarios of the given suites, sequentially
    pub async fn run_suites(&mut self, suites: &[SuiteSpec], filter: &Filter) -> E2eResult<TestSuiteResult> {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let mut results = Vec::new();

        let selected: usize = suites
            .iter()
            .map(|s| s.scenarios.iter().filter(|sc| filter.selects(s, sc)).count())
            .sum();
        info!("Running {} scenario(s)...", selected);

        for suite in suites {
            for scenario in suite.scenarios.iter().filter(|sc| filter.selects(suite, sc)) {
                let result = self.run_scenario(suite, scenario).await;
                if result.skipped {
                    info!("- {} › {} (skipped)", suite.name, scenario.name);
                } else if result.success {
                    info!("✓ {} › {} ({} ms)", suite.name, scenario.name, result.duration_ms);
                } else if let Some(failure) = &result.failure {
                    error!(
                        "✗ {} › {} - step {}: {}",
                        suite.name,
                        scenario.name,
                        failure.step_index.map(|i| i.to_string()).unwrap_or_else(|| "setup".to_string()),
                        failure.message
                    );
                }
                results.push(result);
            }
        }

        if let Err(e) = self.recorder.finish().await {
            warn!("Snapshot recorder did not finish cleanly: {}", e);
        }

        let skipped = results.iter().filter(|r| r.skipped).count();
        let passed = results.iter().filter(|r| r.success && !r.skipped).count();
        let failed = results.iter().filter(|r| !r.success).count();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        Ok(TestSuiteResult {
            started_at,
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        })
    }

    /// Run one scenario in a fresh browser context
    pub async fn run_scenario(&self, suite: &SuiteSpec, scenario: &ScenarioSpec) -> ScenarioResult {
        let viewport = scenario
            .viewport
            .or(suite.viewport)
            .unwrap_or(self.config.viewport);

        if scenario.skip {
            return ScenarioResult::skipped(suite, scenario, viewport);
        }

        let start = Instant::now();
        debug!("Running scenario: {} › {}", suite.name, scenario.name);

        let driver = match self.launcher.launch(&viewport).await {
            Ok(driver) => driver,
            Err(e) => {
                return ScenarioResult {
                    suite: suite.name.clone(),
                    name: scenario.name.clone(),
                    success: false,
                    skipped: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    viewport,
                    steps: Vec::new(),
                    snapshots: Vec::new(),
                    requests: Vec::new(),
                    failure: Some(ScenarioFailure::from_error(None, None, &e)),
                }
            }
        };

        let mut run = ScenarioRun {
            config: &self.config,
            fixtures: self.fixtures.as_ref(),
            recorder: self.recorder.as_ref(),
            driver,
            registry: InterceptRegistry::new(),
            suite: &suite.name,
            scenario: &scenario.name,
            viewport,
            steps: Vec::new(),
            snapshots: Vec::new(),
        };

        let plan = plan_steps(&scenario.steps, self.config.is_mobile(&viewport));
        let scenario_timeout = self.config.timeouts.scenario();

        let outcome = tokio::time::timeout(scenario_timeout, run.execute(&suite.before_each, &plan)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(_) => {
                let err = E2eError::Timeout {
                    what: format!("scenario '{}' to finish", scenario.name),
                    timeout_ms: scenario_timeout.as_millis() as u64,
                };
                let index = run.steps.len();
                Some(ScenarioFailure::from_error(
                    Some(index),
                    plan.get(index).map(|s| s.name()),
                    &err,
                ))
            }
        };

        if let Err(e) = run.driver.close().await {
            warn!("Closing browser for '{}' failed: {}", scenario.name, e);
        }

        ScenarioResult {
            suite: suite.name.clone(),
            name: scenario.name.clone(),
            success: failure.is_none(),
            skipped: false,
            duration_ms: start.elapsed().as_millis() as u64,
            viewport,
            steps: run.steps,
            snapshots: run.snapshots,
            requests: run.registry.calls().to_vec(),
            failure,
        }
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        let _ = self.stop_server();
    }
}

/// Expand `when_mobile` blocks into the steps that will actually run
fn plan_steps(steps: &[Step], mobile: bool) -> Vec<&Step> {
    let mut plan = Vec::with_capacity(steps.len());
    for step in steps {
        match step {
            Step::WhenMobile { steps } => {
                if mobile {
                    plan.extend(plan_steps(steps, mobile));
                }
            }
            other => plan.push(other),
        }
    }
    plan
}

/// State of one scenario while it runs
struct ScenarioRun<'a> {
    config: &'a HarnessConfig,
    fixtures: &'a dyn FixtureService,
    recorder: &'a dyn SnapshotRecorder,
    driver: Box<dyn Driver>,
    registry: InterceptRegistry,
    suite: &'a str,
    scenario: &'a str,
    viewport: Viewport,
    steps: Vec<StepResult>,
    snapshots: Vec<SnapshotRecord>,
}

impl ScenarioRun<'_> {
    async fn execute(&mut self, hooks: &Hooks, plan: &[&Step]) -> Result<(), ScenarioFailure> {
        self.prepare(hooks)
            .await
            .map_err(|e| ScenarioFailure::from_error(None, None, &e))?;

        for (index, step) in plan.iter().enumerate() {
            let step_name = step.name();
            debug!("Step {}: {}", index, step_name);
            let started = Instant::now();

            let outcome = self.execute_step(step).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => self.steps.push(StepResult {
                    index,
                    step_name,
                    success: true,
                    duration_ms,
                    error: None,
                }),
                Err(e) => {
                    self.steps.push(StepResult {
                        index,
                        step_name: step_name.clone(),
                        success: false,
                        duration_ms,
                        error: Some(e.to_string()),
                    });
                    return Err(ScenarioFailure::from_error(Some(index), Some(step_name), &e));
                }
            }
        }
        Ok(())
    }

    /// Seed, alias hook routes, then log in and land on the app
    async fn prepare(&mut self, hooks: &Hooks) -> E2eResult<()> {
        if hooks.seed {
            self.fixtures.seed().await?;
        }

        for route in &hooks.routes {
            self.register(route.clone()).await?;
        }

        if hooks.authenticate {
            let user = self.fixtures.find_user(hooks.user.as_deref()).await?;
            let cookies = self.fixtures.login(&user).await?;
            self.driver.add_cookies(&cookies).await?;
            if let Some(landing) = &hooks.landing_url {
                self.driver.visit(landing).await?;
            }
        }
        Ok(())
    }

    /// Requests seen before a route exists must not bind to it
    async fn sync_network(&mut self) -> E2eResult<()> {
        let events = self.driver.drain_network().await?;
        self.registry.record_all(events);
        Ok(())
    }

    async fn register(&mut self, route: Route) -> E2eResult<()> {
        self.sync_network().await?;
        if route.stub.is_some() {
            self.driver.stub_route(&route).await?;
        }
        self.registry.register(route)
    }

    async fn execute_step(&mut self, step: &Step) -> E2eResult<()> {
        let result = match step {
            Step::Visit { url } => self.driver.visit(url).await,
            Step::Click { target } => {
                self.await_actionable(target).await?;
                self.driver.click(target).await
            }
            Step::Type { target, text } => {
                self.await_actionable(target).await?;
                self.driver.type_text(target, text).await
            }
            Step::Clear { target } => {
                self.await_actionable(target).await?;
                self.driver.clear(target).await
            }
            Step::Blur { target } => {
                self.await_actionable(target).await?;
                self.driver.blur(target).await
            }
            Step::Route { .. } => match step.as_route() {
                Some(route) => self.register(route).await,
                None => Ok(()),
            },
            Step::Wait { alias, timeout_ms } => self.wait_alias(alias, *timeout_ms).await,
            Step::WaitFor { target, state, timeout_ms } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.config.timeouts.command());
                let mut retry = Retry::new(timeout, self.config.timeouts.poll_interval());
                loop {
                    let elements = self.driver.query(target).await?;
                    if wait_state_holds(*state, &elements) {
                        break Ok(());
                    }
                    retry
                        .wait(Mismatch::new(
                            format!("{} to be {:?}", target, state),
                            format!("{} match(es), {} visible", elements.len(), elements.iter().filter(|e| e.visible).count()),
                        ))
                        .await?;
                }
            }
            Step::Assert { target, count, index, visible, contains, text, disabled, value } => {
                let expectation = Expectation {
                    count: *count,
                    index: *index,
                    visible: *visible,
                    contains: contains.clone(),
                    text: text.clone(),
                    disabled: *disabled,
                    value: value.clone(),
                };
                let mut retry = Retry::new(self.config.timeouts.command(), self.config.timeouts.poll_interval());
                loop {
                    let elements = self.driver.query(target).await?;
                    match expectation.evaluate(&elements) {
                        Ok(()) => break Ok(()),
                        Err(mismatch) => retry.wait(mismatch).await?,
                    }
                }
            }
            Step::Location { pathname } => {
                let mut retry = Retry::new(self.config.timeouts.command(), self.config.timeouts.poll_interval());
                loop {
                    let actual = self.driver.pathname().await?;
                    if &actual == pathname {
                        break Ok(());
                    }
                    retry
                        .wait(Mismatch::new(
                            format!("location pathname {:?}", pathname),
                            format!("pathname was {:?}", actual),
                        ))
                        .await?;
                }
            }
            Step::Snapshot { name } => {
                self.snapshot(name).await;
                Ok(())
            }
            Step::WhenMobile { .. } => Ok(()),
            Step::Log { message } => {
                info!("[{}] {}", self.scenario, message);
                Ok(())
            }
        };

        // A lost bridge must not hide why the step failed
        match result {
            Ok(()) => self.sync_network().await,
            Err(e) => {
                if let Err(sync) = self.sync_network().await {
                    debug!("Network sync after failed step: {}", sync);
                }
                Err(e)
            }
        }
    }

    /// Wait until the element an action addresses exists
    async fn await_actionable(&mut self, target: &Target) -> E2eResult<()> {
        let mut retry = Retry::new(self.config.timeouts.command(), self.config.timeouts.poll_interval());
        loop {
            let found = self.driver.query(target).await?.len();
            if found > 0 {
                return Ok(());
            }
            retry
                .wait(Mismatch::new(
                    format!("to find {}", target),
                    format!("found {} match(es)", found),
                ))
                .await?;
        }
    }

    /// Block until the next un-waited request for `alias` completes.
    ///
    /// The request must start within the request timeout and then finish
    /// within the response timeout.
    async fn wait_alias(&mut self, alias: &str, timeout_ms: Option<u64>) -> E2eResult<()> {
        if !self.registry.has_alias(alias) {
            return Err(E2eError::SpecParse(format!("@{} was never routed", alias)));
        }

        let nth = ordinal(self.registry.waited(alias) + 1);
        let request_ms = timeout_ms.unwrap_or(self.config.timeouts.request_ms);
        let response_ms = self.config.timeouts.response_ms;
        let start = Instant::now();
        let mut requested_at: Option<Instant> = None;

        loop {
            self.sync_network().await?;
            match self.registry.state(alias) {
                AliasState::Completed => {
                    if let Some(call) = self.registry.consume(alias) {
                        debug!(
                            "@{} resolved: {} {} -> {:?}",
                            alias, call.method, call.url, call.status
                        );
                    }
                    return Ok(());
                }
                AliasState::InFlight => {
                    let since = *requested_at.get_or_insert_with(Instant::now);
                    if since.elapsed() >= Duration::from_millis(response_ms) {
                        return Err(E2eError::Timeout {
                            what: format!("the {} response to the route '{}'", nth, alias),
                            timeout_ms: response_ms,
                        });
                    }
                }
                AliasState::NotRequested => {
                    if start.elapsed() >= Duration::from_millis(request_ms) {
                        return Err(E2eError::Timeout {
                            what: format!(
                                "the {} request to the route '{}'; no request ever occurred",
                                nth, alias
                            ),
                            timeout_ms: request_ms,
                        });
                    }
                }
            }
            tokio::time::sleep(self.config.timeouts.poll_interval()).await;
        }
    }

    /// Snapshots never fail a scenario
    async fn snapshot(&mut self, name: &str) {
        if !self.recorder.enabled() {
            debug!("Snapshot '{}' skipped (recorder disabled)", name);
            return;
        }

        match self.capture(name).await {
            Ok(capture) => match self.recorder.record(capture).await {
                Ok(record) => self.snapshots.push(record),
                Err(e) => warn!("Snapshot '{}' not recorded: {}", name, e),
            },
            Err(e) => warn!("Snapshot '{}' not captured: {}", name, e),
        }
    }

    async fn capture(&mut self, name: &str) -> E2eResult<Capture> {
        let png = self.driver.screenshot().await?;
        let dom = if self.recorder.wants_dom() {
            Some(self.driver.dom_snapshot().await?)
        } else {
            None
        };
        Ok(Capture {
            suite: self.suite.to_string(),
            scenario: self.scenario.to_string(),
            name: name.to_string(),
            url: self.driver.url().await?,
            viewport: self.viewport,
            png,
            dom,
        })
    }
}
