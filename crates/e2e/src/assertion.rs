//! Expectations over matched elements, retried until they hold
//!
//! Evaluation is pure: a driver query produces `ElementState`s and an
//! [`Expectation`] either accepts them or explains the mismatch. The runner
//! re-queries until the expectation holds or the command timeout elapses.

use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::driver::ElementState;
use crate::error::{E2eError, E2eResult};
use crate::spec::WaitState;

/// Conditions from an `assert` step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expectation {
    pub count: Option<usize>,
    pub index: Option<usize>,
    pub visible: Option<bool>,
    pub contains: Option<String>,
    pub text: Option<String>,
    pub disabled: Option<bool>,
    pub value: Option<String>,
}

/// Why an expectation did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: String,
    pub actual: String,
}

impl Mismatch {
    pub fn new(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<Mismatch> for E2eError {
    fn from(m: Mismatch) -> Self {
        E2eError::Assertion {
            expected: m.expected,
            actual: m.actual,
        }
    }
}

fn describe_texts(elements: &[&ElementState]) -> String {
    let texts: Vec<String> = elements.iter().map(|e| format!("{:?}", e.text.trim())).collect();
    format!("text was [{}]", texts.join(", "))
}

impl Expectation {
    /// Whether any condition needs matched elements to exist
    fn requires_presence(&self) -> bool {
        self.index.is_some()
            || self.contains.is_some()
            || self.text.is_some()
            || self.disabled.is_some()
            || self.value.is_some()
            || self.visible == Some(true)
    }

    pub fn evaluate(&self, elements: &[ElementState]) -> Result<(), Mismatch> {
        if let Some(count) = self.count {
            if elements.len() != count {
                return Err(Mismatch::new(
                    format!("{} element(s)", count),
                    format!("found {}", elements.len()),
                ));
            }
        }

        let selected: Vec<&ElementState> = match self.index {
            Some(i) => match elements.get(i) {
                Some(e) => vec![e],
                None => {
                    return Err(Mismatch::new(
                        format!("an element at index {}", i),
                        format!("found {}", elements.len()),
                    ))
                }
            },
            None => elements.iter().collect(),
        };

        if selected.is_empty() && self.requires_presence() {
            return Err(Mismatch::new("to find element", "never found it"));
        }

        match self.visible {
            Some(true) => {
                if let Some(pos) = selected.iter().position(|e| !e.visible) {
                    return Err(Mismatch::new(
                        "element to be visible",
                        format!("match {} is hidden", pos),
                    ));
                }
            }
            Some(false) => {
                if let Some(pos) = selected.iter().position(|e| e.visible) {
                    return Err(Mismatch::new(
                        "element not to be visible",
                        format!("match {} is visible", pos),
                    ));
                }
            }
            None => {}
        }

        if let Some(needle) = &self.contains {
            if !selected.iter().any(|e| e.text.contains(needle.as_str())) {
                return Err(Mismatch::new(
                    format!("to contain {:?}", needle),
                    describe_texts(&selected),
                ));
            }
        }

        if let Some(exact) = &self.text {
            if let Some(e) = selected.iter().find(|e| e.text.trim() != exact.trim()) {
                return Err(Mismatch::new(
                    format!("text {:?}", exact),
                    format!("text was {:?}", e.text.trim()),
                ));
            }
        }

        if let Some(disabled) = self.disabled {
            if let Some(pos) = selected.iter().position(|e| e.disabled != disabled) {
                let want = if disabled { "disabled" } else { "enabled" };
                let got = if disabled { "enabled" } else { "disabled" };
                return Err(Mismatch::new(
                    format!("element to be {}", want),
                    format!("match {} is {}", pos, got),
                ));
            }
        }

        if let Some(value) = &self.value {
            if let Some(e) = selected.iter().find(|e| e.value.as_deref() != Some(value.as_str())) {
                return Err(Mismatch::new(
                    format!("value {:?}", value),
                    format!("value was {:?}", e.value),
                ));
            }
        }

        Ok(())
    }
}

/// Whether matched elements satisfy a wait state
pub fn wait_state_holds(state: WaitState, elements: &[ElementState]) -> bool {
    match state {
        WaitState::Attached => !elements.is_empty(),
        WaitState::Detached => elements.is_empty(),
        WaitState::Visible => elements.iter().any(|e| e.visible),
        WaitState::Hidden => elements.iter().all(|e| !e.visible),
    }
}

/// Retry budget for a polled condition
///
/// Callers re-query in a loop and hand each mismatch to [`Retry::wait`],
/// which sleeps one interval or, once the deadline has passed, turns the
/// last mismatch into the step's failure.
pub struct Retry {
    deadline: Instant,
    interval: Duration,
    attempts: u32,
}

impl Retry {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            interval,
            attempts: 0,
        }
    }

    pub async fn wait(&mut self, mismatch: Mismatch) -> E2eResult<()> {
        self.attempts += 1;
        if Instant::now() >= self.deadline {
            trace!("Giving up after {} attempts", self.attempts);
            return Err(mismatch.into());
        }
        tokio::time::sleep(self.interval).await;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
