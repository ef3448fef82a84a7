//! Element targets
//!
//! The application exposes stable `data-test` hooks. Scenario files address
//! them with a short prefix syntax:
//!
//! - `sel:bankaccount-new` matches `[data-test="bankaccount-new"]`
//! - `sel-like:bankName-input` matches any `data-test` containing the value
//! - anything else is passed through as CSS (`#bankaccount-bankName-input-helper-text`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::E2eError;

const TEST_ATTRIBUTE: &str = "data-test";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Exact `data-test` value
    Sel(String),
    /// `data-test` substring
    SelLike(String),
    Css(String),
}

impl Selector {
    pub fn to_css(&self) -> String {
        match self {
            Selector::Sel(value) => format!("[{}=\"{}\"]", TEST_ATTRIBUTE, escape(value)),
            Selector::SelLike(value) => format!("[{}*=\"{}\"]", TEST_ATTRIBUTE, escape(value)),
            Selector::Css(css) => css.clone(),
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl FromStr for Selector {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let selector = if let Some(rest) = s.strip_prefix("sel-like:") {
            Selector::SelLike(rest.trim().to_string())
        } else if let Some(rest) = s.strip_prefix("sel:") {
            Selector::Sel(rest.trim().to_string())
        } else {
            Selector::Css(s.to_string())
        };

        match &selector {
            Selector::Sel(v) | Selector::SelLike(v) | Selector::Css(v) if v.is_empty() => {
                Err(E2eError::Selector(format!("empty selector '{}'", s)))
            }
            _ => Ok(selector),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Sel(v) => write!(f, "sel:{}", v),
            Selector::SelLike(v) => write!(f, "sel-like:{}", v),
            Selector::Css(v) => f.write_str(v),
        }
    }
}

/// What a step acts on or asserts about
///
/// `index` picks one match of `selector`; `find` then narrows to its
/// descendants (the inner `<input>` of a form control wrapper). Without an
/// index, `find` searches under every match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TargetRepr", into = "TargetRepr")]
pub struct Target {
    pub selector: Selector,
    pub find: Option<String>,
    pub index: Option<usize>,
}

impl Target {
    pub fn new(selector: Selector) -> Self {
        Self { selector, find: None, index: None }
    }

    pub fn with_find(mut self, find: impl Into<String>) -> Self {
        self.find = Some(find.into());
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl FromStr for Target {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target::new(s.parse()?))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector)?;
        if let Some(index) = self.index {
            write!(f, "[{}]", index)?;
        }
        if let Some(find) = &self.find {
            write!(f, " > {}", find)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Short(String),
    Full {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        find: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
}

impl TryFrom<TargetRepr> for Target {
    type Error = E2eError;

    fn try_from(repr: TargetRepr) -> Result<Self, Self::Error> {
        match repr {
            TargetRepr::Short(s) => s.parse(),
            TargetRepr::Full { selector, find, index } => Ok(Target {
                selector: selector.parse()?,
                find: find.filter(|f| !f.trim().is_empty()),
                index,
            }),
        }
    }
}

impl From<Target> for TargetRepr {
    fn from(target: Target) -> Self {
        if target.find.is_none() && target.index.is_none() {
            TargetRepr::Short(target.selector.to_string())
        } else {
            TargetRepr::Full {
                selector: target.selector.to_string(),
                find: target.find,
                index: target.index,
            }
        }
    }
}
