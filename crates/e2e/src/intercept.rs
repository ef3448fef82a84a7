//! Network interception: route aliases and wait handles
//!
//! Routes are registered before navigation. The driver reports every request
//! it observes; each one is bound to the most recently registered matching
//! route and queued under that route's alias. A `wait` on an alias consumes
//! the oldest request not yet waited on.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::error::{E2eError, E2eResult};

/// A named interception: method + path glob, optionally stubbed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub alias: String,
    /// When set the request never reaches the server; the driver answers
    /// with status 200 and this JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<serde_json::Value>,
}

impl Route {
    pub fn new(method: &str, path: &str, alias: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            alias: alias.to_string(),
            stub: None,
        }
    }

    pub fn stubbed(mut self, body: serde_json::Value) -> Self {
        self.stub = Some(body);
        self
    }
}

/// Compiled form of a route's method and path glob
#[derive(Debug, Clone)]
pub struct RoutePattern {
    method: String,
    regex: Regex,
}

impl RoutePattern {
    pub fn compile(method: &str, glob: &str) -> E2eResult<Self> {
        if !glob.starts_with('/') {
            return Err(E2eError::SpecParse(format!(
                "route path '{}' must start with '/'",
                glob
            )));
        }

        let mut pattern = String::from("^");
        let mut chars = glob.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]*");
                }
            } else {
                pattern.push_str(&regex::escape(&c.to_string()));
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| E2eError::SpecParse(format!("bad route glob '{}': {}", glob, e)))?;

        Ok(Self {
            method: method.to_ascii_uppercase(),
            regex,
        })
    }

    /// Anchored path regex, also valid as a JavaScript `RegExp` source
    pub fn regex_source(&self) -> &str {
        self.regex.as_str()
    }

    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.regex.is_match(&request_path(url))
    }
}

/// Path component of a request URL, without origin, query or fragment
pub fn request_path(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        return parsed.path().to_string();
    }
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}

/// Network activity reported by a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum NetworkEvent {
    Started {
        rid: String,
        method: String,
        url: String,
    },
    Finished {
        rid: String,
        #[serde(default)]
        status: Option<u16>,
    },
    Failed {
        rid: String,
        #[serde(default)]
        error: String,
    },
}

/// One request bound to an alias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptedCall {
    pub alias: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub completed: bool,
}

/// Where the next un-waited request for an alias stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasState {
    NotRequested,
    InFlight,
    Completed,
}

/// Per-scenario alias bookkeeping
#[derive(Debug, Default)]
pub struct InterceptRegistry {
    routes: Vec<(Route, RoutePattern)>,
    calls: Vec<InterceptedCall>,
    by_rid: HashMap<String, usize>,
    consumed: HashMap<String, usize>,
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: Route) -> E2eResult<()> {
        let pattern = RoutePattern::compile(&route.method, &route.path)?;
        debug!("Route {} {} as @{}", route.method, route.path, route.alias);
        self.routes.push((route, pattern));
        Ok(())
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|(route, _)| route)
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.routes.iter().any(|(route, _)| route.alias == alias)
    }

    /// Latest registration wins
    fn alias_for(&self, method: &str, url: &str) -> Option<&str> {
        self.routes
            .iter()
            .rev()
            .find(|(_, pattern)| pattern.matches(method, url))
            .map(|(route, _)| route.alias.as_str())
    }

    pub fn record(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Started { rid, method, url } => {
                let Some(alias) = self.alias_for(&method, &url).map(str::to_string) else {
                    trace!("Unrouted request {} {}", method, url);
                    return;
                };
                trace!("Request {} {} -> @{}", method, url, alias);
                self.by_rid.insert(rid, self.calls.len());
                self.calls.push(InterceptedCall {
                    alias,
                    method,
                    url,
                    status: None,
                    error: None,
                    completed: false,
                });
            }
            NetworkEvent::Finished { rid, status } => {
                if let Some(call) = self.by_rid.get(&rid).and_then(|i| self.calls.get_mut(*i)) {
                    call.status = status;
                    call.completed = true;
                }
            }
            NetworkEvent::Failed { rid, error } => {
                if let Some(call) = self.by_rid.get(&rid).and_then(|i| self.calls.get_mut(*i)) {
                    call.error = Some(error);
                    call.completed = true;
                }
            }
        }
    }

    pub fn record_all(&mut self, events: impl IntoIterator<Item = NetworkEvent>) {
        for event in events {
            self.record(event);
        }
    }

    fn next_unconsumed(&self, alias: &str) -> Option<&InterceptedCall> {
        let skip = self.consumed.get(alias).copied().unwrap_or(0);
        self.calls.iter().filter(|c| c.alias == alias).nth(skip)
    }

    pub fn state(&self, alias: &str) -> AliasState {
        match self.next_unconsumed(alias) {
            None => AliasState::NotRequested,
            Some(call) if call.completed => AliasState::Completed,
            Some(_) => AliasState::InFlight,
        }
    }

    /// Take the next completed call for `alias`, if there is one
    pub fn consume(&mut self, alias: &str) -> Option<InterceptedCall> {
        let call = self.next_unconsumed(alias).filter(|c| c.completed).cloned()?;
        *self.consumed.entry(alias.to_string()).or_insert(0) += 1;
        Some(call)
    }

    /// How many waits have already been satisfied for `alias` (1-based ordinal
    /// of the next wait is this plus one)
    pub fn waited(&self, alias: &str) -> usize {
        self.consumed.get(alias).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> &[InterceptedCall] {
        &self.calls
    }
}

pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, 11) | (2, 12) | (3, 13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}
