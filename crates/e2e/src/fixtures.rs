//! Fixture seeding and session bootstrap
//!
//! Both are owned by the application under test: it exposes test-data
//! endpoints that reset its store and list seeded entities, and a regular
//! login endpoint. The harness only calls them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};

/// A seeded user the scenario logs in as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Cookie carrying an authenticated session into the browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Origin the cookie belongs to when no domain is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[async_trait]
pub trait FixtureService: Send + Sync {
    /// Reset the backing store to its seed state
    async fn seed(&self) -> E2eResult<()>;

    /// Look up a seeded user; the first one when `username` is `None`
    async fn find_user(&self, username: Option<&str>) -> E2eResult<TestUser>;

    /// Authenticate out of band and return the session cookies
    async fn login(&self, user: &TestUser) -> E2eResult<Vec<SessionCookie>>;
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    results: Vec<T>,
}

/// Fixture service backed by the application's HTTP test-data endpoints
pub struct ApiFixtures {
    client: reqwest::Client,
    seed_url: String,
    users_url: String,
    login_url: String,
    app_url: String,
    password: String,
}

impl ApiFixtures {
    pub fn new(config: &HarnessConfig) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            seed_url: config.api_endpoint(&config.fixtures.seed_path),
            users_url: config.api_endpoint(&config.fixtures.users_path),
            login_url: config.api_endpoint(&config.fixtures.login_path),
            app_url: config.app_url.clone(),
            password: config.fixtures.password.clone(),
        })
    }
}

#[async_trait]
impl FixtureService for ApiFixtures {
    async fn seed(&self) -> E2eResult<()> {
        debug!("Seeding via {}", self.seed_url);
        let resp = self.client.post(&self.seed_url).send().await?;
        if !resp.status().is_success() {
            return Err(E2eError::Fixture(format!(
                "seed returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn find_user(&self, username: Option<&str>) -> E2eResult<TestUser> {
        let resp = self.client.get(&self.users_url).send().await?;
        if !resp.status().is_success() {
            return Err(E2eError::Fixture(format!(
                "listing users returned {}",
                resp.status()
            )));
        }
        let users: Collection<TestUser> = resp.json().await?;
        select_user(users.results, username)
    }

    async fn login(&self, user: &TestUser) -> E2eResult<Vec<SessionCookie>> {
        let resp = self
            .client
            .post(&self.login_url)
            .json(&serde_json::json!({
                "username": user.username,
                "password": self.password,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(E2eError::Fixture(format!(
                "login as {} returned {}",
                user.username,
                resp.status()
            )));
        }

        let cookies: Vec<SessionCookie> = resp
            .cookies()
            .map(|c| SessionCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(str::to_string),
                path: c.path().map(str::to_string),
                url: None,
            })
            .map(|c| with_origin(c, &self.app_url))
            .collect();

        if cookies.is_empty() {
            return Err(E2eError::Fixture(format!(
                "login as {} set no session cookie",
                user.username
            )));
        }

        info!("Logged in as {}", user.username);
        Ok(cookies)
    }
}

/// Cookies without a domain are scoped to the app origin
fn with_origin(mut cookie: SessionCookie, app_url: &str) -> SessionCookie {
    if cookie.domain.is_none() {
        cookie.url = Some(app_url.to_string());
        cookie.path = None;
    } else if cookie.path.is_none() {
        cookie.path = Some("/".to_string());
    }
    cookie
}

fn select_user(users: Vec<TestUser>, username: Option<&str>) -> E2eResult<TestUser> {
    match username {
        Some(name) => users
            .into_iter()
            .find(|u| u.username == name)
            .ok_or_else(|| E2eError::Fixture(format!("no seeded user named {}", name))),
        None => users
            .into_iter()
            .next()
            .ok_or_else(|| E2eError::Fixture("seed produced no users".to_string())),
    }
}
