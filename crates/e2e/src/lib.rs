//! Bank Accounts E2E Scenario Harness
//!
//! This crate drives the bank accounts UI through a real browser:
//! - Seeds the backend and logs in through the app's test endpoints
//! - Controls Playwright through a persistent Node bridge (JSON lines)
//! - Parses declarative YAML scenario suites
//! - Aliases network requests so steps can wait on them
//! - Records named visual snapshots for external review
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Test Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── FixtureService   seed() / find_user() / login()      │
//! │    ├── DriverLauncher   launch(viewport) -> Driver          │
//! │    ├── InterceptRegistry  route -> @alias, wait(@alias)     │
//! │    ├── Expectation + Retry  assert until it holds           │
//! │    └── SnapshotRecorder  directory | percy | disabled       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteSpec (YAML)                                           │
//! │    ├── before_each { seed, authenticate, user, routes }     │
//! │    └── scenarios: [{ name, tags, viewport, steps }]         │
//! │          ├── visit / click / type / clear / blur            │
//! │          ├── route { method, path, alias, stub? }           │
//! │          ├── wait { alias } / wait_for { target, state }    │
//! │          ├── assert { target, count?, visible?, ... }       │
//! │          ├── location { pathname } / snapshot { name }      │
//! │          └── when_mobile { steps }                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assertion;
pub mod config;
pub mod driver;
pub mod error;
pub mod fixtures;
pub mod intercept;
pub mod playwright;
pub mod runner;
pub mod selector;
pub mod server;
pub mod snapshot;
pub mod spec;

pub use config::HarnessConfig;
pub use driver::{Driver, DriverLauncher, ElementState};
pub use error::{E2eError, E2eResult};
pub use fixtures::{FixtureService, SessionCookie, TestUser};
pub use intercept::{NetworkEvent, Route};
pub use runner::{Filter, ScenarioResult, TestRunner, TestSuiteResult};
pub use selector::{Selector, Target};
pub use spec::{ScenarioSpec, Step, SuiteSpec, Viewport};
