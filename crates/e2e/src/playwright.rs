//! Playwright browser automation
//!
//! Each scenario gets its own Node process running a small bridge script
//! around Playwright. The bridge speaks JSON lines on stdio:
//!
//! ```text
//! -> {"id": 3, "cmd": "click", "args": {"target": {...}}}
//! <- {"id": 3, "ok": true, "result": null}
//! <- {"event": "request", "phase": "started", "rid": "7", "method": "POST", "url": "..."}
//! ```
//!
//! Replies are matched to callers by id; request events are forwarded to a
//! channel that the runner drains into its intercept registry.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{BrowserConfig, HarnessConfig, TimeoutConfig};
use crate::driver::{Driver, DriverLauncher, ElementState};
use crate::error::{E2eError, E2eResult};
use crate::fixtures::SessionCookie;
use crate::intercept::{request_path, NetworkEvent, Route, RoutePattern};
use crate::selector::Target;
use crate::spec::Viewport;

/// Bridge script run by Node for every scenario
const BRIDGE_JS: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

let browser = null;
let context = null;
let page = null;
let nextRid = 0;
const rids = new WeakMap();

function send(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

function matches(target) {
  let loc = page.locator(target.base);
  if (target.index !== null && target.index !== undefined) {
    loc = loc.nth(target.index);
  }
  if (target.find) {
    loc = loc.locator(target.find);
  }
  return loc;
}

function locate(target) {
  return matches(target).first();
}

function watchNetwork(p) {
  p.on('request', (req) => {
    const type = req.resourceType();
    if (type !== 'xhr' && type !== 'fetch') return;
    const rid = String(++nextRid);
    rids.set(req, rid);
    send({ event: 'request', phase: 'started', rid, method: req.method(), url: req.url() });
  });
  p.on('requestfinished', async (req) => {
    const rid = rids.get(req);
    if (!rid) return;
    let status = null;
    try {
      const resp = await req.response();
      status = resp ? resp.status() : null;
    } catch (_) {}
    send({ event: 'request', phase: 'finished', rid, status });
  });
  p.on('requestfailed', (req) => {
    const rid = rids.get(req);
    if (!rid) return;
    const failure = req.failure();
    send({ event: 'request', phase: 'failed', rid, error: failure ? failure.errorText : 'failed' });
  });
}

const handlers = {
  async launch(a) {
    const engine = playwright[a.browser];
    if (!engine) throw new Error('unknown browser ' + a.browser);
    browser = await engine.launch({ headless: a.headless });
    context = await browser.newContext({ viewport: a.viewport, baseURL: a.baseUrl });
    context.setDefaultTimeout(a.timeoutMs);
    context.setDefaultNavigationTimeout(a.navigationTimeoutMs);
    page = await context.newPage();
    watchNetwork(page);
    return null;
  },
  async addCookies(a) {
    await context.addCookies(a.cookies);
    return null;
  },
  async route(a) {
    const pattern = new RegExp(a.pattern);
    const method = a.method.toUpperCase();
    await page.route((url) => pattern.test(url.pathname), async (route, req) => {
      if (req.method().toUpperCase() !== method) return route.fallback();
      const origin = await req.headerValue('origin');
      const headers = { ...a.headers };
      if (origin) headers['access-control-allow-origin'] = origin;
      return route.fulfill({ status: 200, contentType: 'application/json', headers, body: JSON.stringify(a.body) });
    });
    return null;
  },
  async visit(a) {
    await page.goto(a.url);
    return null;
  },
  async click(a) {
    await locate(a.target).click();
    return null;
  },
  async type(a) {
    await locate(a.target).click();
    await page.keyboard.type(a.text);
    return null;
  },
  async clear(a) {
    await locate(a.target).fill('');
    return null;
  },
  async blur(a) {
    await locate(a.target).blur();
    return null;
  },
  async query(a) {
    return await matches(a.target).evaluateAll((els) => els.map((e) => {
      const style = window.getComputedStyle(e);
      const rect = e.getBoundingClientRect();
      const visible = style.visibility !== 'hidden' && style.display !== 'none' && rect.width > 0 && rect.height > 0;
      return {
        text: e.innerText !== undefined ? e.innerText : (e.textContent || ''),
        visible,
        disabled: e.disabled === true || e.getAttribute('aria-disabled') === 'true',
        value: typeof e.value === 'string' ? e.value : null,
      };
    }));
  },
  async url() {
    return page.url();
  },
  async screenshot(a) {
    await page.screenshot({ path: a.path, fullPage: true });
    return a.path;
  },
  async dom() {
    return await page.content();
  },
  async close() {
    if (browser) await browser.close();
    browser = null;
    return null;
  },
};

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', async (line) => {
  let msg;
  try {
    msg = JSON.parse(line);
  } catch (e) {
    return;
  }
  const handler = handlers[msg.cmd];
  try {
    if (!handler) throw new Error('unknown command ' + msg.cmd);
    const result = await handler(msg.args || {});
    send({ id: msg.id, ok: true, result: result === undefined ? null : result });
  } catch (e) {
    send({ id: msg.id, ok: false, error: String((e && e.message) || e) });
  }
  if (msg.cmd === 'close') process.exit(0);
});
rl.on('close', async () => {
  if (browser) await browser.close();
  process.exit(0);
});
"#;

#[derive(Debug, Serialize)]
struct BridgeCommand<'a> {
    id: u64,
    cmd: &'a str,
    args: Value,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>>;

/// Starts one bridge per scenario
pub struct PlaywrightLauncher {
    browser: BrowserConfig,
    base_url: String,
    timeouts: TimeoutConfig,
}

impl PlaywrightLauncher {
    pub fn new(config: &HarnessConfig) -> E2eResult<Self> {
        check_playwright_installed(&config.browser)?;
        Ok(Self {
            browser: config.browser.clone(),
            base_url: config.app_url.clone(),
            timeouts: config.timeouts.clone(),
        })
    }
}

#[async_trait]
impl DriverLauncher for PlaywrightLauncher {
    async fn launch(&self, viewport: &Viewport) -> E2eResult<Box<dyn Driver>> {
        let driver = PlaywrightDriver::launch(&self.browser, &self.base_url, viewport, &self.timeouts).await?;
        Ok(Box::new(driver))
    }
}

/// Verify Playwright is resolvable from the configured `node_modules`
fn check_playwright_installed(config: &BrowserConfig) -> E2eResult<()> {
    let project_dir = config
        .node_modules
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let status = Command::new("npx")
        .args(["--no-install", "playwright", "--version"])
        .current_dir(project_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(E2eError::PlaywrightNotFound),
    }
}

/// Browser page driven through the Node bridge
pub struct PlaywrightDriver {
    child: Child,
    stdin: ChildStdin,
    pending: Pending,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    reader: JoinHandle<()>,
    next_id: u64,
    reply_timeout: Duration,
    origin: String,
    script_dir: tempfile::TempDir,
    shots: u32,
}

impl PlaywrightDriver {
    pub async fn launch(
        config: &BrowserConfig,
        base_url: &str,
        viewport: &Viewport,
        timeouts: &TimeoutConfig,
    ) -> E2eResult<Self> {
        let origin = app_origin(base_url)?;
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_JS)?;

        let node_path = absolute(&config.node_modules)?;
        debug!("Starting Playwright bridge: {}", script_path.display());

        let mut child = TokioCommand::new(&config.node_binary)
            .arg(&script_path)
            .env("NODE_PATH", &node_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                E2eError::Driver(format!("Failed to spawn {}: {}", config.node_binary.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdout unavailable".to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_bridge(BufReader::new(stdout), pending.clone(), event_tx));

        let mut driver = Self {
            child,
            stdin,
            pending,
            events,
            reader,
            next_id: 0,
            // Actions time out inside Playwright first; this only catches a hung bridge
            reply_timeout: (timeouts.command() * 4).max(timeouts.page_load()) + Duration::from_secs(30),
            origin,
            script_dir,
            shots: 0,
        };

        driver
            .call("launch", launch_args(config, base_url, viewport, timeouts))
            .await?;

        info!(
            "Launched {} ({}x{}{})",
            config.kind.as_str(),
            viewport.width,
            viewport.height,
            if config.headless { ", headless" } else { "" }
        );
        Ok(driver)
    }

    /// Send one command and wait for its reply
    async fn call(&mut self, cmd: &str, args: Value) -> E2eResult<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let line = serde_json::to_string(&BridgeCommand { id, cmd, args })?;
        trace!("bridge <- {}", line);
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(E2eError::BridgeClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(E2eError::Timeout {
                    what: format!("browser bridge to answer '{}'", cmd),
                    timeout_ms: self.reply_timeout.as_millis() as u64,
                });
            }
        };

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(E2eError::Driver(
                reply.error.unwrap_or_else(|| format!("'{}' failed", cmd)),
            ))
        }
    }

    async fn call_void(&mut self, cmd: &str, args: Value) -> E2eResult<()> {
        self.call(cmd, args).await.map(|_| ())
    }
}

/// Route bridge output: replies to their callers, request events to the channel
async fn read_bridge<R>(
    mut reader: BufReader<R>,
    pending: Pending,
    events: mpsc::UnboundedSender<NetworkEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Bridge read error: {}", e);
                break;
            }
        }
        trace!("bridge -> {}", line.trim());

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                debug!("Bridge output: {}", line.trim());
                continue;
            }
        };

        if value.get("event").is_some() {
            match serde_json::from_value::<NetworkEvent>(value) {
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(e) => warn!("Malformed bridge event: {}", e),
            }
            continue;
        }

        match serde_json::from_value::<BridgeReply>(value) {
            Ok(reply) => {
                if let Some(tx) = pending.lock().remove(&reply.id) {
                    let _ = tx.send(reply);
                }
            }
            Err(e) => warn!("Malformed bridge reply: {}", e),
        }
    }

    // Dropping the senders wakes every waiting caller with BridgeClosed
    pending.lock().clear();
}

fn launch_args(config: &BrowserConfig, base_url: &str, viewport: &Viewport, timeouts: &TimeoutConfig) -> Value {
    json!({
        "browser": config.kind.as_str(),
        "headless": config.headless,
        "viewport": viewport,
        "baseUrl": base_url,
        "timeoutMs": timeouts.command_ms,
        "navigationTimeoutMs": timeouts.page_load_ms,
    })
}

fn target_json(target: &Target) -> Value {
    json!({
        "base": target.selector.to_css(),
        "find": target.find,
        "index": target.index,
    })
}

/// Scheme, host and port of the app, as browsers send it in `Origin`
fn app_origin(base_url: &str) -> E2eResult<String> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| E2eError::Config(format!("app_url '{}' is not a valid URL: {}", base_url, e)))?;
    Ok(url.origin().ascii_serialization())
}

/// CORS headers for a stubbed API response. The app calls the API
/// cross-origin with credentials, so a wildcard origin is rejected. The
/// bridge swaps in the request's own `Origin` when it carries one.
fn stub_headers(origin: &str) -> Value {
    json!({
        "access-control-allow-origin": origin,
        "access-control-allow-credentials": "true",
    })
}

fn absolute(path: &Path) -> E2eResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[async_trait]
impl Driver for PlaywrightDriver {
    async fn visit(&mut self, url: &str) -> E2eResult<()> {
        self.call_void("visit", json!({ "url": url })).await
    }

    async fn click(&mut self, target: &Target) -> E2eResult<()> {
        self.call_void("click", json!({ "target": target_json(target) })).await
    }

    async fn type_text(&mut self, target: &Target, text: &str) -> E2eResult<()> {
        self.call_void("type", json!({ "target": target_json(target), "text": text }))
            .await
    }

    async fn clear(&mut self, target: &Target) -> E2eResult<()> {
        self.call_void("clear", json!({ "target": target_json(target) })).await
    }

    async fn blur(&mut self, target: &Target) -> E2eResult<()> {
        self.call_void("blur", json!({ "target": target_json(target) })).await
    }

    async fn query(&mut self, target: &Target) -> E2eResult<Vec<ElementState>> {
        let result = self.call("query", json!({ "target": target_json(target) })).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn pathname(&mut self) -> E2eResult<String> {
        let url = self.url().await?;
        Ok(request_path(&url))
    }

    async fn url(&mut self) -> E2eResult<String> {
        match self.call("url", Value::Null).await? {
            Value::String(url) => Ok(url),
            other => Err(E2eError::Driver(format!("unexpected url reply {}", other))),
        }
    }

    async fn add_cookies(&mut self, cookies: &[SessionCookie]) -> E2eResult<()> {
        self.call_void("addCookies", json!({ "cookies": cookies })).await
    }

    async fn stub_route(&mut self, route: &Route) -> E2eResult<()> {
        let Some(body) = &route.stub else {
            return Ok(());
        };
        let pattern = RoutePattern::compile(&route.method, &route.path)?;
        self.call_void(
            "route",
            json!({
                "method": route.method,
                "pattern": pattern.regex_source(),
                "headers": stub_headers(&self.origin),
                "body": body,
            }),
        )
        .await
    }

    async fn drain_network(&mut self) -> E2eResult<Vec<NetworkEvent>> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        Ok(drained)
    }

    async fn screenshot(&mut self) -> E2eResult<Vec<u8>> {
        self.shots += 1;
        let path = self.script_dir.path().join(format!("shot-{}.png", self.shots));
        self.call_void("screenshot", json!({ "path": path })).await?;
        let png = std::fs::read(&path)?;
        let _ = std::fs::remove_file(&path);
        Ok(png)
    }

    async fn dom_snapshot(&mut self) -> E2eResult<String> {
        match self.call("dom", Value::Null).await? {
            Value::String(html) => Ok(html),
            other => Err(E2eError::Driver(format!("unexpected dom reply {}", other))),
        }
    }

    async fn close(&mut self) -> E2eResult<()> {
        let result = self.call_void("close", Value::Null).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
        self.reader.abort();
        match result {
            // The bridge may exit before its reply is read
            Err(E2eError::BridgeClosed) => Ok(()),
            other => other,
        }
    }
}

impl Drop for PlaywrightDriver {
    fn drop(&mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
    }
}
