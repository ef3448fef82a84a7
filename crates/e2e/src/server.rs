//! Application process management - spawning and health checking the app under test

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};

/// Lines of app stderr kept for startup errors
const STDERR_TAIL: usize = 20;

/// Handle to a running application process
pub struct AppServer {
    child: Child,
    urls: Vec<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl AppServer {
    /// Spawn the configured command and wait until the app and API answer
    pub async fn spawn(config: &HarnessConfig) -> E2eResult<Self> {
        let (program, args) = config
            .server
            .command
            .split_first()
            .ok_or_else(|| E2eError::ServerStartup("server.command is empty".to_string()))?;

        info!("Spawning application: {}", config.server.command.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("CI", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(cwd) = &config.server.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!("Failed to spawn {}: {}", program, e))
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            std::thread::spawn(move || drain_stderr(stderr, tail));
        }

        let mut handle = AppServer {
            child,
            urls: vec![config.app_url.clone(), config.api_url.clone()],
            stderr_tail,
        };

        let timeout = Duration::from_secs(config.server.startup_timeout_secs);
        if let Err(e) = handle.wait_for_healthy(timeout).await {
            let _ = handle.stop();
            return Err(e);
        }

        info!("Application is up at {}", config.app_url);
        Ok(handle)
    }

    /// Wait for every URL to respond with anything but a connection error
    async fn wait_for_healthy(&mut self, timeout_duration: Duration) -> E2eResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();

        for url in &self.urls {
            let mut attempts = 0;
            loop {
                attempts += 1;

                if let Ok(Some(status)) = self.child.try_wait() {
                    let tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();
                    let mut message = format!("application exited early with {}", status);
                    if !tail.is_empty() {
                        message.push_str(":\n");
                        message.push_str(&tail.join("\n"));
                    }
                    return Err(E2eError::ServerStartup(message));
                }

                match client.get(url).send().await {
                    Ok(resp) if resp.status().is_server_error() => {
                        warn!("Health check on {} returned {}", url, resp.status());
                    }
                    Ok(_) => break,
                    Err(e) => {
                        if attempts == 1 {
                            info!("Waiting for {} ...", url);
                        }
                        // Connection refused is expected while the app is starting
                        if !e.is_connect() && !e.is_timeout() {
                            warn!("Health check error: {}", e);
                        }
                    }
                }

                if start.elapsed() >= timeout_duration {
                    return Err(E2eError::ServerHealthCheck {
                        url: url.clone(),
                        attempts,
                    });
                }
                sleep(Duration::from_millis(250)).await;
            }
        }

        Ok(())
    }

    /// Stop the application
    pub fn stop(&mut self) -> E2eResult<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        info!("Stopping application (pid: {})", self.child.id());

        // Try graceful shutdown first
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(Duration::from_millis(500));
            }
        }

        // Force kill if still running
        let _ = self.child.kill();
        let _ = self.child.wait();

        Ok(())
    }
}

/// Read the app's stderr until it closes. A full pipe would block the app.
fn drain_stderr<R: Read>(stderr: R, tail: Arc<Mutex<VecDeque<String>>>) {
    for line in BufReader::new(stderr).split(b'\n') {
        let Ok(line) = line else { break };
        let line = String::from_utf8_lossy(&line).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("app: {}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

impl Drop for AppServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
