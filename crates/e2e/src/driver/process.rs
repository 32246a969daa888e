//! WebDriver server process - spawning and health checking chromedriver/geckodriver

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::{E2eError, E2eResult};

/// Handle to a running driver process
pub struct DriverProcess {
    child: Child,
    pub url: String,
    pub port: u16,
    stopped: bool,
}

impl DriverProcess {
    /// Spawn the driver binary configured for this browser
    pub async fn spawn(config: &BrowserConfig) -> E2eResult<Self> {
        let binary = config
            .webdriver
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(config.kind.driver_binary()));
        let port = match config.webdriver.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let url = format!("http://127.0.0.1:{}", port);

        info!("Spawning {} on port {}", binary.display(), port);

        let mut cmd = Command::new(&binary);
        cmd.arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            E2eError::Setup(format!("Failed to spawn {}: {}", binary.display(), e))
        })?;

        let mut handle = DriverProcess {
            child,
            url: url.clone(),
            port,
            stopped: false,
        };

        let startup = Duration::from_millis(config.webdriver.startup_timeout_ms);
        if let Err(e) = handle.wait_for_healthy(startup).await {
            handle.stop().await?;
            return Err(e);
        }

        info!("Driver is ready at {}", url);
        Ok(handle)
    }

    /// Wait for the driver to answer `/status` with `ready: true`
    async fn wait_for_healthy(&mut self, timeout_duration: Duration) -> E2eResult<()> {
        let status_url = format!("{}/status", self.url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = tokio::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(E2eError::Setup(format!("Driver exited during startup: {}", status)));
            }

            match client.get(&status_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let ready = resp
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.pointer("/value/ready").and_then(|r| r.as_bool()))
                        .unwrap_or(true);
                    if ready {
                        return Ok(());
                    }
                    debug!("Driver reports not ready yet");
                }
                Ok(resp) => {
                    warn!("Driver status returned {}", resp.status());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for driver to start...");
                    }
                    // Connection refused is expected while the driver starts
                    if !e.is_connect() {
                        warn!("Driver status error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(E2eError::Setup(format!(
            "Driver at {} not healthy after {} attempts",
            self.url, attempts
        )))
    }

    /// Process id of the driver
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Stop the driver: SIGTERM, then kill. Waits with timers so other
    /// sessions on the runtime keep running. Safe to call more than once.
    pub async fn stop(&mut self) -> E2eResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!("Stopping driver (pid: {})", self.child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() && self.exited_within(10).await? {
                return Ok(());
            }
        }

        // Force kill if still running
        let _ = self.child.kill();
        if !self.exited_within(20).await? {
            warn!("Driver (pid: {}) still running after kill", self.child.id());
        }
        Ok(())
    }

    async fn exited_within(&mut self, polls: u32) -> E2eResult<bool> {
        for _ in 0..polls {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            sleep(Duration::from_millis(50)).await;
        }
        Ok(self.child.try_wait()?.is_some())
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.kill();
            let _ = self.child.try_wait();
        }
    }
}

/// Find a free port to use
fn find_free_port() -> E2eResult<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port1 = find_free_port().unwrap();
        let port2 = find_free_port().unwrap();

        // Ports should be in valid range
        assert!(port1 > 1024);
        assert!(port2 > 1024);
    }

    fn running(script: &str) -> DriverProcess {
        let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
        DriverProcess {
            child,
            url: "http://127.0.0.1:1".into(),
            port: 1,
            stopped: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let mut process = running("exec sleep 30");
        let start = std::time::Instant::now();

        process.stop().await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(process.child.try_wait().unwrap().is_some());
        process.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_without_stalling_the_runtime() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let mut process = running("trap '' TERM; exec sleep 30");
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
            }
        });

        process.stop().await.unwrap();
        ticker.abort();

        assert!(process.child.try_wait().unwrap().is_some());
        // SIGTERM is ignored, so stop spends ~500 ms waiting before the kill
        assert!(ticks.load(Ordering::SeqCst) > 10, "runtime stalled during stop");
    }

    #[tokio::test]
    async fn test_missing_binary_is_setup_error() {
        let mut config = BrowserConfig::default();
        config.webdriver.binary = Some(PathBuf::from("/nonexistent/uiflow-test-driver"));
        config.webdriver.port = Some(1);

        match DriverProcess::spawn(&config).await {
            Err(E2eError::Setup(msg)) => assert!(msg.contains("Failed to spawn")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("spawn of a missing binary succeeded"),
        }
    }
}
