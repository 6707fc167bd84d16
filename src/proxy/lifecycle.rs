//! cloud-sql-proxy process lifecycle management.
//!
//! Provides the `CloudSqlProxy` guard which manages:
//! - Proxy process spawning with captured output
//! - Waiting for the proxy to accept connections on its local port
//! - Termination and reaping on every exit path, including panics

use std::collections::VecDeque;
use std::future::Future;
use std::io::{BufRead, BufReader, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::defaults;
use crate::error::{Error, Result};
use crate::proxy::instance::validate_instance_name;
use crate::proxy::locator::locate_proxy_binary;
use crate::proxy::process::stop_child;

const MAX_CAPTURED_LINES: usize = 500;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings for one proxy session.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub instance_connection_name: String,
    pub port: u16,
    /// Executable to run. Looked up with the locator when `None`.
    pub proxy_path: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    /// Extra flags appended after the instance and port, e.g. `--private-ip`.
    pub extra_args: Vec<String>,
}

impl ProxyOptions {
    pub fn new(instance_connection_name: impl Into<String>, port: u16) -> Self {
        Self {
            instance_connection_name: instance_connection_name.into(),
            port,
            proxy_path: None,
            startup_timeout: defaults::STARTUP_TIMEOUT,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
            poll_interval: defaults::POLL_INTERVAL,
            extra_args: Vec::new(),
        }
    }

    pub fn with_proxy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_path = Some(path.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command-line arguments passed to the proxy executable.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.instance_connection_name.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Lifecycle of a proxy session.
///
/// `NotStarted -> Starting -> Ready -> Stopping -> Stopped`. A session that
/// never becomes ready still passes through `Stopping`, unless the spawn
/// itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

/// Owned details of a running proxy, handed to async session bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub executable_path: PathBuf,
    pub instance_connection_name: String,
    pub port: u16,
    pub pid: u32,
}

impl ProxyEndpoint {
    /// Local address the proxy listens on.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Lines written by the proxy to stdout and stderr.
#[derive(Clone, Default)]
struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    open_streams: Arc<AtomicUsize>,
}

impl OutputBuffer {
    fn capture<R: Read + Send + 'static>(&self, stream: R, name: &'static str) {
        let lines = Arc::clone(&self.lines);
        let open_streams = Arc::clone(&self.open_streams);
        open_streams.fetch_add(1, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name(format!("cloud-sql-proxy-{}", name))
            .spawn(move || {
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    log::debug!("cloud-sql-proxy {}: {}", name, line);
                    let mut buf = lines.lock().unwrap_or_else(|e| e.into_inner());
                    if buf.len() == MAX_CAPTURED_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
                open_streams.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
            log::warn!("Failed to capture proxy {}: {}", name, e);
        }
    }

    /// Give the readers up to `timeout` to hit end-of-stream after the
    /// process has exited.
    fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.open_streams.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn snapshot(&self) -> String {
        let buf = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Why the proxy never became ready.
enum StartupFailure {
    TimedOut(Duration),
    Exited(ExitStatus),
    Io(std::io::Error),
}

/// A running cloud-sql-proxy process.
///
/// The process is stopped and reaped by [`CloudSqlProxy::stop`] or, failing
/// that, when the guard is dropped.
pub struct CloudSqlProxy {
    endpoint: ProxyEndpoint,
    child: Option<Child>,
    output: OutputBuffer,
    state: ProxyState,
    shutdown_grace: Duration,
}

impl CloudSqlProxy {
    /// Start the proxy and block until it accepts connections.
    pub fn start(options: &ProxyOptions) -> Result<Self> {
        validate_instance_name(&options.instance_connection_name)?;

        let executable_path = match options.proxy_path {
            Some(ref path) => path.clone(),
            None => locate_proxy_binary(None)?,
        };

        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, options.port));
        if TcpStream::connect_timeout(&address, defaults::PROBE_TIMEOUT).is_ok() {
            log::error!("Cannot start Cloud SQL Proxy: {} is already in use", address);
            return Err(Error::ProxyPortInUse { port: options.port });
        }

        log::info!("Starting Cloud SQL Proxy...");
        log::info!("Using cloud-sql-proxy at: {}", executable_path.display());
        log::info!(
            "Connecting to instance: {} on port {}",
            options.instance_connection_name,
            options.port
        );

        let mut child = Command::new(&executable_path)
            .args(options.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::ProxySpawnFailed {
                path: executable_path.clone(),
                source,
            })?;

        let output = OutputBuffer::default();
        if let Some(stdout) = child.stdout.take() {
            output.capture(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            output.capture(stderr, "stderr");
        }

        let mut proxy = Self {
            endpoint: ProxyEndpoint {
                executable_path,
                instance_connection_name: options.instance_connection_name.clone(),
                port: options.port,
                pid: child.id(),
            },
            child: Some(child),
            output,
            state: ProxyState::Starting,
            shutdown_grace: options.shutdown_grace,
        };

        if let Err(failure) = proxy.wait_until_ready(options.startup_timeout, options.poll_interval) {
            if let Err(teardown) = proxy.teardown() {
                log::error!("Proxy teardown after failed startup also failed: {}", teardown);
            }
            proxy.output.drain(OUTPUT_DRAIN_TIMEOUT);
            let output = proxy.output.snapshot();
            return Err(match failure {
                StartupFailure::TimedOut(timeout) => Error::ProxyStartupTimeout { timeout, output },
                StartupFailure::Exited(status) => Error::ProxyExited { status, output },
                StartupFailure::Io(e) => Error::Io(e),
            });
        }

        proxy.state = ProxyState::Ready;
        log::info!(
            "Cloud SQL Proxy ready on {} (pid {})",
            proxy.endpoint.address(),
            proxy.endpoint.pid
        );
        Ok(proxy)
    }

    /// Stop the proxy, surfacing teardown failures.
    pub fn stop(mut self) -> Result<()> {
        self.teardown()
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> u32 {
        self.endpoint.pid
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn instance_connection_name(&self) -> &str {
        &self.endpoint.instance_connection_name
    }

    pub fn executable_path(&self) -> &Path {
        &self.endpoint.executable_path
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Output captured from the proxy so far.
    pub fn output(&self) -> String {
        self.output.snapshot()
    }

    fn wait_until_ready(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> std::result::Result<(), StartupFailure> {
        let address = self.endpoint.address();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut warned = false;

        loop {
            self.check_still_running()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe_timeout = defaults::PROBE_TIMEOUT
                .min(remaining)
                .max(Duration::from_millis(1));
            if TcpStream::connect_timeout(&address, probe_timeout).is_ok() {
                // The port may belong to someone else if the proxy died meanwhile
                self.check_still_running()?;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "Cloud SQL Proxy not accepting connections on {} after {:?}; giving up",
                    address,
                    timeout
                );
                return Err(StartupFailure::TimedOut(timeout));
            }

            if !warned && now.duration_since(started) >= timeout / 2 {
                log::warn!(
                    "Cloud SQL Proxy not accepting connections on {} after {:?}; still waiting",
                    address,
                    now.duration_since(started)
                );
                warned = true;
            }

            std::thread::sleep(poll_interval.min(deadline - now));
        }
    }

    fn check_still_running(&mut self) -> std::result::Result<(), StartupFailure> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(Some(status)) => Err(StartupFailure::Exited(status)),
            Ok(None) => Ok(()),
            Err(e) => Err(StartupFailure::Io(e)),
        }
    }

    /// Terminate and reap the child. Runs at most once.
    fn teardown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = self.endpoint.pid;

        self.state = ProxyState::Stopping;
        log::info!("Stopping Cloud SQL Proxy (pid {})", pid);

        let result = stop_child(&mut child, self.shutdown_grace);
        self.state = ProxyState::Stopped;

        match result {
            Ok(status) => {
                log::info!("Cloud SQL Proxy (pid {}) stopped: {}", pid, status);
                Ok(())
            }
            Err(reason) => {
                log::error!("Failed to stop Cloud SQL Proxy (pid {}): {}", pid, reason);
                Err(Error::ProxyTeardownFailed { pid, reason })
            }
        }
    }
}

impl Drop for CloudSqlProxy {
    fn drop(&mut self) {
        // Errors are already logged by teardown
        let _ = self.teardown();
    }
}

/// Run `body` while a cloud-sql-proxy is running.
///
/// `body` runs only once the proxy accepts connections. The proxy is
/// stopped and reaped before this returns, whether `body` succeeds, fails
/// or panics. A failure from `body` takes precedence over a teardown
/// failure, which is then only logged.
pub fn cloud_sql_proxy_running<T, E, F>(options: &ProxyOptions, body: F) -> std::result::Result<T, E>
where
    F: FnOnce(&CloudSqlProxy) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let proxy = CloudSqlProxy::start(options)?;
    let outcome = body(&proxy);
    merge_outcome(outcome, proxy.stop())
}

/// Async form of [`cloud_sql_proxy_running`].
///
/// Startup and teardown block, so they run on tokio's blocking pool. If the
/// returned future is dropped while `body` is pending, the guard stops the
/// proxy from its `Drop` on whichever runtime worker drops the future. That
/// teardown blocks the worker for up to the shutdown grace plus five seconds
/// when the proxy ignores SIGTERM.
pub async fn cloud_sql_proxy_running_async<T, E, F, Fut>(
    options: ProxyOptions,
    body: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(ProxyEndpoint) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    let proxy = run_blocking(move || CloudSqlProxy::start(&options)).await?;
    let outcome = body(proxy.endpoint().clone()).await;
    let teardown = run_blocking(move || proxy.stop()).await;
    merge_outcome(outcome, teardown)
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Io(std::io::Error::other(e))),
    }
}

fn merge_outcome<T, E: From<Error>>(
    outcome: std::result::Result<T, E>,
    teardown: Result<()>,
) -> std::result::Result<T, E> {
    match (outcome, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            log::error!("Discarding proxy teardown error in favour of session error: {}", teardown);
            Err(e)
        }
    }
}
