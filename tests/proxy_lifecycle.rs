//! Lifecycle tests against throwaway shell-script proxies.
//!
//! Each script stands in for cloud-sql-proxy and writes a `started` marker
//! first. Readiness is simulated by a `TcpListener` the test binds on the
//! proxy's port once that marker appears, since a port that is already busy
//! before the spawn is rejected. Tests are serialized so no other test forks
//! while a script is still open for writing.

#![cfg(unix)]

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cloudsql_postgres::proxy::process::pid_is_alive;
use cloudsql_postgres::{
    cloud_sql_proxy_running, cloud_sql_proxy_running_async, CloudSqlProxy, Error, ProxyLocator,
    ProxyOptions, ProxyState,
};

const INSTANCE: &str = "project:region:instance";

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("cloud-sql-proxy");
    let started = dir.join("started");
    fs::write(
        &path,
        format!("#!/bin/sh\necho started > {}\n{}\n", started.display(), body),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn unused_port() -> u16 {
    let (listener, port) = listener();
    drop(listener);
    port
}

/// Pick a free port and start listening on it once the script in `dir` has
/// started. Keep the handle alive for as long as the port should accept.
fn listen_after_start(dir: &Path) -> (JoinHandle<TcpListener>, u16) {
    let started = dir.join("started");
    let _ = fs::remove_file(&started);
    let port = unused_port();
    let handle = std::thread::spawn(move || {
        wait_for_file(&started);
        TcpListener::bind(("127.0.0.1", port)).unwrap()
    });
    (handle, port)
}

fn wait_for_file(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if content.ends_with('\n') {
                return content;
            }
        }
        assert!(Instant::now() < deadline, "{:?} never written", path);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn read_pid(path: &Path) -> u32 {
    wait_for_file(path).trim().parse().unwrap()
}

#[test]
fn test_starts_and_stops_proxy() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args.txt");
    let script = write_script(
        dir.path(),
        &format!("echo \"$@\" > {}\nexec sleep 30", args_file.display()),
    );
    let (_ready, port) = listen_after_start(dir.path());

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let pid = cloud_sql_proxy_running(&options, |proxy| {
        assert_eq!(proxy.state(), ProxyState::Ready);
        assert_eq!(proxy.port(), port);
        assert_eq!(proxy.instance_connection_name(), INSTANCE);
        assert_eq!(proxy.executable_path(), script.as_path());
        assert!(pid_is_alive(proxy.pid()));

        let args = wait_for_file(&args_file);
        assert_eq!(args, format!("{} --port {}\n", INSTANCE, port));
        Ok::<_, Error>(proxy.pid())
    })
    .unwrap();

    assert!(!pid_is_alive(pid), "proxy should be terminated and reaped");
}

#[test]
fn test_startup_timeout_skips_body_and_reaps() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let script = write_script(
        dir.path(),
        &format!(
            "echo \"waiting for instance\"\necho $$ > {}\nexec sleep 30",
            pid_file.display()
        ),
    );

    let options = ProxyOptions::new(INSTANCE, unused_port())
        .with_proxy_path(&script)
        .with_startup_timeout(Duration::from_secs(1));

    let mut body_ran = false;
    let started = Instant::now();
    let result = cloud_sql_proxy_running(&options, |_| {
        body_ran = true;
        Ok::<_, Error>(())
    });

    assert!(!body_ran, "body must not run when the proxy never becomes ready");
    assert!(started.elapsed() >= Duration::from_secs(1));
    match result {
        Err(Error::ProxyStartupTimeout { timeout, output }) => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert!(output.contains("waiting for instance"), "output was: {:?}", output);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!pid_is_alive(read_pid(&pid_file)));
}

#[test]
fn test_body_error_still_tears_down() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let (_ready, port) = listen_after_start(dir.path());

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let mut pid = 0;
    let result: Result<(), Error> = cloud_sql_proxy_running(&options, |proxy| {
        pid = proxy.pid();
        Err(Error::Config("query failed".into()))
    });

    assert!(matches!(result, Err(Error::Config(ref msg)) if msg == "query failed"));
    assert_ne!(pid, 0);
    assert!(!pid_is_alive(pid));
}

#[test]
fn test_panic_in_body_still_tears_down() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let (_ready, port) = listen_after_start(dir.path());

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let pid = std::cell::Cell::new(0);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        cloud_sql_proxy_running(&options, |proxy| -> Result<(), Error> {
            pid.set(proxy.pid());
            panic!("caller code failed");
        })
    }));

    assert!(result.is_err());
    assert_ne!(pid.get(), 0);
    assert!(!pid_is_alive(pid.get()));
}

#[test]
fn test_sequential_sessions_never_overlap() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");

    let (ready, port) = listen_after_start(dir.path());
    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let first = cloud_sql_proxy_running(&options, |proxy| Ok::<_, Error>(proxy.pid())).unwrap();
    assert!(!pid_is_alive(first));
    drop(ready.join().unwrap());

    let (_ready, port) = listen_after_start(dir.path());
    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let second = cloud_sql_proxy_running(&options, |proxy| {
        assert!(!pid_is_alive(first));
        Ok::<_, Error>(proxy.pid())
    })
    .unwrap();
    assert_ne!(first, second);
    assert!(!pid_is_alive(second));
}

#[test]
fn test_ignored_sigterm_escalates_to_kill() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let trapped = dir.path().join("trapped");
    let script = write_script(
        dir.path(),
        &format!("trap '' TERM\necho yes > {}\nwhile true; do sleep 1; done", trapped.display()),
    );
    let (_ready, port) = listen_after_start(dir.path());

    let options = ProxyOptions::new(INSTANCE, port)
        .with_proxy_path(&script)
        .with_shutdown_grace(Duration::from_millis(300));

    let proxy = CloudSqlProxy::start(&options).unwrap();
    assert_eq!(proxy.state(), ProxyState::Ready);
    let pid = proxy.pid();
    wait_for_file(&trapped);

    let started = Instant::now();
    proxy.stop().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!pid_is_alive(pid));
}

#[test]
fn test_early_exit_reports_status_and_output() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "echo \"credentials not found\" >&2\nexit 3");

    let options = ProxyOptions::new(INSTANCE, unused_port())
        .with_proxy_path(&script)
        .with_startup_timeout(Duration::from_secs(5));

    match CloudSqlProxy::start(&options) {
        Err(Error::ProxyExited { status, output }) => {
            assert_eq!(status.code(), Some(3));
            assert!(output.contains("credentials not found"), "output was: {:?}", output);
        }
        other => panic!("unexpected result: {:?}", other.err()),
    }
}

#[test]
fn test_invalid_instance_name_spawns_nothing() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let script = write_script(dir.path(), &format!("touch {}\nexec sleep 30", marker.display()));

    let options = ProxyOptions::new("project:instance", unused_port()).with_proxy_path(&script);
    let result = cloud_sql_proxy_running(&options, |_| Ok::<_, Error>(()));

    assert!(matches!(result, Err(Error::InvalidInstanceName(_))));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!marker.exists());
}

#[test]
fn test_busy_port_is_rejected_before_spawn() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "sleep 0.3\necho \"bind: address already in use\" >&2\nexit 1",
    );
    let (_listener, port) = listener();

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let mut body_ran = false;
    let result = cloud_sql_proxy_running(&options, |_| {
        body_ran = true;
        Ok::<_, Error>(())
    });

    assert!(!body_ran, "body must not run against whatever holds the port");
    assert!(matches!(result, Err(Error::ProxyPortInUse { port: busy }) if busy == port));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!dir.path().join("started").exists());
}

#[test]
fn test_located_binary_is_spawned() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let (_ready, port) = listen_after_start(dir.path());

    let located = ProxyLocator::from_env().locate(Some(script.as_path())).unwrap();
    assert_eq!(located, script);

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(located);
    let pid = cloud_sql_proxy_running(&options, |proxy| Ok::<_, Error>(proxy.pid())).unwrap();
    assert!(!pid_is_alive(pid));
}

#[tokio::test]
async fn test_async_session_tears_down() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exec sleep 30");
    let (_ready, port) = listen_after_start(dir.path());

    let options = ProxyOptions::new(INSTANCE, port).with_proxy_path(&script);
    let endpoint = cloud_sql_proxy_running_async(options, |endpoint| async move {
        assert!(pid_is_alive(endpoint.pid));
        assert_eq!(endpoint.address().port(), port);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, Error>(endpoint)
    })
    .await
    .unwrap();

    assert_eq!(endpoint.instance_connection_name, INSTANCE);
    assert!(!pid_is_alive(endpoint.pid));
}
