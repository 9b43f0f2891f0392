#![allow(dead_code)]

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use lxcterm::pty::AttachCommand;
use lxcterm::reaper::Reaper;
use lxcterm::registry::SessionRegistry;
use lxcterm::session::SessionOptions;
use tokio::net::TcpListener;

/// Session options that run `program args..` instead of `lxc-attach`,
/// listening on loopback only.
pub fn options_with(program: &str, args: &[&str]) -> SessionOptions {
    SessionOptions {
        command: AttachCommand::new(program, args),
        listen_host: "127.0.0.1".parse().unwrap(),
        ..SessionOptions::default()
    }
}

/// A registry whose sessions run `cat`, so input is echoed back.
pub fn cat_registry(ports: RangeInclusive<u16>) -> SessionRegistry {
    SessionRegistry::new(options_with("cat", &[]), ports, Reaper::disabled())
}

/// Poll `check` every 20ms until it returns true or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Whether a plain listener could bind `127.0.0.1:port` right now.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Write an executable shell script named `name` into `dir`.
pub fn fake_tool(dir: &Path, name: &str, script: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A directory of stand-in `lxc-*` tools. Every invocation is appended to
/// `calls.log` as `tool args..`.
pub fn fake_lxc_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let record = format!("echo \"$(basename \"$0\") $*\" >> {}", log.display());

    fake_tool(
        dir.path(),
        "lxc-info",
        &format!(
            "{record}\n\
             if [ \"$1\" = \"--version\" ]; then echo 5.0.3; exit 0; fi\n\
             if [ \"$2\" = \"missing\" ]; then echo \"missing doesn't exist\" >&2; exit 1; fi\n\
             echo \"Name:           $2\"\n\
             echo \"State:          RUNNING\"\n\
             echo \"PID:            4242\"\n\
             echo \"IP:             10.0.3.7\"\n\
             echo \"Link:           veth0\"\n\
             echo \" TX bytes:      1.00 KiB\"\n\
             echo \" RX bytes:      2.00 KiB\"\n\
             echo \" Total bytes:   3.00 KiB\""
        ),
    );
    fake_tool(dir.path(), "lxc-ls", &format!("{record}\necho 'web01  db01'"));
    for tool in [
        "lxc-start",
        "lxc-stop",
        "lxc-freeze",
        "lxc-unfreeze",
        "lxc-create",
        "lxc-destroy",
    ] {
        fake_tool(dir.path(), tool, &record);
    }
    dir
}

pub fn read_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
