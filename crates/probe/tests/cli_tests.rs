//! Probe binary integration tests

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

const BIN: &str = env!("CARGO_BIN_EXE_disk-probe");

/// Kills the probe when the test ends
struct Probe(Child);

impl Drop for Probe {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Issue `GET /disk`, retrying while the probe starts up
fn get_disk(port: u16) -> String {
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .write_all(b"GET /disk HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            return response;
        }
        sleep(Duration::from_millis(100));
    }
    panic!("probe did not start listening on port {}", port);
}

#[test]
fn test_cli_help() {
    let output = Command::new(BIN).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "help should succeed");
    assert!(stdout.contains("--volumes"));
    assert!(stdout.contains("--mount"));
    assert!(stdout.contains("--port"));
}

#[test]
fn test_cli_version() {
    let output = Command::new(BIN).arg("--version").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("disk-probe"));
}

#[cfg(unix)]
#[test]
fn test_serves_disk_usage() {
    let mount = tempfile::tempdir().unwrap();
    std::fs::create_dir(mount.path().join("data-0")).unwrap();
    let port = free_port();

    let _probe = Probe(
        Command::new(BIN)
            .args(["--volumes", "data-0,missing", "--port", &port.to_string()])
            .arg("--mount")
            .arg(mount.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    );

    let response = get_disk(port);
    assert!(response.starts_with("HTTP/1.1 500"), "{}", response);
    assert!(response.contains(r#""volume_name":"data-0""#));
    assert!(response.contains(r#""total_bytes":"#));
    assert!(response.contains(r#""volume_name":"missing""#));
    assert!(response.contains(r#""error":"#));
}

#[cfg(unix)]
#[test]
fn test_sigterm_shuts_down_gracefully() {
    let mount = tempfile::tempdir().unwrap();
    let port = free_port();

    let mut probe = Probe(
        Command::new(BIN)
            .args(["--volumes", "data-0", "--port", &port.to_string()])
            .arg("--mount")
            .arg(mount.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    );
    get_disk(port);
    // Give the shutdown task time to install its handlers
    sleep(Duration::from_millis(200));

    let killed = Command::new("kill")
        .args(["-TERM", &probe.0.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    for _ in 0..50 {
        if let Some(status) = probe.0.try_wait().unwrap() {
            assert!(status.success(), "probe exited with {}", status);
            return;
        }
        sleep(Duration::from_millis(100));
    }
    panic!("probe did not exit after SIGTERM");
}
