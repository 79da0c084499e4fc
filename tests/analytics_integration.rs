//! Integration tests for per-request analytics emitted by a real worker.
//!
//! Requests go over the worker's TCP transport; records are read back from
//! the JSON-lines analytics log after the worker has been stopped, which
//! flushes the log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use worker_loader::analytics::AnalyticsRecord;
use worker_loader::app::MANIFEST_FILE;
use worker_loader::config::StartOptions;
use worker_loader::loader::{Loader, WorkerHandle, WorkerSpec};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

const BOOTSTRAP: &str = env!("CARGO_BIN_EXE_worker-bootstrap");

struct Fixture {
    app: tempfile::TempDir,
    _logs: tempfile::TempDir,
    log: PathBuf,
}

fn fixture(manifest: &str) -> Fixture {
    let app = tempfile::tempdir().unwrap();
    std::fs::write(app.path().join(MANIFEST_FILE), manifest).unwrap();
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("analytics.jsonl");
    Fixture {
        app,
        _logs: logs,
        log,
    }
}

async fn start(fixture: &Fixture, extra: &[(&str, Value)]) -> WorkerHandle {
    let mut spec = WorkerSpec::bootstrap(BOOTSTRAP, fixture.app.path())
        .with_option("analytics_log", fixture.log.to_string_lossy().into_owned());
    for (key, value) in extra {
        spec = spec.with_option(*key, value.clone());
    }
    let options = StartOptions::default().with_startup_timeout(Duration::from_secs(5));
    Loader::new().start(&spec, &options).await.unwrap()
}

/// Send one request frame and read one reply frame.
async fn request(stream: &mut BufReader<TcpStream>, frame: Value) -> Value {
    let mut line = serde_json::to_vec(&frame).unwrap();
    line.push(b'\n');
    stream.get_mut().write_all(&line).await.unwrap();

    let mut reply = String::new();
    stream.read_line(&mut reply).await.unwrap();
    serde_json::from_str(&reply).unwrap()
}

async fn connect(handle: &WorkerHandle) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(handle.listen_address()).await.unwrap())
}

fn records(log: &Path) -> Vec<AnalyticsRecord> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[cfg(unix)]
fn handler(dir: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("handler.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn successful_request_yields_one_record() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"static"}"#);
        let public = fixture.app.path().join("public");
        std::fs::create_dir(&public).unwrap();
        std::fs::write(public.join("index.html"), "<h1>hello</h1>").unwrap();

        let mut handle = start(&fixture, &[]).await;
        let mut stream = connect(&handle).await;

        let reply = request(&mut stream, serde_json::json!({"path": "/"})).await;
        assert_eq!(reply["status"], 200);
        assert_eq!(reply["body"], "<h1>hello</h1>");
        assert_eq!(reply["headers"]["content-type"], "text/html");
        drop(stream);

        handle.stop().await;

        let records = records(&fixture.log);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.error_kind.is_none());
        assert_eq!(record.status_code, Some(200));
        assert!(record.processing_duration_micros > 0);
        assert!(record.gc_duration_micros <= record.processing_duration_micros);
        assert_eq!(record.worker_pid, handle.pid());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn echo_response_is_relayed_unchanged() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"echo"}"#);
        let mut handle = start(&fixture, &[]).await;
        let mut stream = connect(&handle).await;

        let body = "line one\nline two \u{2603}";
        let reply = request(
            &mut stream,
            serde_json::json!({"method": "POST", "path": "/submit", "body": body}),
        )
        .await;
        assert_eq!(reply["status"], 200);
        assert_eq!(reply["body"], body);
        assert_eq!(reply["headers"]["x-echo-method"], "POST");
        assert_eq!(reply["headers"]["x-echo-path"], "/submit");
        drop(stream);

        handle.stop().await;
        assert_eq!(records(&fixture.log).len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn record_count_matches_dispatch_count() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"static"}"#);
        let public = fixture.app.path().join("public");
        std::fs::create_dir(&public).unwrap();
        std::fs::write(public.join("a.txt"), "a").unwrap();

        let mut handle = start(&fixture, &[]).await;
        let mut stream = connect(&handle).await;

        let paths = ["/a.txt", "/missing.txt", "/../etc/passwd", "/a.txt", "/"];
        let mut statuses = Vec::new();
        for path in paths {
            let reply = request(&mut stream, serde_json::json!({ "path": path })).await;
            statuses.push(reply["status"].as_u64().unwrap());
        }
        assert_eq!(statuses, vec![200, 404, 403, 200, 404]);
        drop(stream);

        handle.stop().await;

        let records = records(&fixture.log);
        assert_eq!(records.len(), paths.len());
        let recorded: Vec<u64> = records
            .iter()
            .map(|r| u64::from(r.status_code.unwrap()))
            .collect();
        assert_eq!(recorded, statuses);

        // Distinct ids, strictly increasing sequence.
        let mut ids: Vec<_> = records.iter().map(|r| r.request_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), paths.len());
        assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
    })
    .await
    .expect("test timed out");
}

#[cfg(unix)]
#[tokio::test]
async fn failed_dispatch_is_recorded_and_reported() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"command","program":"handler.sh"}"#);
        handler(
            fixture.app.path(),
            r#"input=$(cat)
case "$input" in
  *'"/fail"'*) echo 'database unavailable' >&2; exit 3 ;;
  *) echo '{"status":201,"body":"made"}' ;;
esac"#,
        );

        let mut handle = start(&fixture, &[]).await;
        let mut stream = connect(&handle).await;

        let ok = request(&mut stream, serde_json::json!({"path": "/ok"})).await;
        assert_eq!(ok["status"], 201);
        assert_eq!(ok["body"], "made");

        let failed = request(&mut stream, serde_json::json!({"path": "/fail"})).await;
        assert_eq!(failed["error"]["kind"], "command_failed");
        assert!(
            failed["error"]["message"]
                .as_str()
                .unwrap()
                .contains("database unavailable")
        );

        // The worker keeps serving after a failed dispatch.
        let again = request(&mut stream, serde_json::json!({"path": "/ok"})).await;
        assert_eq!(again["status"], 201);
        drop(stream);

        handle.stop().await;

        let records = records(&fixture.log);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status_code, Some(201));
        assert_eq!(records[1].error_kind.as_deref(), Some("command_failed"));
        assert!(records[1].status_code.is_none());
        assert_eq!(records[2].status_code, Some(201));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shared_retry_ids_are_kept_with_attempts() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"echo"}"#);
        let policy = ("request_id_policy", Value::from("shared_across_retries"));
        let mut handle = start(&fixture, &[policy]).await;
        let mut stream = connect(&handle).await;

        let id = "6f1c5b1e-8d7a-4c59-9a44-3f0d2f5c9b10";
        for attempt in 1..=3 {
            request(
                &mut stream,
                serde_json::json!({"id": id, "attempt": attempt, "path": "/"}),
            )
            .await;
        }
        drop(stream);
        handle.stop().await;

        let records = records(&fixture.log);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.request_id.to_string() == id));
        let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_connections_each_get_a_record() {
    timeout(TEST_TIMEOUT, async {
        let fixture = fixture(r#"{"framework":"echo"}"#);
        let mut handle = start(&fixture, &[]).await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let address = handle.listen_address().to_string();
            tasks.push(tokio::spawn(async move {
                let mut stream = BufReader::new(TcpStream::connect(address).await.unwrap());
                let reply = request(
                    &mut stream,
                    serde_json::json!({"path": "/", "body": format!("client {i}")}),
                )
                .await;
                assert_eq!(reply["body"], format!("client {i}"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        handle.stop().await;
        assert_eq!(records(&fixture.log).len(), 8);
    })
    .await
    .expect("test timed out");
}
