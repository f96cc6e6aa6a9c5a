//! Integration tests for the session registry.
//!
//! These tests spawn real `/bin/sh` sessions and verify complete flows:
//! - Admission control at the session limit
//! - Output delivery and reconnect snapshots
//! - Natural exit and forced termination
//! - Registry shutdown

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use termhub::config::Config;
use termhub::session::{CreateOptions, ExitStatus, SessionError, SessionManager, SessionRegistry};

/// Create a registry with a short kill grace period and a temporary home.
fn create_test_registry(max_sessions: usize) -> (SessionRegistry, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.session.max_sessions = max_sessions;
    config.session.kill_grace_ms = 200;
    (SessionRegistry::new(&config), temp_dir)
}

fn sh() -> CreateOptions {
    CreateOptions {
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    }
}

fn sh_command(script: &str) -> CreateOptions {
    CreateOptions {
        shell: Some("/bin/sh".to_string()),
        args: Some(vec!["-c".to_string(), script.to_string()]),
        ..Default::default()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

type Collected = Arc<Mutex<Vec<u8>>>;

fn collect_output(registry: &SessionRegistry, session_id: &str) -> Collected {
    let collected: Collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let id = session_id.to_string();
    let _subscription = registry.on_data(move |session_id, data| {
        if session_id == id {
            sink.lock().unwrap().extend_from_slice(data);
        }
    });
    collected
}

fn contains(collected: &Collected, needle: &str) -> bool {
    String::from_utf8_lossy(&collected.lock().unwrap()).contains(needle)
}

// =============================================================================
// Admission Control Tests
// =============================================================================

#[tokio::test]
async fn test_limit_frees_one_slot_per_kill() {
    let (registry, _temp_dir) = create_test_registry(2);

    let a = registry.create(sh()).await.unwrap();
    let b = registry.create(sh()).await.unwrap();

    let err = registry.create(sh()).await.unwrap_err();
    assert!(matches!(err, SessionError::LimitExceeded { current: 2, max: 2 }));
    assert!(registry.get(&a.id).is_some());
    assert!(registry.get(&b.id).is_some());

    assert!(registry.kill(&a.id));
    assert!(wait_until(Duration::from_secs(2), || registry.get(&a.id).is_none()).await);

    let d = registry.create(sh()).await.unwrap();
    assert!(registry.create(sh()).await.is_err());
    assert_eq!(registry.count(), 2);

    let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
    assert!(ids.contains(&b.id));
    assert!(ids.contains(&d.id));

    registry.shutdown();
}

#[tokio::test]
async fn test_concurrent_creates_respect_limit() {
    let (registry, _temp_dir) = create_test_registry(3);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.create(sh()).await.is_ok() }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() {
            created += 1;
        }
    }

    assert_eq!(created, 3);
    assert_eq!(registry.count(), 3);
    assert_eq!(registry.health().utilization, 1.0);

    registry.shutdown();
}

// =============================================================================
// Output Tests
// =============================================================================

#[tokio::test]
async fn test_output_reaches_subscribers() {
    let (registry, _temp_dir) = create_test_registry(4);

    let session = registry.create(sh()).await.unwrap();
    let collected = collect_output(&registry, &session.id);

    assert!(registry.write(&session.id, b"echo integration_marker_$((20+22))\n"));
    assert!(wait_until(Duration::from_secs(5), || contains(&collected, "integration_marker_42")).await);

    registry.shutdown();
}

#[tokio::test]
async fn test_reconnect_returns_scrollback() {
    let (registry, _temp_dir) = create_test_registry(4);

    let session = registry.create(sh()).await.unwrap();
    let collected = collect_output(&registry, &session.id);

    registry.write(&session.id, b"echo reconnect_marker\n");
    assert!(wait_until(Duration::from_secs(5), || contains(&collected, "reconnect_marker")).await);

    let scrollback = registry.take_scrollback_for_reconnect(&session.id).unwrap();
    assert!(String::from_utf8_lossy(&scrollback).contains("reconnect_marker"));

    registry.shutdown();
}

#[tokio::test]
async fn test_session_environment() {
    let (registry, _temp_dir) = create_test_registry(4);

    let session = registry
        .create(CreateOptions {
            env: vec![("TERMHUB_TEST_VALUE".to_string(), "env_ok".to_string())],
            ..sh_command("echo \"$TERM:$COLORTERM:$TERMHUB_TEST_VALUE\"; sleep 5")
        })
        .await
        .unwrap();
    let collected = collect_output(&registry, &session.id);

    // The first output may have flushed before the subscription existed.
    let seen = wait_until(Duration::from_secs(5), || {
        contains(&collected, "xterm-256color:truecolor:env_ok")
            || registry
                .take_scrollback_for_reconnect(&session.id)
                .is_some_and(|s| String::from_utf8_lossy(&s).contains("xterm-256color:truecolor:env_ok"))
    })
    .await;
    assert!(seen);

    registry.shutdown();
}

// =============================================================================
// Working Directory Tests
// =============================================================================

#[tokio::test]
async fn test_requested_cwd_is_used() {
    let (registry, temp_dir) = create_test_registry(4);
    let workdir = temp_dir.path().join("work");
    std::fs::create_dir(&workdir).unwrap();

    let session = registry
        .create(CreateOptions {
            cwd: Some(workdir.to_string_lossy().into_owned()),
            ..sh()
        })
        .await
        .unwrap();

    assert_eq!(session.cwd, workdir.canonicalize().unwrap());
    registry.shutdown();
}

#[tokio::test]
async fn test_invalid_cwd_falls_back_to_home() {
    let (registry, temp_dir) = create_test_registry(4);

    let session = registry
        .create(CreateOptions {
            cwd: Some(temp_dir.path().join("missing").to_string_lossy().into_owned()),
            ..sh()
        })
        .await
        .unwrap();

    let home = dirs::home_dir().unwrap_or_else(|| "/".into());
    assert_eq!(session.cwd, home);
    registry.shutdown();
}

// =============================================================================
// Termination Tests
// =============================================================================

#[tokio::test]
async fn test_natural_exit_emits_status() {
    let (registry, _temp_dir) = create_test_registry(4);

    let exits: Arc<Mutex<Vec<(String, ExitStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exits);
    let _subscription = registry.on_exit(move |id, status| {
        sink.lock().unwrap().push((id.to_string(), status.clone()));
    });

    let session = registry.create(sh_command("exit 42")).await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || registry.get(&session.id).is_none()).await);

    let exits = exits.lock().unwrap();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, session.id);
    assert_eq!(exits[0].1.exit_code, 42);
    assert!(!exits[0].1.forced);
    assert_eq!(registry.count(), 0);
}

#[derive(Debug)]
enum Event {
    Data(Vec<u8>),
    Exit(u32),
}

#[tokio::test]
async fn test_final_output_delivered_before_exit() {
    let (registry, _temp_dir) = create_test_registry(4);

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let data = registry.on_data(move |_, data| sink.lock().unwrap().push(Event::Data(data.to_vec())));
    let sink = Arc::clone(&events);
    let exit = registry.on_exit(move |_, status| sink.lock().unwrap().push(Event::Exit(status.exit_code)));

    let session = registry.create(sh_command("printf tail; exit 3")).await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || registry.get(&session.id).is_none()).await);

    let events = events.lock().unwrap();
    let exit_at = events
        .iter()
        .position(|e| matches!(e, Event::Exit(_)))
        .expect("exit event");
    assert!(matches!(events[exit_at], Event::Exit(3)));
    assert_eq!(exit_at, events.len() - 1);

    let before_exit: Vec<u8> = events[..exit_at]
        .iter()
        .filter_map(|e| match e {
            Event::Data(bytes) => Some(bytes.as_slice()),
            Event::Exit(_) => None,
        })
        .flatten()
        .copied()
        .collect();
    assert!(String::from_utf8_lossy(&before_exit).contains("tail"));

    drop(events);
    assert!(data.unsubscribe());
    assert!(exit.unsubscribe());
}

#[tokio::test]
async fn test_unresponsive_process_is_force_killed() {
    let (registry, _temp_dir) = create_test_registry(4);

    let exits: Arc<Mutex<Vec<ExitStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&exits);
    let _subscription = registry.on_exit(move |_, status| sink.lock().unwrap().push(status.clone()));

    let session = registry
        .create(sh_command("trap '' HUP TERM; while :; do sleep 1; done"))
        .await
        .unwrap();
    // Give the shell time to install its traps.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    assert!(registry.kill(&session.id));
    assert!(registry.kill(&session.id));

    assert!(wait_until(Duration::from_secs(3), || registry.get(&session.id).is_none()).await);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let exits = exits.lock().unwrap();
    assert_eq!(exits.len(), 1);
    assert!(exits[0].forced);
}

#[tokio::test]
async fn test_shutdown_kills_everything() {
    let (registry, _temp_dir) = create_test_registry(4);

    for _ in 0..3 {
        registry.create(sh()).await.unwrap();
    }
    assert_eq!(registry.count(), 3);

    registry.shutdown();
    assert_eq!(registry.count(), 0);
    assert!(registry.list().is_empty());

    registry.shutdown();
    assert!(matches!(
        registry.create(sh()).await,
        Err(SessionError::RegistryClosed)
    ));
}
