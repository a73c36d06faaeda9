use std::{
    fs,
    os::unix::process::ExitStatusExt,
    path::Path,
    thread,
    time::Duration,
};

use procman::{
    config::Ecosystem,
    error::ProcessManagerError,
    process::is_alive,
    supervisor::{AppSnapshot, AppStatus, Supervisor, SupervisorOptions},
    test_utils::{process_running, wait_until},
};
use tempfile::tempdir;

fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        tick: Duration::from_millis(50),
        watch_interval: Duration::from_millis(100),
    }
}

fn supervisor(dir: &Path, yaml: &str, mode: Option<&str>) -> Supervisor {
    let ecosystem = Ecosystem::parse(yaml, procman::config::ConfigFormat::Yaml, dir).unwrap();
    Supervisor::new(ecosystem, mode, fast_options()).unwrap()
}

fn app(supervisor: &Supervisor, name: &str) -> AppSnapshot {
    supervisor
        .snapshot()
        .unwrap()
        .into_iter()
        .find(|app| app.name == name)
        .expect("app in snapshot")
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[test]
fn crashed_app_is_restarted() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("crash.sh"),
        "echo run >> runs.log\nsleep 0.3\nexit 1\n",
    )
    .unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: crasher
    script: crash.sh
    min_uptime: 100ms
"#,
        None,
    );
    supervisor.start().unwrap();

    let runs = dir.path().join("runs.log");
    assert!(wait_until(Duration::from_secs(5), || line_count(&runs) >= 3));

    let snapshot = app(&supervisor, "crasher");
    assert!(snapshot.restarts >= 2, "{snapshot:?}");
    assert_eq!(snapshot.unstable_restarts, 0);

    supervisor.shutdown().unwrap();
}

#[test]
fn crash_loop_ends_errored_after_max_restarts() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("fail.sh"), "echo run >> runs.log\nexit 2\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: failing
    script: fail.sh
    max_restarts: 2
    min_uptime: 5s
"#,
        None,
    );
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        supervisor.status("failing").unwrap() == AppStatus::Errored
    }));

    let snapshot = app(&supervisor, "failing");
    assert_eq!(snapshot.restarts, 2);
    assert_eq!(snapshot.last_exit_code, Some(2));
    assert_eq!(snapshot.pid, None);
    assert_eq!(line_count(&dir.path().join("runs.log")), 3);

    supervisor.shutdown().unwrap();
}

#[test]
fn autorestart_disabled_leaves_app_stopped() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("once.sh"), "exit 0\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: once
    script: once.sh
    autorestart: false
"#,
        None,
    );
    supervisor.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        supervisor.status("once").unwrap() == AppStatus::Stopped
    }));
    thread::sleep(Duration::from_millis(300));

    let snapshot = app(&supervisor, "once");
    assert_eq!(snapshot.status, AppStatus::Stopped);
    assert_eq!(snapshot.restarts, 0);
    assert_eq!(snapshot.last_exit_code, Some(0));

    supervisor.shutdown().unwrap();
}

#[test]
fn manually_stopped_app_is_not_restarted() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("long.sh"), "sleep 30\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        "apps:\n  - name: long\n    script: long.sh\n",
        None,
    );
    supervisor.start().unwrap();

    let pid = app(&supervisor, "long").pid.expect("running pid");
    let status = supervisor.stop_app("long").unwrap().expect("exit status");
    assert_eq!(status.signal(), Some(libc::SIGTERM));
    assert!(!is_alive(pid));

    thread::sleep(Duration::from_millis(300));
    let snapshot = app(&supervisor, "long");
    assert_eq!(snapshot.status, AppStatus::Stopped);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.restarts, 0);

    assert!(supervisor.stop_app("long").unwrap().is_none());
    supervisor.shutdown().unwrap();
}

#[test]
fn deployment_mode_env_reaches_the_app() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("env.sh"),
        "echo \"$NODE_ENV $PORT\" > env.log\nsleep 30\n",
    )
    .unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: myapp
    script: env.sh
    env:
      PORT: 3000
      NODE_ENV: development
    env_production:
      NODE_ENV: production
"#,
        Some("production"),
    );
    supervisor.start().unwrap();

    let env_log = dir.path().join("env.log");
    assert!(wait_until(Duration::from_secs(5), || line_count(&env_log) == 1));
    assert_eq!(
        fs::read_to_string(&env_log).unwrap().trim(),
        "production 3000"
    );

    supervisor.shutdown().unwrap();
}

#[test]
fn restart_app_relaunches_with_new_pid() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("long.sh"), "sleep 30\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        "apps:\n  - name: long\n    script: long.sh\n",
        None,
    );
    supervisor.start().unwrap();

    let first = app(&supervisor, "long").pid.unwrap();
    let second = supervisor.restart_app("long").unwrap();
    assert_ne!(first, second);
    assert!(!is_alive(first));

    let snapshot = app(&supervisor, "long");
    assert_eq!(snapshot.status, AppStatus::Online);
    assert_eq!(snapshot.pid, Some(second));
    assert_eq!(snapshot.restarts, 1);
    assert!(snapshot.started_at.is_some());

    supervisor.shutdown().unwrap();
}

#[test]
fn unlaunchable_app_is_errored_while_others_run() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("long.sh"), "sleep 30\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: good
    script: long.sh
  - name: broken
    script: ./does-not-exist
    interpreter: none
"#,
        None,
    );
    supervisor.start().unwrap();

    assert_eq!(supervisor.status("good").unwrap(), AppStatus::Online);
    assert_eq!(supervisor.status("broken").unwrap(), AppStatus::Errored);

    supervisor.shutdown().unwrap();
}

#[test]
fn start_fails_when_no_app_launches() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor(
        dir.path(),
        "apps:\n  - name: broken\n    script: ./does-not-exist\n    interpreter: none\n",
        None,
    );

    match supervisor.start() {
        Err(ProcessManagerError::NothingStarted { apps }) => {
            assert_eq!(apps, vec!["broken".to_string()])
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn shutdown_stops_every_app() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("long.sh"), "sleep 30\n").unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: first
    script: long.sh
  - name: second
    script: long.sh
"#,
        None,
    );
    supervisor.start().unwrap();

    let pids: Vec<u32> = supervisor
        .snapshot()
        .unwrap()
        .iter()
        .map(|app| app.pid.unwrap())
        .collect();
    assert_eq!(pids.len(), 2);

    supervisor.shutdown().unwrap();
    assert!(pids.iter().all(|pid| !is_alive(*pid)));
    assert!(
        supervisor
            .snapshot()
            .unwrap()
            .iter()
            .all(|app| app.status == AppStatus::Stopped)
    );

    assert!(matches!(
        supervisor.status("missing"),
        Err(ProcessManagerError::UnknownApp(_))
    ));
}

#[test]
fn shutdown_stops_background_children_of_relaunched_app() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("flaky.sh"),
        "if [ -f crashed.flag ]; then\n  sleep 30 &\n  echo $! > background.pid\n  wait\nelse\n  touch crashed.flag\n  exit 1\nfi\n",
    )
    .unwrap();

    let supervisor = supervisor(
        dir.path(),
        r#"
apps:
  - name: flaky
    script: flaky.sh
    min_uptime: 10ms
"#,
        None,
    );
    supervisor.start().unwrap();

    let pid_file = dir.path().join("background.pid");
    assert!(wait_until(Duration::from_secs(5), || {
        app(&supervisor, "flaky").restarts == 1 && line_count(&pid_file) == 1
    }));
    let background: u32 = fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_running(background));

    supervisor.shutdown().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !process_running(background)));
    assert_eq!(app(&supervisor, "flaky").status, AppStatus::Stopped);
}
