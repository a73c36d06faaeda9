//! Supervisor runtime that keeps the configured apps alive.
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Child, ExitStatus},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{AppSpec, Ecosystem, LaunchPlan, MAX_BACKOFF_DELAY},
    error::ProcessManagerError,
    process,
    watcher::{FileWatcher, IgnoreSet, WatchEvent},
};

/// Lifecycle state of a managed app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AppStatus {
    Launching,
    Online,
    Stopping,
    Stopped,
    WaitingRestart,
    Errored,
}

/// Point-in-time view of one app.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSnapshot {
    pub name: String,
    pub status: AppStatus,
    pub pid: Option<u32>,
    /// Relaunches since the supervisor started, automatic and manual.
    pub restarts: u32,
    /// Consecutive restarts after runs shorter than `min_uptime`.
    pub unstable_restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Option<Duration>,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
}

/// Runtime tuning that does not belong in the ecosystem file.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How often the monitor loop reaps children and fires due restarts.
    pub tick: Duration,
    /// How often watched directories are rescanned.
    pub watch_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            watch_interval: Duration::from_secs(1),
        }
    }
}

struct ManagedApp {
    spec: AppSpec,
    plan: LaunchPlan,
    child: Option<Child>,
    status: AppStatus,
    started: Option<(Instant, DateTime<Utc>)>,
    restarts: u32,
    unstable_restarts: u32,
    restart_at: Option<Instant>,
    watch_restart_at: Option<Instant>,
    last_exit: Option<ExitStatus>,
}

impl ManagedApp {
    fn new(spec: AppSpec, plan: LaunchPlan) -> Self {
        Self {
            spec,
            plan,
            child: None,
            status: AppStatus::Stopped,
            started: None,
            restarts: 0,
            unstable_restarts: 0,
            restart_at: None,
            watch_restart_at: None,
            last_exit: None,
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn launch(&mut self) -> Result<u32, ProcessManagerError> {
        self.restart_at = None;
        self.status = AppStatus::Launching;
        match process::spawn(&self.plan) {
            Ok(child) => {
                let pid = child.id();
                info!("App '{}' online with PID {pid}", self.spec.name);
                self.child = Some(child);
                self.status = AppStatus::Online;
                self.started = Some((Instant::now(), Utc::now()));
                Ok(pid)
            }
            Err(err) => {
                self.status = AppStatus::Errored;
                self.started = None;
                Err(err)
            }
        }
    }

    /// Delay before the next automatic relaunch.
    fn restart_delay(&self) -> Duration {
        match self.spec.exp_backoff_restart_delay {
            Some(base) => {
                let steps = self.unstable_restarts.saturating_sub(1).min(64) as i32;
                let secs = base.as_secs_f64() * 1.5_f64.powi(steps);
                Duration::from_secs_f64(secs.min(MAX_BACKOFF_DELAY.as_secs_f64()))
            }
            None => self.spec.restart_delay,
        }
    }

    /// Applies the restart policy to an unexpected exit observed at `now`.
    fn on_exit(&mut self, status: ExitStatus, now: Instant) {
        let uptime = self
            .started
            .take()
            .map(|(at, _)| now.saturating_duration_since(at))
            .unwrap_or_default();
        self.last_exit = Some(status);

        if status.success() {
            info!("App '{}' exited normally after {uptime:?}.", self.spec.name);
        } else {
            warn!("App '{}' exited with {status} after {uptime:?}.", self.spec.name);
        }

        let stop_code = status
            .code()
            .is_some_and(|code| self.spec.stop_exit_codes.contains(&code));
        if !self.spec.autorestart || stop_code {
            debug!("Not restarting '{}' per its restart settings", self.spec.name);
            self.status = if status.success() {
                AppStatus::Stopped
            } else {
                AppStatus::Errored
            };
            return;
        }

        if uptime < self.spec.min_uptime {
            self.unstable_restarts += 1;
        } else {
            self.unstable_restarts = 0;
        }

        if self.unstable_restarts > self.spec.max_restarts {
            error!(
                "App '{}' has reached maximum restart attempts ({}). Giving up.",
                self.spec.name, self.spec.max_restarts
            );
            self.status = AppStatus::Errored;
            return;
        }

        let delay = self.restart_delay();
        warn!("Restarting '{}' in {delay:?}...", self.spec.name);
        self.status = AppStatus::WaitingRestart;
        self.restart_at = Some(now + delay);
    }

    fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            name: self.spec.name.clone(),
            status: self.status,
            pid: self.child.as_ref().map(Child::id),
            restarts: self.restarts,
            unstable_restarts: self.unstable_restarts,
            started_at: self.started.map(|(_, wall)| wall),
            uptime: self.started.map(|(at, _)| at.elapsed()),
            last_exit_code: self.last_exit.and_then(|status| status.code()),
            last_signal: self.last_exit.and_then(|status| status.signal()),
        }
    }
}

/// State shared between the caller and the monitor thread.
struct Shared {
    apps: Mutex<HashMap<String, ManagedApp>>,
    order: Vec<String>,
}

impl Shared {
    fn apps(&self) -> Result<MutexGuard<'_, HashMap<String, ManagedApp>>, ProcessManagerError> {
        Ok(self.apps.lock()?)
    }

    fn start(&self, name: &str) -> Result<u32, ProcessManagerError> {
        let mut apps = self.apps()?;
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ProcessManagerError::UnknownApp(name.to_string()))?;

        if let Some(child) = &app.child {
            warn!("App '{name}' is already running with PID {}", child.id());
            return Ok(child.id());
        }

        app.unstable_restarts = 0;
        app.watch_restart_at = None;
        app.launch()
    }

    fn stop(&self, name: &str) -> Result<Option<ExitStatus>, ProcessManagerError> {
        let (child, kill_timeout) = {
            let mut apps = self.apps()?;
            let app = apps
                .get_mut(name)
                .ok_or_else(|| ProcessManagerError::UnknownApp(name.to_string()))?;
            app.restart_at = None;
            app.watch_restart_at = None;
            let child = app.child.take();
            app.status = if child.is_some() {
                AppStatus::Stopping
            } else {
                AppStatus::Stopped
            };
            (child, app.spec.kill_timeout)
        };

        let Some(mut child) = child else {
            debug!("App '{name}' is not running");
            return Ok(None);
        };

        info!("Stopping app '{name}' (PID {})", child.id());
        let result = process::terminate(name, &mut child, kill_timeout);

        let mut apps = self.apps()?;
        if let Some(app) = apps.get_mut(name) {
            app.started = None;
            match &result {
                Ok(status) => {
                    app.last_exit = Some(*status);
                    app.status = AppStatus::Stopped;
                }
                Err(err) => {
                    error!("Failed to stop app '{name}': {err}");
                    app.status = AppStatus::Errored;
                }
            }
        }

        result.map(Some)
    }

    fn restart(&self, name: &str) -> Result<u32, ProcessManagerError> {
        self.stop(name)?;

        let mut apps = self.apps()?;
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ProcessManagerError::UnknownApp(name.to_string()))?;
        app.unstable_restarts = 0;
        let pid = app.launch()?;
        app.restarts += 1;
        Ok(pid)
    }

    /// Collects exit statuses of children that are gone.
    fn reap_exited(&self) -> Result<(), ProcessManagerError> {
        let now = Instant::now();
        let mut apps = self.apps()?;
        for app in apps.values_mut() {
            let Some(child) = app.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    app.child = None;
                    app.on_exit(status, now);
                }
                Ok(None) => {}
                Err(err) => error!("Failed to check status of '{}': {err}", app.name()),
            }
        }
        Ok(())
    }

    /// (Re)arms the debounce deadline for the app a watcher reported on.
    fn note_changes(&self, event: WatchEvent) -> Result<(), ProcessManagerError> {
        let mut apps = self.apps()?;
        let Some(app) = apps.get_mut(&event.app) else {
            return Ok(());
        };

        if !matches!(app.status, AppStatus::Online | AppStatus::WaitingRestart) {
            debug!(
                "Ignoring {} change(s) for '{}' while {}",
                event.changes.len(),
                event.app,
                app.status
            );
            return Ok(());
        }

        debug!(
            "{} change(s) detected for '{}'; restart in {:?}",
            event.changes.len(),
            event.app,
            app.spec.watch_delay
        );
        app.watch_restart_at = Some(Instant::now() + app.spec.watch_delay);
        Ok(())
    }

    /// Relaunches apps whose backoff elapsed and restarts apps whose watch
    /// debounce elapsed.
    fn fire_due_restarts(&self) -> Result<(), ProcessManagerError> {
        let now = Instant::now();
        let mut watch_due = Vec::new();

        {
            let mut apps = self.apps()?;
            for app in apps.values_mut() {
                if app.restart_at.is_some_and(|at| at <= now) {
                    match app.launch() {
                        Ok(_) => app.restarts += 1,
                        Err(err) => error!("Failed to restart '{}': {err}", app.name()),
                    }
                }
                if app.watch_restart_at.is_some_and(|at| at <= now) {
                    app.watch_restart_at = None;
                    watch_due.push(app.spec.name.clone());
                }
            }
        }

        for name in watch_due {
            info!("Restarting '{name}' after file changes");
            if let Err(err) = self.restart(&name) {
                error!("Watch restart of '{name}' failed: {err}");
            }
        }

        Ok(())
    }
}

struct WatchTarget {
    app: String,
    roots: Vec<PathBuf>,
    ignore: IgnoreSet,
}

/// Owns the managed processes, their watchers and the monitor thread.
pub struct Supervisor {
    shared: Arc<Shared>,
    options: SupervisorOptions,
    running: Arc<AtomicBool>,
    shut_down: AtomicBool,
    watch_targets: Mutex<Vec<WatchTarget>>,
    watch_tx: Sender<WatchEvent>,
    watch_rx: Mutex<Option<Receiver<WatchEvent>>>,
    monitor_handle: Mutex<Option<thread::JoinHandle<()>>>,
    watcher_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Supervisor {
    /// Prepares launch plans for `mode` and compiles watch settings. Nothing
    /// is started until [`Supervisor::start`].
    pub fn new(
        ecosystem: Ecosystem,
        mode: Option<&str>,
        options: SupervisorOptions,
    ) -> Result<Self, ProcessManagerError> {
        if let Some(mode) = mode {
            info!("Using deployment mode '{mode}'");
        }

        let project_dir = ecosystem.project_dir().to_path_buf();
        let mut apps = HashMap::new();
        let mut order = Vec::new();
        let mut watch_targets = Vec::new();

        for spec in ecosystem.apps() {
            if spec.watch.is_enabled() {
                watch_targets.push(WatchTarget {
                    app: spec.name.clone(),
                    roots: spec.watch_roots(&project_dir),
                    ignore: IgnoreSet::new(spec.ignore_patterns())?,
                });
            }

            let plan = spec.launch_plan(&project_dir, mode);
            order.push(spec.name.clone());
            apps.insert(spec.name.clone(), ManagedApp::new(spec.clone(), plan));
        }

        let (watch_tx, watch_rx) = mpsc::channel();

        Ok(Self {
            shared: Arc::new(Shared {
                apps: Mutex::new(apps),
                order,
            }),
            options,
            running: Arc::new(AtomicBool::new(false)),
            shut_down: AtomicBool::new(false),
            watch_targets: Mutex::new(watch_targets),
            watch_tx,
            watch_rx: Mutex::new(Some(watch_rx)),
            monitor_handle: Mutex::new(None),
            watcher_handles: Mutex::new(Vec::new()),
        })
    }

    /// Launches every app in config order, then starts watchers and the
    /// monitor loop. Fails only when no app could be launched.
    pub fn start(&self) -> Result<(), ProcessManagerError> {
        info!("Starting {} app(s)...", self.shared.order.len());
        self.running.store(true, Ordering::SeqCst);

        let mut failed = Vec::new();
        for name in &self.shared.order {
            if let Err(err) = self.shared.start(name) {
                error!("Failed to start app '{name}': {err}");
                failed.push(name.clone());
            }
        }

        if failed.len() == self.shared.order.len() {
            self.running.store(false, Ordering::SeqCst);
            return Err(ProcessManagerError::NothingStarted { apps: failed });
        }

        self.start_watchers()?;
        self.ensure_monitoring()
    }

    fn start_watchers(&self) -> Result<(), ProcessManagerError> {
        let targets = std::mem::take(&mut *self.watch_targets.lock()?);
        let mut handles = self.watcher_handles.lock()?;

        for target in targets {
            info!("Watching {:?} for app '{}'", target.roots, target.app);
            let watcher = FileWatcher::new(target.roots, target.ignore);
            handles.push(watcher.spawn(
                target.app,
                self.options.watch_interval,
                self.watch_tx.clone(),
                Arc::clone(&self.running),
            ));
        }

        Ok(())
    }

    /// Spawns the monitor thread unless it is already running.
    pub fn ensure_monitoring(&self) -> Result<(), ProcessManagerError> {
        let mut handle_slot = self.monitor_handle.lock()?;
        if handle_slot.is_some() {
            return Ok(());
        }

        let Some(events) = self.watch_rx.lock()?.take() else {
            return Ok(());
        };

        debug!("Starting app monitoring thread...");
        self.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let tick = self.options.tick;

        *handle_slot = Some(thread::spawn(move || {
            Self::monitor_loop(shared, events, running, tick);
        }));
        Ok(())
    }

    fn monitor_loop(
        shared: Arc<Shared>,
        events: Receiver<WatchEvent>,
        running: Arc<AtomicBool>,
        tick: Duration,
    ) {
        while running.load(Ordering::SeqCst) {
            if let Err(err) = shared.reap_exited() {
                error!("Monitor failed to reap apps: {err}");
                break;
            }

            loop {
                match events.try_recv() {
                    Ok(event) => {
                        if let Err(err) = shared.note_changes(event) {
                            error!("Monitor failed to record file changes: {err}");
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if let Err(err) = shared.fire_due_restarts() {
                error!("Monitor failed to restart apps: {err}");
                break;
            }

            thread::sleep(tick);
        }

        debug!("Monitor loop terminating.");
    }

    /// Starts one app that is currently stopped or errored.
    pub fn start_app(&self, name: &str) -> Result<u32, ProcessManagerError> {
        self.shared.start(name)
    }

    /// Stops one app; it stays stopped until started again.
    pub fn stop_app(&self, name: &str) -> Result<Option<ExitStatus>, ProcessManagerError> {
        self.shared.stop(name)
    }

    /// Stops and relaunches one app, resetting its unstable-restart counter.
    pub fn restart_app(&self, name: &str) -> Result<u32, ProcessManagerError> {
        self.shared.restart(name)
    }

    /// Stops every app in reverse config order.
    pub fn stop_all(&self) -> Result<(), ProcessManagerError> {
        let mut first_error = None;
        for name in self.shared.order.iter().rev() {
            if let Err(err) = self.shared.stop(name) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Status of every app, in config order.
    pub fn snapshot(&self) -> Result<Vec<AppSnapshot>, ProcessManagerError> {
        let apps = self.shared.apps()?;
        Ok(self
            .shared
            .order
            .iter()
            .filter_map(|name| apps.get(name))
            .map(ManagedApp::snapshot)
            .collect())
    }

    pub fn status(&self, name: &str) -> Result<AppStatus, ProcessManagerError> {
        self.shared
            .apps()?
            .get(name)
            .map(|app| app.status)
            .ok_or_else(|| ProcessManagerError::UnknownApp(name.to_string()))
    }

    /// Stops watchers and the monitor, then every app. Safe to call twice.
    pub fn shutdown(&self) -> Result<(), ProcessManagerError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down supervisor...");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.monitor_handle.lock()?.take() {
            let _ = handle.join();
        }
        for handle in self.watcher_handles.lock()?.drain(..) {
            let _ = handle.join();
        }

        // Apps relaunched by the monitor thread already received SIGTERM from
        // PR_SET_PDEATHSIG when it exited; stopping them here reaps them.
        self.stop_all()
    }

    /// Blocks until `stop` is set, then shuts down.
    pub fn run_until(&self, stop: &AtomicBool) -> Result<(), ProcessManagerError> {
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(self.options.tick);
        }
        self.shutdown()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("Supervisor shutdown during drop failed: {err}");
        }
    }
}
