//! Polling file watcher used for watch-triggered restarts.
//!
//! Each watched app gets a [`FileWatcher`] that keeps a snapshot of
//! modification times and sizes under its roots. A background thread diffs
//! fresh scans against the snapshot and forwards non-empty diffs to the
//! supervisor as [`WatchEvent`]s.
use regex::Regex;
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::ProcessManagerError;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// What happened to a path between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Changes observed for one app, sent to the supervisor.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub app: String,
    pub changes: Vec<FileChange>,
}

/// Translates a glob (`*`, `**`, `?`) into an anchored regular expression.
fn glob_to_regex(glob: &str) -> String {
    let glob = glob.trim();
    let glob = glob.strip_prefix("./").unwrap_or(glob).trim_end_matches('/');

    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Compiled ignore patterns.
///
/// A path is ignored when a pattern matches its root-relative form or any
/// single component of it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Regex>,
}

impl IgnoreSet {
    pub fn new<I, S>(patterns: I) -> Result<Self, ProcessManagerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter(|pattern| !pattern.as_ref().trim().is_empty())
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&glob_to_regex(pattern)).map_err(|source| {
                    ProcessManagerError::InvalidIgnorePattern {
                        pattern: pattern.to_string(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        let full = relative.to_string_lossy();
        self.patterns.iter().any(|pattern| {
            pattern.is_match(&full)
                || relative
                    .components()
                    .any(|part| pattern.is_match(&part.as_os_str().to_string_lossy()))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

/// Snapshot-diffing watcher over a set of files and directories.
#[derive(Debug)]
pub struct FileWatcher {
    roots: Vec<PathBuf>,
    ignore: IgnoreSet,
    snapshot: HashMap<PathBuf, Fingerprint>,
}

impl FileWatcher {
    /// Creates a watcher and records the initial snapshot.
    pub fn new(roots: Vec<PathBuf>, ignore: IgnoreSet) -> Self {
        let mut watcher = Self {
            roots,
            ignore,
            snapshot: HashMap::new(),
        };
        watcher.snapshot = watcher.scan();
        watcher
    }

    /// Number of files in the current snapshot.
    pub fn tracked_files(&self) -> usize {
        self.snapshot.len()
    }

    fn scan(&self) -> HashMap<PathBuf, Fingerprint> {
        let mut files = HashMap::new();
        for root in &self.roots {
            // Symlinks below a root are fingerprinted as links and never followed.
            let walker = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !self.is_ignored_entry(root, entry));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err)
                        if err.depth() == 0
                            && err
                                .io_error()
                                .is_some_and(|io| io.kind() == ErrorKind::NotFound) =>
                    {
                        trace!("Watch root {} does not exist yet", root.display());
                        continue;
                    }
                    Err(err) => {
                        debug!("Cannot scan under {}: {err}", root.display());
                        continue;
                    }
                };
                if entry.file_type().is_dir() {
                    continue;
                }
                match entry.metadata() {
                    Ok(metadata) => {
                        files.insert(entry.into_path(), fingerprint(&metadata));
                    }
                    Err(err) => debug!("Cannot stat {}: {err}", entry.path().display()),
                }
            }
        }
        files
    }

    /// Ignored directories are pruned, so nothing beneath them is read.
    fn is_ignored_entry(&self, root: &Path, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry
                .path()
                .strip_prefix(root)
                .is_ok_and(|relative| self.ignore.is_ignored(relative))
    }

    /// Rescans and returns what changed since the previous scan.
    pub fn poll(&mut self) -> Vec<FileChange> {
        let current = self.scan();
        let mut changes = Vec::new();

        for (path, print) in &current {
            match self.snapshot.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Created,
                }),
                Some(previous) if previous != print => changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Removed,
                });
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        self.snapshot = current;
        changes
    }

    /// Polls every `interval` on a background thread until `running` is
    /// cleared or the receiving side hangs up.
    pub fn spawn(
        mut self,
        app: String,
        interval: Duration,
        sender: Sender<WatchEvent>,
        running: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            debug!(
                "Watching {} file(s) under {:?} for app '{app}'",
                self.tracked_files(),
                self.roots
            );

            while sleep_while_running(interval, &running) {
                let changes = self.poll();
                if changes.is_empty() {
                    continue;
                }

                for change in &changes {
                    debug!("[{app}] {} {}", change.kind, change.path.display());
                }

                let event = WatchEvent {
                    app: app.clone(),
                    changes,
                };
                if sender.send(event).is_err() {
                    warn!("Supervisor channel closed; stopping watcher for '{app}'");
                    break;
                }
            }

            debug!("Watcher for '{app}' terminating.");
        })
    }
}

fn fingerprint(metadata: &fs::Metadata) -> Fingerprint {
    Fingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    }
}

/// Sleeps for `total` in short slices; returns whether `running` is still set.
fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
