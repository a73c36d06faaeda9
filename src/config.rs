//! Configuration management for procman.
use regex::Regex;
use serde::{Deserialize, Serialize, de::IgnoredAny};
use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use strum_macros::AsRefStr;
use tracing::{debug, warn};

use crate::error::ProcessManagerError;

/// File names probed, in order, when no config path is given.
pub const DEFAULT_CONFIG_FILES: [&str; 3] = [
    "ecosystem.config.yaml",
    "ecosystem.config.yml",
    "ecosystem.config.json",
];

/// Consecutive unstable restarts tolerated before an app is marked errored.
pub const DEFAULT_MAX_RESTARTS: u32 = 16;
/// Runs shorter than this count as unstable.
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(1);
/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);
/// Quiet period after the last file change before a watch restart fires.
pub const DEFAULT_WATCH_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound for exponential restart backoff.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(15);
/// Patterns excluded from watching for every app.
pub const ALWAYS_IGNORED: [&str; 3] = ["node_modules", ".git", "*.log"];

/// Environment variables keyed by name.
pub type EnvMap = BTreeMap<String, String>;

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern")
});

/// On-disk format of an ecosystem file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Picks the format from the file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Whether and what to watch for an app.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WatchConfig {
    /// `true` watches the app's working directory.
    Flag(bool),
    /// Explicit paths, relative to the app's working directory.
    Paths(Vec<String>),
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig::Flag(false)
    }
}

impl WatchConfig {
    pub fn is_enabled(&self) -> bool {
        match self {
            WatchConfig::Flag(flag) => *flag,
            WatchConfig::Paths(paths) => !paths.is_empty(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArgsConfig {
    Line(String),
    List(Vec<String>),
}

impl ArgsConfig {
    fn into_vec(self) -> Vec<String> {
        match self {
            ArgsConfig::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            ArgsConfig::List(list) => list,
        }
    }
}

/// Duration written either as milliseconds or as a `<n>ms|s|m|h` string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Millis(u64),
    Text(String),
}

impl DurationValue {
    fn to_duration(&self) -> Result<Duration, ProcessManagerError> {
        match self {
            DurationValue::Millis(ms) => Ok(Duration::from_millis(*ms)),
            DurationValue::Text(raw) => parse_duration(raw),
        }
    }
}

/// Scalar environment value; numbers and booleans keep their textual form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            EnvValue::Text(text) => text,
            EnvValue::Bool(flag) => flag.to_string(),
            EnvValue::Int(number) => number.to_string(),
            EnvValue::UInt(number) => number.to_string(),
            EnvValue::Float(number) => number.to_string(),
        }
    }
}

fn into_env_map(raw: BTreeMap<String, EnvValue>) -> EnvMap {
    raw.into_iter()
        .map(|(key, value)| (key, value.into_string()))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtraField {
    Env(BTreeMap<String, EnvValue>),
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
struct RawEcosystem {
    #[serde(default)]
    apps: Vec<RawApp>,
    #[serde(flatten)]
    extra: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    #[serde(default)]
    name: String,
    #[serde(default)]
    script: String,
    #[serde(default)]
    args: Option<ArgsConfig>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    interpreter: Option<String>,
    #[serde(default)]
    watch: WatchConfig,
    #[serde(default)]
    ignore_watch: Vec<String>,
    #[serde(default)]
    watch_delay: Option<DurationValue>,
    #[serde(default)]
    env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    autorestart: Option<bool>,
    #[serde(default)]
    max_restarts: Option<u32>,
    #[serde(default)]
    min_uptime: Option<DurationValue>,
    #[serde(default)]
    restart_delay: Option<DurationValue>,
    #[serde(default)]
    exp_backoff_restart_delay: Option<DurationValue>,
    #[serde(default)]
    stop_exit_codes: Vec<i32>,
    #[serde(default)]
    kill_timeout: Option<DurationValue>,
    #[serde(flatten)]
    extra: BTreeMap<String, ExtraField>,
}

fn optional_duration(
    value: Option<DurationValue>,
    default: Duration,
) -> Result<Duration, ProcessManagerError> {
    value.map_or(Ok(default), |value| value.to_duration())
}

impl RawApp {
    fn into_spec(self, index: usize) -> Result<AppSpec, ProcessManagerError> {
        let invalid = |reason: String| ProcessManagerError::InvalidApp { index, reason };

        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("`name` is required".into()));
        }
        let script = self.script.trim().to_string();
        if script.is_empty() {
            return Err(invalid(format!("`script` is required for app '{name}'")));
        }

        let mut env_modes = BTreeMap::new();
        for (key, field) in self.extra {
            match (key.strip_prefix("env_"), field) {
                (Some(""), _) => {
                    return Err(invalid(format!(
                        "`env_` needs a mode suffix in app '{name}'"
                    )));
                }
                (Some(mode), ExtraField::Env(vars)) => {
                    env_modes.insert(mode.to_string(), into_env_map(vars));
                }
                (Some(_), ExtraField::Other(_)) => {
                    return Err(invalid(format!(
                        "`{key}` must map variable names to scalar values in app '{name}'"
                    )));
                }
                (None, _) => warn!("Ignoring unsupported key '{key}' for app '{name}'"),
            }
        }

        let cwd = self
            .cwd
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        let interpreter = self
            .interpreter
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(AppSpec {
            name,
            script,
            args: self.args.map(ArgsConfig::into_vec).unwrap_or_default(),
            cwd,
            interpreter,
            watch: self.watch,
            ignore_watch: self.ignore_watch,
            watch_delay: optional_duration(self.watch_delay, DEFAULT_WATCH_DELAY)?,
            env: into_env_map(self.env),
            env_modes,
            autorestart: self.autorestart.unwrap_or(true),
            max_restarts: self.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            min_uptime: optional_duration(self.min_uptime, DEFAULT_MIN_UPTIME)?,
            restart_delay: optional_duration(self.restart_delay, Duration::ZERO)?,
            exp_backoff_restart_delay: self
                .exp_backoff_restart_delay
                .map(|value| value.to_duration())
                .transpose()?,
            stop_exit_codes: self.stop_exit_codes,
            kill_timeout: optional_duration(self.kill_timeout, DEFAULT_KILL_TIMEOUT)?,
        })
    }
}

/// Declarative description of one managed application.
///
/// Built once while loading the ecosystem file and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    /// Unique name of the app.
    pub name: String,
    /// Entry point, relative to the working directory unless absolute.
    pub script: String,
    /// Extra arguments passed after the script.
    pub args: Vec<String>,
    /// Working directory relative to the project root.
    pub cwd: Option<PathBuf>,
    /// Explicit interpreter; `none` runs the script directly.
    pub interpreter: Option<String>,
    /// File watching configuration.
    pub watch: WatchConfig,
    /// Extra glob patterns excluded from watching.
    pub ignore_watch: Vec<String>,
    /// Debounce between the last change and the restart.
    pub watch_delay: Duration,
    /// Default-mode environment.
    pub env: EnvMap,
    /// Per-mode overrides, keyed by mode name (`env_production` → `production`).
    pub env_modes: BTreeMap<String, EnvMap>,
    /// Whether unexpected exits trigger a restart.
    pub autorestart: bool,
    /// Consecutive unstable restarts allowed.
    pub max_restarts: u32,
    /// Minimum run time for a run to count as stable.
    pub min_uptime: Duration,
    /// Fixed delay before relaunching.
    pub restart_delay: Duration,
    /// Base delay for exponential backoff; overrides `restart_delay` when set.
    pub exp_backoff_restart_delay: Option<Duration>,
    /// Exit codes that never trigger a restart.
    pub stop_exit_codes: Vec<i32>,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_timeout: Duration,
}

/// Fully resolved command for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables set on top of the supervisor's own environment.
    pub env: EnvMap,
}

/// Guesses the interpreter for a script from its extension.
pub fn infer_interpreter(script: &str) -> Option<&'static str> {
    let ext = Path::new(script).extension()?.to_str()?;
    match ext.to_ascii_lowercase().as_str() {
        "js" | "mjs" | "cjs" => Some("node"),
        "ts" => Some("ts-node"),
        "py" => Some("python3"),
        "rb" => Some("ruby"),
        "pl" => Some("perl"),
        "sh" => Some("sh"),
        _ => None,
    }
}

impl AppSpec {
    /// A spec with only the required fields set and every default applied.
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            interpreter: None,
            watch: WatchConfig::default(),
            ignore_watch: Vec::new(),
            watch_delay: DEFAULT_WATCH_DELAY,
            env: EnvMap::new(),
            env_modes: BTreeMap::new(),
            autorestart: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            min_uptime: DEFAULT_MIN_UPTIME,
            restart_delay: Duration::ZERO,
            exp_backoff_restart_delay: None,
            stop_exit_codes: Vec::new(),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// Mode names this app defines overrides for.
    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.env_modes.keys().map(String::as_str)
    }

    /// The raw override map for `mode`, if the app declares one.
    pub fn env_for_mode(&self, mode: &str) -> Option<&EnvMap> {
        self.env_modes.get(mode)
    }

    /// `env` overlaid with the overrides of `mode`.
    pub fn resolve_env(&self, mode: Option<&str>) -> EnvMap {
        let mut resolved = self.env.clone();
        if let Some(mode) = mode {
            match self.env_modes.get(mode) {
                Some(overrides) => {
                    resolved.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())))
                }
                None => warn!(
                    "App '{}' has no env_{mode}; using default environment",
                    self.name
                ),
            }
        }
        resolved
    }

    /// Interpreter that will run the script, if any.
    pub fn resolved_interpreter(&self) -> Option<&str> {
        match self.interpreter.as_deref() {
            Some("none") => None,
            Some(other) => Some(other),
            None => infer_interpreter(&self.script),
        }
    }

    /// Directory the app runs in.
    pub fn working_dir(&self, project_root: &Path) -> PathBuf {
        match &self.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root.to_path_buf(),
        }
    }

    fn script_path(&self, cwd: &Path, interpreted: bool) -> PathBuf {
        let script = Path::new(&self.script);
        if script.is_absolute() {
            return script.to_path_buf();
        }

        let candidate = cwd.join(script);
        // Bare command names without a local file are left for PATH lookup.
        if interpreted || candidate.exists() || script.components().count() > 1 {
            candidate
        } else {
            script.to_path_buf()
        }
    }

    /// Builds the command line and environment for `mode`.
    pub fn launch_plan(&self, project_root: &Path, mode: Option<&str>) -> LaunchPlan {
        let cwd = self.working_dir(project_root);
        let interpreter = self.resolved_interpreter();
        let script = self
            .script_path(&cwd, interpreter.is_some())
            .to_string_lossy()
            .into_owned();

        let (program, mut args) = match interpreter {
            Some(interpreter) => (interpreter.to_string(), vec![script]),
            None => (script, Vec::new()),
        };
        args.extend(self.args.iter().cloned());

        LaunchPlan {
            name: self.name.clone(),
            program,
            args,
            cwd,
            env: self.resolve_env(mode),
        }
    }

    /// Roots to poll for changes; empty when watching is off.
    pub fn watch_roots(&self, project_root: &Path) -> Vec<PathBuf> {
        let cwd = self.working_dir(project_root);
        match &self.watch {
            WatchConfig::Flag(true) => vec![cwd],
            WatchConfig::Flag(false) => Vec::new(),
            WatchConfig::Paths(paths) => paths
                .iter()
                .map(|path| {
                    let path = Path::new(path);
                    if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        cwd.join(path)
                    }
                })
                .collect(),
        }
    }

    /// Built-in ignore patterns followed by `ignore_watch`.
    pub fn ignore_patterns(&self) -> Vec<String> {
        ALWAYS_IGNORED
            .iter()
            .map(|pattern| pattern.to_string())
            .chain(self.ignore_watch.iter().cloned())
            .collect()
    }
}

/// The set of apps loaded from one ecosystem file.
#[derive(Debug, Clone)]
pub struct Ecosystem {
    apps: Vec<AppSpec>,
    project_dir: PathBuf,
}

impl Ecosystem {
    /// Validates names and wraps the apps.
    pub fn new(
        apps: Vec<AppSpec>,
        project_dir: impl Into<PathBuf>,
    ) -> Result<Self, ProcessManagerError> {
        if apps.is_empty() {
            return Err(ProcessManagerError::NoApps);
        }

        let mut seen = HashSet::new();
        for (index, app) in apps.iter().enumerate() {
            if app.name.trim().is_empty() {
                return Err(ProcessManagerError::InvalidApp {
                    index,
                    reason: "`name` is required".into(),
                });
            }
            if app.script.trim().is_empty() {
                return Err(ProcessManagerError::InvalidApp {
                    index,
                    reason: format!("`script` is required for app '{}'", app.name),
                });
            }
            if !seen.insert(app.name.as_str()) {
                return Err(ProcessManagerError::DuplicateApp(app.name.clone()));
            }
        }

        Ok(Self {
            apps,
            project_dir: project_dir.into(),
        })
    }

    /// Parses an ecosystem document without touching the filesystem.
    pub fn parse(
        content: &str,
        format: ConfigFormat,
        project_dir: impl Into<PathBuf>,
    ) -> Result<Self, ProcessManagerError> {
        let raw: RawEcosystem = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)?,
        };

        for key in raw.extra.keys() {
            warn!("Ignoring unsupported top-level key '{key}'");
        }

        let apps = raw
            .apps
            .into_iter()
            .enumerate()
            .map(|(index, app)| app.into_spec(index))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(apps, project_dir)
    }

    pub fn apps(&self) -> &[AppSpec] {
        &self.apps
    }

    pub fn app(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Directory relative paths are resolved against.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Narrows the ecosystem down to a single app.
    pub fn only(self, name: &str) -> Result<Self, ProcessManagerError> {
        let app = self
            .app(name)
            .cloned()
            .ok_or_else(|| ProcessManagerError::UnknownApp(name.to_string()))?;
        Ok(Self {
            apps: vec![app],
            project_dir: self.project_dir,
        })
    }

    /// Launch plans for every app, in config order.
    pub fn launch_plans(&self, mode: Option<&str>) -> Vec<LaunchPlan> {
        self.apps
            .iter()
            .map(|app| app.launch_plan(&self.project_dir, mode))
            .collect()
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ProcessManagerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ProcessManagerError::InvalidDuration(raw.to_string()));
    }

    let (amount_str, millis) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| ProcessManagerError::InvalidDuration(raw.to_string()))?;

    Ok(Duration::from_millis(amount.saturating_mul(millis)))
}

/// Expands `${VAR}` references from the process environment.
fn expand_env_vars(input: &str) -> Result<String, ProcessManagerError> {
    let mut missing = None;
    let result = ENV_REF.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ProcessManagerError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

fn default_config_path() -> PathBuf {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]))
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<Ecosystem, ProcessManagerError> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ProcessManagerError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base_path = if base_path.is_absolute() {
        base_path
    } else {
        env::current_dir()?.join(base_path)
    };

    let expanded = expand_env_vars(&content)?;
    let format = ConfigFormat::from_path(&config_path);
    debug!(
        "Parsing {} config {}",
        format.as_ref(),
        config_path.display()
    );

    Ecosystem::parse(&expanded, format, base_path)
}
