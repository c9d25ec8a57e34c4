//! TOML configuration for the report job runner.
//!
//! A layered model: compiled-in defaults, a config file located through the
//! `REPORTRUNNER_CONFIG` environment variable or the standard system path,
//! and an explicit `--config` path on the command line.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "REPORTRUNNER_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/reportrunner/reportrunner.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the runner process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub secret: SecretConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl RunnerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runner configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `REPORTRUNNER_CONFIG` environment variable.
    /// 2. `/etc/reportrunner/reportrunner.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "REPORTRUNNER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.job.name.trim().is_empty() {
            anyhow::bail!("job.name must not be empty");
        }
        if self.job.alert_address.trim().is_empty() {
            anyhow::bail!("job.alert_address must not be empty");
        }
        crate::scheduler::cron::parse_expression(&self.schedule.cron)?;
        chrono_tz::Tz::from_str(&self.schedule.timezone)
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", self.schedule.timezone, e))?;
        if self.report.program.trim().is_empty() {
            anyhow::bail!("report.program must not be empty");
        }
        if !stays_inside(&self.report.output_dir) {
            anyhow::bail!(
                "report.output_dir must be relative to the run work directory, got {}",
                self.report.output_dir.display()
            );
        }
        let target = Path::new(&self.secret.target);
        if target.file_name().is_none() || !stays_inside(target) {
            anyhow::bail!(
                "secret.target must name a file inside the run work directory, got '{}'",
                self.secret.target
            );
        }
        if self.report.extension.trim().is_empty() {
            anyhow::bail!("report.extension must not be empty");
        }
        if self.limits.timeout_secs == 0 {
            anyhow::bail!("limits.timeout_secs must be greater than zero");
        }
        if self.retention.max_runs == 0 {
            anyhow::bail!("retention.max_runs must be at least 1");
        }
        if let Some(cmd) = &self.source.checkout {
            if cmd.program.trim().is_empty() {
                anyhow::bail!("source.checkout.program must not be empty");
            }
        }
        for (i, cmd) in self.environment.prepare.iter().enumerate() {
            if cmd.program.trim().is_empty() {
                anyhow::bail!("environment.prepare[{}].program must not be empty", i);
            }
        }
        match self.notify.kind {
            NotifyKind::Smtp if self.notify.smtp.host.trim().is_empty() => {
                anyhow::bail!("notify.smtp.host must be set when notify.kind = \"smtp\"");
            }
            NotifyKind::Webhook if self.notify.webhook_url.is_none() => {
                anyhow::bail!("notify.webhook_url must be set when notify.kind = \"webhook\"");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Relative, and never climbs out through `..`.
fn stays_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Identity of the job and where its failures are reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job name used in logs and notifications.
    pub name: String,
    /// Fixed alerting address that receives failure notifications.
    pub alert_address: String,
    /// Base URL under which run logs are reachable (the `serve` API).
    pub log_url_base: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: "weekly-report".to_string(),
            alert_address: "ops@example.com".to_string(),
            log_url_base: "http://localhost:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// When the job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression, 5-field (minute precision) or 6/7-field.
    pub cron: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Whether the daemon fires scheduled runs at all.
    pub enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 6 * * Mon".to_string(),
            timezone: "Europe/Berlin".to_string(),
            enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// An external command: program, arguments, and extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandConfig {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// A `sh -c <script>` command.
    pub fn shell(script: &str) -> Self {
        Self::new("sh", &["-c", script])
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where the versioned source tree comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Repository URL handed to the default checkout command.
    pub repository: String,
    /// Branch to check out.
    pub branch: String,
    /// Explicit checkout command. Runs inside the empty work directory and
    /// overrides the default `git clone`.
    pub checkout: Option<CommandConfig>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repository: "https://git.example.com/reports/weekly-report.git".to_string(),
            branch: "main".to_string(),
            checkout: None,
        }
    }
}

impl SourceConfig {
    /// The command that populates the work directory.
    pub fn checkout_command(&self) -> CommandConfig {
        match &self.checkout {
            Some(cmd) => cmd.clone(),
            None => CommandConfig::new(
                "git",
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &self.branch,
                    &self.repository,
                    ".",
                ],
            ),
        }
    }
}

/// Dependency installation commands, run in order inside the work directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub prepare: Vec<CommandConfig>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            prepare: vec![CommandConfig::new(
                "python3",
                &["-m", "pip", "install", "--quiet", "-r", "requirements.txt"],
            )],
        }
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// The credential bundle copied into each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    /// Path of the stored credential bundle.
    pub source: PathBuf,
    /// File name inside the work directory.
    pub target: String,
    /// Keys that must be present in the bundle.
    pub required_keys: Vec<String>,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("/var/lib/reportrunner/secrets/weekly-report.env"),
            target: ".env".to_string(),
            required_keys: vec![
                "ODOO_BASE_URL".to_string(),
                "ODOO_DB".to_string(),
                "ODOO_USERNAME".to_string(),
                "ODOO_PASSWORD".to_string(),
                "EMAIL_SMTP_HOST".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Which flavour of the report program runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Default mode of the program: reports go to customers.
    #[default]
    Production,
    /// Preview mode: the program is told to render without delivering.
    Development,
}

impl ReportMode {
    /// Extra arguments appended to the report command for this mode.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            ReportMode::Production => &[],
            ReportMode::Development => &["--mode", "preview"],
        }
    }
}

impl FromStr for ReportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" | "customer" => Ok(ReportMode::Production),
            "development" | "dev" | "preview" => Ok(ReportMode::Development),
            other => anyhow::bail!("unknown report mode '{}'", other),
        }
    }
}

impl std::fmt::Display for ReportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportMode::Production => write!(f, "production"),
            ReportMode::Development => write!(f, "development"),
        }
    }
}

/// The external report-producing program and its output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub program: String,
    pub args: Vec<String>,
    pub mode: ReportMode,
    /// Output tree, relative to the work directory.
    pub output_dir: PathBuf,
    /// File extension of produced artifacts, without the dot.
    pub extension: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "app.main".to_string()],
            mode: ReportMode::Production,
            output_dir: PathBuf::from("output/reports"),
            extension: "pdf".to_string(),
        }
    }
}

impl ReportConfig {
    /// Program, configured args, then the mode's args.
    pub fn command(&self, mode: ReportMode) -> CommandConfig {
        let mut args = self.args.clone();
        args.extend(mode.args().iter().map(|a| a.to_string()));
        CommandConfig {
            program: self.program.clone(),
            args,
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits / retention
// ---------------------------------------------------------------------------

/// Wall-clock bounds on a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Budget shared by checkout, prepare, secrets and report generation.
    pub timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { timeout_secs: 3600 }
    }
}

/// How many completed runs are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_runs: u32,
    /// Runs older than this are discarded as well, when set.
    pub max_age_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs: 10,
            max_age_days: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// On-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Parent of every per-run directory.
    pub runs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/reportrunner.db"),
            runs_dir: PathBuf::from("data/runs"),
        }
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Failure notification transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    Smtp,
    Webhook,
    /// Emit the notification as an ERROR log event only.
    #[default]
    Log,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub smtp: SmtpConfig,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_address: String,
    pub starttls: bool,
    pub username: Option<String>,
    /// Read from this environment variable so the password stays out of the file.
    pub password_env: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            from_address: "reportrunner@localhost".to_string(),
            starttls: true,
            username: None,
            password_env: Some("REPORTRUNNER_SMTP_PASSWORD".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        RunnerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg: RunnerConfig = toml::from_str(
            r#"
            [job]
            name = "kw-report"

            [limits]
            timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(cfg.job.name, "kw-report");
        assert_eq!(cfg.job.alert_address, "ops@example.com");
        assert_eq!(cfg.limits.timeout_secs, 120);
        assert_eq!(cfg.retention.max_runs, 10);
        assert_eq!(cfg.schedule.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_mode_args() {
        let report = ReportConfig::default();
        assert_eq!(
            report.command(ReportMode::Production).args,
            vec!["-m", "app.main"]
        );
        assert_eq!(
            report.command(ReportMode::Development).args,
            vec!["-m", "app.main", "--mode", "preview"]
        );
        assert_eq!("preview".parse::<ReportMode>().unwrap(), ReportMode::Development);
        assert!("nightly".parse::<ReportMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = RunnerConfig::default();
        cfg.limits.timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.retention.max_runs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.schedule.timezone = "Mars/Olympus".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.schedule.cron = "not a cron".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.notify.kind = NotifyKind::Smtp;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_keeps_paths_inside_work_dir() {
        for bad in ["../outside", "output/../../etc", "/srv/reports"] {
            let mut cfg = RunnerConfig::default();
            cfg.report.output_dir = PathBuf::from(bad);
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("report.output_dir"), "{bad}");
        }

        for bad in ["", ".", "../.env", "config/../../.env", "/etc/report.env"] {
            let mut cfg = RunnerConfig::default();
            cfg.secret.target = bad.to_string();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("secret.target"), "{bad:?}");
        }

        let mut cfg = RunnerConfig::default();
        cfg.report.output_dir = PathBuf::from("./output/reports");
        cfg.secret.target = "config/.env".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_default_checkout_is_git_clone() {
        let cmd = SourceConfig::default().checkout_command();
        assert_eq!(cmd.program, "git");
        assert_eq!(cmd.args.last().map(String::as_str), Some("."));
        assert!(cmd.display().starts_with("git clone --depth 1"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(
            &path,
            r#"
            [source.checkout]
            program = "sh"
            args = ["-c", "true"]

            [report]
            mode = "development"
            "#,
        )
        .unwrap();
        let cfg = RunnerConfig::load(&path).unwrap();
        assert_eq!(cfg.report.mode, ReportMode::Development);
        assert_eq!(cfg.source.checkout_command(), CommandConfig::shell("true"));
    }
}
