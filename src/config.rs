//! Configuration layer: typed settings with layered precedence
//! (defaults → file → environment → CLI).

use clap::{Args, Parser, Subcommand, ValueHint};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::cluster::ClusterOptions;
use crate::executor::Executor;
use crate::worker::WorkerOptions;
use crate::{EngineConfig, Error, Result};

const ENV_PREFIX: &str = "SNAPCLUSTER";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3000";
const DEFAULT_RENDER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_WORKER_SLOTS: usize = 4;
const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;
const DEFAULT_SETTLE_MS: u64 = 1_000;
const DEFAULT_RESULT_TTL_SECS: u64 = 30;
const DEFAULT_PAGE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Command-line arguments for the snapcluster binary.
#[derive(Debug, Parser)]
#[command(name = "snapcluster", version, about = "Queued headless-browser snapshot service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SNAPCLUSTER_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service and its render cluster.
    Serve(ServeArgs),
    /// Run one render worker over stdin/stdout. Started by `serve`.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    /// Override the listen address.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the origin every rendered URL is restricted to.
    #[arg(long, value_name = "URL")]
    pub origin: Option<String>,

    /// Override the number of worker processes.
    #[arg(long, value_name = "COUNT")]
    pub workers: Option<usize>,

    /// Override the concurrent renders per worker.
    #[arg(long = "worker-slots", value_name = "COUNT")]
    pub worker_slots: Option<usize>,

    /// Override the queue admission limit.
    #[arg(long = "max-queue", value_name = "COUNT")]
    pub max_queue: Option<usize>,

    /// Override how long a request waits for its render.
    #[arg(long = "render-timeout-ms", value_name = "MILLIS")]
    pub render_timeout_ms: Option<u64>,

    /// Override the settle delay between page load and render.
    #[arg(long = "settle-ms", value_name = "MILLIS")]
    pub settle_ms: Option<u64>,

    /// Override the browser binary.
    #[arg(long = "chrome-path", value_name = "PATH", value_hint = ValueHint::ExecutablePath)]
    pub chrome_path: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Slot index assigned by the supervisor, for logs.
    #[arg(long = "worker-id", default_value_t = 0)]
    pub worker_id: usize,

    #[arg(long, default_value_t = DEFAULT_WORKER_SLOTS)]
    pub slots: usize,

    #[arg(long = "settle-ms", default_value_t = DEFAULT_SETTLE_MS)]
    pub settle_ms: u64,

    #[arg(long = "page-timeout-ms", default_value_t = DEFAULT_PAGE_TIMEOUT_MS)]
    pub page_timeout_ms: u64,

    #[arg(long = "chrome-path", value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    #[arg(long = "user-agent", value_name = "UA")]
    pub user_agent: Option<String>,

    /// Disable the browser sandbox (containers without user namespaces).
    #[arg(long = "no-sandbox")]
    pub no_sandbox: bool,

    #[arg(long = "log-level", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

impl WorkerArgs {
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            slots: self.slots.max(1),
            executor: Executor::new(Duration::from_millis(self.settle_ms)),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            user_agent: self.user_agent.clone(),
            timeout_ms: self.page_timeout_ms,
            chrome_path: self.chrome_path.clone(),
            sandbox: !self.no_sandbox,
            ..EngineConfig::default()
        }
    }
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http: HttpSettings,
    pub cluster: ClusterSettings,
    pub render: RenderSettings,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub listen: SocketAddr,
    /// Scheme, host and port of every rendered page
    pub origin: Url,
    pub render_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub workers: usize,
    pub worker_slots: usize,
    pub max_queue: Option<usize>,
    pub restart_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub settle: Duration,
    pub result_ttl: Duration,
    pub page_timeout: Duration,
    pub chrome_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub clients: Vec<ClientToken>,
}

/// One caller allowed to request renders
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientToken {
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl Settings {
    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            workers: self.cluster.workers,
            worker_slots: self.cluster.worker_slots,
            max_queue: self.cluster.max_queue,
            result_ttl: self.render.result_ttl,
            restart_delay: self.cluster.restart_delay,
        }
    }

    /// Arguments a worker process is started with
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--slots".to_string(),
            self.cluster.worker_slots.to_string(),
            "--settle-ms".to_string(),
            self.render.settle.as_millis().to_string(),
            "--page-timeout-ms".to_string(),
            self.render.page_timeout.as_millis().to_string(),
            "--log-level".to_string(),
            self.logging.level.clone(),
        ];
        if let Some(path) = &self.render.chrome_path {
            args.push("--chrome-path".to_string());
            args.push(path.display().to_string());
        }
        if let Some(agent) = &self.render.user_agent {
            args.push("--user-agent".to_string());
            args.push(agent.clone());
        }
        if !self.render.sandbox {
            args.push("--no-sandbox".to_string());
        }
        args
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings> {
    let mut builder = Config::builder();
    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    if let Some(Command::Serve(args)) = cli.command.as_ref() {
        raw.apply_serve_overrides(args);
    }
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    http: RawHttpSettings,
    cluster: RawClusterSettings,
    render: RawRenderSettings,
    store: RawStoreSettings,
    auth: RawAuthSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    listen: Option<String>,
    origin: Option<String>,
    render_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClusterSettings {
    workers: Option<usize>,
    worker_slots: Option<usize>,
    max_queue: Option<usize>,
    restart_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    settle_ms: Option<u64>,
    result_ttl_secs: Option<u64>,
    page_timeout_ms: Option<u64>,
    chrome_path: Option<PathBuf>,
    user_agent: Option<String>,
    sandbox: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    clients: Vec<ClientToken>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeArgs) {
        if let Some(listen) = overrides.listen.as_ref() {
            self.http.listen = Some(listen.clone());
        }
        if let Some(origin) = overrides.origin.as_ref() {
            self.http.origin = Some(origin.clone());
        }
        if let Some(workers) = overrides.workers {
            self.cluster.workers = Some(workers);
        }
        if let Some(slots) = overrides.worker_slots {
            self.cluster.worker_slots = Some(slots);
        }
        if let Some(max) = overrides.max_queue {
            self.cluster.max_queue = Some(max);
        }
        if let Some(timeout) = overrides.render_timeout_ms {
            self.http.render_timeout_ms = Some(timeout);
        }
        if let Some(settle) = overrides.settle_ms {
            self.render.settle_ms = Some(settle);
        }
        if let Some(path) = overrides.chrome_path.as_ref() {
            self.render.chrome_path = Some(path.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self> {
        let RawSettings {
            http,
            cluster,
            render,
            store,
            auth,
            logging,
        } = raw;

        Ok(Self {
            http: build_http_settings(http)?,
            cluster: build_cluster_settings(cluster)?,
            render: build_render_settings(render)?,
            store: build_store_settings(store)?,
            auth: build_auth_settings(auth)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> Error {
    Error::ConfigError(format!("`{}`: {}", key, reason))
}

fn build_http_settings(http: RawHttpSettings) -> Result<HttpSettings> {
    let listen = http.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
    let listen: SocketAddr = listen
        .parse()
        .map_err(|e| invalid("http.listen", format!("{:?} is not a socket address: {}", listen, e)))?;

    let origin = http.origin.as_deref().unwrap_or(DEFAULT_ORIGIN);
    let origin = Url::parse(origin).map_err(|e| invalid("http.origin", e))?;
    if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
        return Err(invalid("http.origin", "must be an absolute http(s) URL"));
    }

    let timeout = http.render_timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS);
    if timeout == 0 {
        return Err(invalid("http.render_timeout_ms", "must be greater than zero"));
    }

    Ok(HttpSettings {
        listen,
        origin,
        render_timeout: Duration::from_millis(timeout),
    })
}

fn build_cluster_settings(cluster: RawClusterSettings) -> Result<ClusterSettings> {
    let workers = cluster.workers.unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        return Err(invalid("cluster.workers", "must be greater than zero"));
    }
    let worker_slots = cluster.worker_slots.unwrap_or(DEFAULT_WORKER_SLOTS);
    if worker_slots == 0 {
        return Err(invalid("cluster.worker_slots", "must be greater than zero"));
    }

    Ok(ClusterSettings {
        workers,
        worker_slots,
        max_queue: cluster.max_queue,
        restart_delay: Duration::from_millis(
            cluster.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS),
        ),
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings> {
    let ttl = render.result_ttl_secs.unwrap_or(DEFAULT_RESULT_TTL_SECS);
    if ttl == 0 {
        return Err(invalid("render.result_ttl_secs", "must be greater than zero"));
    }
    let chrome_path = render.chrome_path.filter(|p| !p.as_os_str().is_empty());
    let user_agent = render.user_agent.and_then(|ua| {
        let trimmed = ua.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(RenderSettings {
        settle: Duration::from_millis(render.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
        result_ttl: Duration::from_secs(ttl),
        page_timeout: Duration::from_millis(render.page_timeout_ms.unwrap_or(DEFAULT_PAGE_TIMEOUT_MS)),
        chrome_path,
        user_agent,
        sandbox: render.sandbox.unwrap_or(true),
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings> {
    let secs = store.sweep_interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    if secs == 0 {
        return Err(invalid("store.sweep_interval_secs", "must be greater than zero"));
    }
    Ok(StoreSettings {
        sweep_interval: Duration::from_secs(secs),
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings> {
    if let Some(client) = auth.clients.iter().find(|c| c.token.trim().is_empty()) {
        return Err(invalid("auth.clients", format!("client {:?} has an empty token", client.name)));
    }
    Ok(AuthSettings {
        clients: auth.clients,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings> {
    let level = logging
        .level
        .map(|l| l.trim().to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(invalid("logging.level", format!("unknown level {:?}", level)));
    }
    Ok(LoggingSettings { level })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.http.listen.port(), 8080);
        assert_eq!(settings.http.render_timeout, Duration::from_secs(60));
        assert_eq!(settings.cluster.workers, 2);
        assert_eq!(settings.cluster.worker_slots, 4);
        assert_eq!(settings.cluster.max_queue, None);
        assert_eq!(settings.render.settle, Duration::from_secs(1));
        assert_eq!(settings.render.result_ttl, Duration::from_secs(30));
        assert_eq!(settings.logging.level, "info");
        assert!(settings.auth.clients.is_empty());
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.cluster.workers = Some(8);
        raw.logging.level = Some("warn".into());

        let overrides = ServeArgs {
            workers: Some(3),
            log_level: Some("DEBUG".into()),
            origin: Some("https://app.example.com".into()),
            ..Default::default()
        };
        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.cluster.workers, 3);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.http.origin.host_str(), Some("app.example.com"));
    }

    #[test]
    fn zero_workers_and_relative_origin_are_rejected() {
        let mut raw = RawSettings::default();
        raw.cluster.workers = Some(0);
        assert!(matches!(Settings::from_raw(raw), Err(Error::ConfigError(_))));

        let mut raw = RawSettings::default();
        raw.http.origin = Some("ftp://files.example.com".into());
        assert!(matches!(Settings::from_raw(raw), Err(Error::ConfigError(_))));

        let mut raw = RawSettings::default();
        raw.http.origin = Some("/relative".into());
        assert!(matches!(Settings::from_raw(raw), Err(Error::ConfigError(_))));
    }

    #[test]
    fn file_source_is_layered() {
        let toml = r#"
            [cluster]
            workers = 5
            max_queue = 100

            [[auth.clients]]
            name = "reports"
            token = "Tok-ABC"
        "#;
        let raw: RawSettings = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        assert_eq!(settings.cluster.workers, 5);
        assert_eq!(settings.cluster.max_queue, Some(100));
        assert_eq!(
            settings.auth.clients,
            vec![ClientToken {
                name: "reports".into(),
                token: "Tok-ABC".into()
            }]
        );
    }

    #[test]
    fn worker_args_round_trip_through_cli() {
        let mut raw = RawSettings::default();
        raw.cluster.worker_slots = Some(6);
        raw.render.settle_ms = Some(250);
        raw.render.sandbox = Some(false);
        let settings = Settings::from_raw(raw).unwrap();

        let mut argv = vec!["snapcluster".to_string()];
        argv.extend(settings.worker_args());
        argv.extend(["--worker-id".to_string(), "1".to_string()]);

        let cli = CliArgs::parse_from(argv);
        let Some(Command::Worker(args)) = cli.command else {
            panic!("expected worker command");
        };
        assert_eq!(args.worker_id, 1);
        assert_eq!(args.worker_options().slots, 6);
        assert_eq!(args.worker_options().executor.settle(), Duration::from_millis(250));
        assert!(!args.engine_config().sandbox);
    }

    #[test]
    fn serve_arguments_parse() {
        let cli = CliArgs::parse_from([
            "snapcluster",
            "serve",
            "--workers",
            "4",
            "--max-queue",
            "10",
            "--origin",
            "http://localhost:3000",
        ]);
        match cli.command.expect("serve command") {
            Command::Serve(args) => {
                assert_eq!(args.workers, Some(4));
                assert_eq!(args.max_queue, Some(10));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
