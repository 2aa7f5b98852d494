use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP facade binds to (`BIND_ADDR`, or `PORT` on 0.0.0.0).
    pub bind_addr: SocketAddr,
    /// Path to the external worker CLI binary (`WORKER_CLI_PATH`).
    pub worker_cli_path: PathBuf,
    /// Root directory under which `repository` names are resolved
    /// (`REPOSITORIES_ROOT`).
    pub repositories_root: PathBuf,
    /// Capacity of the process-wide invocation semaphore
    /// (`MAX_CONCURRENT_INVOCATIONS`).
    pub max_concurrent: usize,
    /// Wall-clock budget for a single worker invocation (`HARD_TIMEOUT_MS`).
    pub hard_timeout: Duration,
    /// Silence-after-output budget for a single worker invocation
    /// (`IDLE_TIMEOUT_MS`).
    pub idle_timeout: Duration,
    /// Budget for reviewer and continuation invocations inside the iterate
    /// loop (`ITERATE_TIMEOUT_MS`).
    pub iterate_timeout: Duration,
    /// Combined stdout+stderr cap per invocation (`MAX_OUTPUT_BYTES`).
    pub max_output_bytes: usize,
    /// Inactivity expiration for conversations (`MEMORY_TTL_SECONDS`).
    pub memory_ttl: Duration,
    /// Shared secret attached to outbound webhook calls (`WEBHOOK_SECRET`).
    pub webhook_secret: Option<String>,
    /// Default review-loop bound when the request omits one (`MAX_ITERATIONS`).
    pub max_iterations: u32,
    /// Stable HOME override for worker invocations so the worker reads a
    /// deterministic configuration directory (`WORKER_HOME`).
    pub worker_home: Option<PathBuf>,
    /// Debug-verbosity knob passed through to the worker (`WORKER_DEBUG`).
    pub worker_debug: bool,
}

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_HARD_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_ITERATE_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MEMORY_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_PORT: u16 = 8080;

impl Config {
    pub fn from_env() -> Self {
        let bind_addr = match env::var("BIND_ADDR") {
            Ok(addr) => addr.parse().unwrap_or_else(|_| {
                tracing::warn!("BIND_ADDR is not a valid socket address: {addr} — using default");
                default_bind_addr()
            }),
            Err(_) => default_bind_addr(),
        };

        let worker_cli_path =
            PathBuf::from(env::var("WORKER_CLI_PATH").unwrap_or_else(|_| "worker".to_string()));
        if !which_exists(&worker_cli_path) {
            tracing::warn!(
                "worker CLI not found at {} — invocations will fail to spawn",
                worker_cli_path.display()
            );
        }

        let repositories_root = PathBuf::from(
            env::var("REPOSITORIES_ROOT").unwrap_or_else(|_| "./repositories".to_string()),
        );
        if !repositories_root.is_dir() {
            tracing::warn!(
                "REPOSITORIES_ROOT does not exist: {}",
                repositories_root.display()
            );
        }

        let max_concurrent = env_parse("MAX_CONCURRENT_INVOCATIONS", DEFAULT_MAX_CONCURRENT);
        let max_concurrent = if max_concurrent == 0 {
            tracing::warn!("MAX_CONCURRENT_INVOCATIONS must be >= 1 — using 1");
            1
        } else {
            max_concurrent
        };

        let hard_timeout =
            Duration::from_millis(env_parse("HARD_TIMEOUT_MS", DEFAULT_HARD_TIMEOUT_MS));
        let idle_timeout =
            Duration::from_millis(env_parse("IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS));
        let iterate_timeout =
            Duration::from_millis(env_parse("ITERATE_TIMEOUT_MS", DEFAULT_ITERATE_TIMEOUT_MS));

        Config {
            bind_addr,
            worker_cli_path,
            repositories_root,
            max_concurrent,
            hard_timeout,
            idle_timeout,
            iterate_timeout,
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES),
            memory_ttl: Duration::from_secs(env_parse(
                "MEMORY_TTL_SECONDS",
                DEFAULT_MEMORY_TTL_SECONDS,
            )),
            webhook_secret: env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            max_iterations: env_parse("MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS),
            worker_home: env::var("WORKER_HOME").ok().map(PathBuf::from),
            worker_debug: env::var("WORKER_DEBUG").is_ok_and(|v| v == "1" || v == "true"),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    let port = env_parse("PORT", DEFAULT_PORT);
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Parse an env var, falling back to `default` (with a warning) when unset
/// or malformed.
fn env_parse<T: std::str::FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("{name} is not a valid value: {raw} — using default {default}");
                default
            }
        },
    }
}

/// Check if the worker binary resolves: absolute/relative paths are checked
/// directly, bare names are looked up in PATH.
fn which_exists(path: &std::path::Path) -> bool {
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::process::Command::new("which")
        .arg(path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
