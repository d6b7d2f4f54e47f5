use std::time::Duration;

/// Which broker backend to run. The in-process backend is single-instance
/// only; horizontally scaled deployments must select `Redis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Memory,
    Redis,
}

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Selected broker backend (`BROKER_BACKEND=memory|redis`).
    pub broker_backend: BrokerBackend,
    /// Redis connection string; required when the redis backend is selected.
    pub redis_url: Option<String>,
    /// Base URL of the data API that validates tokens and answers
    /// conversation-membership checks.
    pub data_api_url: String,
    /// Shared secret for the internal event-publish endpoint.
    pub internal_api_token: String,
    /// How often clients are expected to send a heartbeat frame.
    pub heartbeat_interval: Duration,
    /// Extra slack on top of the heartbeat interval before the receive
    /// loop wakes up to check liveness.
    pub heartbeat_grace: Duration,
    /// TTL of the per-user presence key; also the liveness cutoff for
    /// reaping sessions that stopped heartbeating.
    pub presence_ttl: Duration,
    /// TTL of the per-conversation typing key.
    pub typing_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let broker_backend = match std::env::var("BROKER_BACKEND").as_deref() {
            Ok("redis") => BrokerBackend::Redis,
            Ok("memory") | Err(_) => BrokerBackend::Memory,
            Ok(other) => panic!("BROKER_BACKEND must be 'memory' or 'redis', got '{other}'"),
        };

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        if broker_backend == BrokerBackend::Redis && redis_url.is_none() {
            panic!("REDIS_URL env var is required when BROKER_BACKEND=redis");
        }

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4003),
            broker_backend,
            redis_url,
            data_api_url: required_var("DATA_API_URL"),
            internal_api_token: required_var("INTERNAL_API_TOKEN"),
            heartbeat_interval: millis_var("HEARTBEAT_INTERVAL_MS", 20_000),
            heartbeat_grace: millis_var("HEARTBEAT_GRACE_MS", 5_000),
            presence_ttl: millis_var("PRESENCE_TTL_MS", 45_000),
            typing_ttl: millis_var("TYPING_TTL_MS", 10_000),
        }
    }

    /// Upper bound on one iteration of the session receive loop.
    pub fn receive_timeout(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_grace
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn millis_var(name: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
