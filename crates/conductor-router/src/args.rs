use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "conductor-router", about = "Routes virtual model runner traffic to backend endpoints")]
pub struct Args {
    #[arg(long, env = "CONDUCTOR_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// JSON snapshot of runners, endpoints, definitions and configurations.
    #[arg(long, env = "CONDUCTOR_DIRECTORY_FILE")]
    pub directory_file: Option<PathBuf>,

    #[arg(long, env = "CONDUCTOR_CONNECT_TIMEOUT_MS", default_value_t = 3_000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "CONDUCTOR_MAX_REQUEST_BODY_BYTES", default_value_t = 32 * 1024 * 1024)]
    pub max_request_body_bytes: usize,

    /// Scheme reported upstream in X-Forwarded-Proto; use "https" behind TLS.
    #[arg(long, env = "CONDUCTOR_FORWARDED_PROTO", default_value = "http", value_parser = ["http", "https"])]
    pub forwarded_proto: String,

    #[arg(long, env = "CONDUCTOR_SESSION_CLEANUP_INTERVAL_MS", default_value_t = 60_000)]
    pub session_cleanup_interval_ms: u64,

    /// Seed for the weighted random balancer.
    #[arg(long, env = "CONDUCTOR_RANDOM_SEED")]
    pub random_seed: Option<u64>,

    /// "json" or "text".
    #[arg(long, env = "CONDUCTOR_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[arg(long, env = "CONDUCTOR_OTLP_URL")]
    pub otlp_url: Option<String>,

    #[arg(long, env = "CONDUCTOR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
