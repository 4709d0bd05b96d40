//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;
use crate::volumes::VolumeSpec;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_HTTP_PORT: u16 = 5000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_UPLOAD_SESSION_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_UPLOAD_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 0;
pub const DEFAULT_UPLOAD_IO_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_UPLOAD_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPLOAD_REAP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://voldrive.db";
pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
pub const TOKEN_PRUNE_INTERVAL_SECS: u64 = 300;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "voldrive", version = VERSION_INFO, about = "Volume file server with resumable uploads")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "VOLDRIVE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "VOLDRIVE_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "VOLDRIVE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "VOLDRIVE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "VOLDRIVE_TLS_SELF_SIGNED",
        help = "Serve HTTPS with a generated self-signed certificate"
    )]
    pub tls_self_signed: bool,
    #[arg(long, env = "VOLDRIVE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "VOLDRIVE_LOG_LEVEL",
        default_value = DEFAULT_LOG_LEVEL,
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        short = 'v',
        long = "volume",
        env = "VOLDRIVE_VOLUMES",
        value_delimiter = ',',
        help = "Volume as name=/absolute/root (repeatable)"
    )]
    pub volumes: Vec<VolumeSpec>,
    #[arg(
        long,
        env = "VOLDRIVE_MOUNT_FS_TYPES",
        value_delimiter = ',',
        help = "Filesystem types discovered from /proc/mounts as volumes (e.g. fuseblk)"
    )]
    pub mount_fs_types: Vec<String>,
    #[arg(
        long,
        env = "VOLDRIVE_PUBLIC_URL",
        help = "Base URL used to build upload Location headers"
    )]
    pub public_url: Option<String>,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_SESSION_TTL_SECS,
        help = "Upload session lifetime in seconds"
    )]
    pub upload_session_ttl_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNK_SIZE,
        help = "Max bytes accepted by one append request"
    )]
    pub upload_max_chunk_size: u64,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_IO_TIMEOUT_SECS",
        default_value_t = DEFAULT_UPLOAD_IO_TIMEOUT_SECS,
        help = "Timeout for one file create or write"
    )]
    pub upload_io_timeout_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_LOCK_TIMEOUT_SECS",
        default_value_t = DEFAULT_UPLOAD_LOCK_TIMEOUT_SECS,
        help = "Max wait for a busy upload session"
    )]
    pub upload_lock_timeout_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_UPLOAD_REAP_INTERVAL_SECS",
        default_value_t = DEFAULT_UPLOAD_REAP_INTERVAL_SECS,
        help = "Expired upload sweep interval in seconds (0 to disable)"
    )]
    pub upload_reap_interval_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_AUTH_DISABLED",
        help = "Serve every route without authentication"
    )]
    pub auth_disabled: bool,
    #[arg(
        long,
        env = "VOLDRIVE_DATABASE_URL",
        default_value = DEFAULT_DATABASE_URL,
        help = "SQLite database holding users and issued tokens"
    )]
    pub database_url: String,
    #[arg(
        long,
        env = "VOLDRIVE_ACCESS_SECRET",
        default_value = "",
        hide_env_values = true,
        help = "HMAC secret for access tokens"
    )]
    pub access_secret: String,
    #[arg(
        long,
        env = "VOLDRIVE_REFRESH_SECRET",
        default_value = "",
        hide_env_values = true,
        help = "HMAC secret for refresh tokens"
    )]
    pub refresh_secret: String,
    #[arg(
        long,
        env = "VOLDRIVE_ACCESS_TTL_SECS",
        default_value_t = DEFAULT_ACCESS_TTL_SECS,
        help = "Access token lifetime in seconds"
    )]
    pub access_ttl_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_REFRESH_TTL_SECS",
        default_value_t = DEFAULT_REFRESH_TTL_SECS,
        help = "Refresh token lifetime in seconds"
    )]
    pub refresh_ttl_secs: u64,
    #[arg(
        long,
        env = "VOLDRIVE_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Initial username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "VOLDRIVE_AUTH_PASS",
        hide_env_values = true,
        help = "Initial user password (no initial user when unset)"
    )]
    pub auth_pass: Option<String>,
    #[arg(
        long,
        env = "VOLDRIVE_BCRYPT_COST",
        default_value_t = DEFAULT_BCRYPT_COST,
        help = "bcrypt cost for stored passwords"
    )]
    pub bcrypt_cost: u32,
}
