use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    models::object::ConsumptionPolicy,
    services::{blob_store::TypeAllowlist, lifecycle::MAX_TTL, object_service::StoreSettings},
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub max_file_size: u64,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub policy: ConsumptionPolicy,
    pub allowed_types: Vec<String>,
    /// Base used to build share links; derived from the request `Host`
    /// header when unset.
    pub public_url: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file-sharing relay")]
pub struct Args {
    /// Host to bind to (overrides RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding uploaded blobs; wiped at startup (overrides RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Maximum upload size in bytes (overrides RELAY_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Seconds an upload stays available (overrides RELAY_TTL_SECS)
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Seconds between sweep passes (overrides RELAY_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// `ttl` or `single-use` (overrides RELAY_POLICY)
    #[arg(long)]
    pub policy: Option<ConsumptionPolicy>,

    /// Comma separated MIME types (`image/*`) or extensions (`.pdf`) (overrides RELAY_ALLOWED_TYPES)
    #[arg(long)]
    pub allowed_types: Option<String>,

    /// Public base URL for share links (overrides RELAY_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge CLI args over environment values over defaults.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = env("RELAY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_env::<u16>(&env, "RELAY_PORT")?.unwrap_or(3000);
        let env_storage = env("RELAY_STORAGE_DIR").unwrap_or_else(|| "./data/blobs".into());
        let env_max_size = parse_env::<u64>(&env, "RELAY_MAX_FILE_SIZE")?.unwrap_or(100 * 1024 * 1024);
        let env_ttl = parse_env::<u64>(&env, "RELAY_TTL_SECS")?.unwrap_or(3600);
        let env_sweep = parse_env::<u64>(&env, "RELAY_SWEEP_INTERVAL_SECS")?.unwrap_or(60);
        let env_policy = parse_env::<ConsumptionPolicy>(&env, "RELAY_POLICY")?
            .unwrap_or(ConsumptionPolicy::SingleUse);
        let env_allowed = env("RELAY_ALLOWED_TYPES").unwrap_or_default();

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            max_file_size: args.max_file_size.unwrap_or(env_max_size),
            ttl: Duration::from_secs(args.ttl_secs.unwrap_or(env_ttl)),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep)),
            policy: args.policy.unwrap_or(env_policy),
            allowed_types: split_list(&args.allowed_types.unwrap_or(env_allowed)),
            public_url: args
                .public_url
                .or_else(|| env("RELAY_PUBLIC_URL"))
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            bail!("max file size must be greater than zero");
        }
        if self.ttl.is_zero() || self.ttl > MAX_TTL {
            bail!("ttl must be between 1 and {} seconds", MAX_TTL.as_secs());
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            storage_dir: PathBuf::from(&self.storage_dir),
            max_file_size: self.max_file_size,
            ttl: self.ttl,
            sweep_interval: self.sweep_interval,
            policy: self.policy,
            allowlist: TypeAllowlist::new(&self.allowed_types),
            // Late visitors of an expired link get 410 for one more TTL.
            expired_retention: self.ttl,
        }
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
