use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

use crate::services::project_registry::DEFAULT_MAX_ATTEMPTS;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub storage_class: String,
    pub database_url: String,
    pub max_upload_bytes: usize,
    pub identifier_attempts: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Project archive registry")]
pub struct Args {
    /// Host to bind to (overrides PROJECT_REGISTRY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PROJECT_REGISTRY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where project archives are stored (overrides PROJECT_REGISTRY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Storage class recorded on new projects (overrides PROJECT_REGISTRY_STORAGE_CLASS)
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Database URL (overrides PROJECT_REGISTRY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest accepted upload in bytes (overrides PROJECT_REGISTRY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Identifier draws per upload before giving up (overrides PROJECT_REGISTRY_IDENTIFIER_ATTEMPTS)
    #[arg(long)]
    pub identifier_attempts: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |name| env::var(name))?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|_| default.into());

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| text("PROJECT_REGISTRY_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => parse_var(&lookup, "PROJECT_REGISTRY_PORT", 3000)?,
            },
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| text("PROJECT_REGISTRY_STORAGE_DIR", "./data/projects")),
            storage_class: args
                .storage_class
                .unwrap_or_else(|| text("PROJECT_REGISTRY_STORAGE_CLASS", "local")),
            database_url: args.database_url.unwrap_or_else(|| {
                text(
                    "PROJECT_REGISTRY_DATABASE_URL",
                    "sqlite://./data/meta/projects.db",
                )
            }),
            max_upload_bytes: match args.max_upload_bytes {
                Some(bytes) => bytes,
                None => parse_var(
                    &lookup,
                    "PROJECT_REGISTRY_MAX_UPLOAD_BYTES",
                    DEFAULT_MAX_UPLOAD_BYTES,
                )?,
            },
            identifier_attempts: match args.identifier_attempts {
                Some(n) => n,
                None => parse_var(
                    &lookup,
                    "PROJECT_REGISTRY_IDENTIFIER_ATTEMPTS",
                    DEFAULT_MAX_ATTEMPTS,
                )?,
            },
        };

        if cfg.identifier_attempts == 0 {
            anyhow::bail!("identifier attempts must be at least 1");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
