use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, time::Duration};

use crate::services::storage::StorageTimeouts;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: BackendConfig,
    pub timeouts: StorageTimeouts,
    /// Chance in `[0, 1]` that a directory listing triggers the placeholder sweep.
    pub sweep_probability: f64,
}

/// Where object payloads live.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Local { storage_dir: String },
    S3(S3Settings),
}

#[derive(Clone, PartialEq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

// Credentials stay out of the startup log.
impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "***"))
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "***"),
            )
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-tenant file manager over local disk or S3")]
pub struct Args {
    /// Host to bind to (overrides FILE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `s3` (overrides FILE_VAULT_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Directory where objects are stored by the local backend (overrides FILE_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket used by the s3 backend (overrides FILE_VAULT_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint, e.g. a MinIO URL (overrides FILE_VAULT_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values looked up by `var` (the environment in production).
    pub fn resolve(args: Args, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = var("FILE_VAULT_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&var, "FILE_VAULT_PORT", 3000u16)?;
        let env_db = var("FILE_VAULT_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/file_vault.db".into());

        let backend_name = args
            .backend
            .or_else(|| var("FILE_VAULT_BACKEND"))
            .unwrap_or_else(|| "local".into());
        let backend = match backend_name.to_ascii_lowercase().as_str() {
            "local" => BackendConfig::Local {
                storage_dir: args
                    .storage_dir
                    .or_else(|| var("FILE_VAULT_STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/objects".into()),
            },
            "s3" | "minio" => {
                let bucket = args
                    .s3_bucket
                    .or_else(|| var("FILE_VAULT_S3_BUCKET"))
                    .context("the s3 backend requires FILE_VAULT_S3_BUCKET or --s3-bucket")?;
                BackendConfig::S3(S3Settings {
                    bucket,
                    region: var("FILE_VAULT_S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                    endpoint: args.s3_endpoint.or_else(|| var("FILE_VAULT_S3_ENDPOINT")),
                    access_key_id: var("FILE_VAULT_S3_ACCESS_KEY_ID"),
                    secret_access_key: var("FILE_VAULT_S3_SECRET_ACCESS_KEY"),
                })
            }
            other => bail!("unknown storage backend `{}` (expected `local` or `s3`)", other),
        };

        let defaults = StorageTimeouts::default();
        let timeouts = StorageTimeouts {
            object: Duration::from_secs(parse_var(
                &var,
                "FILE_VAULT_OBJECT_TIMEOUT_SECS",
                defaults.object.as_secs(),
            )?),
            listing: Duration::from_secs(parse_var(
                &var,
                "FILE_VAULT_LISTING_TIMEOUT_SECS",
                defaults.listing.as_secs(),
            )?),
            batch: Duration::from_secs(parse_var(
                &var,
                "FILE_VAULT_BATCH_TIMEOUT_SECS",
                defaults.batch.as_secs(),
            )?),
        };

        let sweep_probability = parse_var(&var, "FILE_VAULT_SWEEP_PROBABILITY", 0.05f64)?;
        if !(0.0..=1.0).contains(&sweep_probability) {
            bail!(
                "FILE_VAULT_SWEEP_PROBABILITY must be within [0, 1], got {}",
                sweep_probability
            );
        }

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            backend,
            timeouts,
            sweep_probability,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_to_local_backend() {
        let cfg = AppConfig::resolve(Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(
            cfg.backend,
            BackendConfig::Local {
                storage_dir: "./data/objects".into()
            }
        );
        assert_eq!(cfg.timeouts.listing, Duration::from_secs(120));
        assert!((cfg.sweep_probability - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn args_override_environment() {
        let args = Args {
            port: Some(9000),
            storage_dir: Some("/srv/objects".into()),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(
            args,
            lookup(&[("FILE_VAULT_PORT", "8000"), ("FILE_VAULT_HOST", "127.0.0.1")]),
        )
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(
            cfg.backend,
            BackendConfig::Local {
                storage_dir: "/srv/objects".into()
            }
        );
    }

    #[test]
    fn s3_backend_reads_bucket_and_credentials() {
        let cfg = AppConfig::resolve(
            Args::default(),
            lookup(&[
                ("FILE_VAULT_BACKEND", "minio"),
                ("FILE_VAULT_S3_BUCKET", "files"),
                ("FILE_VAULT_S3_ENDPOINT", "http://localhost:9000"),
                ("FILE_VAULT_S3_SECRET_ACCESS_KEY", "hunter2"),
            ]),
        )
        .unwrap();
        let BackendConfig::S3(settings) = cfg.backend else {
            panic!("expected s3 backend");
        };
        assert_eq!(settings.bucket, "files");
        assert_eq!(settings.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(AppConfig::resolve(Args::default(), lookup(&[("FILE_VAULT_PORT", "x")])).is_err());
        assert!(
            AppConfig::resolve(Args::default(), lookup(&[("FILE_VAULT_BACKEND", "s3")])).is_err()
        );
        assert!(
            AppConfig::resolve(
                Args::default(),
                lookup(&[("FILE_VAULT_SWEEP_PROBABILITY", "2")])
            )
            .is_err()
        );
    }
}
