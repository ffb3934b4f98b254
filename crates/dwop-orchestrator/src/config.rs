//! Centralized environment configuration.
//!
//! The Go original scatters `os.Getenv` calls across `main.go`,
//! `executor.go` and `rabitMQ.go`; every var is collected here instead, so
//! a missing required var fails fast at boot with one readable error
//! rather than surfacing as a nil-pointer deep in a request handler.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub image: String,
    pub port: u16,
    pub database_url: String,
    pub supabase_project_url: String,
    pub supabase_service_key: String,
    pub rabbitmq_url: String,
}

impl Config {
    /// Load `.env` (if present) and read every variable named in the
    /// external-interfaces contract. `DWOP_IMAGE` is the only one with no
    /// default — a missing image is a fatal boot error, matching the Go
    /// original's `log.Fatalf` on an unset `DWOP_IMAGE`.
    ///
    /// `DATABASE_URL` is not named in the distilled spec's env var list
    /// (the original resolves its Postgres connection through the
    /// Supabase SDK); since `dwop-store` talks to Postgres directly via
    /// `sqlx`, it needs its own connection string. Recorded as an ambient
    /// addition in DESIGN.md.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound)
            {
                tracing::warn!(error = %e, "failed to load .env");
            }
        }

        let image = std::env::var("DWOP_IMAGE").context(
            "DWOP_IMAGE environment variable is required (the image run for every task Job)",
        )?;

        let namespace = std::env::var("DWOP_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let port: u16 = std::env::var("DWOP_PORT")
            .ok()
            .map(|v| v.parse().context("DWOP_PORT must be a valid port number"))
            .transpose()?
            .unwrap_or(8080);

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
        let supabase_project_url = std::env::var("SUPABASE_PROJECT_URL")
            .context("SUPABASE_PROJECT_URL environment variable required")?;
        let supabase_service_key = std::env::var("SUPABASE_SERVICE_KEY")
            .context("SUPABASE_SERVICE_KEY environment variable required")?;
        let rabbitmq_url = std::env::var("RABBITMQ_CONNECTION_URL")
            .context("RABBITMQ_CONNECTION_URL environment variable required")?;

        // KUBECONFIG is read by `kube::Client::try_default()` itself; we
        // only check it's present when the in-cluster service account
        // config isn't available, so there's nothing to store here beyond
        // letting the `kube` config loader see it via the process env.

        Ok(Self {
            namespace,
            image,
            port,
            database_url,
            supabase_project_url,
            supabase_service_key,
            rabbitmq_url,
        })
    }
}
