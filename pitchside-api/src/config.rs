/// Configuration management for the API server
///
/// This module loads configuration from environment variables and provides
/// a type-safe configuration struct.
///
/// # Environment Variables
///
/// - `DATABASE_URL`: PostgreSQL connection string (required)
/// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
/// - `API_HOST`: Host to bind to (default: 0.0.0.0)
/// - `API_PORT`: Port to bind to (default: 8080)
/// - `CORS_ORIGINS`: Comma-separated allowed origins, `*` for any (default: `*`)
/// - `PRODUCTION`: Enables HSTS (default: false)
/// - `JWT_SECRET`: Secret key for JWT signing, at least 32 characters (required)
/// - `CRON_SECRET`: Shared secret for `/cron/*`, at least 16 characters (required)
/// - Stripe, Xero, email, alert and reservation settings, see
///   [`pitchside_shared::config`]
///
/// # Example
///
/// ```no_run
/// use pitchside_api::config::Config;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.bind_address());
/// # Ok(())
/// # }
/// ```

use pitchside_shared::config::{parse_or, CheckoutConfig, IntegrationsConfig};
use serde::{Deserialize, Serialize};
use std::env;

pub const MIN_JWT_SECRET_LEN: usize = 32;
pub const MIN_CRON_SECRET_LEN: usize = 16;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub cron: CronConfig,

    /// Stripe, Xero, email and alert settings
    pub integrations: IntegrationsConfig,

    /// Reservation hold windows
    pub checkout: CheckoutConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,

    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,

    /// Production deployments sit behind HTTPS and get HSTS
    pub production: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Secret key for JWT signing
    ///
    /// Generate with: `openssl rand -hex 32`
    #[serde(skip_serializing)]
    pub secret: String,
}

/// Shared secret the scheduler sends in `x-cron-secret`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(skip_serializing)]
    pub secret: String,
}

impl Config {
    /// Loads configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Required environment variables are missing
    /// - Environment variables have invalid values
    /// - A secret is shorter than its minimum length
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present (for development)
        dotenvy::dotenv().ok();

        let host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_or::<u16>("API_PORT", 8080)?;
        let cors_origins = parse_origins(&env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string()));
        let production = parse_or::<bool>("PRODUCTION", false)?;

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;
        let max_connections = parse_or::<u32>("DATABASE_MAX_CONNECTIONS", 10)?;

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?;
        let cron_secret = env::var("CRON_SECRET")
            .map_err(|_| anyhow::anyhow!("CRON_SECRET environment variable is required"))?;
        validate_secrets(&jwt_secret, &cron_secret)?;

        Ok(Self {
            api: ApiConfig {
                host,
                port,
                cors_origins,
                production,
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            jwt: JwtConfig { secret: jwt_secret },
            cron: CronConfig { secret: cron_secret },
            integrations: IntegrationsConfig::from_env()?,
            checkout: CheckoutConfig::from_env()?,
        })
    }

    /// Returns the server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.api.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| o.trim_end_matches('/').to_string())
        .collect()
}

fn validate_secrets(jwt_secret: &str, cron_secret: &str) -> anyhow::Result<()> {
    if jwt_secret.len() < MIN_JWT_SECRET_LEN {
        anyhow::bail!("JWT_SECRET must be at least {} characters long", MIN_JWT_SECRET_LEN);
    }
    if cron_secret.len() < MIN_CRON_SECRET_LEN {
        anyhow::bail!("CRON_SECRET must be at least {} characters long", MIN_CRON_SECRET_LEN);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pitchside_shared::config::{AccountCodes, AlertConfig, StripeConfig};

    pub(crate) fn test_config() -> Config {
        Config {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                cors_origins: vec!["*".to_string()],
                production: false,
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/test".to_string(),
                max_connections: 10,
            },
            jwt: JwtConfig {
                secret: "test-secret-key-at-least-32-bytes-long".to_string(),
            },
            cron: CronConfig {
                secret: "cron-secret-16-chars".to_string(),
            },
            integrations: IntegrationsConfig {
                stripe: StripeConfig {
                    secret_key: "sk_test_123".to_string(),
                    webhook_secret: "whsec_test".to_string(),
                    api_base: "http://localhost:12111".to_string(),
                    currency: "usd".to_string(),
                },
                xero: None,
                email: None,
                alerts: AlertConfig { webhook_url: None },
                accounts: AccountCodes::default(),
            },
            checkout: CheckoutConfig::default(),
        }
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(test_config().bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            parse_origins("https://club.example.org/, https://admin.example.org ,"),
            vec!["https://club.example.org", "https://admin.example.org"]
        );
        assert!(parse_origins("").is_empty());
    }

    #[test]
    fn test_allows_any_origin() {
        let mut config = test_config();
        assert!(config.allows_any_origin());

        config.api.cors_origins = vec!["https://club.example.org".to_string()];
        assert!(!config.allows_any_origin());
    }

    #[test]
    fn test_validate_secrets() {
        assert!(validate_secrets(&"j".repeat(32), &"c".repeat(16)).is_ok());

        let err = validate_secrets("short", &"c".repeat(16)).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));

        let err = validate_secrets(&"j".repeat(32), "short").unwrap_err();
        assert!(err.to_string().contains("CRON_SECRET"));
    }

    #[test]
    fn test_secrets_never_serialized() {
        let json = serde_json::to_string(&test_config()).unwrap();
        assert!(!json.contains("test-secret-key"));
        assert!(!json.contains("cron-secret"));
    }
}
