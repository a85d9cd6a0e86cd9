use serde::Deserialize;
use std::collections::HashMap;

/// Read a secret either directly from `var` or from the file named by `var_file`.
/// File contents win over the plain variable so deployments can mount secrets.
fn secret_from_env(var: &str, var_file: &str) -> String {
    if let Ok(path) = std::env::var(var_file) {
        std::fs::read_to_string(&path)
            .map(|p| p.trim().to_string())
            .unwrap_or_else(|e| panic!("Failed to read {} at {}: {}", var_file, path, e))
    } else {
        std::env::var(var).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    /// When true the in-memory ledger is used instead of PostgreSQL
    /// (local development and hermetic tests).
    pub mock: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("DATABASE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("DATABASE_NAME").unwrap_or_else(|_| "gateway".to_string()),
            username: std::env::var("DATABASE_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: secret_from_env("DATABASE_PASSWORD", "DATABASE_PASSWORD_FILE"),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(10),
            mock: std::env::var("DATABASE_MOCK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }
}

/// Upstream AI provider configuration.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    /// Model used for chat completions.
    pub chat_model: String,
    /// Model used for audio transcription.
    pub transcription_model: String,
    /// Ordered fallback list for the vision action. The provider client tries
    /// each in turn and surfaces an exhausted-fallback error when all fail.
    pub vision_models: Vec<String>,
}

// Custom Debug to keep the API key out of log output.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("transcription_model", &self.transcription_model)
            .field("vision_models", &self.vision_models)
            .finish()
    }
}

/// Split a comma-separated env var value into non-empty trimmed entries.
fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let vision_models = std::env::var("PROVIDER_VISION_MODELS")
            .ok()
            .map(|raw| split_csv(&raw))
            .filter(|models| !models.is_empty())
            .unwrap_or_else(|| vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()]);

        Self {
            api_key: secret_from_env("PROVIDER_API_KEY", "PROVIDER_API_KEY_FILE"),
            base_url: std::env::var("PROVIDER_BASE_URL").ok(),
            chat_model: std::env::var("PROVIDER_CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            transcription_model: std::env::var("PROVIDER_TRANSCRIPTION_MODEL")
                .unwrap_or_else(|_| "whisper-1".to_string()),
            vision_models,
        }
    }
}

/// Trusted signing keys for in-app-purchase receipt verification.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptConfig {
    /// Map of key id (JWS `kid` header) to PEM-encoded public key.
    /// Loaded from the JSON file named by RECEIPT_TRUSTED_KEYS_FILE.
    pub trusted_keys: HashMap<String, String>,
    /// Expected token issuer, when set.
    pub issuer: Option<String>,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        let trusted_keys = if let Ok(path) = std::env::var("RECEIPT_TRUSTED_KEYS_FILE") {
            let raw = std::fs::read_to_string(&path).unwrap_or_else(|e| {
                panic!("Failed to read RECEIPT_TRUSTED_KEYS_FILE at {}: {}", path, e)
            });
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                panic!(
                    "RECEIPT_TRUSTED_KEYS_FILE must hold a JSON kid->PEM map: {}",
                    e
                )
            })
        } else {
            HashMap::new()
        };

        Self {
            trusted_keys,
            issuer: std::env::var("RECEIPT_ISSUER").ok(),
        }
    }
}

/// Bearer-token verification for inbound requests.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"[REDACTED]")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: secret_from_env("AUTH_JWT_SECRET", "AUTH_JWT_SECRET_FILE"),
        }
    }
}

/// Quota reset cadence for the whole deployment. Which cadence applies is a
/// deployment policy choice, never a per-user one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetCadence {
    Daily,
    Monthly,
    Lifetime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub cadence: ResetCadence,
    /// Free-tier limits per action class. Stored records carrying an older
    /// default are migrated opportunistically at read time.
    pub chat_limit: u32,
    pub transcription_limit: u32,
    pub vision_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let cadence = match std::env::var("QUOTA_RESET_CADENCE").as_deref() {
            Ok("daily") => ResetCadence::Daily,
            Ok("lifetime") => ResetCadence::Lifetime,
            Ok("monthly") | Err(_) => ResetCadence::Monthly,
            Ok(other) => panic!(
                "QUOTA_RESET_CADENCE must be daily, monthly or lifetime (got {:?})",
                other
            ),
        };

        fn limit(var: &str, default: u32) -> u32 {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            cadence,
            chat_limit: limit("QUOTA_CHAT_LIMIT", 10),
            transcription_limit: limit("QUOTA_TRANSCRIPTION_LIMIT", 5),
            vision_limit: limit("QUOTA_VISION_LIMIT", 5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub exact_matches: Vec<String>,
    pub wildcard_suffixes: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        let raw_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        let mut exact_matches = Vec::new();
        let mut wildcard_suffixes = Vec::new();

        for origin in raw_origins.split(',') {
            let s = origin.trim();
            if s.is_empty() {
                continue;
            }

            if let Some(suffix) = s.strip_prefix('*') {
                let safe_suffix = if suffix.starts_with('.') || suffix.starts_with('-') {
                    suffix.to_string()
                } else {
                    format!(".{}", suffix)
                };
                wildcard_suffixes.push(safe_suffix);
            } else {
                exact_matches.push(s.to_string());
            }
        }

        Self {
            exact_matches,
            wildcard_suffixes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub receipt: ReceiptConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub cors: CorsConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
