use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Default number of logged updates after which a document is compacted.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 500;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// SQLite database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Bearer tokens and the user each one belongs to
    pub auth_tokens: HashMap<String, String>,
    /// Whether `POST /api/token` may mint tokens
    pub allow_token_issue: bool,
    /// CORS allowed origins (comma-separated); empty allows any origin
    pub cors_origins: Vec<String>,
    /// Update count above which a document log is compacted
    pub compact_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            database_path: None,
            auth_tokens: HashMap::new(),
            allow_token_issue: false,
            cors_origins: Vec::new(),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl Config {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = match lookup("PORT") {
            Some(p) => p.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let database_path = lookup("DATABASE_PATH")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let auth_tokens = match lookup("AUTH_TOKENS") {
            Some(raw) => parse_tokens(&raw)?,
            None => HashMap::new(),
        };

        let allow_token_issue = lookup("ALLOW_TOKEN_ISSUE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let compact_threshold = match lookup("COMPACT_THRESHOLD") {
            Some(t) => t
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCompactThreshold)?,
            None => defaults.compact_threshold,
        };

        Ok(Config {
            host,
            port,
            database_path,
            auth_tokens,
            allow_token_issue,
            cors_origins,
            compact_threshold,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `token:user_id` pairs separated by commas.
fn parse_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (token, user_id) = pair
            .split_once(':')
            .map(|(t, u)| (t.trim(), u.trim()))
            .filter(|(t, u)| !t.is_empty() && !u.is_empty())
            .ok_or_else(|| ConfigError::InvalidAuthToken(pair.to_string()))?;
        tokens.insert(token.to_string(), user_id.to_string());
    }
    Ok(tokens)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidAuthToken(String),
    InvalidCompactThreshold,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidAuthToken(pair) => {
                write!(f, "Invalid AUTH_TOKENS entry '{}', expected token:user_id", pair)
            }
            ConfigError::InvalidCompactThreshold => {
                write!(f, "Invalid COMPACT_THRESHOLD environment variable")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3030");
        assert!(config.database_path.is_none());
        assert!(config.auth_tokens.is_empty());
        assert!(!config.allow_token_issue);
        assert_eq!(config.compact_threshold, DEFAULT_COMPACT_THRESHOLD);
    }

    #[test]
    fn test_parses_tokens_and_origins() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("DATABASE_PATH", "/tmp/collab.db"),
            ("AUTH_TOKENS", "abc:u1, def:u2"),
            ("CORS_ORIGINS", "http://a.test, ,http://b.test"),
            ("COMPACT_THRESHOLD", "10"),
            ("ALLOW_TOKEN_ISSUE", "true"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/collab.db")));
        assert_eq!(config.auth_tokens.get("def").map(String::as_str), Some("u2"));
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.compact_threshold, 10);
        assert!(config.allow_token_issue);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("PORT", "http")])),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("AUTH_TOKENS", "abc")])),
            Err(ConfigError::InvalidAuthToken(_))
        ));
    }
}
