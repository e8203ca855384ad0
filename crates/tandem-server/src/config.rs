use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";
const DEFAULT_DB_PATH: &str = "tandem.db";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_MESSAGE_LEN: usize = 5000;

/// Server settings read from `TANDEM_*` environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_message_len: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unset keys take their default;
    /// set but unparsable numbers are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("TANDEM_JWT_SECRET").unwrap_or_else(|| DEFAULT_JWT_SECRET.into());
        if jwt_secret == DEFAULT_JWT_SECRET || jwt_secret.len() < 16 {
            warn!("TANDEM_JWT_SECRET is a placeholder or too short; set a real secret before deploying");
        }

        let port = match lookup("TANDEM_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid TANDEM_PORT '{}'", raw))?,
            None => DEFAULT_PORT,
        };

        let max_message_len = match lookup("TANDEM_MAX_MESSAGE_LEN") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid TANDEM_MAX_MESSAGE_LEN '{}'", raw))?,
            None => DEFAULT_MAX_MESSAGE_LEN,
        };
        if max_message_len == 0 {
            anyhow::bail!("TANDEM_MAX_MESSAGE_LEN must be positive");
        }

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(lookup("TANDEM_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.into())),
            host: lookup("TANDEM_HOST").unwrap_or_else(|| DEFAULT_HOST.into()),
            port,
            max_message_len,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.jwt_secret, DEFAULT_JWT_SECRET);
        assert_eq!(cfg.db_path, PathBuf::from("tandem.db"));
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.max_message_len, 5000);
        assert_eq!(cfg.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn overrides_are_read() {
        let cfg = config(&[
            ("TANDEM_JWT_SECRET", "a-much-longer-production-secret"),
            ("TANDEM_HOST", "127.0.0.1"),
            ("TANDEM_PORT", "8088"),
            ("TANDEM_MAX_MESSAGE_LEN", "200"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 8088);
        assert_eq!(cfg.max_message_len, 200);
        assert_eq!(cfg.addr().unwrap().to_string(), "127.0.0.1:8088");
    }

    #[test]
    fn bad_numbers_fail() {
        assert!(config(&[("TANDEM_PORT", "eighty")]).is_err());
        assert!(config(&[("TANDEM_MAX_MESSAGE_LEN", "0")]).is_err());
    }
}
