use std::{str::FromStr, time::Duration};

use serde::Deserialize;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Tikv,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "tikv" => Ok(Backend::Tikv),
            other => Err(Error::Config(format!("unknown backend `{other}`"))),
        }
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub pd_endpoints: Vec<String>,
    pub database: String,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            pd_endpoints: Vec::new(),
            database: "app".to_string(),
            min_pool_size: 5,
            max_pool_size: 40,
            request_timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    /// Parses a JSON settings document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| Error::Config(format!("invalid settings: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `DOC_STORE_*` variables, loading `.env` first when present.
    ///
    /// `DOC_STORE_CONFIG` names a JSON settings file used as the base; the
    /// other variables override it.
    pub fn from_env() -> Result<Self, Error> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`StoreConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = match lookup("DOC_STORE_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|err| Error::Config(format!("cannot read `{path}`: {err}")))?;
                serde_json::from_str(&raw)
                    .map_err(|err| Error::Config(format!("invalid settings in `{path}`: {err}")))?
            }
            None => Self::default(),
        };
        if let Some(backend) = lookup("DOC_STORE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(endpoints) = lookup("DOC_STORE_PD_ENDPOINTS") {
            config.pd_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(database) = lookup("DOC_STORE_DATABASE") {
            config.database = database;
        }
        if let Some(min) = lookup("DOC_STORE_MIN_POOL") {
            config.min_pool_size = parse_number("DOC_STORE_MIN_POOL", &min)?;
        }
        if let Some(max) = lookup("DOC_STORE_MAX_POOL") {
            config.max_pool_size = parse_number("DOC_STORE_MAX_POOL", &max)?;
        }
        if let Some(timeout) = lookup("DOC_STORE_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("DOC_STORE_TIMEOUT_SECS", &timeout)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_pool_size == 0 {
            return Err(Error::Config("max_pool_size must be positive".to_string()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::Config(format!(
                "min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database must not be empty".to_string()));
        }
        if self.backend == Backend::Tikv && self.pd_endpoints.is_empty() {
            return Err(Error::Config("tikv backend needs pd_endpoints".to_string()));
        }
        Ok(())
    }
}

fn parse_number<N: FromStr>(name: &str, raw: &str) -> Result<N, Error> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a number, got `{raw}`")))
}
