use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::LockPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both STAYLOCK_TLS_CERT and STAYLOCK_TLS_KEY must be set, or neither")]
    TlsPair,
}

/// Certificate and key files for the pgwire TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `STAYLOCK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Room catalog JSON. Without one the server starts with no rooms.
    pub catalog: Option<PathBuf>,
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub sweep_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables
    /// take their defaults; set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let tls = match (get("STAYLOCK_TLS_CERT"), get("STAYLOCK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        Ok(Self {
            port: parse_or(&get, "STAYLOCK_PORT", 5433)?,
            bind: get("STAYLOCK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("STAYLOCK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("STAYLOCK_PASSWORD").unwrap_or_else(|| "staylock".into()),
            max_connections: nonzero_or(&get, "STAYLOCK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "STAYLOCK_COMPACT_THRESHOLD", 1000)?,
            catalog: get("STAYLOCK_CATALOG").map(PathBuf::from),
            lock_timeout: Duration::from_millis(nonzero_or(&get, "STAYLOCK_LOCK_TIMEOUT_MS", 2000)?),
            max_retries: parse_or(&get, "STAYLOCK_MAX_RETRIES", 5)?,
            sweep_interval: Duration::from_secs(nonzero_or(&get, "STAYLOCK_SWEEP_INTERVAL_SECS", 60)?),
            metrics_port: get("STAYLOCK_METRICS_PORT")
                .map(|v| parse_var("STAYLOCK_METRICS_PORT", v))
                .transpose()?,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staylock.wal")
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            lock_timeout: self.lock_timeout,
            max_attempts: self.max_retries.max(1),
            ..LockPolicy::default()
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(value) => parse_var(var, value),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is refused: these values size intervals,
/// timeouts and the connection pool.
fn nonzero_or<T: std::str::FromStr + Default + PartialEq>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse_or(get, var, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: get(var).unwrap_or_default(),
        });
    }
    Ok(value)
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.password, "staylock");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.lock_timeout, Duration::from_secs(2));
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.sweep_interval, Duration::from_secs(60));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.catalog, None);
        assert_eq!(c.tls, None);
        assert_eq!(c.wal_path(), PathBuf::from("./data/staylock.wal"));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("STAYLOCK_PORT", "6000"),
            ("STAYLOCK_BIND", "127.0.0.1"),
            ("STAYLOCK_DATA_DIR", "/var/lib/staylock"),
            ("STAYLOCK_CATALOG", "/etc/staylock/rooms.json"),
            ("STAYLOCK_LOCK_TIMEOUT_MS", "250"),
            ("STAYLOCK_MAX_RETRIES", "0"),
            ("STAYLOCK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/staylock/staylock.wal"));
        assert_eq!(c.catalog, Some(PathBuf::from("/etc/staylock/rooms.json")));
        assert_eq!(c.metrics_port, Some(9100));

        let policy = c.lock_policy();
        assert_eq!(policy.lock_timeout, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn empty_value_means_default() {
        let c = config(&[("STAYLOCK_PORT", "  ")]).unwrap();
        assert_eq!(c.port, 5433);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = config(&[("STAYLOCK_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "STAYLOCK_MAX_CONNECTIONS",
                value: "lots".into()
            }
        );
    }

    #[test]
    fn zero_intervals_are_refused() {
        for var in [
            "STAYLOCK_SWEEP_INTERVAL_SECS",
            "STAYLOCK_LOCK_TIMEOUT_MS",
            "STAYLOCK_MAX_CONNECTIONS",
        ] {
            assert_eq!(
                config(&[(var, "0")]).unwrap_err(),
                ConfigError::Invalid { var, value: "0".into() }
            );
        }
        let c = config(&[("STAYLOCK_SWEEP_INTERVAL_SECS", "5")]).unwrap();
        assert_eq!(c.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            config(&[("STAYLOCK_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::TlsPair
        );
        let c = config(&[("STAYLOCK_TLS_CERT", "cert.pem"), ("STAYLOCK_TLS_KEY", "key.pem")]).unwrap();
        assert_eq!(
            c.tls,
            Some(TlsPaths {
                cert: "cert.pem".into(),
                key: "key.pem".into()
            })
        );
    }
}
