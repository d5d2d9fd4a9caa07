use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Server settings, read from `AVAILD_*` environment variables.
/// Values that fail to parse fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "availd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or(lookup("AVAILD_PORT"), defaults.port),
            bind: lookup("AVAILD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("AVAILD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("AVAILD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(lookup("AVAILD_MAX_CONNECTIONS"), defaults.max_connections)
                .max(1),
            compact_threshold: parse_or(
                lookup("AVAILD_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            ),
            metrics_port: lookup("AVAILD_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("AVAILD_TLS_CERT"),
            tls_key: lookup("AVAILD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS acceptor from `AVAILD_TLS_CERT` / `AVAILD_TLS_KEY`, or `None` when
    /// neither is set. Setting only one of them is an error naming the other.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(cert), Some(key)) => (cert, key),
            (Some(_), None) => return Err(missing_pair("AVAILD_TLS_CERT", "AVAILD_TLS_KEY")),
            (None, Some(_)) => return Err(missing_pair("AVAILD_TLS_KEY", "AVAILD_TLS_CERT")),
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut open_pem("AVAILD_TLS_CERT", cert_path)?)
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("AVAILD_TLS_CERT: no certificates in {cert_path}"),
            ));
        }
        let key = rustls_pemfile::private_key(&mut open_pem("AVAILD_TLS_KEY", key_path)?)?
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("AVAILD_TLS_KEY: no private key in {key_path}"),
                )
            })?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];
        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

fn missing_pair(set: &str, unset: &str) -> io::Error {
    io::Error::new(
        ErrorKind::InvalidInput,
        format!("{set} is set but {unset} is not; set both to enable TLS, or neither"),
    )
}

fn open_pem(var: &str, path: &str) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{var}: cannot open {path}: {e}")))
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
