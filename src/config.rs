//! Connection configuration.

use std::env;
use thiserror::Error as ThisError;

use crate::DEFAULT_PORT;

/// Largest partial reply kept in memory before the connection gives up on the peer.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("{var} must be {expected}, got {value:?}")]
    InvalidVar {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Treat malformed reply lines as fatal instead of skipping them.
    pub strict_decoding: bool,
    /// Upper bound on bytes buffered for a single unfinished reply.
    pub max_buffer_size: usize,
    /// Disable Nagle's algorithm on the socket.
    pub nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            strict_decoding: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            nodelay: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `REDLINE_HOST`, `REDLINE_PORT`, `REDLINE_STRICT` and
    /// `MAX_FRAME_SIZE` when they are set.
    pub fn from_env() -> Result<Config, Error> {
        Config::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
        let mut config = Config::default();

        if let Some(host) = lookup("REDLINE_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("REDLINE_PORT") {
            config.port = parse_var("REDLINE_PORT", "a port number", port)?;
        }
        if let Some(strict) = lookup("REDLINE_STRICT") {
            config.strict_decoding = parse_var("REDLINE_STRICT", "true or false", strict)?;
        }
        if let Some(size) = lookup("MAX_FRAME_SIZE") {
            config.max_buffer_size = parse_var("MAX_FRAME_SIZE", "a number", size)?;
        }

        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    expected: &'static str,
    value: String,
) -> Result<T, Error> {
    value.trim().parse().map_err(|_| Error::InvalidVar {
        var,
        expected,
        value,
    })
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn strict_decoding(mut self, strict: bool) -> Self {
        self.config.strict_decoding = strict;
        self
    }

    pub fn max_buffer_size(mut self, max: usize) -> Self {
        self.config.max_buffer_size = max;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
