//! Target address parsing
//!
//! CONNECT targets and Host headers come as `host`, `host:port`, `[v6]` or
//! `[v6]:port`; a missing port falls back to a caller supplied default.

use anyhow::anyhow;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(authority: &str, default_port: u16) -> anyhow::Result<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(anyhow!("Empty host"));
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("Unterminated IPv6 literal: {}", authority))?;
            let port = match tail {
                "" => default_port,
                _ => parse_port(
                    tail.strip_prefix(':')
                        .ok_or_else(|| anyhow!("Invalid authority: {}", authority))?,
                )?,
            };
            return Ok(Self::new(host, port));
        }

        match authority.rsplit_once(':') {
            // Bare IPv6 without brackets has several colons and no port.
            Some((host, _)) if host.contains(':') => Ok(Self::new(authority, default_port)),
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port)?)),
            Some(_) => Err(anyhow!("Empty host in {}", authority)),
            None => Ok(Self::new(authority, default_port)),
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn to_connect_addr(&self) -> String {
        self.to_string()
    }
}

fn parse_port(port: &str) -> anyhow::Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(anyhow!("Invalid port: {}", port)),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
