// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::net::addr::SocketAddr;

/// Top-level process configuration: how many loops to run, what to listen
/// on, and the RPC-layer limits.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppConfig {
    pub reactor: ReactorConfig,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub listen: Option<ListenConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Loop-group sizing.
pub struct ReactorConfig {
    /// Size of the base loop group. The application façade always runs this
    /// group's single loop on the calling thread, so this is normalized to
    /// `1` if the file disagrees.
    #[serde(default = "default_base_group_size")]
    pub base_group_size: usize,
    /// Size of the optional worker loop group accepted connections are
    /// dispatched to. `0` means "no worker group" — accepted connections
    /// stay on the base loop.
    #[serde(default)]
    pub worker_group_size: usize,
}

fn default_base_group_size() -> usize {
    1
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Connection-level and wire-level limits shared by `ClientChannel`s and
/// `ServiceStub`s.
pub struct RpcConfig {
    #[serde(rename = "ConnectTimeoutMillis", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Largest frame `frame::decode` accepts before it treats the stream as
    /// corrupt (64 MiB default).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Outbound buffer high-water mark past which a connection is closed
    /// rather than left to grow unbounded.
    #[serde(default = "default_max_outbound_buffered_bytes")]
    pub max_outbound_buffered_bytes: usize,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024 * 1024
}

fn default_max_outbound_buffered_bytes() -> usize {
    16 * 1024 * 1024
}

impl RpcConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Where the sample server binds, used by `demos::echo_server`.
pub struct ListenConfig {
    pub addr: String,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        SocketAddr::parse(&self.addr)
    }
}

impl AppConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: AppConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.reactor.base_group_size != 1 {
            self.reactor.base_group_size = 1;
        }
        ensure!(
            self.rpc.connect_timeout_ms >= 1,
            "rpc.ConnectTimeoutMillis must be >= 1"
        );
        ensure!(
            self.rpc.max_frame_bytes >= 16,
            "rpc.max_frame_bytes must be large enough to hold a frame header"
        );
        if let Some(listen) = &self.listen {
            listen
                .socket_addr()
                .context("listen.addr is not a valid address")?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reactor: ReactorConfig {
                base_group_size: default_base_group_size(),
                worker_group_size: 0,
            },
            rpc: RpcConfig {
                connect_timeout_ms: default_connect_timeout_ms(),
                max_frame_bytes: default_max_frame_bytes(),
                max_outbound_buffered_bytes: default_max_outbound_buffered_bytes(),
            },
            listen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate_and_normalize().is_ok());
    }

    #[test]
    fn base_group_size_is_normalized_to_one() {
        let mut cfg = AppConfig::default();
        cfg.reactor.base_group_size = 4;
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.reactor.base_group_size, 1);
    }

    #[test]
    fn rejects_invalid_listen_address() {
        let mut cfg = AppConfig::default();
        cfg.listen = Some(ListenConfig {
            addr: "not-an-address".to_string(),
        });
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn parses_from_yaml() {
        let yaml = r#"
reactor:
  base_group_size: 1
  worker_group_size: 2
rpc:
  ConnectTimeoutMillis: 3000
listen:
  addr: "127.0.0.1:8765"
"#;
        let mut cfg: AppConfig = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.reactor.worker_group_size, 2);
        assert_eq!(cfg.rpc.max_frame_bytes, default_max_frame_bytes());
    }
}
