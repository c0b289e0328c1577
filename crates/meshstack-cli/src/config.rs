//! Configuration file for the meshstack CLI.

use meshstack_netstack::{NicId, StackConfig};
use meshstack_resolver::Nameserver;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// meshstack configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Stack configuration
    #[serde(default)]
    pub stack: StackSection,
    /// Resolver configuration
    #[serde(default)]
    pub resolver: ResolverSection,
    /// Self-test configuration
    #[serde(default)]
    pub selftest: SelftestSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Userspace stack settings
#[derive(Debug, Clone, Deserialize)]
pub struct StackSection {
    /// NIC identifier
    #[serde(default = "default_nic_id")]
    pub nic_id: u32,
    /// Let the stack answer traffic for its own address
    #[serde(default = "default_true")]
    pub handle_local: bool,
    /// TCP receive buffer per socket
    #[serde(default = "default_socket_buffer")]
    pub tcp_rx_buffer: usize,
    /// TCP send buffer per socket
    #[serde(default = "default_socket_buffer")]
    pub tcp_tx_buffer: usize,
    /// UDP payload buffer per socket and direction
    #[serde(default = "default_socket_buffer")]
    pub udp_buffer: usize,
    /// Pending connections per listener
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: usize,
}

/// Resolver settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResolverSection {
    /// Nameserver as `host` or `host:port`
    pub nameserver: Option<String>,
}

/// Loopback self-test settings
#[derive(Debug, Clone, Deserialize)]
pub struct SelftestSection {
    /// MTU of the loopback link
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Port the test listener binds
    #[serde(default = "default_selftest_port")]
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_nic_id() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_socket_buffer() -> usize {
    64 * 1024
}

fn default_listen_backlog() -> usize {
    8
}

fn default_mtu() -> usize {
    1500
}

fn default_selftest_port() -> u16 {
    9000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StackSection {
    fn default() -> Self {
        Self {
            nic_id: default_nic_id(),
            handle_local: true,
            tcp_rx_buffer: default_socket_buffer(),
            tcp_tx_buffer: default_socket_buffer(),
            udp_buffer: default_socket_buffer(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl Default for SelftestSection {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            port: default_selftest_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StackSection {
    /// Stack configuration built from this section
    #[must_use]
    pub fn to_stack_config(&self) -> StackConfig {
        StackConfig {
            nic_id: NicId(self.nic_id),
            handle_local: self.handle_local,
            tcp_rx_buffer: self.tcp_rx_buffer,
            tcp_tx_buffer: self.tcp_tx_buffer,
            udp_buffer: self.udp_buffer,
            listen_backlog: self.listen_backlog,
            ..StackConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("meshstack/config.toml")
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    ///
    /// An explicitly named file must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, size) in [
            ("tcp_rx_buffer", self.stack.tcp_rx_buffer),
            ("tcp_tx_buffer", self.stack.tcp_tx_buffer),
            ("udp_buffer", self.stack.udp_buffer),
        ] {
            if size == 0 || size > 16 * 1024 * 1024 {
                anyhow::bail!("{name} must be between 1 byte and 16MB, got {size}");
            }
        }

        if self.stack.listen_backlog == 0 {
            anyhow::bail!("listen_backlog must be at least 1");
        }

        if let Some(nameserver) = &self.resolver.nameserver {
            Nameserver::parse(nameserver)?;
        }

        if self.selftest.mtu < meshstack_netstack::packet::IPV6_MIN_MTU {
            anyhow::bail!(
                "selftest mtu {} is below the IPv6 minimum of {}",
                self.selftest.mtu,
                meshstack_netstack::packet::IPV6_MIN_MTU
            );
        }

        Ok(())
    }
}
