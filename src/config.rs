//! CLI configuration and argument parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CcupError;
use crate::prompt::Operator;
use crate::upload::TransferStrategy;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Files above this size need an explicit go-ahead before the run starts.
pub const LARGE_FILE_WARNING_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// CyberController HA pair rolling upgrade CLI tool.
///
/// Disables HA, upgrades the secondary and then the primary controller,
/// migrates the DefenseFlow configuration between them, fixes the secondary
/// router ID and re-establishes HA. Progress is checkpointed so an
/// interrupted run can be resumed.
#[derive(Parser, Debug, Clone)]
#[command(name = "ccup")]
#[command(about = "CyberController HA pair rolling upgrade CLI tool")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Primary CyberController address (host or host:port)
    #[arg(long, env = "CCUP_PRIMARY_ADDRESS")]
    pub primary: Option<String>,

    /// Primary username
    #[arg(long, env = "CCUP_PRIMARY_USER")]
    pub primary_user: Option<String>,

    /// Primary password
    #[arg(long, env = "CCUP_PRIMARY_PASSWORD", hide_env_values = true)]
    pub primary_password: Option<String>,

    /// Secondary CyberController address (host or host:port)
    #[arg(long, env = "CCUP_SECONDARY_ADDRESS")]
    pub secondary: Option<String>,

    /// Secondary username
    #[arg(long, env = "CCUP_SECONDARY_USER")]
    pub secondary_user: Option<String>,

    /// Secondary password
    #[arg(long, env = "CCUP_SECONDARY_PASSWORD", hide_env_values = true)]
    pub secondary_password: Option<String>,

    /// Upgrade image path (.tar.gz)
    #[arg(short = 'f', long, env = "CCUP_UPGRADE_FILE")]
    pub upgrade_file: Option<PathBuf>,

    /// Directory holding checkpoint.json and exported configuration files
    #[arg(long, default_value = ".", env = "CCUP_WORK_DIR")]
    pub work_dir: PathBuf,

    /// Upload strategy (default: buffered for small files, streamed otherwise)
    #[arg(long, value_enum)]
    pub upload_strategy: Option<TransferStrategy>,

    /// Verify appliance TLS certificates (self-signed certificates are accepted by default)
    #[arg(long, default_value = "false")]
    pub verify_tls: bool,

    /// Timeout in seconds for regular API requests
    #[arg(long, default_value = "60")]
    pub request_timeout: u64,

    /// Timeout in seconds for a single software upload attempt
    #[arg(long, default_value = "10800")]
    pub upload_timeout: u64,

    /// Pause in seconds before importing configuration or uploading to a freshly authenticated node
    #[arg(long, default_value = "5")]
    pub settle_delay: u64,

    /// Validate prerequisites (file, credentials, license) and exit
    #[arg(long, default_value = "false")]
    pub preflight: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short, long, default_value = "false")]
    pub yes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CCUP_LOG_LEVEL")]
    pub log_level: String,
}

/// Role of a controller within the HA pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Secondary,
}

impl NodeRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login credentials for one controller. The password never reaches logs.
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// One controller of the HA pair.
#[derive(Debug)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub address: String,
    pub credentials: Credentials,
}

impl NodeConfig {
    /// Management API base URL. Addresses without a scheme use HTTPS.
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.contains("://") {
            address.to_string()
        } else {
            format!("https://{}", address)
        }
    }
}

impl fmt::Display for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.role, self.address)
    }
}

/// Application configuration derived from CLI args and operator input.
#[derive(Debug)]
pub struct Config {
    pub primary: NodeConfig,
    pub secondary: NodeConfig,
    pub upgrade_file: PathBuf,
    pub file_size: u64,
    pub work_dir: PathBuf,
    pub upload_strategy: Option<TransferStrategy>,
    pub verify_tls: bool,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    pub settle_delay: Duration,
    pub preflight: bool,
}

impl Config {
    /// Build the config, asking the operator for anything not given on the command line.
    pub fn resolve(args: Args, operator: &dyn Operator) -> Result<Self> {
        let primary = resolve_node(
            NodeRole::Primary,
            args.primary,
            args.primary_user,
            args.primary_password,
            operator,
        )?;
        let secondary = resolve_node(
            NodeRole::Secondary,
            args.secondary,
            args.secondary_user,
            args.secondary_password,
            operator,
        )?;

        let upgrade_file = match args.upgrade_file {
            Some(path) => path,
            None => PathBuf::from(operator.input("Upgrade file path (.tar.gz)")?),
        };
        let file_size = upgrade_file_size(&upgrade_file)?;

        let config = Self {
            primary,
            secondary,
            upgrade_file,
            file_size,
            work_dir: args.work_dir,
            upload_strategy: args.upload_strategy,
            verify_tls: args.verify_tls,
            request_timeout: Duration::from_secs(args.request_timeout),
            upload_timeout: Duration::from_secs(args.upload_timeout),
            settle_delay: Duration::from_secs(args.settle_delay),
            preflight: args.preflight,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check field-level constraints.
    pub fn validate(&self) -> Result<()> {
        for node in [&self.primary, &self.secondary] {
            if node.address.is_empty() || node.address.chars().any(char::is_whitespace) {
                return Err(CcupError::InvalidConfig(format!(
                    "{} address '{}' is not a valid host",
                    node.role, node.address
                ))
                .into());
            }
            if node.credentials.username.is_empty() {
                return Err(CcupError::InvalidConfig(format!("{} username is empty", node.role)).into());
            }
        }

        if self.primary.address == self.secondary.address {
            return Err(CcupError::InvalidConfig(
                "primary and secondary addresses must differ".to_string(),
            )
            .into());
        }

        if self.file_size == 0 {
            return Err(CcupError::InvalidConfig(format!(
                "upgrade file {} is empty",
                self.upgrade_file.display()
            ))
            .into());
        }

        if self.request_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(CcupError::InvalidConfig("timeouts must be greater than zero".to_string()).into());
        }

        Ok(())
    }

    pub fn node(&self, role: NodeRole) -> &NodeConfig {
        match role {
            NodeRole::Primary => &self.primary,
            NodeRole::Secondary => &self.secondary,
        }
    }

    pub fn is_large_file(&self) -> bool {
        self.file_size > LARGE_FILE_WARNING_BYTES
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.work_dir
    }
}

fn resolve_node(
    role: NodeRole,
    address: Option<String>,
    username: Option<String>,
    password: Option<String>,
    operator: &dyn Operator,
) -> Result<NodeConfig> {
    let label = match role {
        NodeRole::Primary => "Primary",
        NodeRole::Secondary => "Secondary",
    };

    let address = match address {
        Some(a) => a,
        None => operator.input(&format!("{} CyberController address", label))?,
    };
    let username = match username {
        Some(u) => u,
        None => operator.input(&format!("{} username", label))?,
    };
    let password = match password {
        Some(p) => p,
        None => operator.password(&format!("{} password", label))?,
    };

    Ok(NodeConfig {
        role,
        address: address.trim().to_string(),
        credentials: Credentials::new(username.trim(), password),
    })
}

/// Size of the upgrade image; a missing file is reported as such.
pub fn upgrade_file_size(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(CcupError::InvalidConfig(format!("{} is not a regular file", path.display())).into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CcupError::FileNotFound(path.to_path_buf()).into())
        }
        Err(e) => Err(CcupError::LocalIo(format!("{}: {}", path.display(), e)).into()),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Config pointing both nodes at the given base URLs.
    pub fn config_for(primary: &str, secondary: &str, upgrade_file: &Path, file_size: u64) -> Config {
        Config {
            primary: NodeConfig {
                role: NodeRole::Primary,
                address: primary.to_string(),
                credentials: Credentials::new("admin", "primary-secret"),
            },
            secondary: NodeConfig {
                role: NodeRole::Secondary,
                address: secondary.to_string(),
                credentials: Credentials::new("admin", "secondary-secret"),
            },
            upgrade_file: upgrade_file.to_path_buf(),
            file_size,
            work_dir: upgrade_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            upload_strategy: None,
            verify_tls: false,
            request_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(600),
            settle_delay: Duration::ZERO,
            preflight: false,
        }
    }
}
