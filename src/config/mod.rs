//! Configuration module
//!
//! This module handles server configuration, including loading from
//! different sources (defaults, JSON files, environment variables, command
//! line arguments) and validating the result.
//!
//! # Priority
//!
//! 1. Default values (lowest)
//! 2. Configuration file
//! 3. Environment variables (`MUX_GATE_*`)
//! 4. Command line arguments (highest)

mod builder;
mod defaults;
mod error;
mod source;
mod types;
mod validator;

pub use builder::ConfigBuilder;
pub use defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX, MAX_BODY_SIZE};
pub use error::ConfigError;
pub use source::{CliSource, ConfigSource, DefaultSource, EnvSource, FileSource};
pub use types::{
    parse_protocol_list, parse_socket_addr, ConfigValues, ConnectionOptions, ServerConfig,
    ValueSource,
};
pub use validator::{check_warnings, validate_config};

/// Load configuration with the standard source priority
///
/// # Parameters
///
/// * `config_file` - Configuration file, `config.json` when not given
/// * `cli` - Values given on the command line
pub fn load(config_file: Option<&std::path::Path>, cli: ConfigValues) -> crate::common::Result<ServerConfig> {
    let path = config_file.unwrap_or_else(|| std::path::Path::new(DEFAULT_CONFIG_FILE));

    let config = ConfigBuilder::new()
        .with_defaults()
        .with_file(path)
        .with_env(ENV_PREFIX)
        .with_cli(cli)
        .build()?;

    Ok(config)
}
