//! Command-line surface shared by the three role binaries.

use std::path::PathBuf;

use clap::Parser;

/// Process exit codes: 0 clean shutdown, 1 config error, 2 unrecoverable
/// runtime error.
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct RoleArgs {
    /// Configuration file.
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config: PathBuf,

    /// Debug logging.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Dummy mode: no hardware, synthetic sensor data.
    #[arg(short = 'd', long = "dummy")]
    pub dummy: bool,

    /// Override the role's primary port (publisher port for the controller,
    /// web port for the actuator and web UI).
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,
}

impl RoleArgs {
    /// Dummy mode from the flag or the `DUMMY_MODE` environment variable.
    pub fn dummy_mode(&self) -> bool {
        self.dummy || std::env::var("DUMMY_MODE").map(|v| v == "true").unwrap_or(false)
    }
}

/// Structured logging with an env-filter; `-D` lowers the default to debug,
/// `RUST_LOG` still wins when set.
pub fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_flags() {
        let args =
            RoleArgs::parse_from(["role", "-c", "config.toml", "-D", "-d", "-p", "9999"]);
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert!(args.debug);
        assert!(args.dummy);
        assert_eq!(args.port, Some(9999));
    }

    #[test]
    fn config_is_required() {
        assert!(RoleArgs::try_parse_from(["role"]).is_err());
    }

    #[test]
    fn defaults_are_off() {
        let args = RoleArgs::parse_from(["role", "-c", "x.toml"]);
        assert!(!args.debug);
        assert!(!args.dummy);
        assert_eq!(args.port, None);
    }
}
