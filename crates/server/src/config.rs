//! Command line and runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::dispatch::TOOL_CALL_TIMEOUT;

pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 20;
pub const DEFAULT_MAX_TURN_STEPS: usize = 25;

#[derive(Parser, Debug)]
#[command(
    name = "toolrelay-server",
    version,
    about = "Routes tool calls between a browser chat and the user's local agent"
)]
pub struct Cli {
    /// Data directory for keys and logs
    #[arg(long, global = true, env = "TOOLRELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server
    Start(StartArgs),

    /// Print a signed gateway token for a user
    GenerateToken {
        /// User id the token authenticates as
        #[arg(long)]
        user: String,

        /// Issue a token for the local agent socket
        #[arg(long)]
        agent: bool,

        #[arg(long, default_value_t = 24 * 30)]
        ttl_hours: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    #[arg(long, env = "TOOLRELAY_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// JWKS endpoint for third-party JWTs
    #[arg(long, env = "TOOLRELAY_JWKS_URL")]
    pub jwks_url: Option<String>,

    #[arg(long, env = "TOOLRELAY_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    #[arg(long, env = "TOOLRELAY_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    /// Agent-proxy turns per user per minute
    #[arg(long, env = "TOOLRELAY_RATE_LIMIT_PER_MINUTE", default_value_t = DEFAULT_RATE_LIMIT_PER_MINUTE)]
    pub rate_limit_per_minute: u32,

    #[arg(long, env = "TOOLRELAY_TOOL_TIMEOUT_SECS", default_value_t = TOOL_CALL_TIMEOUT.as_secs())]
    pub tool_timeout_secs: u64,

    /// Upper bound on model steps in one agent-proxy turn
    #[arg(long, env = "TOOLRELAY_MAX_TURN_STEPS", default_value_t = DEFAULT_MAX_TURN_STEPS)]
    pub max_turn_steps: usize,
}

/// Settings handlers read at request time.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tool_timeout: Duration,
    pub rate_limit_per_minute: u32,
    pub max_turn_steps: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tool_timeout: TOOL_CALL_TIMEOUT,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            max_turn_steps: DEFAULT_MAX_TURN_STEPS,
        }
    }
}

impl From<&StartArgs> for ServerConfig {
    fn from(args: &StartArgs) -> Self {
        Self {
            tool_timeout: Duration::from_secs(args.tool_timeout_secs.max(1)),
            rate_limit_per_minute: args.rate_limit_per_minute,
            max_turn_steps: args.max_turn_steps.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_defaults() {
        let cli = Cli::try_parse_from(["toolrelay-server", "start"]).unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        let config = ServerConfig::from(&args);
        assert_eq!(config.tool_timeout, Duration::from_secs(60));
        assert_eq!(config.rate_limit_per_minute, 20);
        assert_eq!(args.bind, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn generate_token_args() {
        let cli = Cli::try_parse_from([
            "toolrelay-server",
            "--data-dir",
            "/tmp/tr",
            "generate-token",
            "--user",
            "u1",
            "--agent",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/tr")));
        match cli.command {
            Command::GenerateToken {
                user,
                agent,
                ttl_hours,
            } => {
                assert_eq!(user, "u1");
                assert!(agent);
                assert_eq!(ttl_hours, 720);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
