mod demo;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use huddle_client_core::config::{Config, DEFAULT_DIAL_DELAY};
use huddle_client_core::error::RoomError;
use huddle_client_core::ids::{IdError, RoomId};
use huddle_client_core::orchestrator::DialPolicy;
use huddle_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use thiserror::Error;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    if let Some(url) = &cli.share_base_url {
        config.share_base_url = url.clone();
    }

    match cli.command {
        Command::NewRoom => {
            let room = RoomId::generate();
            println!("room:  {room}");
            println!("share: {}", config.share_link(&room));
            Ok(())
        }
        Command::Demo(args) => {
            if let Some(url) = &args.signaling_url {
                config.signaling_url = url.clone();
            }
            if let Some(policy) = args.dial_policy {
                config.dial_policy = policy.into_policy(args.dial_delay_ms);
            }
            config.validate().map_err(RoomError::from)?;
            let room = match &args.room {
                Some(raw) => RoomId::new(raw)?,
                None => RoomId::generate(),
            };
            let options = demo::DemoOptions {
                room,
                participants: args.participants,
                websocket: args.signaling_url.is_some(),
                hold: std::time::Duration::from_millis(args.hold_ms),
            };
            demo::run(config, options).await?;
            Ok(())
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "huddle",
    about = "Multi-party video room client core",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "HUDDLE_SHARE_BASE_URL",
        help = "Base URL used for share links"
    )]
    share_base_url: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "HUDDLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "HUDDLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh room id and its share link
    NewRoom,
    /// Run a simulated room with in-process participants
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, value_name = "ROOM", help = "Room to join (generated when omitted)")]
    room: Option<String>,

    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(2..=16))]
    participants: u16,

    #[arg(
        long,
        value_name = "URL",
        help = "Use a websocket signaling server instead of the in-process hub"
    )]
    signaling_url: Option<String>,

    #[arg(long, value_enum, help = "When existing participants call newcomers")]
    dial_policy: Option<DialPolicyArg>,

    #[arg(long, default_value_t = DEFAULT_DIAL_DELAY.as_millis() as u64)]
    dial_delay_ms: u64,

    #[arg(long, default_value_t = 200, help = "Pause between scripted steps")]
    hold_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DialPolicyArg {
    Ready,
    Delay,
}

impl DialPolicyArg {
    fn into_policy(self, delay_ms: u64) -> DialPolicy {
        match self {
            DialPolicyArg::Ready => DialPolicy::ReadyHandshake,
            DialPolicyArg::Delay => DialPolicy::FixedDelay(std::time::Duration::from_millis(delay_ms)),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Room(#[from] RoomError),
    #[error("invalid room id: {0}")]
    RoomId(#[from] IdError),
    #[error("demo failed: {0:#}")]
    Demo(#[from] anyhow::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}
