use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::session::SessionConfig;
use crate::telemetry::{LogConfig, LogLevel};
use crate::transport::{TransportError, normalize_relay_url};

pub const DEFAULT_RELAY: &str = "127.0.0.1:8787";

#[derive(Parser, Debug)]
#[command(name = "tidepool", version, about = "LAN peer discovery and chat over WebRTC")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a room through a relay and chat from stdin.
    Join(JoinArgs),
    /// Run two in-process peers against each other and exit.
    Demo(DemoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    #[arg(long, env = "TIDEPOOL_ROOM")]
    pub room: String,

    #[arg(long, env = "TIDEPOOL_NAME")]
    pub name: String,

    #[arg(long, env = "TIDEPOOL_RELAY_URL", default_value = DEFAULT_RELAY)]
    pub relay: String,

    #[arg(long)]
    pub no_camera: bool,

    #[arg(long)]
    pub no_microphone: bool,

    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub poll_ms: u64,

    #[arg(long = "stun", value_name = "URL")]
    pub stun_servers: Vec<String>,
}

impl JoinArgs {
    pub fn relay_url(&self) -> Result<Url, TransportError> {
        normalize_relay_url(&self.relay)
    }

    pub fn session_config(&self) -> SessionConfig {
        let config =
            SessionConfig::default().with_poll_interval(Duration::from_millis(self.poll_ms.max(10)));
        if self.stun_servers.is_empty() {
            config
        } else {
            config.with_ice_servers(self.stun_servers.clone())
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[arg(long, default_value = "demo")]
    pub room: String,

    #[arg(long, default_value = "hello from the other side")]
    pub message: String,

    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn join_reads_flags() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let cli = Cli::try_parse_from([
            "tidepool",
            "join",
            "--room",
            "lobby",
            "--name",
            "alice",
            "--relay",
            "10.0.0.5:8787",
            "--no-camera",
        ])
        .expect("parse");
        let Command::Join(args) = cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.room, "lobby");
        assert!(args.no_camera);
        assert!(!args.no_microphone);
        assert_eq!(args.relay_url().expect("url").as_str(), "http://10.0.0.5:8787/");
        assert_eq!(args.session_config().poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn join_falls_back_to_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("TIDEPOOL_ROOM", "kitchen");
            std::env::set_var("TIDEPOOL_NAME", "bob");
        }
        let parsed = Cli::try_parse_from(["tidepool", "join"]);
        unsafe {
            std::env::remove_var("TIDEPOOL_ROOM");
            std::env::remove_var("TIDEPOOL_NAME");
        }
        let Command::Join(args) = parsed.expect("parse").command else {
            panic!("expected join");
        };
        assert_eq!(args.room, "kitchen");
        assert_eq!(args.name, "bob");
    }

    #[test]
    fn custom_stun_servers_replace_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let cli = Cli::try_parse_from([
            "tidepool", "join", "--room", "r", "--name", "n", "--stun", "stun:lan:3478",
        ])
        .expect("parse");
        let Command::Join(args) = cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.session_config().ice_servers, vec!["stun:lan:3478".to_string()]);
    }
}
