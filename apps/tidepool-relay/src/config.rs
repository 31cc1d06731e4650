use clap::builder::TypedValueParser;
use clap::Parser;

use tidepool_proto::DEFAULT_RETENTION;

pub const DEFAULT_PORT: u16 = 8787;

#[derive(Parser, Debug, Clone)]
#[command(name = "tidepool-relay")]
#[command(about = "Signaling relay for tidepool rooms")]
pub struct Config {
    #[arg(long, env = "TIDEPOOL_RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long, env = "TIDEPOOL_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Messages kept per room before the oldest are dropped.
    #[arg(
        long,
        env = "TIDEPOOL_RELAY_RETENTION",
        default_value_t = DEFAULT_RETENTION,
        value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize)
    )]
    pub retention: usize,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            retention: DEFAULT_RETENTION,
        }
    }
}
