use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tidepool_core::config::{Cli, Command, DemoArgs, JoinArgs};
use tidepool_core::media::StaticMediaDevices;
use tidepool_core::peer::loopback::LoopbackNetwork;
use tidepool_core::peer::rtc::RtcConnector;
use tidepool_core::proto::PeerId;
use tidepool_core::registry::PeerSnapshot;
use tidepool_core::session::{
    LocalIdentity, NetworkSession, SessionBackends, SessionConfig, SessionEvent,
};
use tidepool_core::telemetry;
use tidepool_core::transport::{HttpRelayBackend, MemoryRelay};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_config()).context("failed to initialise logging")?;

    match cli.command {
        Command::Join(args) => join(args).await,
        Command::Demo(args) => demo(args).await,
    }
}

async fn join(args: JoinArgs) -> Result<()> {
    let relay_url = args.relay_url()?;
    let config = args.session_config();
    let backends = SessionBackends {
        relay: Arc::new(HttpRelayBackend::new(relay_url.clone())?),
        connector: Arc::new(RtcConnector::new(config.ice_servers.clone())?),
        media: Arc::new(StaticMediaDevices::new(
            !args.no_camera,
            !args.no_microphone,
        )),
    };
    let identity = LocalIdentity::generate(args.name.clone());
    info!(target = "tidepool::cli", relay = %relay_url, room = %args.room, "starting");
    println!(
        "joined room '{}' as {} ({})",
        args.room,
        identity.name,
        identity.id.short()
    );

    let session = NetworkSession::start(args.room.clone(), identity, config, backends);
    let printer = tokio::spawn(print_events(session.subscribe(), session.subscribe_peers()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Chat(text) => report(session.send_chat(text).await),
            Input::File { name, size } => report(session.offer_file(name, size).await),
            Input::Video(enabled) => report(session.set_video_enabled(enabled).await),
            Input::Audio(enabled) => report(session.set_audio_enabled(enabled).await),
            Input::Invalid(reason) => eprintln!("{reason}"),
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

fn report<T, E: std::fmt::Display>(result: Result<T, E>) {
    if let Err(err) = result {
        eprintln!("error: {err}");
    }
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    mut peers: tokio::sync::broadcast::Receiver<PeerSnapshot>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(target = "tidepool::cli", skipped, "event output lagged"),
                Err(RecvError::Closed) => break,
            },
            snapshot = peers.recv() => match snapshot {
                Ok(snapshot) => print_peers(&snapshot),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::MediaReady(status) | SessionEvent::MediaChanged(status) => format!(
            "* media {:?}: video {}, audio {}",
            status.mode,
            on_off(status.video_enabled),
            on_off(status.audio_enabled)
        ),
        SessionEvent::Chat(message) => format!("<{}> {}", message.peer_name, message.content),
        SessionEvent::FileOffered(record) => format!(
            "* {} offers {} ({} bytes)",
            record.peer_name, record.name, record.size
        ),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

fn print_peers(snapshot: &PeerSnapshot) {
    if snapshot.is_empty() {
        println!("* no peers");
        return;
    }
    let listing: Vec<String> = snapshot
        .peers
        .iter()
        .map(|peer| format!("{} [{}]", peer.name, peer.state))
        .collect();
    println!("* peers: {}", listing.join(", "));
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    Chat(String),
    File { name: String, size: u64 },
    Video(bool),
    Audio(bool),
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Chat(line.to_string());
    };
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("quit"), None, None) => Input::Quit,
        (Some("mute"), None, None) => Input::Audio(false),
        (Some("unmute"), None, None) => Input::Audio(true),
        (Some("video"), Some("on"), None) => Input::Video(true),
        (Some("video"), Some("off"), None) => Input::Video(false),
        (Some("file"), Some(name), Some(size)) => match size.parse() {
            Ok(size) => Input::File {
                name: name.to_string(),
                size,
            },
            Err(_) => Input::Invalid(format!("invalid size '{size}'")),
        },
        _ => Input::Invalid(format!(
            "unknown command '/{command}'; try /file NAME SIZE, /video on|off, /mute, /unmute, /quit"
        )),
    }
}

async fn demo(args: DemoArgs) -> Result<()> {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let config = SessionConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_discovery_interval(Duration::from_millis(500));
    let spawn = |id: &str, name: &str| {
        let identity = LocalIdentity::new(PeerId::from(id), name);
        let backends = SessionBackends {
            relay: Arc::new(relay.clone()),
            connector: Arc::new(network.connector(identity.id.clone())),
            media: Arc::new(StaticMediaDevices::new(true, true)),
        };
        NetworkSession::start(args.room.clone(), identity, config.clone(), backends)
    };
    let alice = spawn("peer-100", "alice");
    let bob = spawn("peer-200", "bob");
    let mut bob_events = bob.subscribe();

    let deadline = Duration::from_secs(args.timeout_secs);
    let outcome = tokio::time::timeout(deadline, async {
        let mut updates = alice.subscribe_peers();
        while !alice.snapshot().peers.iter().any(|peer| peer.channel_open) {
            updates.recv().await.map_err(|err| anyhow!("peer updates ended: {err}"))?;
        }
        println!("alice and bob connected");
        alice.send_chat(args.message.clone()).await?;
        loop {
            match bob_events.recv().await {
                Ok(SessionEvent::Chat(message)) if message.peer_id == alice.identity().id => {
                    println!("bob received: {}", describe(&SessionEvent::Chat(message)));
                    return Ok::<_, anyhow::Error>(());
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(anyhow!("bob's session ended")),
            }
        }
    })
    .await;

    alice.close().await;
    bob.close().await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(anyhow!("demo timed out after {}s", args.timeout_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(parse_input("hi there"), Input::Chat("hi there".into()));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/mute"), Input::Audio(false));
        assert_eq!(parse_input("/video off"), Input::Video(false));
        assert_eq!(
            parse_input("/file notes.txt 42"),
            Input::File {
                name: "notes.txt".into(),
                size: 42
            }
        );
        assert!(matches!(parse_input("/file notes.txt big"), Input::Invalid(_)));
        assert!(matches!(parse_input("/dance"), Input::Invalid(_)));
    }
}
