//! # Cadence
//!
//! Gapless command line player. Plays the files given on the command line in
//! order and takes single-letter commands on stdin.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cadence_audio::output::{default_device_name, list_output_devices};
use cadence_audio::{
    CpalOutputManager, EngineConfig, EngineEvent, PlaybackEngine, PlaybackState,
    SymphoniaDecoderManager, ThreadPool,
};
use cadence_core::{Playlist, Track};
use crossbeam_channel::{select, unbounded, Receiver};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming a JSON engine config file.
const CONFIG_ENV: &str = "CADENCE_CONFIG";

const SEEK_STEP: Duration = Duration::from_secs(10);

const USAGE: &str = "usage: cadence [--device NAME] [--list-devices] FILE...";

const HELP: &str = "p play/pause | n next | b back | f/r seek +/-10s | s stop | q quit";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    device: Option<String>,
    list_devices: bool,
    files: Vec<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--device" | "-d" => {
                    let Some(name) = args.next() else {
                        bail!("--device needs a device name\n{USAGE}");
                    };
                    parsed.device = Some(name);
                }
                "--list-devices" | "-l" => parsed.list_devices = true,
                "--help" | "-h" => bail!("{USAGE}\n{HELP}"),
                flag if flag.starts_with('-') => bail!("unknown option '{flag}'\n{USAGE}"),
                _ => parsed.files.push(PathBuf::from(arg)),
            }
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Toggle,
    Next,
    Back,
    Forward,
    Rewind,
    Stop,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "p" => Some(Self::Toggle),
            "n" => Some(Self::Next),
            "b" => Some(Self::Back),
            "f" => Some(Self::Forward),
            "r" => Some(Self::Rewind),
            "s" => Some(Self::Stop),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_audio=debug".into()),
        )
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    if args.list_devices {
        let default = default_device_name();
        for name in list_output_devices()? {
            let marker = if default.as_deref() == Some(name.as_str()) {
                '*'
            } else {
                ' '
            };
            println!("{marker} {name}");
        }
        return Ok(());
    }
    if args.files.is_empty() {
        bail!("{USAGE}");
    }

    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let executor = ThreadPool::new(config.worker_threads)?;
    let outputs = match args.device {
        Some(name) => CpalOutputManager::with_device(name),
        None => CpalOutputManager::new(),
    };

    let engine = PlaybackEngine::new(
        Arc::new(SymphoniaDecoderManager),
        Arc::new(outputs),
        Arc::new(executor),
        config,
    );
    engine.set_playlist(Playlist::from_tracks(
        args.files.into_iter().map(Track::new).collect(),
    ));

    let commands = spawn_command_reader()?;
    println!("{HELP}");
    engine.play();
    run(&engine, &commands);

    engine.shutdown();
    Ok(())
}

/// Engine config from the file named by `CADENCE_CONFIG`, or the defaults.
fn load_config() -> Result<EngineConfig> {
    let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) else {
        return Ok(EngineConfig::default());
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config = EngineConfig::from_json(&json)
        .with_context(|| format!("loading config file {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn spawn_command_reader() -> Result<Receiver<Command>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("cadence-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match Command::parse(&line) {
                    Some(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => println!("{HELP}"),
                }
            }
        })
        .context("spawning stdin reader")?;
    Ok(rx)
}

/// Handle events and commands until the playlist ends or the user quits.
fn run(engine: &PlaybackEngine, commands: &Receiver<Command>) {
    let events = engine.events();
    let mut finished = false;

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { return };
                match event {
                    EngineEvent::PlaylistFinished => finished = true,
                    EngineEvent::StateChanged(PlaybackState::Stopped) if finished => {
                        info!("Playlist finished");
                        return;
                    }
                    EngineEvent::TrackChanged(Some(_)) => finished = false,
                    _ => {}
                }
                report(engine, &event);
            },
            recv(commands) -> command => match command {
                Ok(Command::Quit) | Err(_) => return,
                Ok(command) => apply(engine, command),
            },
        }
    }
}

fn report(engine: &PlaybackEngine, event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged(PlaybackState::Error) => {
            warn!("Playback failed; 'p' retries");
        }
        EngineEvent::StateChanged(state) => info!("{state}"),
        EngineEvent::TrackChanged(Some(index)) => {
            let playlist = engine.playlist();
            if let Some(track) = playlist.get(*index) {
                info!(
                    "Track {}/{}: {}",
                    index + 1,
                    playlist.len(),
                    track.display_name()
                );
            }
        }
        EngineEvent::PlayPosition { position, duration } => {
            debug!("{:.1}s / {:.1}s", position.as_secs_f64(), duration.as_secs_f64());
        }
        EngineEvent::TrackChanged(None) | EngineEvent::PlaylistFinished => {}
    }
}

fn apply(engine: &PlaybackEngine, command: Command) {
    match command {
        Command::Toggle => {
            if engine.state() == PlaybackState::Playing {
                engine.pause();
            } else {
                engine.play();
            }
        }
        Command::Next => engine.next(),
        Command::Back => engine.previous(),
        Command::Forward => engine.seek(engine.tell() + SEEK_STEP),
        Command::Rewind => engine.seek(engine.tell().saturating_sub(SEEK_STEP)),
        Command::Stop => engine.stop(),
        Command::Quit => {}
    }
}
