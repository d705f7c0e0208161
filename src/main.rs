use beatbridge::params::{BRIDGE_INFO, PARAMETERS};
use beatbridge::{
    Bridge, BridgeConfig, ConfigWatcher, EventIngress, MidiEvent, MidiOutput, TimedEvent,
};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use midir::{Ignore, MidiInput, MidiOutputConnection};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const IDLE_INTERVAL: Duration = Duration::from_millis(20);

enum MidiSink {
    Port(MidiOutputConnection),
    Discard,
}

impl MidiOutput for MidiSink {
    fn send(&mut self, event: &TimedEvent) {
        if let MidiSink::Port(conn) = self {
            // Nothing useful can be done about a failed write on the MIDI thread.
            let _ = event.event.with_bytes(|bytes| conn.send(bytes));
        }
    }
}

enum Command {
    Quit,
    Reset,
    Status,
}

struct Args {
    config_path: Option<PathBuf>,
    input: Option<String>,
    output: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_path: None,
        input: None,
        output: None,
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--input" => args.input = Some(iter.next().ok_or("--input needs a port name")?),
            "--output" => args.output = Some(iter.next().ok_or("--output needs a port name")?),
            "-h" | "--help" => {
                return Err(format!(
                    "Usage: beatbridge [config.ron] [--input <port>] [--output <port>]\n{}",
                    BRIDGE_INFO.description
                ));
            }
            _ if args.config_path.is_none() => args.config_path = Some(PathBuf::from(arg)),
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }
    Ok(args)
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) if path.exists() => Ok(BridgeConfig::load(path)?),
        Some(path) => {
            let config = BridgeConfig::default();
            config.save(path)?;
            eprintln!("wrote default config to {}", path.display());
            Ok(config)
        }
        None => Ok(BridgeConfig::default()),
    }
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config = match load_config(args.config_path.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args, config) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args, config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("{} {}", BRIDGE_INFO.name, BRIDGE_INFO.version);
    for (index, param) in PARAMETERS.iter().enumerate() {
        info!(index, name = param.name, default = param.default, "parameter");
    }

    let bridge = Bridge::new(&config)?;
    let (ingress, mut idle) = bridge.into_parts();

    let _watcher = match &args.config_path {
        Some(path) => match ConfigWatcher::spawn(path.clone(), idle.transport_config().clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("config hot reload disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let sink = open_output(args.output.as_deref())?;
    let reset_requested = Arc::new(AtomicBool::new(false));
    let reset_midi = reset_requested.clone();

    let mut midi_in = MidiInput::new("beatbridge").map_err(|e| e.to_string())?;
    midi_in.ignore(Ignore::None);
    let ports = midi_in.ports();
    let port = ports
        .iter()
        .find(|p| match &args.input {
            Some(wanted) => midi_in.port_name(p).unwrap_or_default().contains(wanted.as_str()),
            None => true,
        })
        .ok_or("no matching MIDI input found")?;
    info!("listening on {}", midi_in.port_name(port).unwrap_or_default());

    let _input = midi_in
        .connect(
            port,
            "beatbridge-in",
            move |stamp, message, state: &mut (EventIngress, MidiSink)| {
                let (ingress, sink) = state;
                if reset_midi.swap(false, Ordering::Relaxed) {
                    ingress.reset();
                }
                let event = TimedEvent::new(stamp, MidiEvent::from_bytes(message));
                ingress.on_event(event, sink);
            },
            (ingress, sink),
        )
        .map_err(|e| e.to_string())?;

    println!("Commands: r = reset beat counter, s = status, q = quit (then Enter)");
    let commands = spawn_stdin_reader();

    loop {
        match commands.recv_timeout(IDLE_INTERVAL) {
            Ok(Command::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Command::Reset) => {
                reset_requested.store(true, Ordering::Relaxed);
                info!("beat counter reset requested");
            }
            Ok(Command::Status) => {
                info!(params = ?idle.params().snapshot(), status = ?idle.status(), "status");
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        idle.idle();
    }

    idle.shutdown();
    if !idle.channel().wait_stopped(Duration::from_millis(200)) {
        warn!("control channel still stopping; abandoning it");
    }
    Ok(())
}

fn open_output(wanted: Option<&str>) -> Result<MidiSink, Box<dyn std::error::Error>> {
    let Some(wanted) = wanted else {
        info!("no MIDI output selected, events are consumed");
        return Ok(MidiSink::Discard);
    };
    let midi_out = midir::MidiOutput::new("beatbridge").map_err(|e| e.to_string())?;
    let ports = midi_out.ports();
    let port = ports
        .iter()
        .find(|p| midi_out.port_name(p).unwrap_or_default().contains(wanted))
        .ok_or_else(|| format!("no MIDI output matching '{wanted}'"))?;
    info!("forwarding to {}", midi_out.port_name(port).unwrap_or_default());
    let conn = midi_out
        .connect(port, "beatbridge-out")
        .map_err(|e| e.to_string())?;
    Ok(MidiSink::Port(conn))
}

fn spawn_stdin_reader() -> Receiver<Command> {
    let (tx, rx) = crossbeam::channel::bounded(8);
    std::thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = match line.trim() {
                "q" | "quit" => Command::Quit,
                "r" | "reset" => Command::Reset,
                "s" | "status" => Command::Status,
                other => {
                    println!("unknown command '{other}'");
                    continue;
                }
            };
            let quit = matches!(command, Command::Quit);
            if tx.send(command).is_err() || quit {
                break;
            }
        }
    });
    rx
}
