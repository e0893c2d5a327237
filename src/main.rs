//! Command-line supervisor for the serial-to-TCP bridge.
//!
//! Opens the serial link once, then keeps one listen/relay cycle running at a
//! time: whenever the TCP client disconnects, the listener comes back up
//! after a short delay while the serial side stays open.

use std::process::ExitCode;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use wirebridge::core::{
    DEFAULT_BAUD_RATE, DEFAULT_RELISTEN_DELAY, DEFAULT_SOCKET_PORT, LinkError,
};
use wirebridge::framing::{FramingMode, ParserConfig};
use wirebridge::link::{LinkConfig, open_serial_stream};
use wirebridge::{Bridge, BridgeConfig, BridgeError, BridgeEvent, SerialLink};

/// Payload bytes per loopback packet.
const LOOPBACK_BATCH_SIZE: usize = 1024;

/// Parsed command line.
#[derive(Debug, Clone)]
struct Args {
    socket: u16,
    serial: Option<String>,
    baudrate: u32,
    framing: FramingMode,
    log: bool,
    check: bool,
    loopback: Option<u64>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            socket: DEFAULT_SOCKET_PORT,
            serial: None,
            baudrate: DEFAULT_BAUD_RATE,
            framing: FramingMode::Passthrough,
            log: false,
            check: false,
            loopback: None,
        }
    }
}

fn print_help() {
    println!(
        "\
wirebridge relays bytes between a serial device and a single TCP client.
It opens the serial port, listens on a TCP socket, and forwards data in both
directions until the client disconnects, then listens again.

General usage:
  wirebridge -serial serial_if [-socket port] [-baudrate rate] [options]

Options:
  -h|-help           Prints this help.
  -v|-version        Prints the version number.
  -socket port       The TCP port to listen on, default is {DEFAULT_SOCKET_PORT}.
  -serial serial_if  The serial port, e.g. \"/dev/ttyUSB0\" (Linux/macOS) or \"COM1\" (Windows).
  -baudrate rate     The baudrate to use for the serial port. Default={DEFAULT_BAUD_RATE}.
  -framed            Reassemble length-prefixed frames instead of raw pass-through.
  -log               Enables verbose logging to console.
  -check             Tests the socket port and the serial interface, then exits.
  -loopback seconds  Runs the serial loopback test for the given time, then exits.
"
    );
}

/// Evaluate the command line the way the help text documents it.
///
/// `Ok(None)` means an informational flag already did its job and the
/// process should exit cleanly.
fn evaluate_args(argv: &[String]) -> Result<Option<Args>, String> {
    let mut args = Args::default();
    let mut it = argv.iter();

    if argv.is_empty() {
        return Err("No arguments. Use 'wirebridge -h' to show all options.".into());
    }

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "-help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "-version" => {
                println!("Version: {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-log" => args.log = true,
            "-framed" => args.framing = FramingMode::LengthPrefixed,
            "-check" => args.check = true,
            "-socket" => {
                let port = it.next().ok_or("No socket port given.")?;
                args.socket = port
                    .parse()
                    .map_err(|_| format!("Invalid socket port: '{port}'"))?;
            }
            "-serial" => {
                let port = it.next().ok_or("No serial port given.")?;
                args.serial = Some(port.clone());
            }
            "-baudrate" => {
                let rate = it.next().ok_or("No baudrate given.")?;
                args.baudrate = rate
                    .parse()
                    .map_err(|_| format!("Invalid baudrate: '{rate}'"))?;
            }
            "-loopback" => {
                let secs = it.next().ok_or("No loopback time given.")?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("Invalid loopback time: '{secs}'"))?;
                args.loopback = Some(secs);
            }
            other => {
                return Err(format!(
                    "Unknown argument: '{other}'. Use 'wirebridge -h' to show all options."
                ));
            }
        }
    }

    if args.serial.is_none() {
        return Err("No serial port given.".into());
    }
    Ok(Some(args))
}

fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "wirebridge=debug"
    } else {
        "wirebridge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

async fn run_check(socket: u16, serial: &str, baudrate: u32) -> ExitCode {
    let mut ok = true;

    match wirebridge::diag::socket_port_available(socket).await {
        Ok(true) => info!("Socket port {socket} OK."),
        Ok(false) => {
            warn!("Socket port {socket} is already in use. Choose another port.");
            ok = false;
        }
        Err(e) => {
            error!("Socket error: {e}");
            ok = false;
        }
    }

    match wirebridge::diag::probe_serial(serial, baudrate) {
        Ok(()) => info!("Serial interface {serial} @{baudrate} baud OK."),
        Err(e) => {
            error!("Serial interface {serial} @{baudrate} baud Error: {e}");
            ok = false;
        }
    }

    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

async fn run_loopback(serial: &str, baudrate: u32, secs: u64) -> ExitCode {
    let duration = Duration::from_secs(secs);
    match wirebridge::diag::serial_loopback(serial, baudrate, duration, LOOPBACK_BATCH_SIZE).await
    {
        Ok(report) => {
            info!("Bytes sent: {}", report.bytes_sent);
            info!("Bytes received: {}", report.bytes_received);
            info!("Bytes/s: {:.1}", report.bytes_per_sec());
            info!("Packets sent: {}", report.packets_sent);
            info!("Packets received: {}", report.packets_received);
            info!("Packets/s: {:.1}", report.packets_per_sec());
            info!("Successful. No error.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Serial loopback {serial} @{baudrate} baud Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_bridge(args: Args, serial: String) -> ExitCode {
    let link_config = LinkConfig::default()
        .framing(args.framing)
        .parser(ParserConfig::default().channel("serial"));
    let mut link = SerialLink::new(link_config);

    let path = serial.clone();
    let baudrate = args.baudrate;
    let link_events = link
        .open(async move { open_serial_stream(&path, baudrate) })
        .await;

    let config = BridgeConfig::default().port(args.socket);
    let (mut bridge, mut events) = Bridge::new(config, link, link_events);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Listening(addr) => info!("Listening on {addr}."),
                BridgeEvent::Connected(peer) => info!("Client connected from {peer}."),
                BridgeEvent::LinkFailed(e) => error!("Serial link failed: {e}"),
                BridgeEvent::Disconnected => info!("Client disconnected."),
            }
        }
    });

    loop {
        match bridge.listen().await {
            Ok(()) => {
                debug!("restarting listener");
                tokio::time::sleep(DEFAULT_RELISTEN_DELAY).await;
            }
            // The serial session is gone; nothing left to relay for.
            Err(BridgeError::Link(LinkError::NotOpen)) => {
                error!("Serial link is gone, exiting.");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("Bridge error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match evaluate_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(args.log);

    let serial = match args.serial.clone() {
        Some(serial) => serial,
        None => return ExitCode::FAILURE,
    };

    if args.check {
        return run_check(args.socket, &serial, args.baudrate).await;
    }
    if let Some(secs) = args.loopback {
        return run_loopback(&serial, args.baudrate, secs).await;
    }

    info!(
        "Using socket={}, serial={}, baudrate={}",
        args.socket, serial, args.baudrate
    );
    run_bridge(args, serial).await
}
