//! Register access utility.
//!
//! Opens a single-destination link, performs one operation and exits.
//!
//! # Usage
//!
//! ```sh
//! epix-reg --udp 0.0.0.0:8192 192.168.2.10:8192 read 0x01000005 4
//! epix-reg --axi /dev/datadev_0 write 0x01000007 0xffff
//! epix-reg --pgp /dev/pgpcard_0 --lane-vc 0x10 command 3
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use epixlink::{CommLink, DestinationConfig, LaneVc, LinkConfig, LinkError, Route};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, PartialEq, Eq)]
enum Operation {
    Read { address: u32, count: u32 },
    Write { address: u32, values: Vec<u32> },
    Command { opcode: u8 },
    RunTrigger,
}

#[derive(Debug)]
struct Options {
    destination: DestinationConfig,
    lane_vc: LaneVc,
    timeout: Duration,
    operation: Operation,
}

fn main() {
    epixlink::init_tracing();
    if let Err(e) = run() {
        eprintln!("epix-reg: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let route = Route::new(0, options.lane_vc);
    // No event stream is read here, so every frame is a reply candidate.
    let config = LinkConfig::default()
        .with_data_mask(0)
        .with_register_route(route)
        .with_register_timeout(options.timeout);
    let link = CommLink::open(std::slice::from_ref(&options.destination), config)?;

    let result = execute(&link, route, options.operation);
    link.close();
    result
}

fn execute(link: &CommLink, route: Route, operation: Operation) -> Result<(), CliError> {
    match operation {
        Operation::Read { address, count } => {
            let words = link.read_register(address, count)?;
            for (offset, word) in (0u32..).zip(&words) {
                println!("0x{:08x}: 0x{word:08x}", address.wrapping_add(offset));
            }
        }
        Operation::Write { address, values } => link.write_register(address, &values)?,
        // Queued opcodes are flushed by close().
        Operation::Command { opcode } => link.send_command(opcode, route)?,
        Operation::RunTrigger => link.send_run_trigger(route)?,
    }
    Ok(())
}

fn usage(msg: impl Into<String>) -> CliError {
    CliError::Usage(msg.into())
}

/// Parses decimal or `0x`-prefixed hexadecimal.
fn parse_number<T: TryFrom<u64>>(s: &str, what: &str) -> Result<T, CliError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| usage(format!("invalid {what}: {s}")))
}

fn next_arg<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, CliError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| usage(format!("missing value for {flag}")))
}

fn parse_endpoint(s: &str) -> Result<SocketAddr, CliError> {
    s.parse()
        .map_err(|e| usage(format!("invalid address {s}: {e}")))
}

/// Parses command line arguments into [`Options`].
fn parse_args(args: &[String]) -> Result<Options, CliError> {
    let mut destination = None;
    let mut lane_vc = LaneVc::from_raw(0);
    let mut timeout = Duration::from_secs(1);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udp" => {
                let local = parse_endpoint(next_arg(args, &mut i, "--udp")?)?;
                let remote = parse_endpoint(next_arg(args, &mut i, "--udp")?)?;
                destination = Some(DestinationConfig::Udp { local, remote });
            }
            "--axi" => {
                let device = PathBuf::from(next_arg(args, &mut i, "--axi")?);
                destination = Some(DestinationConfig::AxiStream { device });
            }
            "--pgp" => {
                let device = PathBuf::from(next_arg(args, &mut i, "--pgp")?);
                destination = Some(DestinationConfig::Pgp { device });
            }
            "--lane-vc" => {
                lane_vc = LaneVc::from_raw(parse_number(next_arg(args, &mut i, "--lane-vc")?, "lane/vc")?);
            }
            "--timeout-ms" => {
                let ms: u64 = parse_number(next_arg(args, &mut i, "--timeout-ms")?, "timeout")?;
                timeout = Duration::from_millis(ms);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => break,
        }
        i += 1;
    }

    let destination =
        destination.ok_or_else(|| usage("one of --udp, --axi or --pgp is required"))?;
    let operation = parse_operation(&args[i.min(args.len())..])?;
    Ok(Options {
        destination,
        lane_vc,
        timeout,
        operation,
    })
}

fn parse_operation(rest: &[String]) -> Result<Operation, CliError> {
    let Some((op, operands)) = rest.split_first() else {
        return Err(usage("missing operation (read, write, command or run)"));
    };
    match op.as_str() {
        "read" => {
            let address = parse_number(operands.first().ok_or_else(|| usage("read needs ADDR"))?, "address")?;
            let count = match operands.get(1) {
                Some(c) => parse_number(c, "count")?,
                None => 1,
            };
            if count == 0 {
                return Err(usage("count must be at least 1"));
            }
            Ok(Operation::Read { address, count })
        }
        "write" => {
            let (address, values) = operands
                .split_first()
                .ok_or_else(|| usage("write needs ADDR VALUE..."))?;
            let address = parse_number(address, "address")?;
            let values = values
                .iter()
                .map(|v| parse_number(v, "value"))
                .collect::<Result<Vec<u32>, _>>()?;
            if values.is_empty() {
                return Err(usage("write needs at least one VALUE"));
            }
            Ok(Operation::Write { address, values })
        }
        "command" => {
            let opcode = parse_number(operands.first().ok_or_else(|| usage("command needs OPCODE"))?, "opcode")?;
            Ok(Operation::Command { opcode })
        }
        "run" => Ok(Operation::RunTrigger),
        other => Err(usage(format!("unknown operation: {other}"))),
    }
}

fn print_usage() {
    eprintln!(
        r#"epix-reg - ePix register access utility

USAGE:
    epix-reg <TRANSPORT> [OPTIONS] <OPERATION>

TRANSPORT (one required):
    --udp <LOCAL> <REMOTE>  UDP socket bound to LOCAL talking to REMOTE
    --axi <DEVICE>          AXI-stream DMA device
    --pgp <DEVICE>          PGP card device

OPTIONS:
    --lane-vc <N>           Packed lane/VC byte for requests (default: 0)
    --timeout-ms <MS>       Register timeout in milliseconds (default: 1000)
    -h, --help              Print this help message

OPERATION:
    read <ADDR> [COUNT]     Read COUNT words (default: 1)
    write <ADDR> <VALUE>... Write one or more words
    command <OPCODE>        Send a command opcode
    run                     Send a run trigger

Numbers accept decimal or 0x-prefixed hex.
"#
    );
}
