//! phyreg: read and write PHY and switch registers through the AM335x MDIO
//! controller from Linux userspace.
//!
//! The controller's registers are mapped through `/dev/mem`, so the tool
//! must run as root. Every session enables the controller, finds the first
//! responding PHY and forces the switch's CPU port link before running the
//! requested command. Each MDIO transaction prints one trace line.
//!
//! Besides the subcommands, the short positional form is accepted:
//! `phyreg ADDR` dumps all 32 registers, `phyreg ADDR REG` reads one and
//! `phyreg ADDR REG VALUE` writes `VALUE` (hex).
//!
//! Exit codes: 0 success, 1 register mapping failed, 2 malformed request,
//! 3 no PHY found, 4 any other hardware failure.

use std::io::{self, Write};
use std::process;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use ph_am335x_mdio::boards::Am335xMv88e6097;
use ph_am335x_mdio::hal::StdDelay;
use ph_am335x_mdio::register::MDIO_WINDOW_LEN;
use ph_am335x_mdio::register::devmem::DevMemWindow;
use ph_am335x_mdio::{
    ConfigError, Error, MdioSession, MdioTransaction, PollConfig, PortForceConfig,
    RegisterWindow, SessionConfig, TraceSink, TransactionTrace, UserChannel,
};

const EXIT_MAPPING: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NO_PHY: i32 = 3;
const EXIT_HARDWARE: i32 = 4;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "AM335x MDIO register tool")]
struct Args {
    /// Physical base of the MDIO register block
    #[clap(long, parse(try_from_str = parse_int))]
    base: Option<usize>,
    /// User-access channel (0 or 1)
    #[clap(long, default_value = "0", parse(try_from_str = parse_channel))]
    channel: UserChannel,
    /// Give up on a GO-bit wait after this many microseconds
    #[clap(long)]
    timeout_us: Option<u32>,
    /// Pause between GO-bit polls in microseconds (0 spins)
    #[clap(long, default_value_t = 1)]
    poll_interval_us: u32,
    /// SMI address of the switch port forced at start
    #[clap(long, default_value_t = Am335xMv88e6097::PORT9_ADDR)]
    port_addr: u8,
    /// Switch port register forced at start
    #[clap(long, default_value_t = Am335xMv88e6097::PORT9_PCS_CONTROL)]
    port_reg: u8,
    /// Value forced into the switch port register, in hex
    #[clap(long, parse(try_from_str = parse_hex_u16))]
    port_value: Option<u16>,
    /// Skip the switch port link force
    #[clap(long)]
    no_force_port: bool,
    /// Only print transaction traces
    #[clap(short, long)]
    quiet: bool,
    /// PHY address for the positional form (0-31)
    addr: Option<u8>,
    /// Register for the positional form; all 32 are read when omitted
    reg: Option<u8>,
    /// Value in hex for the positional form; writes the register
    #[clap(requires = "reg", parse(try_from_str = parse_hex_u16))]
    value: Option<u16>,
    #[clap(subcommand)]
    cmd: Option<Cmd>,
}

impl Args {
    /// The command to run, from a subcommand or the positional form
    fn command(&self) -> Result<Cmd> {
        if let Some(cmd) = &self.cmd {
            return Ok(cmd.clone());
        }
        let Some(addr) = self.addr else {
            return Err(Error::from(ConfigError::InvalidConfig))
                .context("no command given (try `phyreg --help`)");
        };
        Ok(match (self.reg, self.value) {
            (Some(reg), Some(value)) => Cmd::Write { addr, reg, value },
            (reg, _) => Cmd::Read { addr, reg },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Cmd {
    /// Read one register, or all 32 when no register is given
    Read {
        /// PHY address (0-31)
        addr: u8,
        /// Register (0-31)
        reg: Option<u8>,
    },
    /// Write one register
    Write {
        /// PHY address (0-31)
        addr: u8,
        /// Register (0-31)
        reg: u8,
        /// Value in hex
        #[clap(parse(try_from_str = parse_hex_u16))]
        value: u16,
    },
    /// Show the version, alive and link registers
    Scan,
}

pub fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(err) = run(&args) {
        eprintln!("phyreg: {err:#}");
        process::exit(exit_code(&err));
    }
}

fn run(args: &Args) -> Result<()> {
    let cmd = args.command()?;
    let config = session_config(args);
    let base = args.base.unwrap_or(Am335xMv88e6097::MDIO_BASE);

    log::debug!("mapping {MDIO_WINDOW_LEN:#x} bytes at {base:#x}");
    let window = DevMemWindow::acquire(base, MDIO_WINDOW_LEN)
        .map_err(Error::from)
        .with_context(|| format!("cannot map MDIO registers at {base:#x} (are you root?)"))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_session(window, &config, &cmd, args.quiet, &mut out)
}

/// Open a session on `window`, run `cmd` and release the window
fn run_session<W: RegisterWindow, O: Write>(
    window: W,
    config: &SessionConfig,
    cmd: &Cmd,
    quiet: bool,
    out: &mut O,
) -> Result<()> {
    let mut printer = TracePrinter::new(out);
    let mut session = MdioSession::open_traced(window, StdDelay::new(), config, &mut printer)
        .context("MDIO initialization failed")?;
    printer.finish()?;

    if !quiet {
        let enable = session.enable_report();
        writeln!(out, "MDIO control before config: {:#x}", enable.before)?;
        writeln!(out, "PHY address: {}", session.phy_address())?;
    }

    match cmd {
        Cmd::Read { addr, reg: Some(reg) } => {
            let txn = MdioTransaction::read(*addr, *reg).map_err(Error::from)?;
            let mut printer = TracePrinter::new(out);
            session.execute_traced(&txn, &mut printer)?;
            printer.finish()?;
        }
        Cmd::Read { addr, reg: None } => {
            let mut printer = TracePrinter::new(out);
            session.dump_traced(*addr, &mut printer)?;
            printer.finish()?;
        }
        Cmd::Write { addr, reg, value } => {
            let txn = MdioTransaction::write(*addr, *reg, *value).map_err(Error::from)?;
            let mut printer = TracePrinter::new(out);
            session.execute_traced(&txn, &mut printer)?;
            printer.finish()?;
        }
        Cmd::Scan => {
            let version = session.version()?;
            let alive = session.alive_bitmap()?;
            let link = session.link_bitmap()?;
            writeln!(out, "MDIO version: {version:#010x}")?;
            writeln!(out, "Alive bits: {:#x}", alive.bits())?;
            writeln!(out, "Link bits: {:#x}", link.bits())?;
            for addr in alive.iter() {
                let state = if link.contains(addr) { "up" } else { "down" };
                writeln!(out, "PHY addr={addr:02} link {state}")?;
            }
        }
    }

    session.close().context("cannot unmap MDIO registers")?;
    Ok(())
}

fn session_config(args: &Args) -> SessionConfig {
    let interval_ns = args.poll_interval_us.saturating_mul(1_000);
    let mut poll = PollConfig::new().with_poll_interval_ns(interval_ns);
    if let Some(timeout_us) = args.timeout_us {
        poll = poll.with_timeout_us(timeout_us);
    }

    let port_force = if args.no_force_port {
        None
    } else {
        Some(PortForceConfig::new(
            args.port_addr,
            args.port_reg,
            args.port_value.unwrap_or(Am335xMv88e6097::PORT9_FORCED_100_FD),
        ))
    };

    Am335xMv88e6097::session_config()
        .with_channel(args.channel)
        .with_port_force(port_force)
        .with_poll(poll)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::Mapping(_)) => EXIT_MAPPING,
        Some(Error::Config(_)) => EXIT_USAGE,
        Some(Error::Discovery(_)) => EXIT_NO_PHY,
        _ => EXIT_HARDWARE,
    }
}

/// Trace sink printing one line per transaction
struct TracePrinter<'a, O: Write> {
    out: &'a mut O,
    error: Option<io::Error>,
}

impl<'a, O: Write> TracePrinter<'a, O> {
    fn new(out: &'a mut O) -> Self {
        Self { out, error: None }
    }

    /// Surface the first write error, if any
    fn finish(self) -> io::Result<()> {
        self.error.map_or(Ok(()), Err)
    }
}

impl<O: Write> TraceSink for TracePrinter<'_, O> {
    fn record(&mut self, trace: &TransactionTrace) {
        if self.error.is_none() {
            if let Err(e) = writeln!(self.out, "{trace}") {
                self.error = Some(e);
            }
        }
    }
}

fn parse_int(s: &str) -> Result<usize> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("invalid number {s:?}"))
}

/// Register values are always hex, with or without a `0x` prefix
fn parse_hex_u16(s: &str) -> Result<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).with_context(|| format!("invalid 16-bit hex value {s:?}"))
}

fn parse_channel(s: &str) -> Result<UserChannel> {
    let Some(channel) = s.parse().ok().and_then(UserChannel::from_index) else {
        bail!("channel must be 0 or 1, got {s:?}");
    };
    Ok(channel)
}
