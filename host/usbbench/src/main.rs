#![deny(warnings)]

use core::{num::ParseIntError, time::Duration};
use std::{
    env,
    io::{self, Write as _},
    process,
};

use anyhow::bail;
use log::{error, info, LevelFilter};
use loopback::{
    CancelPolicy, CancellationToken, Config, Libusb, Mode, Pattern, Throughput, ThroughputReport,
};
use structopt::{clap::AppSettings, StructOpt};

mod device;
mod sync;

/// Default session length
const DEFAULT_SZ: u64 = 8 * 1024 * 1024;

/// One progress dot per this many bytes
const DOT: u64 = 16 * 1024;

/// Bulk throughput benchmark for the loopback firmware
#[derive(StructOpt)]
#[structopt(global_settings = &[AppSettings::DisableVersion])]
struct Opts {
    /// IN-only test: the device sources data
    #[structopt(short, long = "in")]
    in_only: bool,

    /// OUT-only test: the device sinks data
    #[structopt(short, long = "out")]
    out_only: bool,

    /// Loopback test (default): the device echoes every byte inverted
    #[structopt(short, long = "loop")]
    loopback: bool,

    /// Vendor ID
    #[structopt(short, long, parse(try_from_str = parse_u16))]
    vid: Option<u16>,

    /// Product ID
    #[structopt(short, long, parse(try_from_str = parse_u16))]
    pid: Option<u16>,

    /// Substring of the manufacturer string
    #[structopt(short, long)]
    manufacturer: Option<String>,

    /// Substring of the product string
    #[structopt(short = "P", long)]
    product: Option<String>,

    /// Interface that carries the bulk endpoints
    #[structopt(short = "f", long, parse(try_from_str = parse_u8))]
    interface: Option<u8>,

    /// Bytes per transfer
    #[structopt(short = "S", long = "pkt-sz", parse(try_from_str = parse_usize))]
    pkt_sz: Option<usize>,

    /// Bytes per batch (default: 8 packets)
    #[structopt(short = "B", long = "batch-sz", parse(try_from_str = parse_usize))]
    batch_sz: Option<usize>,

    /// Bulk IN endpoint
    #[structopt(short = "I", long = "in-ep", parse(try_from_str = parse_u8))]
    in_ep: Option<u8>,

    /// Bulk OUT endpoint
    #[structopt(short = "O", long = "out-ep", parse(try_from_str = parse_u8))]
    out_ep: Option<u8>,

    /// Bytes to transfer; 0 runs until Ctrl-C
    #[structopt(short, long, parse(try_from_str = parse_u64))]
    sz: Option<u64>,

    /// Keep many transfers in flight
    #[structopt(short, long = "async")]
    asynchronous: bool,

    /// IN-only: fail on short packets (echoes are always checked)
    #[structopt(short, long)]
    check: bool,

    /// Maximum number of packets in flight (default: a whole batch)
    #[structopt(short, long, parse(try_from_str = parse_usize))]
    depth: Option<usize>,

    /// Transfer timeout in milliseconds
    #[structopt(short, long, parse(try_from_str = parse_u64))]
    timeout: Option<u64>,

    /// Cancel the transfers in flight on Ctrl-C instead of letting them finish
    #[structopt(long)]
    abort: bool,

    /// Random payloads instead of `aa 55 00 ff`
    #[structopt(long)]
    random: bool,

    /// Send the test mode and packet size to the device before starting
    #[structopt(long)]
    vendor_config: bool,

    /// Run against an in-memory loopback device
    #[structopt(long)]
    simulate: bool,

    /// Debug output
    #[structopt(short = "V", long)]
    verbose: bool,
}

fn parse_u8(s: &str) -> Result<u8, ParseIntError> {
    match hex_digits(s) {
        Some(digits) => u8::from_str_radix(digits, 16),
        None => s.parse(),
    }
}

fn parse_u16(s: &str) -> Result<u16, ParseIntError> {
    match hex_digits(s) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => s.parse(),
    }
}

fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
    match hex_digits(s) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => s.parse(),
    }
}

fn parse_usize(s: &str) -> Result<usize, ParseIntError> {
    match hex_digits(s) {
        Some(digits) => usize::from_str_radix(digits, 16),
        None => s.parse(),
    }
}

fn hex_digits(s: &str) -> Option<&str> {
    if s.starts_with("0x") || s.starts_with("0X") {
        Some(&s[2..])
    } else {
        None
    }
}

fn main() -> Result<(), anyhow::Error> {
    process::exit(not_main()?)
}

fn not_main() -> Result<i32, anyhow::Error> {
    let opts = Opts::from_args();

    let mut logger = env_logger::Builder::new();
    logger.filter_level(if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let mode = match (opts.in_only, opts.out_only, opts.loopback) {
        (false, false, _) => Mode::Loopback,
        (true, false, false) => Mode::InOnly,
        (false, true, false) => Mode::OutOnly,
        _ => bail!("`--in`, `--out` and `--loop` are mutually exclusive"),
    };

    let chunk_size = opts.pkt_sz.unwrap_or_else(|| consts::BULK_MPS.into());
    let config = Config {
        mode,
        out_endpoint: opts.out_ep.unwrap_or(consts::EPOUT1),
        in_endpoint: opts.in_ep.unwrap_or(consts::EPIN1),
        chunk_size,
        batch_size: opts.batch_sz.unwrap_or(8 * chunk_size),
        total_bytes: match opts.sz.unwrap_or(DEFAULT_SZ) {
            0 => None,
            sz => Some(sz),
        },
        timeout: Duration::from_millis(opts.timeout.unwrap_or(1_000)),
        depth: opts.depth.unwrap_or(usize::max_value()),
        cancel_policy: if opts.abort {
            CancelPolicy::Abort
        } else {
            CancelPolicy::Drain
        },
        verify: mode == Mode::Loopback || opts.check,
        pattern: if opts.random {
            Pattern::Random
        } else {
            Pattern::Aa5500ff
        },
    };
    config.validate()?;

    let cancel = CancellationToken::new();
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || cancel.cancel()
    })?;

    let mut dots = Dots::new();
    let progress = |throughput: &Throughput| dots.update(throughput.bytes());

    let result = if opts.simulate {
        info!("running against the simulated device");
        let mut device = loopback::sim::Device::new(mode);
        loopback::run_with_progress(&mut device, &config, &cancel, progress)
    } else {
        let interface = opts.interface.unwrap_or(consts::INTERFACE);
        let mut handle = device::open(&device::Target {
            vid: opts.vid.unwrap_or(consts::VID),
            pid: opts.pid.unwrap_or(consts::PID),
            manufacturer: opts
                .manufacturer
                .unwrap_or_else(|| consts::MANUFACTURER.to_string()),
            product: opts.product.unwrap_or_else(|| consts::PRODUCT.to_string()),
            interface,
        })?;

        device::clear_halts(&mut handle, &[config.out_endpoint, config.in_endpoint])?;
        if opts.vendor_config {
            device::configure(&handle, interface, mode, chunk_size)?;
        }
        if mode == Mode::Loopback {
            device::flush(&handle, config.in_endpoint)?;
        }

        if opts.asynchronous {
            let mut transport = Libusb::new(&handle);
            loopback::run_with_progress(&mut transport, &config, &cancel, progress)
        } else {
            sync::run(&handle, &config, &cancel, progress)
        }
    };
    println!();

    match result {
        Ok(report) => {
            summary(mode, &report);
            Ok(0)
        }

        Err(e) => {
            error!("{}", e);
            Ok(1)
        }
    }
}

fn summary(mode: Mode, report: &ThroughputReport) {
    let label = match mode {
        Mode::Loopback => "Loopback",
        Mode::OutOnly => "OUT",
        Mode::InOnly => "IN",
    };

    if report.cancelled {
        info!("cancelled");
    }
    if report.timeouts != 0 {
        info!("{} transfer(s) timed out", report.timeouts);
    }
    info!(
        "{} bytes in {} batch(es), {:?}",
        report.bytes_verified, report.batches, report.elapsed
    );
    println!("{} test speed: {:.2} Kbps", label, report.kbits_per_second());
}

struct Dots {
    next: u64,
}

impl Dots {
    fn new() -> Self {
        Self { next: DOT }
    }

    fn update(&mut self, bytes: u64) {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        let mut printed = false;
        while bytes >= self.next {
            let _ = stdout.write_all(b".");
            self.next += DOT;
            printed = true;
        }

        if printed {
            let _ = stdout.flush();
        }
    }
}
