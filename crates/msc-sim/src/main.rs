use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Parser;
use env_logger::Env;
use log::{Level, info};
use pbr::{ProgressBar, Units};

use usbd_msc::{MscConfig, MscDevice};

use crate::bus::SimBus;
use crate::host::Host;
use crate::ramdisk::RamDisk;

pub mod bus;
pub mod host;
pub mod ramdisk;

#[derive(Parser, Debug)]
#[clap(version, about = "Plays a host session against the usbd-msc stack over a loopback bus", long_about = None)]
struct Opts {
    /// Verbose
    #[clap(short, long)]
    verbose: bool,

    /// Number of blocks on the simulated medium
    #[clap(long, default_value = "4096", value_parser = num_parser)]
    blocks: u32,

    /// Block size in bytes
    #[clap(long, default_value = "512", value_parser = num_parser)]
    block_size: u32,

    /// Shared transfer buffer size in bytes (power of two)
    #[clap(long, default_value = "16384", value_parser = num_parser)]
    buffer: u32,

    /// Sectors written and read back by the demo transfer
    #[clap(long, default_value = "1024", value_parser = num_parser)]
    sectors: u32,

    /// Starting LBA of the demo transfer
    #[clap(long, default_value = "32", value_parser = num_parser)]
    lba: u32,
}

// allow hex and binary formatted numbers alongside decimal
fn num_parser(s: &str) -> Result<u32, &'static str> {
    match s.get(0..2) {
        Some("0x") => u32::from_str_radix(&s[2..], 16).map_err(|_| "invalid hex number"),
        Some("0b") => u32::from_str_radix(&s[2..], 2).map_err(|_| "invalid binary number"),
        _ => s.parse::<u32>().map_err(|_| "invalid decimal number"),
    }
}

fn main() -> Result<()> {
    let options = Opts::parse();

    if options.verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                let level = record.level();
                if level == Level::Info {
                    writeln!(buf, "{}", record.args())
                } else {
                    writeln!(buf, "{}: {}", record.level(), record.args())
                }
            })
            .init();
    }

    if options.lba + options.sectors > options.blocks {
        bail!(
            "demo transfer {}+{} does not fit a {}-block medium",
            options.lba,
            options.sectors,
            options.blocks
        );
    }

    let bus = SimBus::new();
    let disk = RamDisk::new(options.blocks, options.block_size);
    let buffer = vec![0u8; options.buffer as usize].into_boxed_slice();
    let mut dev = MscDevice::new(bus.clone(), disk, MscConfig::default(), buffer)
        .context("declaring the mass-storage function")?;
    dev.initialize().context("initializing the function")?;
    bus.attach(dev.events());
    dev.initialize_automaton().context("arming CBW reception")?;

    let mut host = Host::new(bus, dev);
    run_session(&mut host, &options)
}

fn run_session(host: &mut Host, options: &Opts) -> Result<()> {
    info!("GetMaxLun -> {}", host.get_max_lun()?);

    // INQUIRY
    let (inquiry, csw) = host.execute_in(&[0x12, 0, 0, 0, 36, 0], 36)?;
    expect_passed("INQUIRY", csw.status)?;
    info!(
        "INQUIRY: vendor '{}' product '{}' rev '{}'",
        String::from_utf8_lossy(&inquiry[8..16]).trim_end(),
        String::from_utf8_lossy(&inquiry[16..32]).trim_end(),
        String::from_utf8_lossy(&inquiry[32..36]).trim_end(),
    );

    // TEST UNIT READY
    let csw = host.execute_out(&[0x00, 0, 0, 0, 0, 0], &[])?;
    expect_passed("TEST UNIT READY", csw.status)?;

    // READ CAPACITY(10)
    let mut cdb = [0u8; 10];
    cdb[0] = 0x25;
    let (capacity, csw) = host.execute_in(&cdb, 8)?;
    expect_passed("READ CAPACITY", csw.status)?;
    let last_lba = u32::from_be_bytes(capacity[0..4].try_into().unwrap());
    let block_size = u32::from_be_bytes(capacity[4..8].try_into().unwrap());
    info!(
        "READ CAPACITY: {} blocks of {} bytes ({} KiB)",
        last_lba as u64 + 1,
        block_size,
        (last_lba as u64 + 1) * block_size as u64 / 1024
    );

    // WRITE(10) then READ(10) the same range and compare
    let total_bytes = options.sectors as usize * block_size as usize;
    let data = pattern(total_bytes);
    // keep each command a comfortable multiple of the transfer buffer
    let sectors_per_cmd = (options.buffer / block_size * 4).clamp(1, u16::MAX as u32);

    info!(
        "writing {} sectors at LBA {}",
        options.sectors, options.lba
    );
    let mut pb = ProgressBar::new(total_bytes as u64);
    pb.set_units(Units::Bytes);
    let mut done = 0u32;
    while done < options.sectors {
        let count = sectors_per_cmd.min(options.sectors - done);
        let lba = options.lba + done;
        let offset = done as usize * block_size as usize;
        let len = count as usize * block_size as usize;
        let csw = host.execute_out(&write10_cdb(lba, count as u16), &data[offset..offset + len])?;
        expect_passed("WRITE(10)", csw.status)?;
        pb.add(len as u64);
        done += count;
    }
    pb.finish();

    info!(
        "reading {} sectors back from LBA {}",
        options.sectors, options.lba
    );
    let mut pb = ProgressBar::new(total_bytes as u64);
    pb.set_units(Units::Bytes);
    let mut observed = Vec::with_capacity(total_bytes);
    let mut done = 0u32;
    while done < options.sectors {
        let count = sectors_per_cmd.min(options.sectors - done);
        let lba = options.lba + done;
        let len = count as usize * block_size as usize;
        let (payload, csw) = host.execute_in(&read10_cdb(lba, count as u16), len as u32)?;
        expect_passed("READ(10)", csw.status)?;
        if payload.len() != len {
            bail!("READ(10) returned {} bytes, expected {len}", payload.len());
        }
        observed.extend(payload);
        pb.add(len as u64);
        done += count;
    }
    pb.finish();

    if observed != data {
        bail!("round trip mismatch: data read back differs from data written");
    }
    info!("round trip verified: {total_bytes} bytes match");
    Ok(())
}

fn expect_passed(what: &str, status: u8) -> Result<()> {
    if status != 0 {
        bail!("{what} failed with CSW status {status}");
    }
    Ok(())
}

fn read10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

fn write10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10_cdb(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}

/// Deterministic non-repeating-ish fill for the demo transfer.
fn pattern(len: usize) -> Vec<u8> {
    let mut state = 0x2545_F491u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xFF) as u8
        })
        .collect()
}
