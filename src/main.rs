//! sata-stack - demo entry point
//!
//! Connects a host port to the simulated disk over an in-memory wire, then
//! runs IDENTIFY, a DMA write and a DMA read-back and reports the outcome.

use std::process::ExitCode;

use log::{Level, LevelFilter};
use sata_stack::phy::{End, Wire};
use sata_stack::sim::{self, Device};
use sata_stack::transport::command::{
    ATA_CMD_IDENTIFY, ATA_CMD_READ_DMA_EXT, ATA_CMD_WRITE_DMA_EXT,
};
use sata_stack::transport::{Completion, Register};
use sata_stack::{HostPort, LinkConfig, MemoryDma, TransportConfig, logger};

/// Steps to wait for any one command
const COMMAND_TIMEOUT: u64 = 200_000;

const DISK_SECTORS: usize = 64;

fn stdout_sink(level: Level, cycle: u64, args: core::fmt::Arguments<'_>) {
    println!("[{:>8}] [{}] {}", cycle, logger::level_tag(level, true), args);
}

struct Bench<'a> {
    wire: Wire,
    host: HostPort,
    dma: MemoryDma<'a>,
    device: Device<'a>,
}

impl Bench<'_> {
    fn tick(&mut self) {
        self.host.step(&mut self.wire.end(End::Host));
        self.device.step(&mut self.wire.end(End::Device));
        self.dma.service(self.host.transport_mut());
        self.wire.tick();
    }

    fn wait_ready(&mut self) -> Result<(), &'static str> {
        for _ in 0..COMMAND_TIMEOUT {
            if self.host.is_ready() {
                return Ok(());
            }
            self.tick();
        }
        Err("timeout waiting for the device")
    }

    /// Issue one command and run it to completion
    fn run(
        &mut self,
        command: u8,
        lba: u64,
        count: u16,
        addr: u64,
    ) -> Result<Completion, &'static str> {
        self.wait_ready()?;
        let regs = [
            (Register::LbaLow, lba as u32),
            (Register::LbaHigh, (lba >> 32) as u32),
            (Register::Count, u32::from(count)),
            (Register::Device, 0x40),
            (Register::DmaAddrLow, addr as u32),
            (Register::DmaAddrHigh, (addr >> 32) as u32),
            (Register::Command, u32::from(command)),
        ];
        for (reg, value) in regs {
            self.host
                .write(reg as u32, value)
                .map_err(|_| "register write rejected")?;
        }
        for _ in 0..COMMAND_TIMEOUT {
            self.tick();
            if let Some(done) = self.host.transport_mut().take_completion() {
                // Let the DMA engine retire what is still queued
                for _ in 0..64 {
                    self.tick();
                }
                return Ok(done);
            }
        }
        Err("command timed out")
    }
}

fn demo() -> Result<(), &'static str> {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; 0x4000];

    let mut bench = Bench {
        wire: Wire::new(),
        host: HostPort::new(LinkConfig::new(), TransportConfig::new()),
        dma: MemoryDma::new(&mut memory),
        device: Device::new(&mut disk),
    };

    bench.wait_ready()?;
    let signature = bench.host.transport().registers().signature();
    log::info!("device signature {:#010x}", signature);

    let done = bench.run(ATA_CMD_IDENTIFY, 0, 1, 0x0)?;
    if done.status & 1 != 0 {
        return Err("IDENTIFY failed");
    }
    let mut identify = [0u8; sim::BLOCK_SIZE];
    identify.copy_from_slice(&bench.dma.memory()[..sim::BLOCK_SIZE]);
    log::info!(
        "IDENTIFY: model \"{}\", {} sectors",
        sim::identify_model(&identify),
        sim::identify_sectors(&identify)
    );

    let pattern: Vec<u8> = (0..8 * 512).map(|i| (i * 7 + 3) as u8).collect();
    bench.dma.memory_mut()[0x1000..0x1000 + pattern.len()].copy_from_slice(&pattern);
    let done = bench.run(ATA_CMD_WRITE_DMA_EXT, 8, 8, 0x1000)?;
    log::info!("WRITE DMA EXT: status {:#04x}, {} bytes", done.status, done.bytes);

    let done = bench.run(ATA_CMD_READ_DMA_EXT, 8, 8, 0x2000)?;
    log::info!("READ DMA EXT: status {:#04x}, {} bytes", done.status, done.bytes);

    if bench.dma.memory()[0x2000..0x2000 + pattern.len()] != pattern[..] {
        return Err("read-back does not match what was written");
    }
    log::info!(
        "read-back matches; link stats {:?}",
        bench.host.link().stats()
    );
    Ok(())
}

fn main() -> ExitCode {
    if logger::init(stdout_sink, LevelFilter::Info).is_err() {
        eprintln!("logger already installed");
    }
    match demo() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("demo failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
