//! Host port against the simulated disk over an in-memory wire

use sata_stack::phy::{End, Wire};
use sata_stack::sim::{self, Device};
use sata_stack::transport::command::{
    ATA_CMD_FLUSH_CACHE, ATA_CMD_IDENTIFY, ATA_CMD_READ_DMA_EXT, ATA_CMD_READ_SECTORS,
    ATA_CMD_WRITE_DMA_EXT, ATA_CMD_WRITE_SECTORS,
};
use sata_stack::transport::regs::{
    ATA_ER_ABRT, ATA_ER_IDNF, ATA_SR_DRDY, ATA_SR_ERR, SATA_SIG_ATA,
};
use sata_stack::transport::{
    CommandError, Completion, Register, RegisterError, TransportErrors, TransportState,
};
use sata_stack::{HostPort, LinkConfig, MemoryDma, TransportConfig};

const DISK_SECTORS: usize = 64;
const MEMORY: usize = 0x10000;
const TIMEOUT: usize = 100_000;

struct Bench<'a> {
    wire: Wire,
    host: HostPort,
    dma: MemoryDma<'a>,
    device: Device<'a>,
}

impl<'a> Bench<'a> {
    fn new(config: LinkConfig, disk: &'a mut [u8], memory: &'a mut [u8]) -> Self {
        let mut bench = Self {
            wire: Wire::new(),
            host: HostPort::new(config, TransportConfig::new()),
            dma: MemoryDma::new(memory),
            device: Device::with_config(config, disk),
        };
        bench.settle();
        bench
    }

    fn tick(&mut self) {
        self.host.step(&mut self.wire.end(End::Host));
        self.device.step(&mut self.wire.end(End::Device));
        self.dma.service(self.host.transport_mut());
        self.wire.tick();
    }

    /// Run until the device is quiet and the host can take a command
    fn settle(&mut self) {
        for _ in 0..TIMEOUT {
            if self.host.is_ready() && self.device.is_idle() {
                return;
            }
            self.tick();
        }
        panic!("port never became ready");
    }

    fn setup(&mut self, lba: u64, count: u16, addr: u64) {
        for (reg, value) in [
            (Register::LbaLow, lba as u32),
            (Register::LbaHigh, (lba >> 32) as u32),
            (Register::Count, u32::from(count)),
            (Register::Device, 0x40),
            (Register::DmaAddrLow, addr as u32),
            (Register::DmaAddrHigh, (addr >> 32) as u32),
        ] {
            self.host.write(reg as u32, value).unwrap();
        }
    }

    fn finish(&mut self) -> Completion {
        for _ in 0..TIMEOUT {
            self.tick();
            if let Some(done) = self.host.transport_mut().take_completion() {
                // Let the DMA engine retire anything still queued
                for _ in 0..8 {
                    self.tick();
                }
                self.settle();
                return done;
            }
        }
        panic!("command never completed");
    }

    fn run(&mut self, command: u8, lba: u64, count: u16, addr: u64) -> Completion {
        self.setup(lba, count, addr);
        self.host
            .write(Register::Command as u32, u32::from(command))
            .unwrap();
        self.finish()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn link_up_reports_ata_signature() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
    let regs = bench.host.transport().registers();
    assert_eq!(regs.signature(), SATA_SIG_ATA);
    assert_eq!(regs.status(), ATA_SR_DRDY);
}

#[test]
fn identify_over_pio() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);

    let done = bench.run(ATA_CMD_IDENTIFY, 0, 0, 0x200);
    assert_eq!(done.status & ATA_SR_ERR, 0);
    assert_eq!(done.bytes, 512);
    assert_eq!(bench.host.transport().registers().dma_addr(), 0x400);

    let mut identify = [0u8; sim::BLOCK_SIZE];
    identify.copy_from_slice(&bench.dma.memory()[0x200..0x400]);
    assert_eq!(sim::identify_sectors(&identify), DISK_SECTORS as u64);
    assert_eq!(sim::identify_model(&identify).as_str(), "SATA-STACK SIM DISK");
}

#[test]
fn dma_write_then_read_back() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    // Larger than one Data FIS so the write needs two DMA Activates
    let data = pattern(20 * 512, 5);
    memory[..data.len()].copy_from_slice(&data);
    {
        let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
        let done = bench.run(ATA_CMD_WRITE_DMA_EXT, 4, 20, 0);
        assert_eq!(done.status, ATA_SR_DRDY);
        assert_eq!(done.bytes, 20 * 512);
        assert_eq!(&bench.device.disk()[4 * 512..24 * 512], &data[..]);

        let done = bench.run(ATA_CMD_READ_DMA_EXT, 4, 20, 0x8000);
        assert_eq!(done.status, ATA_SR_DRDY);
        assert_eq!(&bench.dma.memory()[0x8000..0x8000 + data.len()], &data[..]);
        assert!(bench.host.transport().errors().is_empty());
        assert_eq!(bench.host.link().stats().rx_bad, 0);
    }
    // Untouched sectors stay zero
    assert!(disk[..4 * 512].iter().all(|&b| b == 0));
}

#[test]
fn pio_write_then_read_back() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let data = pattern(3 * 512, 9);
    memory[0x1000..0x1000 + data.len()].copy_from_slice(&data);
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);

    let done = bench.run(ATA_CMD_WRITE_SECTORS, 10, 3, 0x1000);
    assert_eq!(done.status & ATA_SR_ERR, 0);
    assert_eq!(&bench.device.disk()[10 * 512..13 * 512], &data[..]);

    let done = bench.run(ATA_CMD_READ_SECTORS, 10, 3, 0x3000);
    assert_eq!(done.status & ATA_SR_ERR, 0);
    assert_eq!(done.bytes, 3 * 512);
    assert_eq!(&bench.dma.memory()[0x3000..0x3000 + data.len()], &data[..]);
}

#[test]
fn non_data_command() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
    let done = bench.run(ATA_CMD_FLUSH_CACHE, 0, 0, 0);
    assert_eq!(done.command, ATA_CMD_FLUSH_CACHE);
    assert_eq!(done.status, ATA_SR_DRDY);
    assert_eq!(done.bytes, 0);
    assert_eq!(bench.device.stats().commands, 1);
}

#[test]
fn out_of_range_lba_fails_with_idnf() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
    let done = bench.run(ATA_CMD_READ_DMA_EXT, DISK_SECTORS as u64, 1, 0);
    assert_eq!(done.status, ATA_SR_DRDY | ATA_SR_ERR);
    assert_eq!(done.error, ATA_ER_IDNF);
    assert_eq!(done.bytes, 0);
    assert_eq!(bench.host.transport().registers().dma_addr(), 0);

    // The port is usable afterwards
    let done = bench.run(ATA_CMD_READ_DMA_EXT, 0, 1, 0);
    assert_eq!(done.status, ATA_SR_DRDY);
}

#[test]
fn device_abort_is_reported() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
    bench.device.fail_next_command();
    let done = bench.run(ATA_CMD_FLUSH_CACHE, 0, 0, 0);
    assert_eq!(done.error, ATA_ER_ABRT);
    assert_eq!(bench.host.read(Register::Status as u32).unwrap() >> 8, u32::from(ATA_ER_ABRT));
}

#[test]
fn rejected_commands_leave_registers_alone() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);
    bench.setup(3, 1, 0);
    assert_eq!(
        bench.host.write(Register::Command as u32, 0x50),
        Err(RegisterError::Command(CommandError::UnknownCommand(0x50)))
    );
    assert!(bench.host.is_ready());
    assert_eq!(bench.host.transport().registers().lba(), 3);
    assert_eq!(bench.host.transport().stats().commands, 0);
}

#[test]
fn survives_cable_pull() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);

    bench.setup(0, 16, 0);
    bench
        .host
        .write(Register::Command as u32, u32::from(ATA_CMD_READ_DMA_EXT))
        .unwrap();
    for _ in 0..100 {
        bench.tick();
    }
    bench.wire.detach();
    let done = bench.finish_after_detach();
    assert_eq!(done.status & ATA_SR_ERR, ATA_SR_ERR);
    assert!(bench.host.transport().errors().contains(TransportErrors::LINK_DOWN));
    assert_eq!(
        bench.host.write(Register::Command as u32, u32::from(ATA_CMD_FLUSH_CACHE)),
        Err(RegisterError::Command(CommandError::LinkDown))
    );

    bench.wire.attach();
    // Wait for the fresh signature to clear ERR
    for _ in 0..TIMEOUT {
        if bench.host.transport().registers().status() == ATA_SR_DRDY {
            break;
        }
        bench.tick();
    }
    bench.settle();
    bench
        .host
        .write(Register::Errors as u32, TransportErrors::all().bits())
        .unwrap();
    let done = bench.run(ATA_CMD_FLUSH_CACHE, 0, 0, 0);
    assert_eq!(done.status, ATA_SR_DRDY);
    assert!(bench.host.transport().errors().is_empty());
}

impl Bench<'_> {
    /// The command ends as soon as the host notices the link is gone
    fn finish_after_detach(&mut self) -> Completion {
        for _ in 0..10 {
            self.tick();
            if let Some(done) = self.host.transport_mut().take_completion() {
                return done;
            }
        }
        panic!("link loss did not end the command");
    }
}

#[test]
fn cont_without_scrambling_round_trips() {
    let config = LinkConfig::new()
        .with_scrambling(false)
        .with_cont(true)
        .with_align_interval(Some(64));
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; MEMORY];
    let data = pattern(2 * 512, 77);
    memory[..data.len()].copy_from_slice(&data);
    let mut bench = Bench::new(config, &mut disk, &mut memory);

    let done = bench.run(ATA_CMD_WRITE_DMA_EXT, 1, 2, 0);
    assert_eq!(done.status, ATA_SR_DRDY);
    let done = bench.run(ATA_CMD_READ_DMA_EXT, 1, 2, 0x4000);
    assert_eq!(done.status, ATA_SR_DRDY);
    assert_eq!(&bench.dma.memory()[0x4000..0x4000 + data.len()], &data[..]);
}

#[test]
fn dma_fault_is_recorded_and_reset_recovers() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; 0x1000];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);

    // Eight sectors at 0x800 run past the end of the engine's memory
    bench.setup(0, 8, 0x800);
    bench
        .host
        .write(Register::Command as u32, u32::from(ATA_CMD_READ_DMA_EXT))
        .unwrap();
    for _ in 0..2000 {
        bench.tick();
    }
    assert!(bench.host.transport().errors().contains(TransportErrors::S2MM));
    assert!(bench.host.transport().registers().is_busy());

    bench.host.reset();
    bench.settle();
    assert!(bench.host.transport().is_idle());
    // The reset reached the device as an SRST pulse
    assert_eq!(bench.device.stats().resets, 1);

    // Leftover payload of the abandoned read was discarded as junk
    bench
        .host
        .write(Register::Errors as u32, TransportErrors::all().bits())
        .unwrap();
    let done = bench.run(ATA_CMD_READ_DMA_EXT, 0, 1, 0);
    assert_eq!(done.status, ATA_SR_DRDY);
    assert!(bench.host.transport().errors().is_empty());
}

#[test]
fn reset_abandons_stalled_write_and_resets_device() {
    let mut disk = vec![0u8; DISK_SECTORS * 512];
    let mut memory = vec![0u8; 0x1000];
    let mut bench = Bench::new(LinkConfig::new(), &mut disk, &mut memory);

    // The engine faults on the source buffer, so the Data FIS never fills
    bench.setup(0, 8, 0x800);
    bench
        .host
        .write(Register::Command as u32, u32::from(ATA_CMD_WRITE_DMA_EXT))
        .unwrap();
    for _ in 0..2000 {
        bench.tick();
    }
    assert!(bench.host.transport().errors().contains(TransportErrors::MM2S));
    assert_eq!(bench.host.transport().state(), TransportState::DmaTxData);

    bench.host.reset();
    assert!(!bench.host.transport().is_idle());
    bench.settle();
    assert_eq!(bench.device.stats().resets, 1);

    bench
        .host
        .write(Register::Errors as u32, TransportErrors::all().bits())
        .unwrap();
    let done = bench.run(ATA_CMD_WRITE_DMA_EXT, 0, 1, 0);
    assert_eq!(done.status, ATA_SR_DRDY);
    assert_eq!(done.bytes, 512);
}
