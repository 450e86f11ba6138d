//! `flint <config.ini>` — build the simulated SSD from a configuration
//! file, drive a short sequential workload through the NVMe front door,
//! and print the accumulated statistics.

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use flint_core::SimConfig;
use flint_machine::{HostMemory, Ssd};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ASQ: u64 = 0x1000;
const ACQ: u64 = 0x2000;
const IO_SQ: u64 = 0x10000;
const IO_CQ: u64 = 0x20000;
const DATA: u64 = 0x100000;
const QUEUE_ENTRIES: u16 = 64;

/// Pages touched by the built-in workload.
const WORKLOAD_PAGES: u64 = 256;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("flint: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);

    let Some(path) = args.next() else {
        bail!("usage: flint <config.ini>");
    };

    if args.next().is_some() {
        bail!("usage: flint <config.ini>");
    }

    let cfg = SimConfig::from_path(&path).with_context(|| format!("loading {path}"))?;
    let mut driver = Driver::new(&cfg)?;

    info!(
        channels = cfg.geometry.channels,
        dies = cfg.geometry.total_dies(),
        capacity_bytes =
            cfg.geometry.total_superblocks() * u64::from(cfg.geometry.pages_per_block)
                * cfg.geometry.superpage_size_bytes(),
        "simulation starting"
    );

    let pages = WORKLOAD_PAGES.min(driver.capacity_lbas());

    for lba in 0..pages {
        driver.io(0x01, lba)?; // write
    }

    for lba in 0..pages {
        driver.io(0x02, lba)?; // read back
    }

    let simulated_ns = driver.ssd.now() / 1000;
    println!("simulated {pages} writes + {pages} reads in {simulated_ns} ns");

    for (name, value) in driver.ssd.report() {
        println!("{name:<40} {value}");
    }

    Ok(())
}

/// Minimal host-side NVMe driver: admin queue pair, one IO queue pair,
/// queue depth 1.
struct Driver {
    ssd: Ssd,
    lba_size: u32,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
    admin_tail: u16,
    admin_head: u16,
    next_cid: u16,
}

impl Driver {
    fn new(cfg: &SimConfig) -> Result<Self> {
        let mut ssd = Ssd::with_host(cfg, HostMemory::new(64 << 20));

        ssd.mmio_write(0x24, 4, 0x003f_003f); // AQA
        ssd.mmio_write(0x28, 8, ASQ);
        ssd.mmio_write(0x30, 8, ACQ);
        ssd.mmio_write(0x14, 4, 1); // CC.EN

        if ssd.mmio_read(0x1C, 4) & 1 == 0 {
            bail!("controller did not come ready");
        }

        let mut driver = Self {
            ssd,
            lba_size: cfg.nvme.lba_size,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true,
            admin_tail: 0,
            admin_head: 0,
            next_cid: 1,
        };

        // IO CQ 1 then IO SQ 1.
        let mut cmd = [0u8; 64];
        cmd[0] = 0x05;
        cmd[2..4].copy_from_slice(&1u16.to_le_bytes());
        cmd[24..32].copy_from_slice(&IO_CQ.to_le_bytes());
        cmd[40..44].copy_from_slice(&((u32::from(QUEUE_ENTRIES) - 1) << 16 | 1).to_le_bytes());
        cmd[44..48].copy_from_slice(&((1u32 << 16) | 0b11).to_le_bytes());
        driver.admin(cmd)?;

        let mut cmd = [0u8; 64];
        cmd[0] = 0x01;
        cmd[2..4].copy_from_slice(&2u16.to_le_bytes());
        cmd[24..32].copy_from_slice(&IO_SQ.to_le_bytes());
        cmd[40..44].copy_from_slice(&((u32::from(QUEUE_ENTRIES) - 1) << 16 | 1).to_le_bytes());
        cmd[44..48].copy_from_slice(&((1u32 << 16) | (1 << 1) | 1).to_le_bytes());
        driver.admin(cmd)?;

        Ok(driver)
    }

    fn capacity_lbas(&self) -> u64 {
        self.ssd.subsystem().capacity_lbas()
    }

    fn admin(&mut self, cmd: [u8; 64]) -> Result<()> {
        let slot = self.admin_tail;

        self.ssd.host.write(ASQ + u64::from(slot) * 64, &cmd);
        self.admin_tail = (self.admin_tail + 1) % QUEUE_ENTRIES;
        self.ssd.mmio_write(0x1000, 4, u64::from(self.admin_tail));

        let addr = ACQ + u64::from(self.admin_head) * 16;

        for _ in 0..1_000_000 {
            self.ssd.run_for(1_000_000);

            let cqe = self.ssd.host.read(addr, 16);
            let dw3 = u32::from_le_bytes(cqe[12..16].try_into().unwrap());

            if (dw3 >> 16) & 1 == 1 {
                self.ssd.host.write(addr, &[0u8; 16]);
                self.admin_head = (self.admin_head + 1) % QUEUE_ENTRIES;
                self.ssd.mmio_write(0x1004, 4, u64::from(self.admin_head));

                if dw3 >> 17 != 0 {
                    bail!("admin command failed with status {:#x}", dw3 >> 17);
                }

                return Ok(());
            }
        }

        bail!("admin command timed out");
    }

    fn io(&mut self, opcode: u8, lba: u64) -> Result<()> {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1).max(1);

        let mut cmd = [0u8; 64];

        cmd[0] = opcode;
        cmd[2..4].copy_from_slice(&cid.to_le_bytes());
        cmd[4..8].copy_from_slice(&1u32.to_le_bytes());
        cmd[24..32].copy_from_slice(&DATA.to_le_bytes());
        cmd[32..40].copy_from_slice(&(DATA + u64::from(self.lba_size)).to_le_bytes());
        cmd[40..44].copy_from_slice(&(lba as u32).to_le_bytes());
        cmd[44..48].copy_from_slice(&((lba >> 32) as u32).to_le_bytes());

        let slot = self.sq_tail;
        self.ssd.host.write(IO_SQ + u64::from(slot) * 64, &cmd);
        self.sq_tail = (self.sq_tail + 1) % QUEUE_ENTRIES;
        self.ssd.mmio_write(0x1008, 4, u64::from(self.sq_tail));

        let addr = IO_CQ + u64::from(self.cq_head) * 16;

        for _ in 0..10_000_000 {
            self.ssd.run_for(1_000_000);

            let cqe = self.ssd.host.read(addr, 16);
            let dw3 = u32::from_le_bytes(cqe[12..16].try_into().unwrap());

            if (dw3 >> 16) & 1 == u32::from(self.cq_phase) {
                self.cq_head = (self.cq_head + 1) % QUEUE_ENTRIES;
                if self.cq_head == 0 {
                    self.cq_phase = !self.cq_phase;
                }
                self.ssd.mmio_write(0x100C, 4, u64::from(self.cq_head));

                let status = (dw3 >> 17) as u16;

                if status != 0 {
                    bail!("io command {opcode:#x} at lba {lba} failed with status {status:#x}");
                }

                return Ok(());
            }
        }

        bail!("io command timed out");
    }
}
