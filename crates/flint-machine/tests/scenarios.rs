//! End-to-end scenarios through the full stack: register writes, admin
//! and NVM commands over host-resident rings, down to NAND timing.

use flint_core::{SimConfig, Tick};
use flint_hil::nvme::reg;
use flint_machine::{HostMemory, Ssd};
use flint_pal::{PalOp, PalPhase, TimingTable};

const ASQ: u64 = 0x1000;
const ACQ: u64 = 0x2000;
const IO_SQ: u64 = 0x10000;
const IO_CQ: u64 = 0x20000;
const DATA: u64 = 0x100000;

const QUEUE_ENTRIES: u16 = 64;

fn config(extra: &str) -> SimConfig {
    let base = "
        [ssd]
        NANDType = 0
        NumChannel = 1
        NumPackage = 1
        NumDie = 1
        NumPlane = 1
        NumBlock = 64
        NumPage = 64
        SizePage = 4096

        [cpu]
        HILCore = 0
        ICLCore = 0
        FTLCore = 0

        [ftl]
        FTLOP = 0.25
        FTLGCThreshold = 0.0

        [icl]
        EnableReadCache = 0
        EnableWriteCache = 0

        [nvme]
        WorkInterval = 1000000
        LBASize = 4096
    ";

    SimConfig::from_str(&format!("{base}\n{extra}")).unwrap()
}

struct Tester {
    ssd: Ssd,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
    admin_tail: u16,
    admin_head: u16,
    next_cid: u16,
}

impl Tester {
    fn new(cfg: &SimConfig) -> Self {
        // A free host bus isolates NAND timing in the assertions.
        let host = HostMemory::with_packet_latency(16 << 20, 0);
        let mut ssd = Ssd::with_host(cfg, host);

        // Admin queue pair + enable.
        ssd.mmio_write(reg::AQA, 4, 0x003f_003f);
        ssd.mmio_write(reg::ASQ, 8, ASQ);
        ssd.mmio_write(reg::ACQ, 8, ACQ);
        ssd.mmio_write(reg::CC, 4, 1);
        assert_eq!(ssd.mmio_read(reg::CSTS, 4) & 1, 1, "controller not ready");

        let mut tester = Self {
            ssd,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true,
            admin_tail: 0,
            admin_head: 0,
            next_cid: 1,
        };

        tester.create_io_queues();
        tester
    }

    fn create_io_queues(&mut self) {
        // IO CQ 1 (IEN, PC) then IO SQ 1 (high priority).
        let mut cmd = [0u8; 64];
        cmd[0] = 0x05;
        cmd[2..4].copy_from_slice(&0xA1u16.to_le_bytes());
        cmd[24..32].copy_from_slice(&IO_CQ.to_le_bytes());
        cmd[40..44].copy_from_slice(&((u32::from(QUEUE_ENTRIES) - 1) << 16 | 1).to_le_bytes());
        cmd[44..48].copy_from_slice(&((1u32 << 16) | 0b11).to_le_bytes());
        let (_, status) = self.admin(cmd);
        assert_eq!(status & !1, 0, "create io cq failed");

        let mut cmd = [0u8; 64];
        cmd[0] = 0x01;
        cmd[2..4].copy_from_slice(&0xA2u16.to_le_bytes());
        cmd[24..32].copy_from_slice(&IO_SQ.to_le_bytes());
        cmd[40..44].copy_from_slice(&((u32::from(QUEUE_ENTRIES) - 1) << 16 | 1).to_le_bytes());
        cmd[44..48].copy_from_slice(&((1u32 << 16) | (1 << 1) | 1).to_le_bytes());
        let (_, status) = self.admin(cmd);
        assert_eq!(status & !1, 0, "create io sq failed");
    }

    /// Submit one admin command and wait for its completion.
    fn admin(&mut self, cmd: [u8; 64]) -> (u32, u16) {
        let slot = self.admin_tail;

        self.ssd.host.write(ASQ + u64::from(slot) * 64, &cmd);
        self.admin_tail = (self.admin_tail + 1) % QUEUE_ENTRIES;
        self.ssd.mmio_write(0x1000, 4, u64::from(self.admin_tail));

        let (result, status) = self.wait_admin_cqe();

        self.admin_head = (self.admin_head + 1) % QUEUE_ENTRIES;
        self.ssd.mmio_write(0x1004, 4, u64::from(self.admin_head));
        (result, status)
    }

    fn wait_admin_cqe(&mut self) -> (u32, u16) {
        let slot = self.admin_head;
        let addr = ACQ + u64::from(slot) * 16;

        for _ in 0..10_000 {
            self.ssd.run_for(1_000_000);

            let cqe = self.ssd.host.read(addr, 16);
            let dw3 = u32::from_le_bytes(cqe[12..16].try_into().unwrap());

            if (dw3 >> 16) & 1 == 1 {
                let result = u32::from_le_bytes(cqe[0..4].try_into().unwrap());

                // Clear the slot so a later wrap is unambiguous.
                self.ssd.host.write(addr, &[0u8; 16]);
                return (result, (dw3 >> 16) as u16);
            }
        }

        panic!("admin completion never arrived");
    }

    /// Queue one IO command without waiting.
    fn submit_io(&mut self, opcode: u8, slba: u64, nlb_zero_based: u16, prp1: u64) -> u16 {
        let cid = self.next_cid;
        self.next_cid += 1;

        let mut cmd = [0u8; 64];

        cmd[0] = opcode;
        cmd[2..4].copy_from_slice(&cid.to_le_bytes());
        cmd[4..8].copy_from_slice(&1u32.to_le_bytes());
        cmd[24..32].copy_from_slice(&prp1.to_le_bytes());
        cmd[40..44].copy_from_slice(&(slba as u32).to_le_bytes());
        cmd[44..48].copy_from_slice(&((slba >> 32) as u32).to_le_bytes());
        cmd[48..52].copy_from_slice(&u32::from(nlb_zero_based).to_le_bytes());

        let slot = self.sq_tail;
        self.ssd.host.write(IO_SQ + u64::from(slot) * 64, &cmd);
        self.sq_tail = (self.sq_tail + 1) % QUEUE_ENTRIES;
        self.ssd.mmio_write(0x1000 + 2 * 4, 4, u64::from(self.sq_tail));

        cid
    }

    /// Run until the next IO completion appears; returns
    /// `(cid, status sans phase, completion tick)`.
    fn wait_io_cqe(&mut self) -> (u16, u16, Tick) {
        let slot = self.cq_head;
        let addr = IO_CQ + u64::from(slot) * 16;

        for _ in 0..200_000 {
            self.ssd.run_for(500_000);

            let cqe = self.ssd.host.read(addr, 16);
            let dw3 = u32::from_le_bytes(cqe[12..16].try_into().unwrap());

            if (dw3 >> 16) & 1 == u32::from(self.cq_phase) {
                let cid = (dw3 & 0xFFFF) as u16;
                let status = ((dw3 >> 16) as u16) & !1;
                let now = self.ssd.now();

                self.cq_head = (self.cq_head + 1) % QUEUE_ENTRIES;
                if self.cq_head == 0 {
                    self.cq_phase = !self.cq_phase;
                }
                self.ssd.mmio_write(0x1000 + (2 * 1 + 1) * 4, 4, u64::from(self.cq_head));

                return (cid, status, now);
            }
        }

        panic!("io completion never arrived");
    }
}

fn write_phase_ticks(cfg: &SimConfig) -> Tick {
    let table = TimingTable::new(
        cfg.geometry.nand_type,
        &cfg.nand,
        cfg.geometry.page_size_bytes,
    );

    table.latency(0, PalOp::Write, PalPhase::Dma0)
        + table.latency(0, PalOp::Write, PalPhase::Mem)
        + table.latency(0, PalOp::Write, PalPhase::Dma1)
}

#[test]
fn sequential_writes_step_by_nand_latency() {
    let cfg = config("");
    let step = write_phase_ticks(&cfg);
    let mut tester = Tester::new(&cfg);

    // Queue depth 1: each write is submitted when the previous completes.
    let mut completions = Vec::new();

    for lpn in 0..16u64 {
        let cid = tester.submit_io(0x01, lpn, 0, DATA);
        let (done_cid, status, tick) = tester.wait_io_cqe();

        assert_eq!(done_cid, cid);
        assert_eq!(status, 0, "write {lpn} failed");
        completions.push(tick);
    }

    // Each command costs one full DMA0+MEM+DMA1 pass plus bounded
    // arbitration overhead (fetch cadence + poll granularity).
    let slack = 5_000_000;

    for pair in completions.windows(2) {
        let delta = pair[1] - pair[0];

        assert!(
            delta + 2_000_000 >= step && delta <= step + slack,
            "inter-completion delta {delta} outside [{step} - 2us, {step} + {slack}]"
        );
    }

    assert_eq!(
        tester.ssd.subsystem().pal().stats().count(PalOp::Write),
        16
    );
}

#[test]
fn read_of_unwritten_lpn_completes_without_media_access() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    tester.submit_io(0x02, 7, 0, DATA);
    let (_, status, _) = tester.wait_io_cqe();

    // Deallocated or unwritten logical block: SCT 2, SC 0x87.
    assert_eq!(status >> 9, 2);
    assert_eq!((status >> 1) & 0xFF, 0x87);

    let stats = tester.ssd.subsystem().pal().stats();
    assert_eq!(stats.count(PalOp::Read), 0);
    assert_eq!(stats.count(PalOp::Write), 0);
}

#[test]
fn written_lpn_reads_back_with_success() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    tester.submit_io(0x01, 3, 0, DATA);
    let (_, status, _) = tester.wait_io_cqe();
    assert_eq!(status, 0);

    tester.submit_io(0x02, 3, 0, DATA);
    let (_, status, _) = tester.wait_io_cqe();
    assert_eq!(status, 0);

    let stats = tester.ssd.subsystem().pal().stats();
    assert_eq!(stats.count(PalOp::Read), 1);
}

#[test]
fn overwrites_past_threshold_trigger_collection() {
    let cfg = config(
        "
        [ssd]
        NumChannel = 2
        NumPackage = 2
        NumBlock = 4
        NumPage = 4

        [ftl]
        FTLOP = 0.25
        FTLGCThreshold = 0.2
        GCReclaimBlock = 1
        ",
    );
    let mut tester = Tester::new(&cfg);

    // 16 superblocks of 4 pages, 12 logical blocks => 48 LPNs.
    let logical = tester.ssd.subsystem().ftl().logical_pages();
    assert_eq!(logical, 48);

    for lpn in 0..logical {
        tester.submit_io(0x01, lpn, 0, DATA);
        let (_, status, _) = tester.wait_io_cqe();
        assert_eq!(status, 0);
    }

    assert_eq!(
        tester.ssd.subsystem().pal().stats().count(PalOp::Erase),
        0,
        "no collection during the initial fill"
    );

    for lpn in 0..4 {
        tester.submit_io(0x01, lpn, 0, DATA);
        let (_, status, _) = tester.wait_io_cqe();
        assert_eq!(status, 0);
    }

    let ftl = tester.ssd.subsystem().ftl();
    let erases = tester.ssd.subsystem().pal().stats().count(PalOp::Erase);

    assert!(erases >= 1, "collection must have reclaimed a victim");
    assert!(
        (0..ftl.total_blocks()).any(|id| {
            ftl.block(id).map(|b| b.erase_count()) == Some(1)
        }),
        "some victim must carry one erase"
    );

    // Every LPN still resolves.
    for lpn in 0..logical {
        assert!(ftl.mapping(lpn).is_some(), "lpn {lpn} lost by collection");
    }
}

#[test]
fn identify_controller_lands_in_host_memory() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    let buf = 0x80000u64;
    let mut cmd = [0u8; 64];

    cmd[0] = 0x06;
    cmd[2..4].copy_from_slice(&0xB0u16.to_le_bytes());
    cmd[24..32].copy_from_slice(&buf.to_le_bytes());
    cmd[40..44].copy_from_slice(&1u32.to_le_bytes()); // CNS = controller

    let (_, status) = tester.admin(cmd);
    assert_eq!(status & !1, 0);

    let data = tester.ssd.host.read(buf, 4096);
    assert_eq!(&data[24..29], b"Flint");
    assert_eq!(data[512], 0x66); // SQES
    assert_eq!(data[513], 0x44); // CQES
    assert_eq!(
        u32::from_le_bytes(data[516..520].try_into().unwrap()),
        1,
        "one namespace"
    );
}

#[test]
fn dataset_management_deallocates_written_range() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    for lpn in 0..4 {
        tester.submit_io(0x01, lpn, 0, DATA);
        tester.wait_io_cqe();
    }

    // One DSM range: 4 blocks from LBA 0, AD attribute set.
    let ranges = 0x90000u64;
    let mut range = [0u8; 16];
    range[4..8].copy_from_slice(&4u32.to_le_bytes());
    range[8..16].copy_from_slice(&0u64.to_le_bytes());
    tester.ssd.host.write(ranges, &range);

    let cid = tester.next_cid;
    tester.next_cid += 1;

    let mut cmd = [0u8; 64];
    cmd[0] = 0x09;
    cmd[2..4].copy_from_slice(&cid.to_le_bytes());
    cmd[4..8].copy_from_slice(&1u32.to_le_bytes());
    cmd[24..32].copy_from_slice(&ranges.to_le_bytes());
    cmd[40..44].copy_from_slice(&0u32.to_le_bytes()); // NR = 1 (zero-based)
    cmd[44..48].copy_from_slice(&(1u32 << 2).to_le_bytes()); // AD

    let slot = tester.sq_tail;
    tester.ssd.host.write(IO_SQ + u64::from(slot) * 64, &cmd);
    tester.sq_tail = (tester.sq_tail + 1) % QUEUE_ENTRIES;
    tester.ssd.mmio_write(0x1000 + 2 * 4, 4, u64::from(tester.sq_tail));

    let (_, status, _) = tester.wait_io_cqe();
    assert_eq!(status, 0);

    // Trimmed LPNs read back as deallocated.
    tester.submit_io(0x02, 0, 0, DATA);
    let (_, status, _) = tester.wait_io_cqe();
    assert_eq!((status >> 1) & 0xFF, 0x87);
}

#[test]
fn checkpoint_roundtrip_preserves_observable_state() {
    let cfg = config(
        "
        [icl]
        EnableReadCache = 1
        EnableWriteCache = 1
        CacheSize = 16
        EntrySize = 2
        ",
    );
    let mut tester = Tester::new(&cfg);

    for lpn in 0..8 {
        tester.submit_io(0x01, lpn, 0, DATA);
        tester.wait_io_cqe();
    }

    // Flush so the written data reaches the media before the snapshot.
    tester.submit_io(0x00, 0, 0, 0);
    let (_, status, _) = tester.wait_io_cqe();
    assert_eq!(status, 0);

    let mut image = Vec::new();
    flint_machine::snapshot::save(&tester.ssd, &cfg.geometry, &mut image).unwrap();

    // A fresh machine knows nothing...
    let mut restored = Tester::new(&cfg);
    assert!(restored.ssd.subsystem().ftl().mapping(3).is_none());

    // ...until the checkpoint is loaded.
    flint_machine::snapshot::restore(&mut restored.ssd, &cfg.geometry, &mut image.as_slice())
        .unwrap();

    // The restored device resumes mid-stream, so the host-side driver
    // state must match the one that took the snapshot.
    restored.sq_tail = tester.sq_tail;
    restored.cq_head = tester.cq_head;
    restored.cq_phase = tester.cq_phase;
    restored.admin_tail = tester.admin_tail;
    restored.admin_head = tester.admin_head;
    restored.next_cid = tester.next_cid;

    // Translation layer parity.
    for lpn in 0..8 {
        assert_eq!(
            restored.ssd.subsystem().ftl().mapping(lpn),
            tester.ssd.subsystem().ftl().mapping(lpn)
        );
    }
    assert_eq!(
        restored.ssd.subsystem().ftl().free_block_count(),
        tester.ssd.subsystem().ftl().free_block_count()
    );

    // Cache, PAL statistics, timeline ledgers, and controller registers.
    assert_eq!(
        restored.ssd.subsystem().cache().stats(),
        tester.ssd.subsystem().cache().stats()
    );
    for op in [PalOp::Read, PalOp::Write, PalOp::Erase] {
        assert_eq!(
            restored.ssd.subsystem().pal().stats().count(op),
            tester.ssd.subsystem().pal().stats().count(op),
            "{op:?} count diverged"
        );
    }
    assert_eq!(
        restored.ssd.subsystem().pal().stats().total_energy_pj(),
        tester.ssd.subsystem().pal().stats().total_energy_pj()
    );
    for ch in 0..cfg.geometry.channels {
        assert_eq!(
            restored.ssd.subsystem().pal().scheduler().channel_slots(ch),
            tester.ssd.subsystem().pal().scheduler().channel_slots(ch)
        );
    }
    assert_eq!(
        restored.ssd.mmio_read(reg::CSTS, 4),
        tester.ssd.mmio_read(reg::CSTS, 4)
    );

    restored.submit_io(0x02, 3, 0, DATA);
    let (_, status, _) = restored.wait_io_cqe();
    assert_eq!(status, 0, "restored mapping must serve reads");
}

#[test]
fn checkpoint_rejects_mismatched_geometry() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    tester.submit_io(0x01, 0, 0, DATA);
    tester.wait_io_cqe();

    let mut image = Vec::new();
    flint_machine::snapshot::save(&tester.ssd, &cfg.geometry, &mut image).unwrap();

    let other_cfg = config("[ssd]\nNumBlock = 32\n");
    let mut other = Tester::new(&other_cfg);

    let err = flint_machine::snapshot::restore(
        &mut other.ssd,
        &other_cfg.geometry,
        &mut image.as_slice(),
    )
    .unwrap_err();

    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn coalesced_completions_share_one_interrupt() {
    let cfg = config("");
    let mut tester = Tester::new(&cfg);

    // Feature 0x08: aggregation threshold 2 (zero-based 1), window 2 ms
    // (20 units of 100 us) so both completions land inside it.
    let mut cmd = [0u8; 64];
    cmd[0] = 0x09;
    cmd[2..4].copy_from_slice(&0xC0u16.to_le_bytes());
    cmd[40..44].copy_from_slice(&0x08u32.to_le_bytes());
    cmd[44..48].copy_from_slice(&(1u32 | (20 << 8)).to_le_bytes());
    let (_, status) = tester.admin(cmd);
    assert_eq!(status & !1, 0);

    // Feature 0x09: CD set, coalesce vector 1.
    let mut cmd = [0u8; 64];
    cmd[0] = 0x09;
    cmd[2..4].copy_from_slice(&0xC1u16.to_le_bytes());
    cmd[40..44].copy_from_slice(&0x09u32.to_le_bytes());
    cmd[44..48].copy_from_slice(&(1u32 | (1 << 16)).to_le_bytes());
    let (_, status) = tester.admin(cmd);
    assert_eq!(status & !1, 0);

    let before = tester.ssd.irq.assert_count(1);

    // Two writes back to back: their completions coalesce into a single
    // vector-1 assertion.
    tester.submit_io(0x01, 0, 0, DATA);
    tester.submit_io(0x01, 1, 0, DATA);
    tester.wait_io_cqe();
    tester.wait_io_cqe();

    let asserts = tester.ssd.irq.assert_count(1) - before;
    assert_eq!(asserts, 1, "two completions must share one interrupt");
}
