//! NVMe controller register file and doorbell decoding.
//!
//! The register block is the host's only way in: admin queues come from
//! AQA/ASQ/ACQ + CC.EN, everything else from admin commands fetched off
//! those queues.

use flint_core::{Engine, EventId};
use tracing::{debug, warn};

use crate::arbitrator::{ArbiterConfig, ArbiterEvents, Arbitration, Arbitrator};
use crate::coalescer::{InterruptCoalescer, InterruptSink};
use crate::dma::DmaEngine;
use crate::nvme::{self, reg, ControllerConfig, Csts};
use crate::queue::{CompQueue, QueuePriority, SubQueue};

pub struct NvmeController {
    pub arbitrator: Arbitrator,
    pub dma: DmaEngine,
    pub coalescer: InterruptCoalescer,
    cc: ControllerConfig,
    csts: Csts,
    shst: u32,
    int_mask: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
}

impl NvmeController {
    pub fn new(cfg: ArbiterConfig, events: ArbiterEvents, coalesce_timer: EventId) -> Self {
        Self {
            arbitrator: Arbitrator::new(cfg, events),
            dma: DmaEngine::new(),
            coalescer: InterruptCoalescer::new(coalesce_timer),
            cc: ControllerConfig(0),
            csts: Csts::empty(),
            shst: nvme::SHST_NORMAL,
            int_mask: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
        }
    }

    /// Controller capabilities: MQES from config, 4 KiB minimum page
    /// size, WRR supported, DSTRD = 0, NVM command set.
    pub fn capabilities(&self) -> u64 {
        let mqes = 1023u64;
        let ams_wrr = 1u64 << 17;
        let to = 20u64 << 24;
        let css_nvm = 1u64 << 37;

        mqes | ams_wrr | to | css_nvm
    }

    pub fn is_ready(&self) -> bool {
        self.csts.contains(Csts::READY)
    }

    pub fn mem_page_size(&self) -> u64 {
        self.cc.mem_page_size()
    }

    pub fn mmio_read(&self, offset: u64, _size: u8) -> u64 {
        match offset {
            reg::CAP => self.capabilities(),
            reg::VS => 0x0001_0400, // NVMe 1.4
            reg::INTMS | reg::INTMC => u64::from(self.int_mask),
            reg::CC => u64::from(self.cc.0),
            reg::CSTS => {
                u64::from(self.csts.bits() | (self.shst << nvme::CSTS_SHST_SHIFT))
            }
            reg::AQA => u64::from(self.aqa),
            reg::ASQ => self.asq,
            reg::ACQ => self.acq,
            _ => 0,
        }
    }

    pub fn mmio_write<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        sink: &mut impl InterruptSink,
        offset: u64,
        _size: u8,
        value: u64,
    ) {
        match offset {
            reg::INTMS => self.int_mask |= value as u32,
            reg::INTMC => self.int_mask &= !(value as u32),
            reg::CC => self.write_cc(engine, value as u32),
            reg::AQA => self.aqa = value as u32,
            reg::ASQ => self.asq = value & !0xFFF,
            reg::ACQ => self.acq = value & !0xFFF,
            _ if offset >= nvme::DOORBELL_BASE => {
                self.write_doorbell(engine, sink, offset, value as u32)
            }
            _ => warn!(offset, "write to read-only or unknown register"),
        }
    }

    fn write_cc<E: Copy>(&mut self, engine: &mut Engine<E>, value: u32) {
        let old = self.cc;
        self.cc = ControllerConfig(value);

        if self.cc.enabled() && !old.enabled() {
            self.enable_controller(engine);
        } else if !self.cc.enabled() && old.enabled() {
            self.arbitrator.enable(engine, false);
            self.csts.remove(Csts::READY);
            debug!("controller disabled");
        }

        // Shutdown notification: stop fetching, drain, then report done.
        if self.cc.shn() != 0 && old.shn() == 0 {
            self.shst = nvme::SHST_IN_PROGRESS;
            self.arbitrator.reserve_shutdown(engine);
        }
    }

    fn enable_controller<E: Copy>(&mut self, engine: &mut Engine<E>) {
        // Only 4 KiB host pages are advertised (MPSMIN = MPSMAX = 0).
        if self.cc.mps() != 0 {
            warn!(mps = self.cc.mps(), "unsupported host page size");
            self.csts.insert(Csts::FATAL);
            return;
        }

        if self.asq == 0 || self.acq == 0 {
            warn!("controller enabled without admin queues");
            self.csts.insert(Csts::FATAL);
            return;
        }

        let sq_size = (self.aqa & 0xFFF) as u16 + 1;
        let cq_size = ((self.aqa >> 16) & 0xFFF) as u16 + 1;

        self.dma.set_mem_page_size(self.cc.mem_page_size());

        let sq_tag = self
            .dma
            .init_raw(self.asq, u32::from(sq_size) * nvme::SQ_ENTRY_SIZE as u32);
        let cq_tag = self
            .dma
            .init_raw(self.acq, u32::from(cq_size) * nvme::CQ_ENTRY_SIZE as u32);

        self.arbitrator.install_admin_queues(
            SubQueue::new(0, sq_size, 0, QueuePriority::Urgent, sq_tag),
            CompQueue::new(0, cq_size, 0, true, cq_tag),
        );

        self.arbitrator.set_mode(if self.cc.ams() == 1 {
            Arbitration::WeightedRoundRobin
        } else {
            Arbitration::RoundRobin
        });

        self.csts.insert(Csts::READY);
        self.arbitrator.enable(engine, true);

        debug!(sq_size, cq_size, "controller enabled");
    }

    fn write_doorbell<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        sink: &mut impl InterruptSink,
        offset: u64,
        value: u32,
    ) {
        let index = (offset - nvme::DOORBELL_BASE) / nvme::DOORBELL_STRIDE;
        let qid = (index / 2) as u16;

        if index % 2 == 0 {
            if !self.arbitrator.ring_sq_doorbell(qid, value as u16) {
                warn!(qid, value, "bad submission doorbell");
            }
        } else if let Some(iv) = self.arbitrator.ring_cq_doorbell(qid, value as u16) {
            // Host consumed the queue; let the coalescer deassert.
            self.coalescer.post_interrupt(engine, sink, iv, false);
        }
    }

    /// Shutdown drain finished (routed from the arbiter's shutdown event).
    pub fn on_shutdown_complete(&mut self) {
        self.shst = nvme::SHST_COMPLETE;
        debug!("controller shutdown complete");
    }

    /// Serialize registers, DMA tags, queues and coalescing state, in
    /// that order.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_u32, write_u64};

        write_u32(w, self.cc.0)?;
        write_u32(w, self.csts.bits())?;
        write_u32(w, self.shst)?;
        write_u32(w, self.int_mask)?;
        write_u32(w, self.aqa)?;
        write_u64(w, self.asq)?;
        write_u64(w, self.acq)?;

        self.dma.save(w)?;
        self.arbitrator.save(w)?;
        self.coalescer.save(w)
    }

    /// Restore registers and sub-components, re-arming their events.
    pub fn restore<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        r: &mut impl std::io::Read,
    ) -> std::io::Result<()> {
        use flint_core::checkpoint::{read_u32, read_u64};

        self.cc = ControllerConfig(read_u32(r)?);
        self.csts = Csts::from_bits_retain(read_u32(r)?);
        self.shst = read_u32(r)?;
        self.int_mask = read_u32(r)?;
        self.aqa = read_u32(r)?;
        self.asq = read_u64(r)?;
        self.acq = read_u64(r)?;

        self.dma.restore(r)?;
        self.arbitrator.restore(engine, r)?;
        self.coalescer.restore(engine, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        Work,
        CollectDone,
        Submit,
        CompletionDone,
        Shutdown,
        CoalesceTimer,
    }

    #[derive(Default)]
    struct NullSink;

    impl InterruptSink for NullSink {
        fn post_interrupt(&mut self, _iv: u16, _set: bool) {}
    }

    fn controller() -> (Engine<Tag>, NvmeController) {
        let mut engine = Engine::new();
        let events = ArbiterEvents {
            work: engine.create_event(Tag::Work, "work"),
            collect_done: engine.create_event(Tag::CollectDone, "collect done"),
            submit: engine.create_event(Tag::Submit, "submit"),
            completion_done: engine.create_event(Tag::CompletionDone, "completion done"),
            shutdown: engine.create_event(Tag::Shutdown, "shutdown"),
        };
        let timer = engine.create_event(Tag::CoalesceTimer, "coalesce timer");

        let cfg = ArbiterConfig {
            period: 50_000_000,
            internal_queue_size: 64,
            hpw: 1,
            mpw: 1,
            lpw: 0,
            max_sq: 16,
            max_cq: 16,
        };

        (engine, NvmeController::new(cfg, events, timer))
    }

    fn enable(engine: &mut Engine<Tag>, ctrl: &mut NvmeController) {
        let mut sink = NullSink;

        ctrl.mmio_write(engine, &mut sink, reg::AQA, 4, 0x000f_000f);
        ctrl.mmio_write(engine, &mut sink, reg::ASQ, 8, 0x10000);
        ctrl.mmio_write(engine, &mut sink, reg::ACQ, 8, 0x20000);
        ctrl.mmio_write(engine, &mut sink, reg::CC, 4, 1);
    }

    #[test]
    fn enable_brings_controller_ready() {
        let (mut engine, mut ctrl) = controller();

        assert!(!ctrl.is_ready());
        enable(&mut engine, &mut ctrl);

        assert!(ctrl.is_ready());
        assert_eq!(ctrl.mmio_read(reg::CSTS, 4) & 1, 1);
        assert!(ctrl.arbitrator.sq(0).is_some());
        assert!(ctrl.arbitrator.cq(0).is_some());
        assert!(engine.is_scheduled(1)); // work event
    }

    #[test]
    fn enable_without_admin_queues_is_fatal() {
        let (mut engine, mut ctrl) = controller();
        let mut sink = NullSink;

        ctrl.mmio_write(&mut engine, &mut sink, reg::CC, 4, 1);

        let csts = ctrl.mmio_read(reg::CSTS, 4) as u32;
        assert_eq!(csts & 1, 0);
        assert_ne!(csts & 2, 0); // CFS
    }

    #[test]
    fn unsupported_page_size_is_fatal() {
        let (mut engine, mut ctrl) = controller();
        let mut sink = NullSink;

        ctrl.mmio_write(&mut engine, &mut sink, reg::AQA, 4, 0x000f_000f);
        ctrl.mmio_write(&mut engine, &mut sink, reg::ASQ, 8, 0x10000);
        ctrl.mmio_write(&mut engine, &mut sink, reg::ACQ, 8, 0x20000);

        // MPS = 15 => 128 MiB pages.
        ctrl.mmio_write(&mut engine, &mut sink, reg::CC, 4, 1 | (15 << 7));

        let csts = ctrl.mmio_read(reg::CSTS, 4) as u32;
        assert_eq!(csts & 1, 0);
        assert_ne!(csts & 2, 0);
    }

    #[test]
    fn interrupt_mask_set_and_clear() {
        let (mut engine, mut ctrl) = controller();
        let mut sink = NullSink;

        ctrl.mmio_write(&mut engine, &mut sink, reg::INTMS, 4, 0b1010);
        assert_eq!(ctrl.mmio_read(reg::INTMS, 4), 0b1010);

        ctrl.mmio_write(&mut engine, &mut sink, reg::INTMC, 4, 0b0010);
        assert_eq!(ctrl.mmio_read(reg::INTMS, 4), 0b1000);
    }

    #[test]
    fn shutdown_reports_complete_when_idle() {
        let (mut engine, mut ctrl) = controller();

        enable(&mut engine, &mut ctrl);

        let mut sink = NullSink;
        let cc = ctrl.mmio_read(reg::CC, 4) | (1 << 14);
        ctrl.mmio_write(&mut engine, &mut sink, reg::CC, 4, cc);

        // Nothing in flight: the shutdown event is already queued.
        let mut saw_shutdown = false;
        while let Some(fired) = engine.advance(engine.now()) {
            if fired.tag == Tag::Shutdown {
                ctrl.on_shutdown_complete();
                saw_shutdown = true;
            }
        }

        assert!(saw_shutdown);
        let shst = (ctrl.mmio_read(reg::CSTS, 4) as u32 >> 2) & 0b11;
        assert_eq!(shst, nvme::SHST_COMPLETE);
    }
}
