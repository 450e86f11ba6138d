//! Full-SSD assembly: one controller, one subsystem, the firmware CPU
//! model, and the event pump that routes every firing to its component.

use flint_core::cpu::Cpu;
use flint_core::{Engine, EventId, SimConfig, Tick};
use flint_hil::arbitrator::{ArbiterConfig, ArbiterEvents};
use flint_hil::controller::NvmeController;
use flint_hil::subsystem::Subsystem;
use flint_pal::{FLUSH_PERIOD, FLUSH_RANGE};
use tracing::info;

use crate::host::{HostMemory, IrqLog};

/// Dispatch tags for every event in the machine. Event payload data is an
/// arena index whose meaning depends on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdEvent {
    /// A firmware core retired a job.
    CpuJobDone,
    /// Arbiter fetch cycle.
    ArbiterWork,
    /// A submission-entry fetch DMA finished.
    CollectDone,
    /// The arbiter refilled its dispatch queue.
    Submit,
    /// A completion-entry DMA write finished.
    CompletionDone,
    /// Reserved shutdown drained.
    Shutdown,
    /// Interrupt coalescing window expired.
    CoalesceTimer,
    /// A command advanced one phase.
    CommandStep,
    /// Periodic PAL timeline compaction.
    PalFlush,
}

pub struct Ssd {
    pub engine: Engine<SsdEvent>,
    pub host: HostMemory,
    pub irq: IrqLog,
    pub(crate) controller: NvmeController,
    pub(crate) subsystem: Subsystem,
    cpu: Cpu,
    flush: EventId,
}

impl Ssd {
    pub fn new(cfg: &SimConfig) -> Self {
        Self::with_host(cfg, HostMemory::new(64 << 20))
    }

    pub fn with_host(cfg: &SimConfig, host: HostMemory) -> Self {
        let mut engine = Engine::new();

        let job_done = engine.create_event(SsdEvent::CpuJobDone, "cpu job done");
        let events = ArbiterEvents {
            work: engine.create_event(SsdEvent::ArbiterWork, "arbiter work"),
            collect_done: engine.create_event(SsdEvent::CollectDone, "arbiter collect done"),
            submit: engine.create_event(SsdEvent::Submit, "arbiter submit"),
            completion_done: engine.create_event(SsdEvent::CompletionDone, "completion posted"),
            shutdown: engine.create_event(SsdEvent::Shutdown, "shutdown drained"),
        };
        let coalesce_timer = engine.create_event(SsdEvent::CoalesceTimer, "coalesce timer");
        let step = engine.create_event(SsdEvent::CommandStep, "command step");
        let flush = engine.create_event(SsdEvent::PalFlush, "pal flush");

        let arbiter_cfg = ArbiterConfig {
            period: cfg.nvme.work_interval,
            internal_queue_size: cfg.nvme.request_queue_size,
            hpw: cfg.nvme.wrr_high - 1,
            mpw: cfg.nvme.wrr_medium - 1,
            lpw: 0,
            max_sq: cfg.nvme.max_sq,
            max_cq: cfg.nvme.max_cq,
        };

        // The scheduler keeps its ledgers bounded by periodic compaction.
        engine.schedule(flush, FLUSH_PERIOD, 0);

        info!(
            channels = cfg.geometry.channels,
            dies = cfg.geometry.total_dies(),
            blocks = cfg.geometry.total_superblocks(),
            "ssd assembled"
        );

        Self {
            controller: NvmeController::new(arbiter_cfg, events, coalesce_timer),
            subsystem: Subsystem::new(cfg, step),
            cpu: Cpu::new(&cfg.cpu, job_done),
            engine,
            host,
            irq: IrqLog::default(),
            flush,
        }
    }

    pub fn now(&self) -> Tick {
        self.engine.now()
    }

    pub fn controller(&self) -> &NvmeController {
        &self.controller
    }

    pub fn subsystem(&self) -> &Subsystem {
        &self.subsystem
    }

    pub fn subsystem_mut(&mut self) -> &mut Subsystem {
        &mut self.subsystem
    }

    pub fn mmio_read(&self, offset: u64, size: u8) -> u64 {
        self.controller.mmio_read(offset, size)
    }

    pub fn mmio_write(&mut self, offset: u64, size: u8, value: u64) {
        self.controller
            .mmio_write(&mut self.engine, &mut self.irq, offset, size, value);
    }

    /// Run the event loop until `limit` (inclusive); returns the number of
    /// firings dispatched.
    pub fn run_until(&mut self, limit: Tick) -> u64 {
        let mut fired = 0;

        while let Some(event) = self.engine.advance(limit) {
            fired += 1;
            self.dispatch(event.tag, event.data);
        }

        fired
    }

    pub fn run_for(&mut self, window: Tick) -> u64 {
        self.run_until(self.engine.now() + window)
    }

    fn dispatch(&mut self, tag: SsdEvent, data: u64) {
        match tag {
            SsdEvent::CpuJobDone => self.cpu.on_job_done(&mut self.engine, data),

            SsdEvent::ArbiterWork => {
                let NvmeController {
                    arbitrator, dma, ..
                } = &mut self.controller;

                arbitrator.on_work(&mut self.engine, &mut self.host, dma);
            }

            SsdEvent::CollectDone => self
                .controller
                .arbitrator
                .on_collect_done(&mut self.engine, data),

            SsdEvent::Submit => self.subsystem.on_submit(
                &mut self.engine,
                &mut self.cpu,
                &mut self.controller,
                &mut self.host,
            ),

            SsdEvent::CompletionDone => {
                if let Some(iv) = self.controller.arbitrator.on_completion_done(data) {
                    self.controller.coalescer.post_interrupt(
                        &mut self.engine,
                        &mut self.irq,
                        iv,
                        true,
                    );
                }
            }

            SsdEvent::Shutdown => self.controller.on_shutdown_complete(),

            SsdEvent::CoalesceTimer => self.controller.coalescer.on_timer(&mut self.irq, data),

            SsdEvent::CommandStep => self.subsystem.on_step(
                &mut self.engine,
                &mut self.controller,
                &mut self.host,
                data,
            ),

            SsdEvent::PalFlush => {
                let now = self.engine.now();

                self.subsystem.flush_pal(now.saturating_sub(FLUSH_RANGE));
                self.engine.schedule(self.flush, now + FLUSH_PERIOD, 0);
            }
        }
    }

    /// End-of-run statistics, flattened to `(name, value)` pairs.
    pub fn report(&self) -> Vec<(String, f64)> {
        let mut out = self.subsystem.pal().stats().report();
        let cache = self.subsystem.cache().stats();

        let channels = self.subsystem.pal().channel_active_time();
        let dies = self.subsystem.pal().die_active_time();

        out.push(("pal.channel.active.min".into(), channels.min));
        out.push(("pal.channel.active.avg".into(), channels.average));
        out.push(("pal.channel.active.max".into(), channels.max));
        out.push(("pal.die.active.min".into(), dies.min));
        out.push(("pal.die.active.avg".into(), dies.average));
        out.push(("pal.die.active.max".into(), dies.max));

        out.push(("icl.read_hits".into(), cache.read_hits as f64));
        out.push(("icl.read_misses".into(), cache.read_misses as f64));
        out.push(("icl.write_hits".into(), cache.write_hits as f64));
        out.push(("icl.write_misses".into(), cache.write_misses as f64));
        out.push(("icl.writebacks".into(), cache.writebacks as f64));
        out.push((
            "ftl.free_blocks".into(),
            self.subsystem.ftl().free_block_count() as f64,
        ));
        out
    }
}
