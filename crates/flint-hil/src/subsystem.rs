//! Subsystem glue: routes dispatched submission entries to their command
//! handlers and drives each command through its firmware-CPU, DMA, and
//! NAND phases.
//!
//! Every long-running step hands the engine a `step` event carrying the
//! command's state id; the machine routes it back into [`Subsystem::on_step`].

use std::collections::HashMap;

use flint_core::cpu::{Cpu, FirmwareFunc};
use flint_core::{Engine, EventId, SimConfig, Tick};
use flint_ftl::{LpnRange, PageMapping};
use flint_icl::{Cache, ReadOutcome};
use flint_pal::{Pal, TimingTable};
use tracing::{debug, trace, warn};

use crate::controller::NvmeController;
use crate::convert::LbaConverter;
use crate::dma::{DmaTag, HostInterface};
use crate::nvme::{AdminOpcode, NvmOpcode, SqEntry, Status};
use crate::queue::{CompQueue, QueuePriority, SubQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Flush,
    DatasetManagement,
    Format,
    /// Identify / Get Log Page: a controller-built payload DMA'd out.
    AdminPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AfterCpu,
    AfterDmaInit,
    AfterData,
    AfterNand,
}

struct CommandState {
    key: u32,
    kind: Kind,
    phase: Phase,
    slpn: u64,
    nlp: u64,
    transfer_len: u32,
    use_sgl: bool,
    prp1: u64,
    prp2: u64,
    tag: Option<DmaTag>,
    status: Status,
    payload: Vec<u8>,
}

pub struct Subsystem {
    cache: Cache,
    ftl: PageMapping,
    pal: Pal,
    lba: LbaConverter,
    lba_size: u32,
    lpn_size: u32,
    max_queue_entries: u16,
    /// Commands in flight through the phase machine.
    states: HashMap<u64, CommandState>,
    next_state_id: u64,
    /// Phase-step event; firings carry the state id.
    step: EventId,
    /// Interrupt coalescing feature storage (Set/Get Features 0x08).
    coalesce_time: u8,
    coalesce_threshold: u8,
}

impl Subsystem {
    pub fn new(cfg: &SimConfig, step: EventId) -> Self {
        let geometry = cfg.geometry.clone();
        let lpn_size = geometry.page_size_bytes * geometry.superblock_degree;
        let timing = TimingTable::new(geometry.nand_type, &cfg.nand, geometry.page_size_bytes);

        let mut ftl = PageMapping::new(geometry.clone(), cfg.ftl);
        ftl.warmup();

        Self {
            cache: Cache::new(cfg.icl, lpn_size),
            ftl,
            pal: Pal::new(geometry, timing),
            lba: LbaConverter::new(lpn_size, cfg.nvme.lba_size),
            lba_size: cfg.nvme.lba_size,
            lpn_size,
            max_queue_entries: 1024,
            states: HashMap::new(),
            next_state_id: 0,
            step,
            coalesce_time: 0,
            coalesce_threshold: 0,
        }
    }

    pub fn pal(&self) -> &Pal {
        &self.pal
    }

    pub fn ftl(&self) -> &PageMapping {
        &self.ftl
    }

    pub fn ftl_mut(&mut self) -> &mut PageMapping {
        &mut self.ftl
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn pal_mut(&mut self) -> &mut Pal {
        &mut self.pal
    }

    /// Periodic timeline compaction, driven by the machine's flush event.
    pub fn flush_pal(&mut self, cut: Tick) {
        self.pal.flush_time_slots(cut);
    }

    /// Serialize the glue state: feature storage and the per-command phase
    /// machine. The cache, FTL and PAL write their own records.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u32, write_u64, write_u8};

        write_u64(w, self.next_state_id)?;
        write_u8(w, self.coalesce_time)?;
        write_u8(w, self.coalesce_threshold)?;

        write_u64(w, self.states.len() as u64)?;
        let mut states: Vec<_> = self.states.iter().collect();
        states.sort_by_key(|(id, _)| **id);

        for (id, state) in states {
            write_u64(w, *id)?;
            write_u32(w, state.key)?;
            write_u8(w, kind_tag(state.kind))?;
            write_u8(w, phase_tag(state.phase))?;
            write_u64(w, state.slpn)?;
            write_u64(w, state.nlp)?;
            write_u32(w, state.transfer_len)?;
            write_bool(w, state.use_sgl)?;
            write_u64(w, state.prp1)?;
            write_u64(w, state.prp2)?;
            write_bool(w, state.tag.is_some())?;
            write_u64(w, state.tag.unwrap_or(0))?;
            write_u8(w, status_tag(state.status))?;
            write_u64(w, state.payload.len() as u64)?;
            w.write_all(&state.payload)?;
        }

        Ok(())
    }

    /// Restore the glue state and reschedule a phase step for every
    /// interrupted command so it runs to completion.
    pub fn restore<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        r: &mut impl std::io::Read,
    ) -> std::io::Result<()> {
        use flint_core::checkpoint::{read_bool, read_u32, read_u64, read_u8};

        self.next_state_id = read_u64(r)?;
        self.coalesce_time = read_u8(r)?;
        self.coalesce_threshold = read_u8(r)?;

        self.states.clear();
        engine.deschedule(self.step, true);

        let count = read_u64(r)?;
        for _ in 0..count {
            let id = read_u64(r)?;
            let key = read_u32(r)?;
            let kind = kind_from_tag(read_u8(r)?)?;
            let phase = phase_from_tag(read_u8(r)?)?;
            let slpn = read_u64(r)?;
            let nlp = read_u64(r)?;
            let transfer_len = read_u32(r)?;
            let use_sgl = read_bool(r)?;
            let prp1 = read_u64(r)?;
            let prp2 = read_u64(r)?;
            let has_tag = read_bool(r)?;
            let tag = read_u64(r)?;
            let status = status_from_tag(read_u8(r)?)?;
            let payload_len = read_u64(r)?;
            let mut payload = vec![0u8; payload_len as usize];

            r.read_exact(&mut payload)?;

            self.states.insert(
                id,
                CommandState {
                    key,
                    kind,
                    phase,
                    slpn,
                    nlp,
                    transfer_len,
                    use_sgl,
                    prp1,
                    prp2,
                    tag: has_tag.then_some(tag),
                    status,
                    payload,
                },
            );

            engine.schedule_now(self.step, id);
        }

        Ok(())
    }

    /// Host-visible capacity in logical blocks.
    pub fn capacity_lbas(&self) -> u64 {
        self.ftl.logical_pages() * u64::from(self.lpn_size / self.lba_size)
    }

    /// Route the arbiter's `submit` event here: drain the dispatch queue.
    pub fn on_submit<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        cpu: &mut Cpu,
        ctrl: &mut NvmeController,
        host: &mut H,
    ) {
        while let Some(ctx) = ctrl.arbitrator.dispatch() {
            self.start_command(engine, cpu, ctrl, host, ctx.key(), ctx.entry, ctx.sq_id);
        }
    }

    /// Route the `step` event here; `data` is the state id.
    pub fn on_step<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        ctrl: &mut NvmeController,
        host: &mut H,
        data: u64,
    ) {
        let mut state = self
            .states
            .remove(&data)
            .expect("phase step for an unknown command");

        match (state.kind, state.phase) {
            (Kind::Read | Kind::Write | Kind::DatasetManagement | Kind::AdminPayload, Phase::AfterCpu) => {
                match self.init_dma(engine, ctrl, host, &mut state, data) {
                    Ok(()) => {
                        self.states.insert(data, state);
                    }
                    Err(status) => {
                        state.status = status;
                        self.finish(engine, ctrl, host, state);
                    }
                }
            }

            (Kind::Flush, Phase::AfterCpu) => {
                let mut tick = engine.now();

                self.cache.flush_all(&mut self.ftl, &mut self.pal, &mut tick);

                state.phase = Phase::AfterNand;
                self.states.insert(data, state);
                engine.schedule(self.step, tick, data);
            }

            (Kind::Format, Phase::AfterCpu) => {
                let mut tick = engine.now();
                let range = LpnRange {
                    slpn: 0,
                    nlp: self.ftl.logical_pages(),
                };

                self.ftl.format(range, &mut self.pal, &mut tick);

                state.phase = Phase::AfterNand;
                self.states.insert(data, state);
                engine.schedule(self.step, tick, data);
            }

            (Kind::Read, Phase::AfterDmaInit) => {
                // Media first; data moves to the host afterwards.
                let finish = self.run_nand_reads(engine.now(), &mut state);

                state.phase = Phase::AfterNand;
                self.states.insert(data, state);
                engine.schedule(self.step, finish, data);
            }

            (Kind::Read, Phase::AfterNand) => {
                if state.status != Status::Success {
                    // Nothing to transfer for an unwritten range.
                    self.finish(engine, ctrl, host, state);
                    return;
                }

                let tag = state.tag.expect("read without a DMA tag");

                ctrl.dma.write(
                    host,
                    engine,
                    tag,
                    0,
                    state.transfer_len,
                    None,
                    self.step,
                    data,
                );
                state.phase = Phase::AfterData;
                self.states.insert(data, state);
            }

            (Kind::Read, Phase::AfterData) => {
                self.finish(engine, ctrl, host, state);
            }

            (Kind::Write, Phase::AfterDmaInit) => {
                // Pull the data in, then program it.
                let tag = state.tag.expect("write without a DMA tag");

                ctrl.dma.read(
                    host,
                    engine,
                    tag,
                    0,
                    state.transfer_len,
                    None,
                    self.step,
                    data,
                );
                state.phase = Phase::AfterData;
                self.states.insert(data, state);
            }

            (Kind::Write, Phase::AfterData) => {
                let finish = self.run_nand_writes(engine.now(), &state);

                state.phase = Phase::AfterNand;
                self.states.insert(data, state);
                engine.schedule(self.step, finish, data);
            }

            (Kind::Write | Kind::Flush | Kind::Format, Phase::AfterNand) => {
                self.finish(engine, ctrl, host, state);
            }

            (Kind::DatasetManagement, Phase::AfterDmaInit) => {
                let tag = state.tag.expect("dsm without a DMA tag");
                let mut buf = vec![0u8; state.transfer_len as usize];

                ctrl.dma.read(
                    host,
                    engine,
                    tag,
                    0,
                    state.transfer_len,
                    Some(&mut buf),
                    self.step,
                    data,
                );

                state.payload = buf;
                state.phase = Phase::AfterData;
                self.states.insert(data, state);
            }

            (Kind::DatasetManagement, Phase::AfterData) => {
                let mut tick = engine.now();
                let payload = std::mem::take(&mut state.payload);

                for range in payload.chunks_exact(16) {
                    let nlb = u32::from_le_bytes(range[4..8].try_into().unwrap());
                    let slba = u64::from_le_bytes(range[8..16].try_into().unwrap());

                    if nlb == 0 {
                        continue;
                    }

                    let info = self.lba.to_lpn_range(slba, nlb);

                    for lpn in info.slpn..info.slpn + info.nlp {
                        self.cache.trim(lpn, &mut self.ftl, &mut tick);
                    }
                }

                self.finish(engine, ctrl, host, state);
            }

            (Kind::AdminPayload, Phase::AfterDmaInit) => {
                let tag = state.tag.expect("payload command without a DMA tag");
                let payload = std::mem::take(&mut state.payload);

                ctrl.dma.write(
                    host,
                    engine,
                    tag,
                    0,
                    payload.len() as u32,
                    Some(&payload),
                    self.step,
                    data,
                );
                state.phase = Phase::AfterData;
                self.states.insert(data, state);
            }

            (Kind::AdminPayload, Phase::AfterData) => {
                self.finish(engine, ctrl, host, state);
            }

            (kind, phase) => {
                unreachable!("command {:?} stepped in impossible phase {:?}", kind, phase)
            }
        }
    }

    fn start_command<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        cpu: &mut Cpu,
        ctrl: &mut NvmeController,
        host: &mut H,
        key: u32,
        entry: SqEntry,
        sq_id: u16,
    ) {
        if sq_id == 0 {
            self.start_admin_command(engine, cpu, ctrl, host, key, entry);
        } else {
            self.start_nvm_command(engine, cpu, ctrl, host, key, entry);
        }
    }

    fn start_nvm_command<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        cpu: &mut Cpu,
        ctrl: &mut NvmeController,
        host: &mut H,
        key: u32,
        entry: SqEntry,
    ) {
        let Some(opcode) = NvmOpcode::from_u8(entry.opcode()) else {
            warn!(opcode = entry.opcode(), "unknown NVM opcode");
            self.complete_now(engine, ctrl, host, key, 0, Status::InvalidOpcode);
            return;
        };

        if entry.nsid() != 1 {
            self.complete_now(engine, ctrl, host, key, 0, Status::InvalidNamespace);
            return;
        }

        let (kind, func) = match opcode {
            NvmOpcode::Read => (Kind::Read, FirmwareFunc::HilRead),
            NvmOpcode::Write => (Kind::Write, FirmwareFunc::HilWrite),
            NvmOpcode::Flush => (Kind::Flush, FirmwareFunc::HilFlush),
            NvmOpcode::DatasetManagement => (Kind::DatasetManagement, FirmwareFunc::HilTrim),
        };

        let mut state = CommandState {
            key,
            kind,
            phase: Phase::AfterCpu,
            slpn: 0,
            nlp: 0,
            transfer_len: 0,
            use_sgl: entry.psdt() != 0,
            prp1: entry.prp1(),
            prp2: entry.prp2(),
            tag: None,
            status: Status::Success,
            payload: Vec::new(),
        };

        match kind {
            Kind::Read | Kind::Write => {
                let slba = entry.slba();
                let nlb = entry.nlb() + 1;

                if slba + u64::from(nlb) > self.capacity_lbas() {
                    self.complete_now(engine, ctrl, host, key, 0, Status::LbaOutOfRange);
                    return;
                }

                let info = self.lba.to_lpn_range(slba, nlb);

                state.slpn = info.slpn;
                state.nlp = info.nlp;
                state.transfer_len = nlb * self.lba_size;

                trace!(
                    op = ?opcode,
                    slba,
                    nlb,
                    slpn = info.slpn,
                    nlp = info.nlp,
                    "nvm command"
                );
            }
            Kind::DatasetManagement => {
                // AD (deallocate) is the only attribute we act on.
                if entry.cdw11() & (1 << 2) == 0 {
                    self.complete_now(engine, ctrl, host, key, 0, Status::Success);
                    return;
                }

                let ranges = (entry.cdw10() & 0xFF) + 1;

                state.transfer_len = ranges * 16;
            }
            _ => {}
        }

        let id = self.alloc_state(state);

        cpu.execute(engine, func, self.step, id, 0);
    }

    fn start_admin_command<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        cpu: &mut Cpu,
        ctrl: &mut NvmeController,
        host: &mut H,
        key: u32,
        entry: SqEntry,
    ) {
        let Some(opcode) = AdminOpcode::from_u8(entry.opcode()) else {
            warn!(opcode = entry.opcode(), "unknown admin opcode");
            self.complete_now(engine, ctrl, host, key, 0, Status::InvalidOpcode);
            return;
        };

        debug!(?opcode, "admin command");

        match opcode {
            AdminOpcode::CreateIoCq => {
                let status = self.create_io_cq(ctrl, &entry);
                self.complete_now(engine, ctrl, host, key, 0, status);
            }
            AdminOpcode::CreateIoSq => {
                let status = self.create_io_sq(ctrl, &entry);
                self.complete_now(engine, ctrl, host, key, 0, status);
            }
            AdminOpcode::DeleteIoSq => {
                let status = ctrl
                    .arbitrator
                    .delete_sq(entry.cdw10() as u16)
                    .err()
                    .unwrap_or(Status::Success);
                self.complete_now(engine, ctrl, host, key, 0, status);
            }
            AdminOpcode::DeleteIoCq => {
                let status = ctrl
                    .arbitrator
                    .delete_cq(entry.cdw10() as u16)
                    .err()
                    .unwrap_or(Status::Success);
                self.complete_now(engine, ctrl, host, key, 0, status);
            }
            AdminOpcode::Abort => {
                let sq_id = entry.cdw10() as u16;
                let cid = (entry.cdw10() >> 16) as u16;
                let aborted = ctrl.arbitrator.abort(sq_id, cid);

                // Result bit 0 set means the command was NOT aborted.
                let result = u32::from(!aborted);
                self.complete_now(engine, ctrl, host, key, result, Status::Success);
            }
            AdminOpcode::SetFeatures => {
                let status = self.set_features(engine, ctrl, &entry);
                self.complete_now(engine, ctrl, host, key, 0, status);
            }
            AdminOpcode::GetFeatures => {
                let (result, status) = self.get_features(&entry);
                self.complete_now(engine, ctrl, host, key, result, status);
            }
            AdminOpcode::Identify => {
                let payload = match entry.cdw10() & 0xFF {
                    0x00 => self.identify_namespace(),
                    0x01 => self.identify_controller(ctrl),
                    _ => {
                        self.complete_now(engine, ctrl, host, key, 0, Status::InvalidField);
                        return;
                    }
                };

                let state = CommandState {
                    key,
                    kind: Kind::AdminPayload,
                    phase: Phase::AfterCpu,
                    slpn: 0,
                    nlp: 0,
                    transfer_len: payload.len() as u32,
                    use_sgl: entry.psdt() != 0,
                    prp1: entry.prp1(),
                    prp2: entry.prp2(),
                    tag: None,
                    status: Status::Success,
                    payload,
                };
                let id = self.alloc_state(state);

                cpu.execute(engine, FirmwareFunc::CollectEntry, self.step, id, 0);
            }
            AdminOpcode::GetLogPage => {
                // Pages are not tracked yet; return zeroes of the asked size.
                let dwords = (entry.cdw10() >> 16) as usize + 1;
                let state = CommandState {
                    key,
                    kind: Kind::AdminPayload,
                    phase: Phase::AfterCpu,
                    slpn: 0,
                    nlp: 0,
                    transfer_len: (dwords * 4) as u32,
                    use_sgl: entry.psdt() != 0,
                    prp1: entry.prp1(),
                    prp2: entry.prp2(),
                    tag: None,
                    status: Status::Success,
                    payload: vec![0u8; dwords * 4],
                };
                let id = self.alloc_state(state);

                cpu.execute(engine, FirmwareFunc::CollectEntry, self.step, id, 0);
            }
            AdminOpcode::FormatNvm => {
                if entry.nsid() != 1 && entry.nsid() != u32::MAX {
                    self.complete_now(engine, ctrl, host, key, 0, Status::InvalidNamespace);
                    return;
                }

                let state = CommandState {
                    key,
                    kind: Kind::Format,
                    phase: Phase::AfterCpu,
                    slpn: 0,
                    nlp: 0,
                    transfer_len: 0,
                    use_sgl: false,
                    prp1: 0,
                    prp2: 0,
                    tag: None,
                    status: Status::Success,
                    payload: Vec::new(),
                };
                let id = self.alloc_state(state);

                cpu.execute(engine, FirmwareFunc::HilFormat, self.step, id, 0);
            }
        }
    }

    fn init_dma<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        ctrl: &mut NvmeController,
        host: &mut H,
        state: &mut CommandState,
        id: u64,
    ) -> Result<(), Status> {
        let result = if state.use_sgl {
            ctrl.dma
                .init_sgl(host, engine, state.prp1, state.prp2, self.step, id)
        } else {
            ctrl.dma.init_prp(
                host,
                engine,
                state.prp1,
                state.prp2,
                state.transfer_len,
                self.step,
                id,
            )
        };

        match result {
            Ok(tag) => {
                state.tag = Some(tag);
                state.phase = Phase::AfterDmaInit;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "descriptor parse failed");
                Err(Status::InvalidField)
            }
        }
    }

    fn run_nand_reads(&mut self, now: Tick, state: &mut CommandState) -> Tick {
        let mut finish = now;

        // Pages of one command fan out across the array; the host sees
        // the slowest one.
        for lpn in state.slpn..state.slpn + state.nlp {
            let mut tick = now;

            match self.cache.read(lpn, &mut self.ftl, &mut self.pal, &mut tick) {
                ReadOutcome::Unwritten => {
                    state.status = Status::DeallocatedOrUnwrittenLogicalBlock;
                }
                ReadOutcome::Hit | ReadOutcome::Miss => {}
            }

            finish = finish.max(tick);
        }

        finish
    }

    fn run_nand_writes(&mut self, now: Tick, state: &CommandState) -> Tick {
        let mut finish = now;

        for lpn in state.slpn..state.slpn + state.nlp {
            let mut tick = now;

            self.cache.write(lpn, &mut self.ftl, &mut self.pal, &mut tick);
            finish = finish.max(tick);
        }

        finish
    }

    fn create_io_cq(&mut self, ctrl: &mut NvmeController, entry: &SqEntry) -> Status {
        let qid = entry.cdw10() as u16;
        let size = (entry.cdw10() >> 16) as u16 + 1;
        let flags = entry.cdw11();
        let iv = (entry.cdw11() >> 16) as u16;

        // Physically contiguous rings only (PC must be set).
        if flags & 1 == 0 {
            return Status::InvalidField;
        }

        if size < 2 || size > self.max_queue_entries {
            return Status::InvalidQueueSize;
        }

        let tag = ctrl
            .dma
            .init_raw(entry.prp1(), u32::from(size) * 16);
        let cq = CompQueue::new(qid, size, iv, flags & 2 != 0, tag);

        ctrl.arbitrator.install_cq(cq).err().unwrap_or(Status::Success)
    }

    fn create_io_sq(&mut self, ctrl: &mut NvmeController, entry: &SqEntry) -> Status {
        let qid = entry.cdw10() as u16;
        let size = (entry.cdw10() >> 16) as u16 + 1;
        let flags = entry.cdw11();
        let cq_id = (entry.cdw11() >> 16) as u16;

        if flags & 1 == 0 {
            return Status::InvalidField;
        }

        if size < 2 || size > self.max_queue_entries {
            return Status::InvalidQueueSize;
        }

        let priority = match (flags >> 1) & 0b11 {
            0 => QueuePriority::Urgent,
            1 => QueuePriority::High,
            2 => QueuePriority::Medium,
            _ => QueuePriority::Low,
        };

        let tag = ctrl
            .dma
            .init_raw(entry.prp1(), u32::from(size) * 64);
        let sq = SubQueue::new(qid, size, cq_id, priority, tag);

        ctrl.arbitrator.install_sq(sq).err().unwrap_or(Status::Success)
    }

    fn set_features<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        ctrl: &mut NvmeController,
        entry: &SqEntry,
    ) -> Status {
        match entry.cdw10() & 0xFF {
            // Interrupt coalescing: THR and TIME in 100 us units.
            0x08 => {
                self.coalesce_threshold = entry.cdw11() as u8;
                self.coalesce_time = (entry.cdw11() >> 8) as u8;
                Status::Success
            }
            // Interrupt vector configuration: CD requests coalescing.
            0x09 => {
                let iv = entry.cdw11() as u16;
                let coalesce = entry.cdw11() & (1 << 16) != 0;

                if !coalesce || self.coalesce_time == 0 {
                    ctrl.coalescer.disable(engine, iv);
                } else {
                    // THR and TIME are zero-based; TIME counts 100 us units.
                    ctrl.coalescer.enable(
                        iv,
                        u64::from(self.coalesce_time) * 100_000_000,
                        u16::from(self.coalesce_threshold) + 1,
                    );
                }

                Status::Success
            }
            // Number of queues: fixed by configuration.
            0x07 => Status::Success,
            _ => Status::InvalidField,
        }
    }

    fn get_features(&self, entry: &SqEntry) -> (u32, Status) {
        match entry.cdw10() & 0xFF {
            0x08 => (
                u32::from(self.coalesce_threshold) | (u32::from(self.coalesce_time) << 8),
                Status::Success,
            ),
            0x07 => {
                let (sqs, cqs) = (15u32, 15u32);

                (((cqs) << 16) | sqs, Status::Success)
            }
            _ => (0, Status::InvalidField),
        }
    }

    fn identify_controller(&self, ctrl: &NvmeController) -> Vec<u8> {
        let _ = ctrl;
        let mut data = vec![0u8; 4096];

        data[4..24].copy_from_slice(b"FLINT0000           ");
        data[24..40].copy_from_slice(b"Flint NAND Simul");
        // SQES/CQES: 64- and 16-byte entries, fixed.
        data[512] = 0x66;
        data[513] = 0x44;
        // One namespace.
        data[516..520].copy_from_slice(&1u32.to_le_bytes());
        data
    }

    fn identify_namespace(&self) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        let blocks = self.capacity_lbas();

        data[0..8].copy_from_slice(&blocks.to_le_bytes()); // NSZE
        data[8..16].copy_from_slice(&blocks.to_le_bytes()); // NCAP
        data[16..24].copy_from_slice(&blocks.to_le_bytes()); // NUSE
        // One LBA format: LBADS = log2(lba size), no metadata.
        data[128 + 2] = self.lba_size.trailing_zeros() as u8;
        data
    }

    fn alloc_state(&mut self, state: CommandState) -> u64 {
        let id = self.next_state_id;

        self.next_state_id += 1;
        self.states.insert(id, state);
        id
    }

    fn complete_now<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        ctrl: &mut NvmeController,
        host: &mut H,
        key: u32,
        result: u32,
        status: Status,
    ) {
        let NvmeController {
            arbitrator, dma, ..
        } = ctrl;

        arbitrator.complete(engine, host, dma, key, result, status);
    }

    fn finish<H: HostInterface, E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        ctrl: &mut NvmeController,
        host: &mut H,
        state: CommandState,
    ) {
        if let Some(tag) = state.tag {
            ctrl.dma.free(tag);
        }

        self.complete_now(engine, ctrl, host, state.key, 0, state.status);
    }
}

fn kind_tag(kind: Kind) -> u8 {
    match kind {
        Kind::Read => 0,
        Kind::Write => 1,
        Kind::Flush => 2,
        Kind::DatasetManagement => 3,
        Kind::Format => 4,
        Kind::AdminPayload => 5,
    }
}

fn kind_from_tag(tag: u8) -> std::io::Result<Kind> {
    Ok(match tag {
        0 => Kind::Read,
        1 => Kind::Write,
        2 => Kind::Flush,
        3 => Kind::DatasetManagement,
        4 => Kind::Format,
        5 => Kind::AdminPayload,
        other => {
            return Err(flint_core::checkpoint::invalid_data(format!(
                "bad command kind tag {other}"
            )))
        }
    })
}

fn phase_tag(phase: Phase) -> u8 {
    match phase {
        Phase::AfterCpu => 0,
        Phase::AfterDmaInit => 1,
        Phase::AfterData => 2,
        Phase::AfterNand => 3,
    }
}

fn phase_from_tag(tag: u8) -> std::io::Result<Phase> {
    Ok(match tag {
        0 => Phase::AfterCpu,
        1 => Phase::AfterDmaInit,
        2 => Phase::AfterData,
        3 => Phase::AfterNand,
        other => {
            return Err(flint_core::checkpoint::invalid_data(format!(
                "bad command phase tag {other}"
            )))
        }
    })
}

fn status_tag(status: Status) -> u8 {
    match status {
        Status::Success => 0,
        Status::InvalidOpcode => 1,
        Status::InvalidField => 2,
        Status::CommandAbortRequested => 3,
        Status::InvalidNamespace => 4,
        Status::LbaOutOfRange => 5,
        Status::DeallocatedOrUnwrittenLogicalBlock => 6,
        Status::InvalidQueueIdentifier => 7,
        Status::InvalidQueueSize => 8,
        Status::AbortCommandLimitExceeded => 9,
    }
}

fn status_from_tag(tag: u8) -> std::io::Result<Status> {
    Ok(match tag {
        0 => Status::Success,
        1 => Status::InvalidOpcode,
        2 => Status::InvalidField,
        3 => Status::CommandAbortRequested,
        4 => Status::InvalidNamespace,
        5 => Status::LbaOutOfRange,
        6 => Status::DeallocatedOrUnwrittenLogicalBlock,
        7 => Status::InvalidQueueIdentifier,
        8 => Status::InvalidQueueSize,
        9 => Status::AbortCommandLimitExceeded,
        other => {
            return Err(flint_core::checkpoint::invalid_data(format!(
                "bad status tag {other}"
            )))
        }
    })
}
