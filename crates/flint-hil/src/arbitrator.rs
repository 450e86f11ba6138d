//! Command arbiter: fetches submission entries under round-robin or
//! weighted round-robin, hands them to the subsystem, and posts
//! completions back to the host.

use std::collections::{HashMap, VecDeque};

use flint_core::{Engine, EventId, Tick};
use tracing::{debug, trace};

use crate::dma::{DmaEngine, HostInterface};
use crate::nvme::{CqEntry, SqEntry, Status, CQ_ENTRY_SIZE, SQ_ENTRY_SIZE};
use crate::queue::{CompQueue, QueuePriority, SubQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    RoundRobin,
    WeightedRoundRobin,
}

#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    /// Fetch cycle period in ticks.
    pub period: Tick,
    /// Internal dispatch buffer depth.
    pub internal_queue_size: u32,
    /// Zero-based weighted-round-robin burst budgets.
    pub hpw: u16,
    pub mpw: u16,
    pub lpw: u16,
    pub max_sq: u16,
    pub max_cq: u16,
}

/// One fetched submission entry, tracked until its completion is posted.
#[derive(Debug, Clone)]
pub struct SqContext {
    pub entry: SqEntry,
    pub sq_id: u16,
    pub cq_id: u16,
    /// SQ head after this entry was consumed, reported to the host.
    pub sq_head: u16,
    pub use_sgl: bool,
    pub aborted: bool,
    pub dispatched: bool,
}

impl SqContext {
    pub fn command_id(&self) -> u16 {
        self.entry.command_id()
    }

    pub fn key(&self) -> u32 {
        command_key(self.sq_id, self.command_id())
    }
}

pub fn command_key(sq_id: u16, command_id: u16) -> u32 {
    (u32::from(sq_id) << 16) | u32::from(command_id)
}

fn save_context(w: &mut impl std::io::Write, ctx: &SqContext) -> std::io::Result<()> {
    use flint_core::checkpoint::{write_bool, write_u16};

    w.write_all(&ctx.entry.0)?;
    write_u16(w, ctx.sq_id)?;
    write_u16(w, ctx.cq_id)?;
    write_u16(w, ctx.sq_head)?;
    write_bool(w, ctx.use_sgl)?;
    write_bool(w, ctx.aborted)?;
    write_bool(w, ctx.dispatched)
}

fn restore_context(r: &mut impl std::io::Read) -> std::io::Result<SqContext> {
    use flint_core::checkpoint::{read_bool, read_u16};

    let mut raw = [0u8; 64];
    r.read_exact(&mut raw)?;

    Ok(SqContext {
        entry: SqEntry(raw),
        sq_id: read_u16(r)?,
        cq_id: read_u16(r)?,
        sq_head: read_u16(r)?,
        use_sgl: read_bool(r)?,
        aborted: read_bool(r)?,
        dispatched: read_bool(r)?,
    })
}

struct PendingFetch {
    sq_id: u16,
    sq_head: u16,
    buf: [u8; 64],
}

/// Events the arbiter needs the machine to route back to it.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterEvents {
    /// Periodic fetch cycle.
    pub work: EventId,
    /// A submission-entry DMA read finished (data = fetch id).
    pub collect_done: EventId,
    /// Request queue refilled; subsystem should dispatch.
    pub submit: EventId,
    /// A completion-entry DMA write finished (data = cq id).
    pub completion_done: EventId,
    /// All in-flight commands drained after a reserved shutdown.
    pub shutdown: EventId,
}

pub struct Arbitrator {
    cfg: ArbiterConfig,
    mode: Arbitration,
    events: ArbiterEvents,
    sqs: Vec<Option<SubQueue>>,
    cqs: Vec<Option<CompQueue>>,
    request_queue: VecDeque<SqContext>,
    inflight: HashMap<u32, SqContext>,
    pending_fetches: HashMap<u64, PendingFetch>,
    next_fetch_id: u64,
    collect_requested: u32,
    collect_completed: u32,
    /// Rotating scan starts so weighted classes stay fair across cycles.
    next_start: [usize; 3],
    run: bool,
    collecting: bool,
    shutdown_reserved: bool,
}

impl Arbitrator {
    pub fn new(cfg: ArbiterConfig, events: ArbiterEvents) -> Self {
        Self {
            sqs: (0..cfg.max_sq).map(|_| None).collect(),
            cqs: (0..cfg.max_cq).map(|_| None).collect(),
            cfg,
            mode: Arbitration::RoundRobin,
            events,
            request_queue: VecDeque::new(),
            inflight: HashMap::new(),
            pending_fetches: HashMap::new(),
            next_fetch_id: 0,
            collect_requested: 0,
            collect_completed: 0,
            next_start: [0; 3],
            run: false,
            collecting: false,
            shutdown_reserved: false,
        }
    }

    pub fn set_mode(&mut self, mode: Arbitration) {
        self.mode = mode;
    }

    pub fn mode(&self) -> Arbitration {
        self.mode
    }

    pub fn enable<E: Copy>(&mut self, engine: &mut Engine<E>, run: bool) {
        self.run = run;

        if run {
            engine.schedule_now(self.events.work, 0);
        } else {
            engine.deschedule(self.events.work, true);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.run
    }

    pub fn reserve_shutdown<E: Copy>(&mut self, engine: &mut Engine<E>) {
        self.shutdown_reserved = true;

        if self.inflight.is_empty() && self.request_queue.is_empty() {
            engine.schedule_now(self.events.shutdown, 0);
            self.shutdown_reserved = false;
        }
    }

    pub fn create_queue_pair_slots(&self) -> (usize, usize) {
        (self.sqs.len(), self.cqs.len())
    }

    pub fn install_sq(&mut self, sq: SubQueue) -> Result<(), Status> {
        let id = sq.id() as usize;

        if id >= self.sqs.len() || self.sqs[id].is_some() {
            return Err(Status::InvalidQueueIdentifier);
        }

        if self.cqs.get(sq.cq_id() as usize).map_or(true, |cq| cq.is_none()) {
            return Err(Status::InvalidQueueIdentifier);
        }

        debug!(id, cq = sq.cq_id(), "submission queue created");
        self.sqs[id] = Some(sq);
        Ok(())
    }

    pub fn install_cq(&mut self, cq: CompQueue) -> Result<(), Status> {
        let id = cq.id() as usize;

        if id >= self.cqs.len() || self.cqs[id].is_some() {
            return Err(Status::InvalidQueueIdentifier);
        }

        debug!(id, iv = cq.iv(), "completion queue created");
        self.cqs[id] = Some(cq);
        Ok(())
    }

    /// Admin queues are installed straight from the control registers and
    /// replace any previous pair.
    pub fn install_admin_queues(&mut self, sq: SubQueue, cq: CompQueue) {
        assert_eq!(sq.id(), 0);
        assert_eq!(cq.id(), 0);

        self.cqs[0] = Some(cq);
        self.sqs[0] = Some(sq);
    }

    pub fn delete_sq(&mut self, id: u16) -> Result<(), Status> {
        if id == 0 || self.sqs.get(id as usize).map_or(true, |q| q.is_none()) {
            return Err(Status::InvalidQueueIdentifier);
        }

        self.sqs[id as usize] = None;
        Ok(())
    }

    pub fn delete_cq(&mut self, id: u16) -> Result<(), Status> {
        if id == 0 || self.cqs.get(id as usize).map_or(true, |q| q.is_none()) {
            return Err(Status::InvalidQueueIdentifier);
        }

        // A CQ with submission queues still mapped to it cannot go away.
        let in_use = self
            .sqs
            .iter()
            .flatten()
            .any(|sq| sq.cq_id() == id);

        if in_use {
            return Err(Status::InvalidQueueIdentifier);
        }

        self.cqs[id as usize] = None;
        Ok(())
    }

    pub fn sq(&self, id: u16) -> Option<&SubQueue> {
        self.sqs.get(id as usize).and_then(|q| q.as_ref())
    }

    pub fn cq(&self, id: u16) -> Option<&CompQueue> {
        self.cqs.get(id as usize).and_then(|q| q.as_ref())
    }

    /// SQ tail doorbell.
    pub fn ring_sq_doorbell(&mut self, id: u16, tail: u16) -> bool {
        match self.sqs.get_mut(id as usize).and_then(|q| q.as_mut()) {
            Some(sq) => sq.set_tail(tail),
            None => false,
        }
    }

    /// CQ head doorbell. Returns a vector to deassert when the host has
    /// consumed everything.
    pub fn ring_cq_doorbell(&mut self, id: u16, head: u16) -> Option<u16> {
        let cq = self.cqs.get_mut(id as usize).and_then(|q| q.as_mut())?;

        if !cq.set_head(head) {
            return None;
        }

        (cq.item_count() == 0 && cq.interrupts_enabled()).then(|| cq.iv())
    }

    /// Route the periodic `work` event here: fetch submission entries
    /// according to the arbitration mode.
    pub fn on_work<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        host: &mut impl HostInterface,
        dma: &mut DmaEngine,
    ) {
        if !self.run || self.collecting {
            return;
        }

        if self.shutdown_reserved {
            self.run = false;
            self.request_queue.clear();

            if self.inflight.is_empty() {
                engine.schedule_now(self.events.shutdown, 0);
                self.shutdown_reserved = false;
            }

            return;
        }

        if self.request_queue.len() >= self.cfg.internal_queue_size as usize {
            engine.schedule(self.events.work, engine.now() + self.cfg.period, 0);
            return;
        }

        self.collect_requested = 0;
        self.collect_completed = 0;

        match self.mode {
            Arbitration::RoundRobin => self.collect_round_robin(engine, host, dma),
            Arbitration::WeightedRoundRobin => self.collect_weighted(engine, host, dma),
        }

        if self.collect_requested == 0 {
            engine.schedule(self.events.work, engine.now() + self.cfg.period, 0);
        } else {
            self.collecting = true;
        }
    }

    /// Route `collect_done` here; `data` is the fetch id.
    pub fn on_collect_done<E: Copy>(&mut self, engine: &mut Engine<E>, data: u64) {
        let fetch = self
            .pending_fetches
            .remove(&data)
            .expect("collect completion for an unknown fetch");

        let entry = SqEntry(fetch.buf);
        let cq_id = self
            .sq(fetch.sq_id)
            .map(|sq| sq.cq_id())
            .expect("fetched from a deleted queue");

        trace!(
            sq = fetch.sq_id,
            cid = entry.command_id(),
            opcode = entry.opcode(),
            "fetched submission entry"
        );

        self.request_queue.push_back(SqContext {
            use_sgl: entry.psdt() != 0,
            entry,
            sq_id: fetch.sq_id,
            cq_id,
            sq_head: fetch.sq_head,
            aborted: false,
            dispatched: false,
        });

        self.collect_completed += 1;

        if self.collect_completed == self.collect_requested {
            self.collecting = false;
            engine.schedule_now(self.events.submit, 0);
            engine.schedule(self.events.work, engine.now() + self.cfg.period, 0);
        }
    }

    /// Hand the next fetched entry to the subsystem, moving it into the
    /// in-flight map.
    pub fn dispatch(&mut self) -> Option<SqContext> {
        let mut ctx = self.request_queue.pop_front()?;

        ctx.dispatched = true;
        self.inflight.insert(ctx.key(), ctx.clone());
        Some(ctx)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Mark an in-flight command aborted. Returns false when the command
    /// already completed (or never existed).
    pub fn abort(&mut self, sq_id: u16, command_id: u16) -> bool {
        match self.inflight.get_mut(&command_key(sq_id, command_id)) {
            Some(ctx) => {
                ctx.aborted = true;
                true
            }
            None => false,
        }
    }

    /// Post the completion for a dispatched command: write the CQ entry
    /// and, once its DMA finishes, raise the queue's interrupt vector.
    ///
    /// # Panics
    ///
    /// Completing a command that is not in flight (including completing
    /// the same command twice) is fatal.
    pub fn complete<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        host: &mut impl HostInterface,
        dma: &mut DmaEngine,
        key: u32,
        result: u32,
        mut status: Status,
    ) {
        let ctx = self
            .inflight
            .remove(&key)
            .unwrap_or_else(|| panic!("completion of command {key:#x} that is not in flight"));

        // Aborted too late to stop: surface the abort to the host.
        if ctx.aborted && status == Status::Success {
            status = Status::CommandAbortRequested;
        }

        let cq = self.cqs[ctx.cq_id as usize]
            .as_mut()
            .expect("completion to a deleted queue");
        let (slot, phase) = cq.push_slot();

        let entry = CqEntry {
            result,
            sq_head: ctx.sq_head,
            sq_id: ctx.sq_id,
            command_id: ctx.command_id(),
            status,
        };

        trace!(
            sq = ctx.sq_id,
            cid = ctx.command_id(),
            ?status,
            "posting completion"
        );

        dma.write(
            host,
            engine,
            cq.base(),
            u64::from(slot) * CQ_ENTRY_SIZE,
            CQ_ENTRY_SIZE as u32,
            Some(&entry.to_bytes(phase)),
            self.events.completion_done,
            u64::from(ctx.cq_id),
        );

        if self.shutdown_reserved && self.inflight.is_empty() {
            engine.schedule_now(self.events.shutdown, 0);
            self.shutdown_reserved = false;
        }
    }

    /// Route `completion_done` here; returns the vector to assert, if the
    /// queue has interrupts enabled.
    pub fn on_completion_done(&mut self, data: u64) -> Option<u16> {
        let cq = self.cqs[data as usize].as_ref()?;

        cq.interrupts_enabled().then(|| cq.iv())
    }

    /// Serialize queues, ring indices, and every fetched-but-unfinished
    /// command.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u32, write_u64, write_u8};

        write_u8(
            w,
            match self.mode {
                Arbitration::RoundRobin => 0,
                Arbitration::WeightedRoundRobin => 1,
            },
        )?;
        write_bool(w, self.run)?;
        write_bool(w, self.collecting)?;
        write_bool(w, self.shutdown_reserved)?;
        write_u32(w, self.collect_requested)?;
        write_u32(w, self.collect_completed)?;
        write_u64(w, self.next_fetch_id)?;
        for start in self.next_start {
            write_u64(w, start as u64)?;
        }

        write_u64(w, self.sqs.len() as u64)?;
        for slot in &self.sqs {
            write_bool(w, slot.is_some())?;
            if let Some(sq) = slot {
                sq.save(w)?;
            }
        }

        write_u64(w, self.cqs.len() as u64)?;
        for slot in &self.cqs {
            write_bool(w, slot.is_some())?;
            if let Some(cq) = slot {
                cq.save(w)?;
            }
        }

        write_u64(w, self.request_queue.len() as u64)?;
        for ctx in &self.request_queue {
            save_context(w, ctx)?;
        }

        write_u64(w, self.inflight.len() as u64)?;
        let mut inflight: Vec<_> = self.inflight.iter().collect();
        inflight.sort_by_key(|(key, _)| **key);
        for (key, ctx) in inflight {
            write_u32(w, *key)?;
            save_context(w, ctx)?;
        }

        write_u64(w, self.pending_fetches.len() as u64)?;
        let mut fetches: Vec<_> = self.pending_fetches.iter().collect();
        fetches.sort_by_key(|(id, _)| **id);
        for (id, fetch) in fetches {
            write_u64(w, *id)?;
            write_u64(w, u64::from(fetch.sq_id))?;
            write_u64(w, u64::from(fetch.sq_head))?;
            w.write_all(&fetch.buf)?;
        }

        Ok(())
    }

    /// Restore queue and command state, then re-arm the fetch cycle and
    /// any interrupted entry fetches.
    pub fn restore<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        r: &mut impl std::io::Read,
    ) -> std::io::Result<()> {
        use flint_core::checkpoint::{
            invalid_data, read_bool, read_u32, read_u64, read_u8,
        };

        self.mode = match read_u8(r)? {
            0 => Arbitration::RoundRobin,
            1 => Arbitration::WeightedRoundRobin,
            other => return Err(invalid_data(format!("bad arbitration tag {other}"))),
        };
        self.run = read_bool(r)?;
        self.collecting = read_bool(r)?;
        self.shutdown_reserved = read_bool(r)?;
        self.collect_requested = read_u32(r)?;
        self.collect_completed = read_u32(r)?;
        self.next_fetch_id = read_u64(r)?;
        for start in &mut self.next_start {
            *start = read_u64(r)? as usize;
        }

        if read_u64(r)? != self.sqs.len() as u64 {
            return Err(invalid_data("checkpoint submission queue count mismatch"));
        }
        for slot in &mut self.sqs {
            *slot = read_bool(r)?.then(|| SubQueue::restore(r)).transpose()?;
        }

        if read_u64(r)? != self.cqs.len() as u64 {
            return Err(invalid_data("checkpoint completion queue count mismatch"));
        }
        for slot in &mut self.cqs {
            *slot = read_bool(r)?.then(|| CompQueue::restore(r)).transpose()?;
        }

        self.request_queue.clear();
        let queued = read_u64(r)?;
        for _ in 0..queued {
            let ctx = restore_context(r)?;

            self.request_queue.push_back(ctx);
        }

        self.inflight.clear();
        let inflight = read_u64(r)?;
        for _ in 0..inflight {
            let key = read_u32(r)?;
            let ctx = restore_context(r)?;

            self.inflight.insert(key, ctx);
        }

        self.pending_fetches.clear();
        let fetches = read_u64(r)?;
        for _ in 0..fetches {
            let id = read_u64(r)?;
            let sq_id = read_u64(r)? as u16;
            let sq_head = read_u64(r)? as u16;
            let mut buf = [0u8; 64];

            r.read_exact(&mut buf)?;
            self.pending_fetches.insert(id, PendingFetch { sq_id, sq_head, buf });
        }

        // Resume: drop whatever the pre-restore machine had queued, then
        // re-issue the fetch cycle and interrupted completions.
        engine.deschedule(self.events.work, true);
        engine.deschedule(self.events.collect_done, true);
        engine.deschedule(self.events.submit, true);

        let mut fetch_ids: Vec<u64> = self.pending_fetches.keys().copied().collect();
        fetch_ids.sort_unstable();
        for id in fetch_ids {
            engine.schedule_now(self.events.collect_done, id);
        }

        if !self.request_queue.is_empty() {
            engine.schedule_now(self.events.submit, 0);
        }

        if self.run {
            engine.schedule_now(self.events.work, 0);
        }

        Ok(())
    }

    fn fetch_one<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        host: &mut impl HostInterface,
        dma: &mut DmaEngine,
        qid: usize,
    ) -> bool {
        let Some(sq) = self.sqs[qid].as_mut() else {
            return false;
        };

        if sq.item_count() == 0 {
            return false;
        }

        let slot = sq.consume_head();
        let sq_head = sq.head();
        let base = sq.base();
        let sq_id = sq.id();

        let fetch_id = self.next_fetch_id;
        self.next_fetch_id += 1;

        let mut buf = [0u8; 64];
        dma.read(
            host,
            engine,
            base,
            u64::from(slot) * SQ_ENTRY_SIZE,
            SQ_ENTRY_SIZE as u32,
            Some(&mut buf),
            self.events.collect_done,
            fetch_id,
        );

        self.pending_fetches
            .insert(fetch_id, PendingFetch { sq_id, sq_head, buf });
        self.collect_requested += 1;
        true
    }

    fn collect_round_robin<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        host: &mut impl HostInterface,
        dma: &mut DmaEngine,
    ) {
        for qid in 0..self.sqs.len() {
            self.fetch_one(engine, host, dma, qid);
        }
    }

    fn collect_weighted<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        host: &mut impl HostInterface,
        dma: &mut DmaEngine,
    ) {
        // Urgent queues have no budget.
        for qid in 0..self.sqs.len() {
            if self.priority_of(qid) == Some(QueuePriority::Urgent) {
                self.fetch_one(engine, host, dma, qid);
            }
        }

        let classes = [
            (QueuePriority::High, self.cfg.hpw, 0usize),
            (QueuePriority::Medium, self.cfg.mpw, 1),
            (QueuePriority::Low, self.cfg.lpw, 2),
        ];

        for (priority, weight, class_idx) in classes {
            let budget = u32::from(weight) + 1;
            let mut served = 0u32;
            let start = self.next_start[class_idx];
            let count = self.sqs.len();

            for offset in 0..count {
                let qid = (start + offset) % count;

                if self.priority_of(qid) != Some(priority) {
                    continue;
                }

                if self.fetch_one(engine, host, dma, qid) {
                    served += 1;

                    if served >= budget {
                        // Resume after this queue next cycle.
                        self.next_start[class_idx] = (qid + 1) % count;
                        break;
                    }
                }
            }

            if served < budget {
                self.next_start[class_idx] = 0;
            }
        }
    }

    fn priority_of(&self, qid: usize) -> Option<QueuePriority> {
        self.sqs[qid].as_ref().map(|sq| sq.priority())
    }
}
