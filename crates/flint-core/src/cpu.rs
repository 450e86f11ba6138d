//! Firmware CPU latency model.
//!
//! Every firmware function call costs deterministic ticks so simulated
//! command throughput reflects firmware-CPU bottlenecks, not just NAND
//! timing. Cores are grouped by firmware layer; each core owns a FIFO of
//! jobs whose latency is its instruction mix times the clock period.

use std::collections::VecDeque;

use crate::engine::{Engine, EventId, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreGroup {
    Hil,
    Icl,
    Ftl,
}

/// Firmware functions with a modeled instruction mix. The per-function
/// counts come from profiling the reference firmware; treat them as part of
/// the timing model, not tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFunc {
    // Host interface layer.
    HilRead,
    HilWrite,
    HilFlush,
    HilTrim,
    HilFormat,
    CollectEntry,
    PostCompletion,
    InitDma,
    // Internal cache layer.
    CacheRead,
    CacheWrite,
    CacheFlush,
    CacheTrim,
    EvictVictim,
    // Flash translation layer.
    MappingRead,
    MappingWrite,
    MappingTrim,
    SelectVictim,
    CollectGarbage,
    EraseBlock,
}

impl FirmwareFunc {
    pub fn group(self) -> CoreGroup {
        use FirmwareFunc::*;

        match self {
            HilRead | HilWrite | HilFlush | HilTrim | HilFormat | CollectEntry
            | PostCompletion | InitDma => CoreGroup::Hil,
            CacheRead | CacheWrite | CacheFlush | CacheTrim | EvictVictim => CoreGroup::Icl,
            MappingRead | MappingWrite | MappingTrim | SelectVictim | CollectGarbage
            | EraseBlock => CoreGroup::Ftl,
        }
    }
}

/// Instruction counts of one firmware function invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionMix {
    pub branch: u64,
    pub load: u64,
    pub store: u64,
    pub arithmetic: u64,
    pub floating_point: u64,
    pub other: u64,
}

impl InstructionMix {
    pub const fn new(
        branch: u64,
        load: u64,
        store: u64,
        arithmetic: u64,
        floating_point: u64,
        other: u64,
    ) -> Self {
        Self {
            branch,
            load,
            store,
            arithmetic,
            floating_point,
            other,
        }
    }

    pub fn total(&self) -> u64 {
        self.branch + self.load + self.store + self.arithmetic + self.floating_point + self.other
    }

    fn accumulate(&mut self, rhs: &InstructionMix) {
        self.branch += rhs.branch;
        self.load += rhs.load;
        self.store += rhs.store;
        self.arithmetic += rhs.arithmetic;
        self.floating_point += rhs.floating_point;
        self.other += rhs.other;
    }
}

/// Per-group instruction mixes, one cycle per instruction.
fn mix_of(func: FirmwareFunc) -> InstructionMix {
    use FirmwareFunc::*;

    match func {
        HilRead => InstructionMix::new(58, 240, 108, 433, 0, 276),
        HilWrite => InstructionMix::new(62, 255, 132, 470, 0, 290),
        HilFlush => InstructionMix::new(22, 100, 44, 150, 0, 90),
        HilTrim => InstructionMix::new(26, 108, 48, 170, 0, 100),
        HilFormat => InstructionMix::new(30, 120, 60, 200, 0, 120),
        CollectEntry => InstructionMix::new(18, 80, 32, 110, 0, 70),
        PostCompletion => InstructionMix::new(16, 70, 36, 100, 0, 60),
        InitDma => InstructionMix::new(20, 90, 40, 130, 0, 80),
        CacheRead => InstructionMix::new(34, 160, 60, 250, 0, 150),
        CacheWrite => InstructionMix::new(38, 170, 80, 270, 0, 160),
        CacheFlush => InstructionMix::new(24, 110, 52, 160, 0, 95),
        CacheTrim => InstructionMix::new(22, 100, 44, 150, 0, 90),
        EvictVictim => InstructionMix::new(30, 140, 70, 210, 0, 130),
        MappingRead => InstructionMix::new(46, 210, 90, 360, 0, 220),
        MappingWrite => InstructionMix::new(52, 230, 110, 400, 0, 240),
        MappingTrim => InstructionMix::new(28, 120, 56, 180, 0, 110),
        SelectVictim => InstructionMix::new(70, 320, 90, 520, 8, 300),
        CollectGarbage => InstructionMix::new(90, 410, 180, 680, 8, 390),
        EraseBlock => InstructionMix::new(20, 90, 44, 140, 0, 85),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuConfig {
    /// Firmware core clock in Hz.
    pub clock_hz: u64,
    pub hil_cores: u32,
    pub icl_cores: u32,
    pub ftl_cores: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            clock_hz: 400_000_000,
            hil_cores: 1,
            icl_cores: 1,
            ftl_cores: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStat {
    pub busy_ticks: Tick,
    pub jobs: u64,
    pub insts: InstructionMix,
}

struct Job {
    done: EventId,
    done_data: u64,
    mix: InstructionMix,
    latency: Tick,
    submitted: Tick,
    delay: Tick,
}

struct Core {
    queue: VecDeque<Job>,
    busy: bool,
    stat: CoreStat,
}

impl Core {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            busy: false,
            stat: CoreStat::default(),
        }
    }
}

pub struct Cpu {
    clock_hz: u64,
    job_done: EventId,
    groups: [Vec<Core>; 3],
}

fn group_index(group: CoreGroup) -> usize {
    match group {
        CoreGroup::Hil => 0,
        CoreGroup::Icl => 1,
        CoreGroup::Ftl => 2,
    }
}

fn pack(group: usize, core: usize) -> u64 {
    ((group as u64) << 32) | core as u64
}

fn unpack(data: u64) -> (usize, usize) {
    ((data >> 32) as usize, (data & 0xFFFF_FFFF) as usize)
}

impl Cpu {
    /// `job_done` is the engine event this model fires internally when a
    /// core retires a job; route it back to [`Cpu::on_job_done`].
    pub fn new(cfg: &CpuConfig, job_done: EventId) -> Self {
        let cores = |n: u32| (0..n).map(|_| Core::new()).collect::<Vec<_>>();

        Self {
            clock_hz: cfg.clock_hz,
            job_done,
            groups: [
                cores(cfg.hil_cores),
                cores(cfg.icl_cores),
                cores(cfg.ftl_cores),
            ],
        }
    }

    /// Instruction-mix latency of `func` in ticks at the configured clock.
    pub fn latency_of(&self, func: FirmwareFunc) -> Tick {
        let cycles = mix_of(func).total();

        // One cycle per instruction; clock period in picoseconds.
        cycles * 1_000_000_000_000 / self.clock_hz
    }

    /// Queue `func` on the least-busy core of its group; `done` fires with
    /// `done_data` once the core retires the job, no earlier than
    /// `submit + delay + latency`. With no cores configured for the group,
    /// the model is transparent and `done` fires immediately.
    pub fn execute<E: Copy>(
        &mut self,
        engine: &mut Engine<E>,
        func: FirmwareFunc,
        done: EventId,
        done_data: u64,
        delay: Tick,
    ) {
        let gidx = group_index(func.group());

        let Some(cidx) = self.least_busy(gidx) else {
            engine.schedule(done, engine.now() + delay, done_data);
            return;
        };

        let mix = mix_of(func);
        let latency = self.latency_of(func);
        let core = &mut self.groups[gidx][cidx];

        core.queue.push_back(Job {
            done,
            done_data,
            mix,
            latency,
            submitted: engine.now(),
            delay,
        });

        if !core.busy {
            self.start_front(engine, gidx, cidx);
        }
    }

    /// Account `func` against its group and return the latency, for callers
    /// that model the delay inline instead of queueing.
    pub fn apply_latency(&mut self, func: FirmwareFunc) -> Tick {
        let latency = self.latency_of(func);
        let gidx = group_index(func.group());

        if let Some(cidx) = self.least_busy(gidx) {
            let core = &mut self.groups[gidx][cidx];

            core.stat.busy_ticks += latency;
            core.stat.jobs += 1;
            core.stat.insts.accumulate(&mix_of(func));
        }

        latency
    }

    /// Route the `job_done` event here.
    pub fn on_job_done<E: Copy>(&mut self, engine: &mut Engine<E>, data: u64) {
        let (gidx, cidx) = unpack(data);
        let core = &mut self.groups[gidx][cidx];

        let job = core
            .queue
            .pop_front()
            .expect("job-done fired on an idle core");

        engine.schedule_now(job.done, job.done_data);

        core.stat.busy_ticks += job.latency;
        core.stat.jobs += 1;
        core.stat.insts.accumulate(&job.mix);
        core.busy = false;

        if !core.queue.is_empty() {
            self.start_front(engine, gidx, cidx);
        }
    }

    pub fn core_stats(&self, group: CoreGroup) -> Vec<CoreStat> {
        self.groups[group_index(group)]
            .iter()
            .map(|c| c.stat)
            .collect()
    }

    fn start_front(&mut self, engine: &mut Engine<impl Copy>, gidx: usize, cidx: usize) {
        let now = engine.now();
        let core = &mut self.groups[gidx][cidx];
        let job = core.queue.front().expect("no job to start");

        // Jobs may carry an external delay (e.g. a DMA the firmware waits
        // on); the core retires at whichever bound is later.
        let waited = now - job.submitted;
        let finished = if waited >= job.delay {
            now + job.latency
        } else {
            now + job.latency + job.delay - waited
        };

        core.busy = true;
        engine.schedule(self.job_done, finished, pack(gidx, cidx));
    }

    fn least_busy(&self, gidx: usize) -> Option<usize> {
        self.groups[gidx]
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.stat.busy_ticks, c.queue.len() as u64))
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        JobDone,
        Completion,
    }

    fn pump(engine: &mut Engine<Tag>, cpu: &mut Cpu) -> Vec<(Tick, u64)> {
        let mut fired = Vec::new();

        while let Some(ev) = engine.advance(u64::MAX) {
            match ev.tag {
                Tag::JobDone => cpu.on_job_done(engine, ev.data),
                Tag::Completion => fired.push((ev.tick, ev.data)),
            }
        }

        fired
    }

    #[test]
    fn zero_cores_is_transparent() {
        let mut engine = Engine::new();
        let job_done = engine.create_event(Tag::JobDone, "cpu job done");
        let done = engine.create_event(Tag::Completion, "done");

        let cfg = CpuConfig {
            hil_cores: 0,
            ..CpuConfig::default()
        };
        let mut cpu = Cpu::new(&cfg, job_done);

        cpu.execute(&mut engine, FirmwareFunc::HilRead, done, 7, 0);

        let fired = pump(&mut engine, &mut cpu);
        assert_eq!(fired, vec![(0, 7)]);
    }

    #[test]
    fn jobs_on_one_core_serialize() {
        let mut engine = Engine::new();
        let job_done = engine.create_event(Tag::JobDone, "cpu job done");
        let done = engine.create_event(Tag::Completion, "done");

        let mut cpu = Cpu::new(&CpuConfig::default(), job_done);
        let lat = cpu.latency_of(FirmwareFunc::MappingRead);

        cpu.execute(&mut engine, FirmwareFunc::MappingRead, done, 1, 0);
        cpu.execute(&mut engine, FirmwareFunc::MappingRead, done, 2, 0);

        let fired = pump(&mut engine, &mut cpu);
        assert_eq!(fired, vec![(lat, 1), (2 * lat, 2)]);

        let stats = cpu.core_stats(CoreGroup::Ftl);
        assert_eq!(stats[0].jobs, 2);
        assert_eq!(stats[0].busy_ticks, 2 * lat);
    }

    #[test]
    fn external_delay_extends_completion() {
        let mut engine = Engine::new();
        let job_done = engine.create_event(Tag::JobDone, "cpu job done");
        let done = engine.create_event(Tag::Completion, "done");

        let mut cpu = Cpu::new(&CpuConfig::default(), job_done);
        let lat = cpu.latency_of(FirmwareFunc::HilWrite);
        let delay = 10 * lat;

        cpu.execute(&mut engine, FirmwareFunc::HilWrite, done, 0, delay);

        let fired = pump(&mut engine, &mut cpu);
        assert_eq!(fired, vec![(delay + lat, 0)]);
    }

    #[test]
    fn apply_latency_accounts_without_queueing() {
        let mut engine = Engine::<Tag>::new();
        let job_done = engine.create_event(Tag::JobDone, "cpu job done");

        let mut cpu = Cpu::new(&CpuConfig::default(), job_done);
        let lat = cpu.apply_latency(FirmwareFunc::CacheRead);

        assert!(lat > 0);
        assert_eq!(cpu.core_stats(CoreGroup::Icl)[0].busy_ticks, lat);
        assert!(!engine.is_scheduled(job_done));
    }
}
