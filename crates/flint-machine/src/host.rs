//! Flat host-memory model with a fixed-rate bus.
//!
//! Data access is immediate; time is charged per 64-byte bus packet and
//! returned through `transfer_latency` for the DMA engine to schedule
//! around.

use flint_core::Tick;
use flint_hil::dma::HostInterface;
use flint_hil::InterruptSink;

/// Roughly PCIe 3.0 x4: a 64-byte packet every ~16 ns.
pub const DEFAULT_PACKET_LATENCY: Tick = 16_000;

pub struct HostMemory {
    mem: Vec<u8>,
    packet_latency: Tick,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self::with_packet_latency(size, DEFAULT_PACKET_LATENCY)
    }

    pub fn with_packet_latency(size: usize, packet_latency: Tick) -> Self {
        Self {
            mem: vec![0u8; size],
            packet_latency,
        }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;

        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, addr: u64, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }
}

impl HostInterface for HostMemory {
    fn read_host(&mut self, addr: u64, buf: &mut [u8]) {
        let start = addr as usize;
        let end = start + buf.len();

        assert!(end <= self.mem.len(), "DMA read past end of host memory");
        buf.copy_from_slice(&self.mem[start..end]);
    }

    fn write_host(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();

        assert!(end <= self.mem.len(), "DMA write past end of host memory");
        self.mem[start..end].copy_from_slice(data);
    }

    fn transfer_latency(&self, len: u32) -> Tick {
        Tick::from(len.div_ceil(64)) * self.packet_latency
    }
}

/// Records every interrupt edge the device raises.
#[derive(Debug, Default)]
pub struct IrqLog {
    pub events: Vec<(u16, bool)>,
}

impl IrqLog {
    pub fn asserted(&self, iv: u16) -> bool {
        self.events
            .iter()
            .rev()
            .find(|(vector, _)| *vector == iv)
            .is_some_and(|(_, set)| *set)
    }

    pub fn assert_count(&self, iv: u16) -> usize {
        self.events
            .iter()
            .filter(|(vector, set)| *vector == iv && *set)
            .count()
    }
}

impl InterruptSink for IrqLog {
    fn post_interrupt(&mut self, iv: u16, set: bool) {
        self.events.push((iv, set));
    }
}
