//! Host-memory DMA engine.
//!
//! Four initializers each produce a *tag* binding an ordered list of
//! physical regions: raw (contiguous), PRDT arrays, NVMe PRP pairs (with
//! list chasing), and NVMe SGL descriptor chains. Transfers against a tag
//! visit regions in list order, ascending offset, and fire exactly one
//! completion event per call.
//!
//! Byte movement happens synchronously against the host model; only time
//! is deferred, through the completion event. Descriptor-walk traffic
//! (PRDT entries, PRP list pages, SGL segments) is charged the same bus
//! latency as data.

use std::collections::HashMap;

use flint_core::{Engine, EventId, Tick};
use thiserror::Error;
use tracing::trace;

/// Models host memory and the bus between it and the controller. Data
/// access is immediate; `transfer_latency` prices one transfer of `len`
/// bytes (implementations account per 64-byte bus packet).
pub trait HostInterface {
    fn read_host(&mut self, addr: u64, buf: &mut [u8]);
    fn write_host(&mut self, addr: u64, data: &[u8]);
    fn transfer_latency(&self, len: u32) -> Tick;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegion {
    pub address: u64,
    pub size: u32,
    /// Bit-bucket region: consumes offset but moves no bytes.
    pub ignore: bool,
}

impl PhysicalRegion {
    fn new(address: u64, size: u32) -> Self {
        Self {
            address,
            size,
            ignore: false,
        }
    }
}

/// Opaque handle to an initialized region list.
pub type DmaTag = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DmaError {
    #[error("zero PRP pointer while data remains")]
    InvalidPrp,

    #[error("PRP list shorter than the requested size")]
    PrpListExhausted,

    #[error("unsupported SGL descriptor type {0:#x}")]
    InvalidSglType(u8),

    #[error("unsupported SGL descriptor subtype {0:#x}")]
    InvalidSglSubtype(u8),

    #[error("SGL segment descriptor not at the end of its segment")]
    MisplacedSglSegment,
}

const SGL_DATA_BLOCK: u8 = 0x0;
const SGL_BIT_BUCKET: u8 = 0x1;
const SGL_SEGMENT: u8 = 0x2;
const SGL_LAST_SEGMENT: u8 = 0x3;
const SGL_KEYED_DATA_BLOCK: u8 = 0x4;

pub struct DmaEngine {
    mem_page_size: u64,
    tags: HashMap<DmaTag, Vec<PhysicalRegion>>,
    next_tag: DmaTag,
}

impl DmaEngine {
    pub fn new() -> Self {
        Self {
            mem_page_size: 4096,
            tags: HashMap::new(),
            next_tag: 1,
        }
    }

    /// Called when CC.MPS changes.
    pub fn set_mem_page_size(&mut self, size: u64) {
        assert!(size.is_power_of_two(), "invalid host memory page size");
        self.mem_page_size = size;
    }

    pub fn regions(&self, tag: DmaTag) -> &[PhysicalRegion] {
        &self.tags[&tag]
    }

    pub fn free(&mut self, tag: DmaTag) {
        self.tags.remove(&tag);
    }

    /// One contiguous region; completes immediately, no event needed.
    pub fn init_raw(&mut self, base: u64, size: u32) -> DmaTag {
        self.insert(vec![PhysicalRegion::new(base, size)])
    }

    /// Parse a PRDT array of `entries` 16-byte records from host memory.
    pub fn init_prdt<E: Copy>(
        &mut self,
        host: &mut impl HostInterface,
        engine: &mut Engine<E>,
        base: u64,
        entries: u32,
        done: EventId,
        data: u64,
    ) -> DmaTag {
        let byte_len = entries * 16;
        let mut raw = vec![0u8; byte_len as usize];

        host.read_host(base, &mut raw);

        let regions = raw
            .chunks_exact(16)
            .map(|entry| {
                let address = u64::from_le_bytes(entry[0..8].try_into().unwrap());
                let dw3 = u32::from_le_bytes(entry[12..16].try_into().unwrap());

                // The byte count field is zero-based.
                PhysicalRegion::new(address, (dw3 & 0x3F_FFFF) + 1)
            })
            .collect();

        let latency = host.transfer_latency(byte_len);
        engine.schedule(done, engine.now() + latency, data);

        self.insert(regions)
    }

    /// Resolve an NVMe PRP pair into regions, chasing list pages as
    /// needed. `done` fires once the walk's bus traffic has elapsed.
    pub fn init_prp<E: Copy>(
        &mut self,
        host: &mut impl HostInterface,
        engine: &mut Engine<E>,
        prp1: u64,
        prp2: u64,
        size: u32,
        done: EventId,
        data: u64,
    ) -> Result<DmaTag, DmaError> {
        let page = self.mem_page_size;
        let size = u64::from(size);
        let prp1_room = self.prp_room(prp1);

        let mut regions: Vec<PhysicalRegion> = Vec::new();
        let mut walk_bytes = 0u32;

        if prp1 == 0 {
            return Err(DmaError::InvalidPrp);
        }

        if size <= prp1_room {
            // Everything fits behind PRP1.
            regions.push(PhysicalRegion::new(prp1, size as u32));
        } else if size <= page || (size <= 2 * page && prp1_room == page) {
            // PRP1 + PRP2 are both data pointers.
            if prp2 == 0 {
                return Err(DmaError::InvalidPrp);
            }

            let rest = size - prp1_room;

            if rest > self.prp_room(prp2) {
                return Err(DmaError::InvalidPrp);
            }

            regions.push(PhysicalRegion::new(prp1, prp1_room as u32));
            regions.push(PhysicalRegion::new(prp2, rest as u32));
        } else {
            // PRP1 is data, PRP2 points at a PRP list; chase it.
            regions.push(PhysicalRegion::new(prp1, prp1_room as u32));

            let mut handled = prp1_room;
            let mut list = prp2;

            'chase: loop {
                if list == 0 {
                    return Err(DmaError::InvalidPrp);
                }

                let room = self.prp_room(list) as usize;
                let mut raw = vec![0u8; room];

                host.read_host(list, &mut raw);
                walk_bytes += room as u32;

                let entries: Vec<u64> = raw
                    .chunks_exact(8)
                    .map(|qw| u64::from_le_bytes(qw.try_into().unwrap()))
                    .collect();

                for (idx, &entry) in entries.iter().enumerate() {
                    if entry == 0 {
                        return Err(DmaError::InvalidPrp);
                    }

                    let is_last_slot = idx + 1 == entries.len();
                    let entry_room = self.prp_room(entry);

                    if is_last_slot && handled + entry_room < size {
                        // Final slot chains to the next PRP list page.
                        list = entry;
                        continue 'chase;
                    }

                    let take = entry_room.min(size - handled);

                    regions.push(PhysicalRegion::new(entry, take as u32));
                    handled += take;

                    if handled >= size {
                        break 'chase;
                    }
                }

                // List ended with data still owing and no chain pointer.
                return Err(DmaError::PrpListExhausted);
            }
        }

        let latency = host.transfer_latency(walk_bytes);
        engine.schedule(done, engine.now() + latency, data);

        trace!(regions = regions.len(), size, "prp init");
        Ok(self.insert(regions))
    }

    /// Walk an NVMe SGL starting from the 16-byte descriptor formed by
    /// `(dptr1, dptr2)`.
    pub fn init_sgl<E: Copy>(
        &mut self,
        host: &mut impl HostInterface,
        engine: &mut Engine<E>,
        dptr1: u64,
        dptr2: u64,
        done: EventId,
        data: u64,
    ) -> Result<DmaTag, DmaError> {
        let mut desc = [0u8; 16];

        desc[0..8].copy_from_slice(&dptr1.to_le_bytes());
        desc[8..16].copy_from_slice(&dptr2.to_le_bytes());

        let mut regions = Vec::new();
        let mut walk_bytes = 0u32;

        match sgl_type(&desc) {
            SGL_DATA_BLOCK | SGL_KEYED_DATA_BLOCK | SGL_BIT_BUCKET => {
                parse_sgl_data_descriptor(&desc, &mut regions)?;
            }
            SGL_SEGMENT | SGL_LAST_SEGMENT => {
                let mut next = Some((sgl_address(&desc), sgl_length(&desc)));

                while let Some((address, length)) = next.take() {
                    let mut raw = vec![0u8; length as usize];

                    host.read_host(address, &mut raw);
                    walk_bytes += length;

                    let descriptors: Vec<&[u8]> = raw.chunks_exact(16).collect();

                    for (idx, entry) in descriptors.iter().enumerate() {
                        let entry: &[u8; 16] = (*entry).try_into().unwrap();

                        match sgl_type(entry) {
                            SGL_DATA_BLOCK | SGL_KEYED_DATA_BLOCK | SGL_BIT_BUCKET => {
                                parse_sgl_data_descriptor(entry, &mut regions)?;
                            }
                            SGL_SEGMENT | SGL_LAST_SEGMENT => {
                                // A segment pointer is only legal as the
                                // final descriptor of its segment.
                                if idx + 1 != descriptors.len() {
                                    return Err(DmaError::MisplacedSglSegment);
                                }

                                next = Some((sgl_address(entry), sgl_length(entry)));
                            }
                            other => return Err(DmaError::InvalidSglType(other)),
                        }
                    }
                }
            }
            other => return Err(DmaError::InvalidSglType(other)),
        }

        let latency = host.transfer_latency(walk_bytes);
        engine.schedule(done, engine.now() + latency, data);

        trace!(regions = regions.len(), "sgl init");
        Ok(self.insert(regions))
    }

    /// Read `size` bytes starting at `offset` within the tag's regions
    /// into `buf` (pass `None` for latency-only transfers). Exactly one
    /// `done` firing per call.
    pub fn read<E: Copy>(
        &mut self,
        host: &mut impl HostInterface,
        engine: &mut Engine<E>,
        tag: DmaTag,
        offset: u64,
        size: u32,
        mut buf: Option<&mut [u8]>,
        done: EventId,
        data: u64,
    ) {
        let mut latency = 0;

        for (region_addr, chunk_offset, chunk_len, ignore) in self.chunks(tag, offset, size) {
            if ignore {
                continue;
            }

            if let Some(buf) = buf.as_deref_mut() {
                let dst = &mut buf[chunk_offset as usize..(chunk_offset + u64::from(chunk_len)) as usize];

                host.read_host(region_addr, dst);
            }

            latency += host.transfer_latency(chunk_len);
        }

        engine.schedule(done, engine.now() + latency, data);
    }

    /// Write `size` bytes from `buf` (or zeros) into the tag's regions.
    pub fn write<E: Copy>(
        &mut self,
        host: &mut impl HostInterface,
        engine: &mut Engine<E>,
        tag: DmaTag,
        offset: u64,
        size: u32,
        buf: Option<&[u8]>,
        done: EventId,
        data: u64,
    ) {
        let mut latency = 0;

        for (region_addr, chunk_offset, chunk_len, ignore) in self.chunks(tag, offset, size) {
            if ignore {
                continue;
            }

            let zeros;
            let src = match buf {
                Some(buf) => {
                    &buf[chunk_offset as usize..(chunk_offset + u64::from(chunk_len)) as usize]
                }
                None => {
                    zeros = vec![0u8; chunk_len as usize];
                    &zeros[..]
                }
            };

            host.write_host(region_addr, src);
            latency += host.transfer_latency(chunk_len);
        }

        engine.schedule(done, engine.now() + latency, data);
    }

    /// `(host address, offset into the caller buffer, length, ignore)`
    /// chunks covering `[offset, offset + size)` in region-list order.
    fn chunks(&self, tag: DmaTag, offset: u64, size: u32) -> Vec<(u64, u64, u32, bool)> {
        let mut out = Vec::new();
        let mut region_base = 0u64;
        let mut remaining = u64::from(size);
        let mut buf_offset = 0u64;

        for region in &self.tags[&tag] {
            let region_len = u64::from(region.size);

            if remaining == 0 {
                break;
            }

            if region_base + region_len > offset {
                let skip = offset.saturating_sub(region_base);
                let take = (region_len - skip).min(remaining);

                out.push((
                    region.address + skip,
                    buf_offset,
                    take as u32,
                    region.ignore,
                ));

                buf_offset += take;
                remaining -= take;
            }

            region_base += region_len;
        }

        assert_eq!(remaining, 0, "transfer extends past the region list");
        out
    }

    /// Serialize every live tag and its region list.
    pub fn save(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        use flint_core::checkpoint::{write_bool, write_u32, write_u64};

        write_u64(w, self.mem_page_size)?;
        write_u64(w, self.next_tag)?;
        write_u64(w, self.tags.len() as u64)?;

        let mut tags: Vec<_> = self.tags.iter().collect();
        tags.sort_by_key(|(tag, _)| **tag);

        for (tag, regions) in tags {
            write_u64(w, *tag)?;
            write_u64(w, regions.len() as u64)?;

            for region in regions {
                write_u64(w, region.address)?;
                write_u32(w, region.size)?;
                write_bool(w, region.ignore)?;
            }
        }

        Ok(())
    }

    pub fn restore(&mut self, r: &mut impl std::io::Read) -> std::io::Result<()> {
        use flint_core::checkpoint::{read_bool, read_u32, read_u64};

        self.mem_page_size = read_u64(r)?;
        self.next_tag = read_u64(r)?;
        self.tags.clear();

        let count = read_u64(r)?;
        for _ in 0..count {
            let tag = read_u64(r)?;
            let len = read_u64(r)?;
            let mut regions = Vec::with_capacity(len as usize);

            for _ in 0..len {
                regions.push(PhysicalRegion {
                    address: read_u64(r)?,
                    size: read_u32(r)?,
                    ignore: read_bool(r)?,
                });
            }

            self.tags.insert(tag, regions);
        }

        Ok(())
    }

    /// Bytes from `prp` to the end of its memory page.
    fn prp_room(&self, prp: u64) -> u64 {
        self.mem_page_size - (prp & (self.mem_page_size - 1))
    }

    fn insert(&mut self, regions: Vec<PhysicalRegion>) -> DmaTag {
        let tag = self.next_tag;

        self.next_tag += 1;
        self.tags.insert(tag, regions);
        tag
    }
}

impl Default for DmaEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn sgl_type(desc: &[u8; 16]) -> u8 {
    desc[15] >> 4
}

fn sgl_subtype(desc: &[u8; 16]) -> u8 {
    desc[15] & 0x0F
}

fn sgl_address(desc: &[u8; 16]) -> u64 {
    u64::from_le_bytes(desc[0..8].try_into().unwrap())
}

fn sgl_length(desc: &[u8; 16]) -> u32 {
    u32::from_le_bytes(desc[8..12].try_into().unwrap())
}

fn parse_sgl_data_descriptor(
    desc: &[u8; 16],
    regions: &mut Vec<PhysicalRegion>,
) -> Result<(), DmaError> {
    if sgl_subtype(desc) != 0 {
        return Err(DmaError::InvalidSglSubtype(sgl_subtype(desc)));
    }

    regions.push(PhysicalRegion {
        address: sgl_address(desc),
        size: sgl_length(desc),
        ignore: sgl_type(desc) == SGL_BIT_BUCKET,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Tag {
        Done,
    }

    /// 1 ns per 64-byte packet.
    struct TestHost {
        mem: Vec<u8>,
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                mem: vec![0u8; 1 << 20],
            }
        }

        fn write(&mut self, addr: u64, data: &[u8]) {
            self.mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        }

        fn write_qword(&mut self, addr: u64, value: u64) {
            self.write(addr, &value.to_le_bytes());
        }
    }

    impl HostInterface for TestHost {
        fn read_host(&mut self, addr: u64, buf: &mut [u8]) {
            buf.copy_from_slice(&self.mem[addr as usize..addr as usize + buf.len()]);
        }

        fn write_host(&mut self, addr: u64, data: &[u8]) {
            self.mem[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        }

        fn transfer_latency(&self, len: u32) -> Tick {
            u64::from(len.div_ceil(64)) * 1000
        }
    }

    fn setup() -> (DmaEngine, TestHost, Engine<Tag>, EventId) {
        let mut engine = Engine::new();
        let done = engine.create_event(Tag::Done, "dma done");

        (DmaEngine::new(), TestHost::new(), engine, done)
    }

    fn coverage(dma: &DmaEngine, tag: DmaTag) -> u64 {
        dma.regions(tag)
            .iter()
            .filter(|r| !r.ignore)
            .map(|r| u64::from(r.size))
            .sum()
    }

    #[test]
    fn prp_single_page() {
        let (mut dma, mut host, mut engine, done) = setup();

        let tag = dma
            .init_prp(&mut host, &mut engine, 0x1000, 0, 512, done, 0)
            .unwrap();

        assert_eq!(dma.regions(tag), &[PhysicalRegion::new(0x1000, 512)]);
        assert!(engine.advance(u64::MAX).is_some());
    }

    #[test]
    fn prp_pair_for_two_pages() {
        let (mut dma, mut host, mut engine, done) = setup();

        let tag = dma
            .init_prp(&mut host, &mut engine, 0x1000, 0x3000, 8192, done, 0)
            .unwrap();

        assert_eq!(
            dma.regions(tag),
            &[
                PhysicalRegion::new(0x1000, 4096),
                PhysicalRegion::new(0x3000, 4096),
            ]
        );
    }

    #[test]
    fn prp_offset_start_uses_pair() {
        let (mut dma, mut host, mut engine, done) = setup();

        // 4 KiB starting 512 bytes into a page: 3584 + 512.
        let tag = dma
            .init_prp(&mut host, &mut engine, 0x1200, 0x3000, 4096, done, 0)
            .unwrap();

        assert_eq!(
            dma.regions(tag),
            &[
                PhysicalRegion::new(0x1200, 3584),
                PhysicalRegion::new(0x3000, 512),
            ]
        );
        assert_eq!(coverage(&dma, tag), 4096);
    }

    #[test]
    fn prp_list_walk() {
        let (mut dma, mut host, mut engine, done) = setup();

        // 32 KiB: PRP1 covers the first page, the list page at 0x2000 the
        // remaining seven.
        for (idx, page) in [0x3000u64, 0x4000, 0x5000, 0x6000, 0x7000, 0x8000, 0x9000]
            .iter()
            .enumerate()
        {
            host.write_qword(0x2000 + idx as u64 * 8, *page);
        }

        let tag = dma
            .init_prp(&mut host, &mut engine, 0x1000, 0x2000, 32768, done, 0)
            .unwrap();

        assert_eq!(dma.regions(tag).len(), 8);
        assert_eq!(coverage(&dma, tag), 32768);
        assert_eq!(dma.regions(tag)[1].address, 0x3000);
        assert_eq!(dma.regions(tag)[7].address, 0x9000);
    }

    #[test]
    fn prp_list_chains_to_next_page() {
        let (mut dma, mut host, mut engine, done) = setup();

        // List page nearly at the end of its page: room for two entries.
        let list1 = 0x2000 + 4096 - 16;

        host.write_qword(list1, 0x10000);
        host.write_qword(list1 + 8, 0x20000); // chain pointer

        host.write_qword(0x20000, 0x30000);
        host.write_qword(0x20000 + 8, 0x40000);

        // PRP1 (partial page) + 3 full pages.
        let size = 2048 + 3 * 4096;
        let tag = dma
            .init_prp(&mut host, &mut engine, 0x1800, list1, size, done, 0)
            .unwrap();

        let addrs: Vec<u64> = dma.regions(tag).iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![0x1800, 0x10000, 0x30000, 0x40000]);
        assert_eq!(coverage(&dma, tag), u64::from(size));
    }

    #[test]
    fn prp_zero_pointer_is_an_error() {
        let (mut dma, mut host, mut engine, done) = setup();

        assert_eq!(
            dma.init_prp(&mut host, &mut engine, 0, 0, 4096, done, 0),
            Err(DmaError::InvalidPrp)
        );

        assert_eq!(
            dma.init_prp(&mut host, &mut engine, 0x1000, 0, 8192, done, 0),
            Err(DmaError::InvalidPrp)
        );
    }

    #[test]
    fn sgl_inline_data_block() {
        let (mut dma, mut host, mut engine, done) = setup();

        let tag = dma
            .init_sgl(&mut host, &mut engine, 0x5000, 512, done, 0)
            .unwrap();

        assert_eq!(dma.regions(tag), &[PhysicalRegion::new(0x5000, 512)]);
    }

    fn write_sgl_desc(host: &mut TestHost, addr: u64, ptr: u64, len: u32, type_byte: u8) {
        let mut desc = [0u8; 16];

        desc[0..8].copy_from_slice(&ptr.to_le_bytes());
        desc[8..12].copy_from_slice(&len.to_le_bytes());
        desc[15] = type_byte << 4;
        host.write(addr, &desc);
    }

    #[test]
    fn sgl_segment_chain_with_bit_bucket() {
        let (mut dma, mut host, mut engine, done) = setup();

        // Root segment -> [data, bit bucket, last segment] -> [data].
        write_sgl_desc(&mut host, 0x7000, 0x10000, 300, SGL_DATA_BLOCK);
        write_sgl_desc(&mut host, 0x7010, 0, 100, SGL_BIT_BUCKET);
        write_sgl_desc(&mut host, 0x7020, 0x8000, 16, SGL_LAST_SEGMENT);
        write_sgl_desc(&mut host, 0x8000, 0x20000, 212, SGL_DATA_BLOCK);

        let dptr2 = 48u64 | (u64::from(SGL_SEGMENT) << 60);
        let tag = dma
            .init_sgl(&mut host, &mut engine, 0x7000, dptr2, done, 0)
            .unwrap();

        let regions = dma.regions(tag);
        assert_eq!(regions.len(), 3);
        assert!(regions[1].ignore);
        assert_eq!(coverage(&dma, tag), 512);
    }

    #[test]
    fn sgl_rejects_bad_subtype_and_misplaced_segment() {
        let (mut dma, mut host, mut engine, done) = setup();

        // Subtype 1 (offset) is not supported.
        let dptr2 = 512u64 | 0x01 << 56;
        assert_eq!(
            dma.init_sgl(&mut host, &mut engine, 0x5000, dptr2, done, 0),
            Err(DmaError::InvalidSglSubtype(1))
        );

        // Segment descriptor not at the end of its segment.
        write_sgl_desc(&mut host, 0x7000, 0x8000, 16, SGL_SEGMENT);
        write_sgl_desc(&mut host, 0x7010, 0x10000, 100, SGL_DATA_BLOCK);

        let dptr2 = 32u64 | (u64::from(SGL_SEGMENT) << 60);
        assert_eq!(
            dma.init_sgl(&mut host, &mut engine, 0x7000, dptr2, done, 0),
            Err(DmaError::MisplacedSglSegment)
        );
    }

    #[test]
    fn read_copies_across_regions_in_order() {
        let (mut dma, mut host, mut engine, done) = setup();

        host.write(0x1000, &[1u8; 100]);
        host.write(0x2000, &[2u8; 100]);

        let tag = dma.init_raw(0x1000, 100);
        dma.tags.get_mut(&tag).unwrap().push(PhysicalRegion::new(0x2000, 100));

        let mut buf = vec![0u8; 150];
        dma.read(&mut host, &mut engine, tag, 50, 150, Some(&mut buf), done, 7);

        assert_eq!(&buf[..50], &[1u8; 50][..]);
        assert_eq!(&buf[50..], &[2u8; 100][..]);

        let fired = engine.advance(u64::MAX).unwrap();
        assert_eq!(fired.data, 7);
        // 50 bytes -> 1 packet, 100 bytes -> 2 packets.
        assert_eq!(fired.tick, 3000);
    }

    #[test]
    fn write_without_buffer_zero_fills() {
        let (mut dma, mut host, mut engine, done) = setup();

        host.write(0x1000, &[0xFFu8; 64]);

        let tag = dma.init_raw(0x1000, 64);
        dma.write(&mut host, &mut engine, tag, 0, 64, None, done, 0);

        let mut check = [0xAAu8; 64];
        host.read_host(0x1000, &mut check);
        assert_eq!(check, [0u8; 64]);
    }

    #[test]
    fn ignored_regions_move_no_bytes_and_cost_nothing() {
        let (mut dma, mut host, mut engine, done) = setup();

        let tag = dma.insert(vec![
            PhysicalRegion::new(0x1000, 64),
            PhysicalRegion {
                address: 0,
                size: 128,
                ignore: true,
            },
            PhysicalRegion::new(0x2000, 64),
        ]);

        host.write(0x1000, &[3u8; 64]);
        host.write(0x2000, &[4u8; 64]);

        let mut buf = vec![0u8; 256];
        dma.read(&mut host, &mut engine, tag, 0, 256, Some(&mut buf), done, 0);

        assert_eq!(&buf[..64], &[3u8; 64][..]);
        assert_eq!(&buf[64..192], &[0u8; 128][..]); // bucket left as zeros
        assert_eq!(&buf[192..], &[4u8; 64][..]);

        // Two 64-byte packets only.
        assert_eq!(engine.advance(u64::MAX).unwrap().tick, 2000);
    }
}
