//! Checkpointing: a stream of tagged, length-prefixed binary records, one
//! per stateful component, written in the order the data model declares
//! them. Checkpoints only restore against bit-identical geometry.

use std::io::{self, Read, Write};

use flint_core::checkpoint::invalid_data;
use flint_core::geometry::AddrAxis;
use flint_core::{Geometry, NandType};

use crate::ssd::Ssd;

const MAGIC: &[u8; 4] = b"FLNT";
const VERSION: u32 = 2;

const TAG_GEOMETRY: u8 = 1;
const TAG_FTL: u8 = 2;
const TAG_PAL: u8 = 3;
const TAG_CONTROLLER: u8 = 4;
const TAG_CACHE: u8 = 5;
const TAG_SUBSYSTEM: u8 = 6;

fn axis_tag(axis: AddrAxis) -> u8 {
    match axis {
        AddrAxis::Channel => 0,
        AddrAxis::Way => 1,
        AddrAxis::Die => 2,
        AddrAxis::Plane => 3,
    }
}

fn geometry_bytes(g: &Geometry) -> Vec<u8> {
    let mut out = Vec::new();

    for v in [
        g.channels,
        g.ways_per_channel,
        g.dies_per_way,
        g.planes_per_die,
        g.blocks_per_plane,
        g.pages_per_block,
        g.page_size_bytes,
        g.dma_speed_mtps,
        g.dma_width_bits,
        g.superblock_degree,
    ] {
        out.extend_from_slice(&v.to_le_bytes());
    }

    out.push(match g.nand_type {
        NandType::Slc => 0,
        NandType::Mlc => 1,
        NandType::Tlc => 2,
    });
    out.extend(g.page_allocation_order.map(axis_tag));
    out.push(g.use_multi_plane as u8);
    out
}

fn write_record(w: &mut impl Write, tag: u8, payload: &[u8]) -> io::Result<()> {
    w.write_all(&[tag])?;
    w.write_all(&(payload.len() as u64).to_le_bytes())?;
    w.write_all(payload)
}

fn read_record(r: &mut impl Read, expected: u8) -> io::Result<Vec<u8>> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;

    if tag[0] != expected {
        return Err(invalid_data(format!(
            "expected record tag {expected}, found {}",
            tag[0]
        )));
    }

    let mut len = [0u8; 8];
    r.read_exact(&mut len)?;

    let mut payload = vec![0u8; u64::from_le_bytes(len) as usize];
    r.read_exact(&mut payload)?;

    Ok(payload)
}

pub fn save(ssd: &Ssd, geometry: &Geometry, w: &mut impl Write) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;

    write_record(w, TAG_GEOMETRY, &geometry_bytes(geometry))?;

    let mut payload = Vec::new();
    ssd.subsystem.ftl().save(&mut payload)?;
    write_record(w, TAG_FTL, &payload)?;

    payload.clear();
    ssd.subsystem.pal().save(&mut payload)?;
    write_record(w, TAG_PAL, &payload)?;

    payload.clear();
    ssd.controller.save(&mut payload)?;
    write_record(w, TAG_CONTROLLER, &payload)?;

    payload.clear();
    ssd.subsystem.cache().save(&mut payload)?;
    write_record(w, TAG_CACHE, &payload)?;

    payload.clear();
    ssd.subsystem.save(&mut payload)?;
    write_record(w, TAG_SUBSYSTEM, &payload)
}

pub fn restore(ssd: &mut Ssd, geometry: &Geometry, r: &mut impl Read) -> io::Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;

    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;

    if &magic != MAGIC || u32::from_le_bytes(version) != VERSION {
        return Err(invalid_data("not a flint checkpoint"));
    }

    let payload = read_record(r, TAG_GEOMETRY)?;

    if payload != geometry_bytes(geometry) {
        return Err(invalid_data("checkpoint geometry mismatch"));
    }

    let payload = read_record(r, TAG_FTL)?;
    ssd.subsystem.ftl_mut().restore(&mut payload.as_slice())?;

    let payload = read_record(r, TAG_PAL)?;
    ssd.subsystem.pal_mut().restore(&mut payload.as_slice())?;

    let payload = read_record(r, TAG_CONTROLLER)?;
    ssd.controller
        .restore(&mut ssd.engine, &mut payload.as_slice())?;

    let payload = read_record(r, TAG_CACHE)?;
    ssd.subsystem.cache_mut().restore(&mut payload.as_slice())?;

    let payload = read_record(r, TAG_SUBSYSTEM)?;
    ssd.subsystem
        .restore(&mut ssd.engine, &mut payload.as_slice())
}
