//! Binary record format for the cache stores.
//!
//! Values are size-dominated (billions of coords, hundreds of millions of
//! ways), so everything is packed by hand: LEB128 varints, zigzag for signed
//! quantities, delta encoding for monotonic sequences, length-prefixed
//! strings for tags. Keys are big-endian ids so the backing engine iterates
//! in id order.

use crate::element::{Coord, Member, MemberKind, Node, Relation, Tags, Way};
use crate::error::{Error, Result};

/// Coord blocks span `1 << COORD_BLOCK_BITS` consecutive ids.
pub const COORD_BLOCK_BITS: u32 = 6;

/// Stored lon/lat resolution, 1e-7 degrees (the native OSM resolution).
const COORD_SCALE: f64 = 1e7;

fn corrupt(what: &str) -> Error {
    Error::Corrupt(what.to_string())
}

// ---------------------------------------------------------------------------
// varints

pub fn write_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub fn read_uvarint(buf: &mut &[u8]) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf.split_first().ok_or_else(|| corrupt("varint"))?;
        *buf = rest;
        if shift >= 64 {
            return Err(corrupt("varint overflow"));
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

pub fn write_varint(buf: &mut Vec<u8>, v: i64) {
    write_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

pub fn read_varint(buf: &mut &[u8]) -> Result<i64> {
    let v = read_uvarint(buf)?;
    Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &mut &[u8]) -> Result<String> {
    let len = read_uvarint(buf)? as usize;
    if buf.len() < len {
        return Err(corrupt("string length"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("string utf-8"))
}

// ---------------------------------------------------------------------------
// tags

pub fn pack_tags(buf: &mut Vec<u8>, tags: &Tags) {
    write_uvarint(buf, tags.len() as u64);
    for (k, v) in tags {
        write_str(buf, k);
        write_str(buf, v);
    }
}

pub fn unpack_tags(buf: &mut &[u8]) -> Result<Tags> {
    let n = read_uvarint(buf)? as usize;
    let mut tags = Tags::with_capacity(n);
    for _ in 0..n {
        let k = read_str(buf)?;
        let v = read_str(buf)?;
        tags.insert(k, v);
    }
    Ok(tags)
}

// ---------------------------------------------------------------------------
// id sequences (way refs, diff coord refs)

pub fn pack_refs(buf: &mut Vec<u8>, refs: &[i64]) {
    write_uvarint(buf, refs.len() as u64);
    let mut prev = 0i64;
    for &id in refs {
        write_varint(buf, id - prev);
        prev = id;
    }
}

pub fn unpack_refs(buf: &mut &[u8]) -> Result<Vec<i64>> {
    let n = read_uvarint(buf)? as usize;
    let mut refs = Vec::with_capacity(n);
    let mut prev = 0i64;
    for _ in 0..n {
        prev += read_varint(buf)?;
        refs.push(prev);
    }
    Ok(refs)
}

// ---------------------------------------------------------------------------
// nodes

pub fn pack_node(node: &Node) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 16 * node.tags.len());
    buf.extend_from_slice(&node.lon.to_le_bytes());
    buf.extend_from_slice(&node.lat.to_le_bytes());
    pack_tags(&mut buf, &node.tags);
    buf
}

pub fn unpack_node(id: i64, mut buf: &[u8]) -> Result<Node> {
    if buf.len() < 16 {
        return Err(corrupt("node value"));
    }
    let lon = f64::from_le_bytes(buf[0..8].try_into().unwrap());
    let lat = f64::from_le_bytes(buf[8..16].try_into().unwrap());
    buf = &buf[16..];
    let tags = unpack_tags(&mut buf)?;
    Ok(Node {
        id,
        lon,
        lat,
        tags,
        geom: None,
    })
}

// ---------------------------------------------------------------------------
// ways

pub fn pack_way(way: &Way) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 * way.refs.len() + 16 * way.tags.len());
    pack_refs(&mut buf, &way.refs);
    pack_tags(&mut buf, &way.tags);
    buf
}

pub fn unpack_way(id: i64, mut buf: &[u8]) -> Result<Way> {
    let refs = unpack_refs(&mut buf)?;
    let tags = unpack_tags(&mut buf)?;
    Ok(Way {
        id,
        refs,
        tags,
        nodes: Vec::new(),
        geom: None,
    })
}

// ---------------------------------------------------------------------------
// relations

pub fn pack_relation(rel: &Relation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * rel.members.len() + 16 * rel.tags.len());
    write_uvarint(&mut buf, rel.members.len() as u64);
    for m in &rel.members {
        write_varint(&mut buf, m.id);
        buf.push(m.kind.as_u8());
        write_str(&mut buf, &m.role);
    }
    pack_tags(&mut buf, &rel.tags);
    buf
}

pub fn unpack_relation(id: i64, mut buf: &[u8]) -> Result<Relation> {
    let n = read_uvarint(&mut buf)? as usize;
    let mut members = Vec::with_capacity(n);
    for _ in 0..n {
        let id = read_varint(&mut buf)?;
        let (&kind, rest) = buf.split_first().ok_or_else(|| corrupt("member kind"))?;
        buf = rest;
        let kind = MemberKind::from_u8(kind).ok_or_else(|| corrupt("member kind"))?;
        let role = read_str(&mut buf)?;
        members.push(Member {
            id,
            kind,
            role,
            way: None,
        });
    }
    let tags = unpack_tags(&mut buf)?;
    Ok(Relation {
        id,
        members,
        tags,
        geom: None,
    })
}

// ---------------------------------------------------------------------------
// coord blocks

fn scale(deg: f64) -> i32 {
    (deg * COORD_SCALE).round() as i32
}

fn unscale(v: i32) -> f64 {
    f64::from(v) / COORD_SCALE
}

/// Packs one positional block. `coords` must be sorted by id and every id
/// must satisfy `id >> COORD_BLOCK_BITS == key`.
pub fn pack_coord_block(key: i64, coords: &[Coord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 * coords.len());
    write_uvarint(&mut buf, coords.len() as u64);
    let mut prev_id = key << COORD_BLOCK_BITS;
    let mut prev_lon = 0i32;
    let mut prev_lat = 0i32;
    for c in coords {
        debug_assert_eq!(c.id >> COORD_BLOCK_BITS, key);
        let lon = scale(c.lon);
        let lat = scale(c.lat);
        write_uvarint(&mut buf, (c.id - prev_id) as u64);
        write_varint(&mut buf, i64::from(lon) - i64::from(prev_lon));
        write_varint(&mut buf, i64::from(lat) - i64::from(prev_lat));
        prev_id = c.id;
        prev_lon = lon;
        prev_lat = lat;
    }
    buf
}

pub fn unpack_coord_block(key: i64, mut buf: &[u8]) -> Result<Vec<Coord>> {
    let n = read_uvarint(&mut buf)? as usize;
    let mut coords = Vec::with_capacity(n);
    let mut prev_id = key << COORD_BLOCK_BITS;
    let mut prev_lon = 0i64;
    let mut prev_lat = 0i64;
    for _ in 0..n {
        prev_id += read_uvarint(&mut buf)? as i64;
        prev_lon += read_varint(&mut buf)?;
        prev_lat += read_varint(&mut buf)?;
        coords.push(Coord {
            id: prev_id,
            lon: unscale(prev_lon as i32),
            lat: unscale(prev_lat as i32),
        });
    }
    Ok(coords)
}
