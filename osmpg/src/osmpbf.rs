//! OSM PBF block access: a lazy index over the self-describing blob
//! framing, blob decompression, and conversion of primitive blocks into
//! per-entity batches.
//!
//! The wire messages are declared by hand against the published OSM PBF
//! field numbers, so no build-time codegen is involved.

use byteorder::{NetworkEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use log::warn;
use prost::Message;
use std::io::{self, Read};

use osmcache::element::{Coord, Member, MemberKind, Node, Relation, Tags, Way};

// ---------------------------------------------------------------------------
// wire messages (fileformat.proto)

#[derive(Clone, PartialEq, Message)]
pub struct BlobHeader {
    #[prost(string, required, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub indexdata: Option<Vec<u8>>,
    #[prost(int32, required, tag = "3")]
    pub datasize: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Blob {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub raw: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub raw_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub zlib_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub lzma_data: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// wire messages (osmformat.proto)

#[derive(Clone, PartialEq, Message)]
pub struct HeaderBlock {
    #[prost(message, optional, tag = "1")]
    pub bbox: Option<HeaderBbox>,
    #[prost(string, repeated, tag = "4")]
    pub required_features: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub optional_features: Vec<String>,
    #[prost(string, optional, tag = "16")]
    pub writingprogram: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub source: Option<String>,
    #[prost(int64, optional, tag = "32")]
    pub osmosis_replication_timestamp: Option<i64>,
    #[prost(int64, optional, tag = "33")]
    pub osmosis_replication_sequence_number: Option<i64>,
    #[prost(string, optional, tag = "34")]
    pub osmosis_replication_base_url: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeaderBbox {
    #[prost(sint64, required, tag = "1")]
    pub left: i64,
    #[prost(sint64, required, tag = "2")]
    pub right: i64,
    #[prost(sint64, required, tag = "3")]
    pub top: i64,
    #[prost(sint64, required, tag = "4")]
    pub bottom: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PrimitiveBlock {
    #[prost(message, required, tag = "1")]
    pub stringtable: StringTable,
    #[prost(message, repeated, tag = "2")]
    pub primitivegroup: Vec<PrimitiveGroup>,
    #[prost(int32, optional, tag = "17")]
    pub granularity: Option<i32>,
    #[prost(int32, optional, tag = "18")]
    pub date_granularity: Option<i32>,
    #[prost(int64, optional, tag = "19")]
    pub lat_offset: Option<i64>,
    #[prost(int64, optional, tag = "20")]
    pub lon_offset: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringTable {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub s: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PrimitiveGroup {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<PbfNode>,
    #[prost(message, optional, tag = "2")]
    pub dense: Option<DenseNodes>,
    #[prost(message, repeated, tag = "3")]
    pub ways: Vec<PbfWay>,
    #[prost(message, repeated, tag = "4")]
    pub relations: Vec<PbfRelation>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbfNode {
    #[prost(sint64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    #[prost(sint64, required, tag = "8")]
    pub lat: i64,
    #[prost(sint64, required, tag = "9")]
    pub lon: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct DenseNodes {
    #[prost(sint64, repeated, packed = "true", tag = "1")]
    pub id: Vec<i64>,
    #[prost(sint64, repeated, packed = "true", tag = "8")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, packed = "true", tag = "9")]
    pub lon: Vec<i64>,
    #[prost(int32, repeated, packed = "true", tag = "10")]
    pub keys_vals: Vec<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbfWay {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    #[prost(sint64, repeated, packed = "true", tag = "8")]
    pub refs: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbfRelation {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    #[prost(int32, repeated, packed = "true", tag = "8")]
    pub roles_sid: Vec<i32>,
    #[prost(sint64, repeated, packed = "true", tag = "9")]
    pub memids: Vec<i64>,
    #[prost(enumeration = "pbf_relation::MemberType", repeated, packed = "true", tag = "10")]
    pub types: Vec<i32>,
}

pub mod pbf_relation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MemberType {
        Node = 0,
        Way = 1,
        Relation = 2,
    }
}

// ---------------------------------------------------------------------------
// block index

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Header,
    Primitive,
}

/// Byte-range position of one independently decodable blob.
#[derive(Debug, Clone, Copy)]
pub struct BlockIndex {
    pub block_type: BlockType,
    pub blob_start: usize,
    pub blob_len: usize,
}

/// Lazily scans blob headers, skipping over blob bodies. A truncated or
/// corrupt trailing header ends the sequence with a warning instead of
/// failing the stages downstream.
pub fn block_index(data: &[u8]) -> BlockIter<'_> {
    BlockIter { data, cursor: 0 }
}

pub struct BlockIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockIndex;

    fn next(&mut self) -> Option<BlockIndex> {
        loop {
            if self.cursor == self.data.len() {
                return None;
            }
            let mut rest = &self.data[self.cursor..];
            let header_len = match rest.read_i32::<NetworkEndian>() {
                Ok(len) if len > 0 => len as usize,
                _ => {
                    warn!("truncated block header at offset {}", self.cursor);
                    self.cursor = self.data.len();
                    return None;
                }
            };
            if rest.len() < header_len {
                warn!("truncated block header at offset {}", self.cursor);
                self.cursor = self.data.len();
                return None;
            }
            let header = match BlobHeader::decode(&rest[..header_len]) {
                Ok(h) => h,
                Err(e) => {
                    warn!("corrupt block header at offset {}: {}", self.cursor, e);
                    self.cursor = self.data.len();
                    return None;
                }
            };
            let blob_start = self.cursor + 4 + header_len;
            let blob_len = header.datasize.max(0) as usize;
            if blob_start + blob_len > self.data.len() {
                warn!("truncated block at offset {}", self.cursor);
                self.cursor = self.data.len();
                return None;
            }
            self.cursor = blob_start + blob_len;
            let block_type = match header.r#type.as_str() {
                "OSMHeader" => BlockType::Header,
                "OSMData" => BlockType::Primitive,
                // blobs of unknown type are skipped, per the format contract
                _ => continue,
            };
            return Some(BlockIndex {
                block_type,
                blob_start,
                blob_len,
            });
        }
    }
}

/// Decodes one blob into a wire message, inflating the body if needed.
pub fn read_block<T: Message + Default>(data: &[u8], idx: &BlockIndex) -> io::Result<T> {
    let blob = Blob::decode(&data[idx.blob_start..idx.blob_start + idx.blob_len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let body = if let Some(zlib) = &blob.zlib_data {
        let mut out = Vec::with_capacity(blob.raw_size.unwrap_or(0).max(0) as usize);
        ZlibDecoder::new(zlib.as_slice()).read_to_end(&mut out)?;
        out
    } else if let Some(raw) = blob.raw {
        raw
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported blob compression",
        ));
    };
    T::decode(body.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------------
// batch conversion

/// One block's worth of decoded entities; at most one batch per kind.
#[derive(Debug, Default)]
pub struct Batches {
    pub coords: Vec<Coord>,
    pub nodes: Vec<Node>,
    pub ways: Vec<Way>,
    pub relations: Vec<Relation>,
}

/// Converts a primitive block. Every node yields a coord; nodes with at
/// least one tag additionally yield a node record. Tag filtering is not
/// applied here, it happens once at cache write time.
pub fn decode_block(block: &PrimitiveBlock) -> Batches {
    let strings: Vec<String> = block
        .stringtable
        .s
        .iter()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    let granularity = i64::from(block.granularity.unwrap_or(100));
    let lat_offset = block.lat_offset.unwrap_or(0);
    let lon_offset = block.lon_offset.unwrap_or(0);
    let coord = |offset: i64, raw: i64| 1e-9 * (offset + granularity * raw) as f64;

    let mut batches = Batches::default();

    for group in &block.primitivegroup {
        if let Some(dense) = &group.dense {
            let n = dense.id.len().min(dense.lat.len()).min(dense.lon.len());
            let mut id = 0i64;
            let mut lat = 0i64;
            let mut lon = 0i64;
            let mut kv = dense.keys_vals.iter();
            for i in 0..n {
                id += dense.id[i];
                lat += dense.lat[i];
                lon += dense.lon[i];
                let lon_deg = coord(lon_offset, lon);
                let lat_deg = coord(lat_offset, lat);
                batches.coords.push(Coord {
                    id,
                    lon: lon_deg,
                    lat: lat_deg,
                });

                let mut tags = Tags::new();
                while let Some(&k) = kv.next() {
                    if k == 0 {
                        break;
                    }
                    let Some(&v) = kv.next() else { break };
                    if let (Some(key), Some(val)) =
                        (strings.get(k as usize), strings.get(v as usize))
                    {
                        tags.insert(key.clone(), val.clone());
                    }
                }
                if !tags.is_empty() {
                    batches.nodes.push(Node {
                        id,
                        lon: lon_deg,
                        lat: lat_deg,
                        tags,
                        geom: None,
                    });
                }
            }
        }

        for node in &group.nodes {
            let lon_deg = coord(lon_offset, node.lon);
            let lat_deg = coord(lat_offset, node.lat);
            batches.coords.push(Coord {
                id: node.id,
                lon: lon_deg,
                lat: lat_deg,
            });
            let tags = decode_tags(&strings, &node.keys, &node.vals);
            if !tags.is_empty() {
                batches.nodes.push(Node {
                    id: node.id,
                    lon: lon_deg,
                    lat: lat_deg,
                    tags,
                    geom: None,
                });
            }
        }

        for way in &group.ways {
            let mut refs = Vec::with_capacity(way.refs.len());
            let mut id = 0i64;
            for delta in &way.refs {
                id += delta;
                refs.push(id);
            }
            batches.ways.push(Way {
                id: way.id,
                refs,
                tags: decode_tags(&strings, &way.keys, &way.vals),
                nodes: Vec::new(),
                geom: None,
            });
        }

        for rel in &group.relations {
            let n = rel.memids.len().min(rel.types.len());
            let mut members = Vec::with_capacity(n);
            let mut id = 0i64;
            for i in 0..n {
                id += rel.memids[i];
                let kind = match pbf_relation::MemberType::try_from(rel.types[i]) {
                    Ok(pbf_relation::MemberType::Node) => MemberKind::Node,
                    Ok(pbf_relation::MemberType::Way) => MemberKind::Way,
                    Ok(pbf_relation::MemberType::Relation) => MemberKind::Relation,
                    Err(_) => continue,
                };
                let role = rel
                    .roles_sid
                    .get(i)
                    .and_then(|&sid| strings.get(sid as usize))
                    .cloned()
                    .unwrap_or_default();
                members.push(Member {
                    id,
                    kind,
                    role,
                    way: None,
                });
            }
            batches.relations.push(Relation {
                id: rel.id,
                members,
                tags: decode_tags(&strings, &rel.keys, &rel.vals),
                geom: None,
            });
        }
    }

    batches
}

fn decode_tags(strings: &[String], keys: &[u32], vals: &[u32]) -> Tags {
    let mut tags = Tags::with_capacity(keys.len());
    for (&k, &v) in keys.iter().zip(vals) {
        if let (Some(key), Some(val)) = (strings.get(k as usize), strings.get(v as usize)) {
            tags.insert(key.clone(), val.clone());
        }
    }
    tags
}
