//! End-to-end import scenarios: synthesized PBF dumps run through both
//! phases against a temp cache, with rows observed through an in-memory
//! sink.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use prost::Message;
use tempfile::TempDir;

use osmcache::element::Node;
use osmcache::{DiffCache, OsmCache};
use osmpg::db::{Database, DbError, Row, SqlValue};
use osmpg::mapping::Mapping;
use osmpg::osmpbf::{
    Blob, BlobHeader, DenseNodes, HeaderBlock, PbfRelation, PbfWay, PrimitiveBlock,
    PrimitiveGroup, StringTable,
};
use osmpg::stats::Progress;
use osmpg::{proj, read_phase, write_phase, SkipFlags};

const MAPPING: &str = r#"{
    "tables": {
        "poi": {
            "type": "point",
            "mapping": { "amenity": ["cafe"] },
            "columns": [
                { "name": "osm_id", "type": "id" },
                { "name": "geometry", "type": "geometry" },
                { "name": "name", "type": "string", "key": "name" }
            ]
        },
        "roads": {
            "type": "linestring",
            "mapping": { "highway": ["__any__"] },
            "columns": [
                { "name": "osm_id", "type": "id" },
                { "name": "geometry", "type": "geometry" }
            ]
        },
        "buildings": {
            "type": "polygon",
            "mapping": { "building": ["__any__"] },
            "columns": [
                { "name": "osm_id", "type": "id" },
                { "name": "geometry", "type": "geometry" }
            ]
        },
        "landusages": {
            "type": "polygon",
            "mapping": { "landuse": ["forest", "park"] },
            "columns": [
                { "name": "osm_id", "type": "id" },
                { "name": "geometry", "type": "geometry" }
            ]
        }
    }
}"#;

// ---------------------------------------------------------------------------
// dump builder

struct Strings {
    table: Vec<Vec<u8>>,
}

impl Strings {
    fn new() -> Strings {
        Strings {
            table: vec![Vec::new()],
        }
    }

    fn idx(&mut self, s: &str) -> u32 {
        match self.table.iter().position(|e| e == s.as_bytes()) {
            Some(i) => i as u32,
            None => {
                self.table.push(s.as_bytes().to_vec());
                (self.table.len() - 1) as u32
            }
        }
    }
}

#[derive(Default)]
struct DumpBuilder {
    nodes: Vec<(i64, f64, f64, Vec<(String, String)>)>,
    ways: Vec<(i64, Vec<i64>, Vec<(String, String)>)>,
    relations: Vec<(i64, Vec<(i64, i32, String)>, Vec<(String, String)>)>,
}

impl DumpBuilder {
    fn node(mut self, id: i64, lon: f64, lat: f64, tags: &[(&str, &str)]) -> Self {
        self.nodes.push((
            id,
            lon,
            lat,
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }

    fn way(mut self, id: i64, refs: &[i64], tags: &[(&str, &str)]) -> Self {
        self.ways.push((
            id,
            refs.to_vec(),
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }

    /// members: (ref id, type: 0 node / 1 way / 2 relation, role)
    fn relation(mut self, id: i64, members: &[(i64, i32, &str)], tags: &[(&str, &str)]) -> Self {
        self.relations.push((
            id,
            members
                .iter()
                .map(|(id, ty, role)| (*id, *ty, role.to_string()))
                .collect(),
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }

    fn build(self) -> Vec<u8> {
        let mut strings = Strings::new();
        let mut group = PrimitiveGroup::default();

        if !self.nodes.is_empty() {
            let mut dense = DenseNodes::default();
            let (mut prev_id, mut prev_lat, mut prev_lon) = (0i64, 0i64, 0i64);
            for (id, lon, lat, tags) in &self.nodes {
                // granularity 100 => raw units of 1e-7 degrees
                let raw_lat = (lat * 1e7).round() as i64;
                let raw_lon = (lon * 1e7).round() as i64;
                dense.id.push(id - prev_id);
                dense.lat.push(raw_lat - prev_lat);
                dense.lon.push(raw_lon - prev_lon);
                prev_id = *id;
                prev_lat = raw_lat;
                prev_lon = raw_lon;
                for (k, v) in tags {
                    dense.keys_vals.push(strings.idx(k) as i32);
                    dense.keys_vals.push(strings.idx(v) as i32);
                }
                dense.keys_vals.push(0);
            }
            group.dense = Some(dense);
        }

        for (id, refs, tags) in &self.ways {
            let mut way = PbfWay {
                id: *id,
                ..Default::default()
            };
            let mut prev = 0i64;
            for r in refs {
                way.refs.push(r - prev);
                prev = *r;
            }
            for (k, v) in tags {
                way.keys.push(strings.idx(k));
                way.vals.push(strings.idx(v));
            }
            group.ways.push(way);
        }

        for (id, members, tags) in &self.relations {
            let mut rel = PbfRelation {
                id: *id,
                ..Default::default()
            };
            let mut prev = 0i64;
            for (mid, ty, role) in members {
                rel.memids.push(mid - prev);
                prev = *mid;
                rel.types.push(*ty);
                rel.roles_sid.push(strings.idx(role) as i32);
            }
            for (k, v) in tags {
                rel.keys.push(strings.idx(k));
                rel.vals.push(strings.idx(v));
            }
            group.relations.push(rel);
        }

        let block = PrimitiveBlock {
            stringtable: StringTable { s: strings.table },
            primitivegroup: vec![group],
            granularity: None,
            date_granularity: None,
            lat_offset: None,
            lon_offset: None,
        };

        let mut data = frame("OSMHeader", HeaderBlock::default().encode_to_vec());
        data.extend(frame("OSMData", block.encode_to_vec()));
        data
    }
}

fn frame(block_type: &str, body: Vec<u8>) -> Vec<u8> {
    let blob = Blob {
        raw: Some(body.clone()),
        raw_size: Some(body.len() as i32),
        zlib_data: None,
        lzma_data: None,
    };
    let blob_bytes = blob.encode_to_vec();
    let header = BlobHeader {
        r#type: block_type.to_string(),
        indexdata: None,
        datasize: blob_bytes.len() as i32,
    };
    let header_bytes = header.encode_to_vec();
    let mut out = Vec::new();
    out.extend((header_bytes.len() as i32).to_be_bytes());
    out.extend(header_bytes);
    out.extend(blob_bytes);
    out
}

// ---------------------------------------------------------------------------
// in-memory sink

type RowStore = Arc<Mutex<HashMap<String, Vec<Row>>>>;

#[derive(Clone, Default)]
struct MemDb {
    rows: RowStore,
}

impl Database for MemDb {
    fn init(&mut self, _mapping: &Mapping) -> Result<(), DbError> {
        Ok(())
    }

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<(), DbError> {
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// fixture

struct Fixture {
    rows: RowStore,
    cache: OsmCache,
    diff: Option<DiffCache>,
    _dir: TempDir,
}

impl Fixture {
    fn rows_for(&self, table: &str) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn total_rows(&self) -> usize {
        self.rows.lock().unwrap().values().map(Vec::len).sum()
    }
}

fn import(dump: Vec<u8>, skip: SkipFlags, use_diff: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let dump_path = dir.path().join("dump.osm.pbf");
    fs::write(&dump_path, dump).unwrap();
    let cachedir = dir.path().join("cache");

    let cache = OsmCache::open(&cachedir).unwrap();
    let mapping = Mapping::parse(MAPPING).unwrap();
    let progress = Progress::start();

    cache.coords.set_linear_import(true);
    read_phase(&cache, &progress, &mapping, &dump_path, &skip).unwrap();
    cache.coords.set_linear_import(false);
    progress.reset();
    cache.coords.flush().unwrap();

    let diff = if use_diff {
        Some(DiffCache::open(&cachedir).unwrap())
    } else {
        None
    };
    let db = MemDb::default();
    let rows = db.rows.clone();
    write_phase(
        &cache,
        &progress,
        &mapping,
        Box::new(db),
        diff.as_ref(),
        3857,
        4096,
    )
    .unwrap();
    if let Some(diff) = &diff {
        diff.coords.close().unwrap();
    }
    progress.stop();

    Fixture {
        rows,
        cache,
        diff,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// wkb helpers

const EWKB_SRID_FLAG: u32 = 0x2000_0000;

fn geom_of(row: &Row) -> &[u8] {
    match &row[1] {
        SqlValue::Bytes(b) => b,
        other => panic!("geometry column holds {other:?}"),
    }
}

fn id_of(row: &Row) -> i64 {
    match &row[0] {
        SqlValue::Int(id) => *id,
        other => panic!("id column holds {other:?}"),
    }
}

fn wkb_type(geom: &[u8]) -> u32 {
    u32::from_le_bytes(geom[1..5].try_into().unwrap()) & !EWKB_SRID_FLAG
}

fn wkb_point(geom: &[u8]) -> (f64, f64) {
    (
        f64::from_le_bytes(geom[9..17].try_into().unwrap()),
        f64::from_le_bytes(geom[17..25].try_into().unwrap()),
    )
}

fn wkb_line_points(geom: &[u8]) -> Vec<(f64, f64)> {
    let n = u32::from_le_bytes(geom[9..13].try_into().unwrap()) as usize;
    (0..n)
        .map(|i| {
            let at = 13 + 16 * i;
            (
                f64::from_le_bytes(geom[at..at + 8].try_into().unwrap()),
                f64::from_le_bytes(geom[at + 8..at + 16].try_into().unwrap()),
            )
        })
        .collect()
}

fn project(lon: f64, lat: f64) -> (f64, f64) {
    let mut node = Node {
        id: 0,
        lon,
        lat,
        ..Default::default()
    };
    proj::node_to_merc(&mut node);
    (node.lon, node.lat)
}

// ---------------------------------------------------------------------------
// scenarios

#[test]
fn single_tagged_node_becomes_a_point_row() {
    let dump = DumpBuilder::default()
        .node(1, 10.0, 50.0, &[("amenity", "cafe"), ("name", "Corner Cafe")])
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let rows = fx.rows_for("poi");
    assert_eq!(rows.len(), 1);
    assert_eq!(id_of(&rows[0]), 1);
    assert_eq!(rows[0][2], SqlValue::Text("Corner Cafe".into()));

    let geom = geom_of(&rows[0]);
    assert_eq!(wkb_type(geom), 1);
    let (x, y) = wkb_point(geom);
    let (ex, ey) = project(10.0, 50.0);
    assert!((x - ex).abs() < 1e-6);
    assert!((y - ey).abs() < 1e-6);
}

#[test]
fn way_becomes_a_line_string_with_points_in_order() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 1.0, 1.0, &[])
        .way(100, &[1, 2], &[("highway", "primary")])
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let rows = fx.rows_for("roads");
    assert_eq!(rows.len(), 1);
    assert_eq!(id_of(&rows[0]), 100);
    let geom = geom_of(&rows[0]);
    assert_eq!(wkb_type(geom), 2);
    let points = wkb_line_points(geom);
    assert_eq!(points.len(), 2);
    let (ex, ey) = project(0.0, 0.0);
    assert!((points[0].0 - ex).abs() < 1e-6 && (points[0].1 - ey).abs() < 1e-6);
    let (ex, ey) = project(1.0, 1.0);
    assert!((points[1].0 - ex).abs() < 1e-6 && (points[1].1 - ey).abs() < 1e-6);
}

#[test]
fn closed_way_becomes_a_polygon_but_no_line_string() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 0.001, 0.0, &[])
        .node(3, 0.001, 0.001, &[])
        .node(4, 0.0, 0.001, &[])
        .way(200, &[1, 2, 3, 4, 1], &[("building", "yes")])
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let rows = fx.rows_for("buildings");
    assert_eq!(rows.len(), 1);
    assert_eq!(wkb_type(geom_of(&rows[0])), 3);
    assert!(fx.rows_for("roads").is_empty());
}

#[test]
fn dual_match_emits_two_independent_geometries() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 0.001, 0.0, &[])
        .node(3, 0.001, 0.001, &[])
        .node(4, 0.0, 0.001, &[])
        .way(
            200,
            &[1, 2, 3, 4, 1],
            &[("highway", "service"), ("building", "yes")],
        )
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let roads = fx.rows_for("roads");
    let buildings = fx.rows_for("buildings");
    assert_eq!(roads.len(), 1);
    assert_eq!(buildings.len(), 1);
    assert_eq!(wkb_type(geom_of(&roads[0])), 2);
    assert_eq!(wkb_type(geom_of(&buildings[0])), 3);
    // the closed line string visits all five positions, the polygon ring too
    assert_eq!(wkb_line_points(geom_of(&roads[0])).len(), 5);
}

#[test]
fn multipolygon_relation_consumes_its_member_ways() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 0.01, 0.0, &[])
        .node(3, 0.01, 0.01, &[])
        .node(4, 0.0, 0.01, &[])
        .node(5, 0.004, 0.004, &[])
        .node(6, 0.006, 0.004, &[])
        .node(7, 0.006, 0.006, &[])
        .node(8, 0.004, 0.006, &[])
        .way(100, &[1, 2, 3, 4, 1], &[("building", "yes")])
        .way(200, &[5, 6, 7, 8, 5], &[])
        .relation(
            7,
            &[(100, 1, "outer"), (200, 1, "inner")],
            &[("type", "multipolygon"), ("landuse", "forest")],
        )
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let rows = fx.rows_for("landusages");
    assert_eq!(rows.len(), 1);
    assert_eq!(id_of(&rows[0]), 7);
    // polygon with outer and inner ring
    let geom = geom_of(&rows[0]);
    assert_eq!(wkb_type(geom), 3);
    assert_eq!(u32::from_le_bytes(geom[9..13].try_into().unwrap()), 2);

    // both members are marked and the way pass emitted nothing for them
    assert!(fx.cache.inserted_ways.is_inserted(100).unwrap());
    assert!(fx.cache.inserted_ways.is_inserted(200).unwrap());
    assert!(fx.rows_for("buildings").is_empty());
}

#[test]
fn skipped_ways_leave_relations_unassembled() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 0.01, 0.0, &[])
        .node(3, 0.01, 0.01, &[])
        .node(4, 0.0, 0.01, &[])
        .way(100, &[1, 2, 3, 4, 1], &[("building", "yes")])
        .relation(
            7,
            &[(100, 1, "outer")],
            &[("type", "multipolygon"), ("landuse", "forest")],
        )
        .build();
    let skip = SkipFlags {
        ways: true,
        ..Default::default()
    };
    let fx = import(dump, skip, false);

    assert!(fx.rows_for("buildings").is_empty());
    assert!(fx.rows_for("roads").is_empty());
    assert!(fx.rows_for("landusages").is_empty());
}

#[test]
fn skipped_coords_emit_no_geometries() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 1.0, 1.0, &[])
        .way(100, &[1, 2], &[("highway", "primary")])
        .build();
    let skip = SkipFlags {
        coords: true,
        ..Default::default()
    };
    let fx = import(dump, skip, false);

    assert_eq!(fx.cache.coords.iter().unwrap().count(), 0);
    assert_eq!(fx.total_rows(), 0);
}

#[test]
fn diff_mode_records_way_coord_associations() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 1.0, 1.0, &[])
        .way(100, &[1, 2], &[("highway", "primary")])
        .build();
    let fx = import(dump, SkipFlags::default(), true);

    let diff = fx.diff.as_ref().unwrap();
    assert_eq!(diff.coords.coord_refs(100).unwrap(), Some(vec![1, 2]));
}

#[test]
fn cached_ways_keep_their_parsed_refs() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .node(2, 1.0, 1.0, &[])
        .node(3, 2.0, 0.0, &[])
        .way(100, &[1, 2, 3], &[("highway", "primary")])
        .build();
    let fx = import(dump, SkipFlags::default(), false);

    let way = fx.cache.ways.get(100).unwrap();
    assert_eq!(way.refs, vec![1, 2, 3]);

    // round-trip law: resolved coords match what was parsed
    let mut way = way;
    fx.cache.coords.fill_way(&mut way).unwrap();
    assert_eq!(way.nodes[0].id, 1);
    assert!((way.nodes[1].lon - 1.0).abs() < 1e-7);
    assert!((way.nodes[2].lon - 2.0).abs() < 1e-7);
}

#[test]
fn relation_referencing_a_missing_way_is_silently_skipped() {
    let dump = DumpBuilder::default()
        .node(1, 0.0, 0.0, &[])
        .relation(
            7,
            &[(12345, 1, "outer")],
            &[("type", "multipolygon"), ("landuse", "forest")],
        )
        .build();
    let fx = import(dump, SkipFlags::default(), false);
    assert!(fx.rows_for("landusages").is_empty());
}
