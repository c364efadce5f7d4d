//! Geometry assembly. Emits PostGIS EWKB for points, line strings and
//! (multi)polygons, and builds relation polygons by stitching member ways
//! into rings.
//!
//! Each worker owns its own `GeomBuilder`; handles are never shared across
//! threads.

use osmcache::element::{Coord, Node, Relation};
use thiserror::Error;

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const WKB_POINT: u32 = 1;
const WKB_LINE_STRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTI_POLYGON: u32 = 6;

/// Classified geometry error. Level ≤ 0 marks the expected, non-noteworthy
/// failures (degenerate input, unclosed rings, non-area relations) that
/// callers drop without logging.
#[derive(Debug, Error)]
pub enum GeomError {
    #[error("{msg}")]
    Classified { msg: String, level: i32 },
}

impl GeomError {
    fn expected(msg: impl Into<String>) -> GeomError {
        GeomError::Classified {
            msg: msg.into(),
            level: 0,
        }
    }

    pub fn level(&self) -> i32 {
        match self {
            GeomError::Classified { level, .. } => *level,
        }
    }
}

pub struct GeomBuilder {
    srid: i32,
}

impl GeomBuilder {
    pub fn new(srid: i32) -> GeomBuilder {
        GeomBuilder { srid }
    }

    fn header(&self, buf: &mut Vec<u8>, type_code: u32) {
        buf.push(1); // little endian
        buf.extend((type_code | EWKB_SRID_FLAG).to_le_bytes());
        buf.extend(self.srid.to_le_bytes());
    }

    pub fn point_wkb(&mut self, node: &Node) -> Result<Vec<u8>, GeomError> {
        let mut buf = Vec::with_capacity(25);
        self.header(&mut buf, WKB_POINT);
        write_point(&mut buf, node.lon, node.lat);
        Ok(buf)
    }

    pub fn line_string_wkb(&mut self, nodes: &[Coord]) -> Result<Vec<u8>, GeomError> {
        if nodes.len() < 2 {
            return Err(GeomError::expected("line string with fewer than two points"));
        }
        let mut buf = Vec::with_capacity(13 + 16 * nodes.len());
        self.header(&mut buf, WKB_LINE_STRING);
        write_ring(&mut buf, nodes);
        Ok(buf)
    }

    pub fn polygon_wkb(&mut self, nodes: &[Coord]) -> Result<Vec<u8>, GeomError> {
        if nodes.len() < 4 || nodes[0].id != nodes[nodes.len() - 1].id {
            return Err(GeomError::expected("unclosed polygon ring"));
        }
        if signed_area(nodes) == 0.0 {
            return Err(GeomError::expected("degenerate polygon ring"));
        }
        let mut shell = nodes.to_vec();
        if signed_area(&shell) < 0.0 {
            shell.reverse();
        }
        let mut buf = Vec::with_capacity(17 + 16 * shell.len());
        self.header(&mut buf, WKB_POLYGON);
        buf.extend(1u32.to_le_bytes());
        write_ring(&mut buf, &shell);
        Ok(buf)
    }

    /// Assembles the polygonal geometry of an area relation from its filled
    /// way members and stores it on the relation. Member coords must
    /// already be projected.
    pub fn build_relation(&mut self, rel: &mut Relation) -> Result<(), GeomError> {
        match rel.tags.get("type").map(String::as_str) {
            Some("multipolygon") | Some("boundary") => {}
            _ => return Err(GeomError::expected("not an area relation")),
        }

        let segments: Vec<Vec<Coord>> = rel
            .members
            .iter()
            .filter_map(|m| m.way.as_ref())
            .filter(|w| w.nodes.len() >= 2)
            .map(|w| w.nodes.clone())
            .collect();
        if segments.is_empty() {
            return Err(GeomError::expected("no way members with coordinates"));
        }

        let mut rings = stitch_rings(segments);
        rings.retain(|r| signed_area(r) != 0.0);
        if rings.is_empty() {
            return Err(GeomError::expected("no closed rings"));
        }
        rings.sort_by(|a, b| signed_area(b).abs().total_cmp(&signed_area(a).abs()));

        // largest ring first, so every hole finds its shell already placed
        let mut polygons: Vec<(Vec<Coord>, Vec<Vec<Coord>>)> = Vec::new();
        for ring in rings {
            match polygons
                .iter()
                .position(|(shell, _)| point_in_ring(ring[0], shell))
            {
                Some(i) => polygons[i].1.push(ring),
                None => polygons.push((ring, Vec::new())),
            }
        }

        for (shell, holes) in &mut polygons {
            if signed_area(shell) < 0.0 {
                shell.reverse();
            }
            for hole in holes {
                if signed_area(hole) > 0.0 {
                    hole.reverse();
                }
            }
        }

        let mut buf = Vec::new();
        if polygons.len() == 1 {
            self.header(&mut buf, WKB_POLYGON);
            write_polygon_body(&mut buf, &polygons[0]);
        } else {
            self.header(&mut buf, WKB_MULTI_POLYGON);
            buf.extend((polygons.len() as u32).to_le_bytes());
            for poly in &polygons {
                buf.push(1);
                buf.extend(WKB_POLYGON.to_le_bytes());
                write_polygon_body(&mut buf, poly);
            }
        }
        rel.geom = Some(buf);
        Ok(())
    }
}

fn write_point(buf: &mut Vec<u8>, x: f64, y: f64) {
    buf.extend(x.to_le_bytes());
    buf.extend(y.to_le_bytes());
}

fn write_ring(buf: &mut Vec<u8>, ring: &[Coord]) {
    buf.extend((ring.len() as u32).to_le_bytes());
    for c in ring {
        write_point(buf, c.lon, c.lat);
    }
}

fn write_polygon_body(buf: &mut Vec<u8>, (shell, holes): &(Vec<Coord>, Vec<Vec<Coord>>)) {
    buf.extend((1 + holes.len() as u32).to_le_bytes());
    write_ring(buf, shell);
    for hole in holes {
        write_ring(buf, hole);
    }
}

/// Joins way segments into closed rings by matching endpoint ids. Chains
/// that cannot be closed are dropped.
fn stitch_rings(mut open: Vec<Vec<Coord>>) -> Vec<Vec<Coord>> {
    let mut rings = Vec::new();
    'next: while let Some(mut cur) = open.pop() {
        loop {
            if cur.len() >= 4 && cur[0].id == cur[cur.len() - 1].id {
                rings.push(cur);
                continue 'next;
            }
            let last_id = cur[cur.len() - 1].id;
            let Some(i) = open
                .iter()
                .position(|seg| seg[0].id == last_id || seg[seg.len() - 1].id == last_id)
            else {
                continue 'next;
            };
            let mut seg = open.swap_remove(i);
            if seg[0].id != last_id {
                seg.reverse();
            }
            cur.extend_from_slice(&seg[1..]);
        }
    }
    rings
}

/// Twice the signed area of a closed ring; positive for counter-clockwise.
fn signed_area(ring: &[Coord]) -> f64 {
    let mut sum = 0.0;
    for w in ring.windows(2) {
        sum += (w[1].lon - w[0].lon) * (w[1].lat + w[0].lat);
    }
    -sum
}

fn point_in_ring(p: Coord, ring: &[Coord]) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x = a.lon + (p.lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
            if x > p.lon {
                inside = !inside;
            }
        }
    }
    inside
}
