//! Forward transform from geographic degrees (EPSG:4326) to spherical web
//! mercator (EPSG:3857), applied in place at assembly time.

use osmcache::element::{Coord, Node};

const MERC_MAX: f64 = 20_037_508.342789244;
/// Latitudes beyond this are outside the mercator plane and get clamped.
const LAT_LIMIT: f64 = 85.05112877980659;

fn merc_x(lon: f64) -> f64 {
    lon * MERC_MAX / 180.0
}

fn merc_y(lat: f64) -> f64 {
    let lat = lat.clamp(-LAT_LIMIT, LAT_LIMIT);
    let y = ((90.0 + lat) * std::f64::consts::PI / 360.0).tan().ln() / (std::f64::consts::PI / 180.0);
    y * MERC_MAX / 180.0
}

pub fn node_to_merc(node: &mut Node) {
    node.lon = merc_x(node.lon);
    node.lat = merc_y(node.lat);
}

pub fn nodes_to_merc(coords: &mut [Coord]) {
    for c in coords {
        c.lon = merc_x(c.lon);
        c.lat = merc_y(c.lat);
    }
}
