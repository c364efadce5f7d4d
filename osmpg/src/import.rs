//! The two-phase import. The read phase decodes blocks in parallel and
//! fans batches out to per-entity cache writers; the write phase reopens
//! the cache and assembles geometries: relations sequentially, ways in
//! parallel, nodes sequentially, all feeding the shared insert buffer.

use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::thread;

use crossbeam_channel::bounded;
use log::{info, warn};
use memmap2::Mmap;

use osmcache::element::{Coord, Node, Relation, Way};
use osmcache::{DiffCache, Error as CacheError, OsmCache};

use crate::args::Args;
use crate::db::{self, Database};
use crate::geom::GeomBuilder;
use crate::mapping::Mapping;
use crate::osmpbf::{self, BlockType, HeaderBlock, PrimitiveBlock};
use crate::proj;
use crate::stats::{self, Progress};
use crate::writer::{self, DbWriter, InsertBuffer};

/// Channel capacity, in batches. Bounded so slow cache writers push back
/// on fast parsers.
const CHANNEL_CAP: usize = 16;

/// Node cache writers; node volume after tag filtering is small.
const NODE_WRITERS: usize = 2;

const SUPPORTED_FEATURES: [&str; 2] = ["OsmSchema-V0.6", "DenseNodes"];

#[derive(Debug, Clone, Copy, Default)]
pub struct SkipFlags {
    pub coords: bool,
    pub nodes: bool,
    pub ways: bool,
}

impl SkipFlags {
    pub fn from_env() -> SkipFlags {
        fn set(name: &str) -> bool {
            std::env::var_os(name).is_some_and(|v| !v.is_empty())
        }
        SkipFlags {
            coords: set("OSMPG_SKIP_COORDS"),
            nodes: set("OSMPG_SKIP_NODES"),
            ways: set("OSMPG_SKIP_WAYS"),
        }
    }
}

fn check_header(header: &HeaderBlock) {
    for feature in &header.required_features {
        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
            warn!("input requires unsupported feature {feature}");
        }
    }
    if let Some(source) = &header.source {
        info!("input source: {source}");
    }
}

/// Parses the dump at `path` into the cache. The coord store must already
/// be in linear-import mode.
pub fn read_phase(
    cache: &OsmCache,
    progress: &Progress,
    mapping: &Mapping,
    path: &Path,
    skip: &SkipFlags,
) -> Result<(), Box<dyn Error>> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let data: &[u8] = &mmap;
    let nworkers = num_cpus::get();

    let mut blocks = osmpbf::block_index(data).peekable();
    if !data.is_empty() && blocks.peek().is_none() {
        return Err(format!("{} is not a PBF file", path.display()).into());
    }

    let (pos_tx, pos_rx) = bounded(CHANNEL_CAP);
    let (coord_tx, coord_rx) = bounded::<Vec<Coord>>(CHANNEL_CAP);
    let (node_tx, node_rx) = bounded::<Vec<Node>>(CHANNEL_CAP);
    let (way_tx, way_rx) = bounded::<Vec<Way>>(CHANNEL_CAP);
    let (rel_tx, rel_rx) = bounded::<Vec<Relation>>(CHANNEL_CAP);

    thread::scope(|s| {
        s.spawn(move || {
            for idx in blocks {
                match idx.block_type {
                    BlockType::Header => match osmpbf::read_block::<HeaderBlock>(data, &idx) {
                        Ok(header) => check_header(&header),
                        Err(e) => warn!("dropping undecodable header block: {e}"),
                    },
                    BlockType::Primitive => {
                        if pos_tx.send(idx).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        for _ in 0..nworkers {
            let pos_rx = pos_rx.clone();
            let coord_tx = coord_tx.clone();
            let node_tx = node_tx.clone();
            let way_tx = way_tx.clone();
            let rel_tx = rel_tx.clone();
            s.spawn(move || {
                for idx in pos_rx {
                    let block: PrimitiveBlock = match osmpbf::read_block(data, &idx) {
                        Ok(block) => block,
                        Err(e) => {
                            warn!("dropping undecodable block at offset {}: {}", idx.blob_start, e);
                            continue;
                        }
                    };
                    let batches = osmpbf::decode_block(&block);
                    progress.add_blocks(1);
                    if !batches.coords.is_empty() {
                        let _ = coord_tx.send(batches.coords);
                    }
                    if !batches.nodes.is_empty() {
                        let _ = node_tx.send(batches.nodes);
                    }
                    if !batches.ways.is_empty() {
                        let _ = way_tx.send(batches.ways);
                    }
                    if !batches.relations.is_empty() {
                        let _ = rel_tx.send(batches.relations);
                    }
                }
            });
        }
        drop(pos_rx);
        drop(coord_tx);
        drop(node_tx);
        drop(way_tx);
        drop(rel_tx);

        for _ in 0..nworkers {
            let rx = coord_rx.clone();
            s.spawn(move || {
                for batch in rx {
                    if skip.coords {
                        continue;
                    }
                    match cache.coords.put_coords(&batch) {
                        Ok(()) => progress.add_coords(batch.len()),
                        Err(e) => warn!("dropping coord batch: {e}"),
                    }
                }
            });
        }

        for _ in 0..NODE_WRITERS {
            let rx = node_rx.clone();
            s.spawn(move || {
                let filter = mapping.node_tag_filter();
                for mut batch in rx {
                    if skip.nodes {
                        continue;
                    }
                    for node in &mut batch {
                        filter.filter(&mut node.tags);
                    }
                    match cache.nodes.put_nodes(&batch) {
                        Ok(written) => progress.add_nodes(written),
                        Err(e) => warn!("dropping node batch: {e}"),
                    }
                }
            });
        }

        for _ in 0..nworkers {
            let rx = way_rx.clone();
            s.spawn(move || {
                let filter = mapping.way_tag_filter();
                for mut batch in rx {
                    if skip.ways {
                        continue;
                    }
                    for way in &mut batch {
                        filter.filter(&mut way.tags);
                    }
                    match cache.ways.put_ways(&batch) {
                        Ok(()) => progress.add_ways(batch.len()),
                        Err(e) => warn!("dropping way batch: {e}"),
                    }
                }
            });
        }

        for _ in 0..nworkers {
            let rx = rel_rx.clone();
            s.spawn(move || {
                let filter = mapping.relation_tag_filter();
                for mut batch in rx {
                    for rel in &mut batch {
                        filter.filter(&mut rel.tags);
                    }
                    match cache.relations.put_relations(&batch) {
                        Ok(()) => progress.add_relations(batch.len()),
                        Err(e) => warn!("dropping relation batch: {e}"),
                    }
                }
            });
        }
        drop(coord_rx);
        drop(node_rx);
        drop(way_rx);
        drop(rel_rx);
    });

    Ok(())
}

/// Assembles features from a flushed cache and streams them into the sink.
pub fn write_phase(
    cache: &OsmCache,
    progress: &Progress,
    mapping: &Mapping,
    database: Box<dyn Database>,
    diff: Option<&DiffCache>,
    srid: i32,
    batch_size: usize,
) -> Result<(), Box<dyn Error>> {
    let (buffer, batch_rx) = InsertBuffer::new(batch_size);
    let db_writer = DbWriter::spawn(database, batch_rx);

    // Relations run sequentially: assembly touches many ways transitively,
    // and marking members as inserted must serialize with the marker reads
    // of later relations.
    let polygons = mapping.polygon_matcher();
    let mut geom = GeomBuilder::new(srid);
    for rel in cache.relations.iter() {
        let mut rel = match rel {
            Ok(rel) => rel,
            Err(e) => {
                warn!("skipping unreadable relation: {e}");
                continue;
            }
        };
        progress.add_relations(1);
        match cache.ways.fill_members(&mut rel.members) {
            // missing member ways are tolerated, partial relations may
            // still close their rings
            Ok(()) | Err(CacheError::NotFound) => {}
            Err(e) => {
                warn!("relation {}: {}", rel.id, e);
                continue;
            }
        }
        for member in &mut rel.members {
            let Some(way) = member.way.as_mut() else {
                continue;
            };
            match cache.coords.fill_way(way) {
                Ok(()) => proj::nodes_to_merc(&mut way.nodes),
                Err(CacheError::NotFound) => {}
                Err(e) => warn!("relation {} way {}: {}", rel.id, way.id, e),
            }
        }
        if let Err(e) = geom.build_relation(&mut rel) {
            if e.level() > 0 {
                warn!("relation {}: {}", rel.id, e);
            }
            continue;
        }
        let matches = polygons.matches(&rel.tags);
        if !matches.is_empty() {
            for m in &matches {
                buffer.insert(&m.table.name, m.row(rel.id, &rel.tags, rel.geom.as_deref()));
            }
            if let Err(e) = cache.inserted_ways.put_members(&rel.members) {
                warn!("relation {}: {}", rel.id, e);
            }
        }
    }

    // Ways run in parallel; the inserted-ways marker is read-only here.
    let nworkers = num_cpus::get();
    let (way_tx, way_rx) = bounded::<Way>(CHANNEL_CAP);
    let buffer_ref = &buffer;
    thread::scope(|s| {
        s.spawn(move || {
            for way in cache.ways.iter() {
                match way {
                    Ok(way) => {
                        if way_tx.send(way).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping unreadable way: {e}"),
                }
            }
        });

        for _ in 0..nworkers {
            let rx = way_rx.clone();
            s.spawn(move || {
                let line_strings = mapping.line_string_matcher();
                let polygons = mapping.polygon_matcher();
                let mut geom = GeomBuilder::new(srid);
                for mut way in rx {
                    progress.add_ways(1);
                    match cache.inserted_ways.is_inserted(way.id) {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => {
                            warn!("way {}: {}", way.id, e);
                            continue;
                        }
                    }
                    if cache.coords.fill_way(&mut way).is_err() {
                        continue;
                    }
                    proj::nodes_to_merc(&mut way.nodes);

                    let matches = line_strings.matches(&way.tags);
                    if !matches.is_empty() {
                        // a copy per geometry branch, so the polygon branch
                        // never sees this geom
                        let mut line = way.clone();
                        match geom.line_string_wkb(&line.nodes) {
                            Ok(wkb) => {
                                line.geom = Some(wkb);
                                for m in &matches {
                                    buffer_ref.insert(
                                        &m.table.name,
                                        m.row(line.id, &line.tags, line.geom.as_deref()),
                                    );
                                }
                            }
                            Err(e) => {
                                if e.level() > 0 {
                                    warn!("way {}: {}", way.id, e);
                                }
                                continue;
                            }
                        }
                    }
                    if way.is_closed() {
                        let matches = polygons.matches(&way.tags);
                        if !matches.is_empty() {
                            let mut area = way.clone();
                            match geom.polygon_wkb(&area.nodes) {
                                Ok(wkb) => {
                                    area.geom = Some(wkb);
                                    for m in &matches {
                                        buffer_ref.insert(
                                            &m.table.name,
                                            m.row(area.id, &area.tags, area.geom.as_deref()),
                                        );
                                    }
                                }
                                Err(e) => {
                                    if e.level() > 0 {
                                        warn!("way {}: {}", way.id, e);
                                    }
                                    continue;
                                }
                            }
                        }
                    }
                    if let Some(diff) = diff {
                        if let Err(e) = diff.coords.add_from_way(&way) {
                            warn!("way {}: {}", way.id, e);
                        }
                    }
                }
            });
        }
        drop(way_rx);
    });

    // Nodes run sequentially; point volume after filtering is small.
    let points = mapping.point_matcher();
    for node in cache.nodes.iter() {
        let mut node = match node {
            Ok(node) => node,
            Err(e) => {
                warn!("skipping unreadable node: {e}");
                continue;
            }
        };
        progress.add_nodes(1);
        let matches = points.matches(&node.tags);
        if matches.is_empty() {
            continue;
        }
        proj::node_to_merc(&mut node);
        match geom.point_wkb(&node) {
            Ok(wkb) => {
                node.geom = Some(wkb);
                for m in &matches {
                    buffer.insert(&m.table.name, m.row(node.id, &node.tags, node.geom.as_deref()));
                }
            }
            Err(e) => {
                if e.level() > 0 {
                    warn!("node {}: {}", node.id, e);
                }
                continue;
            }
        }
    }

    buffer.close();
    db_writer.close();
    Ok(())
}

pub fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &args.cpuprofile {
        stats::start_cpu_profiler(path)?;
    }
    if let Some(arg) = &args.memprofile {
        stats::start_mem_profiler(arg)?;
    }

    if args.read.is_some() && OsmCache::exists(&args.cachedir) {
        if args.overwritecache {
            info!("removing existing cache {}", args.cachedir.display());
            OsmCache::remove(&args.cachedir)?;
        } else if !args.appendcache {
            return Err("cache already exists, use --appendcache or --overwritecache".into());
        }
    }
    let cache = OsmCache::open(&args.cachedir)?;
    let mapping = Mapping::from_file(&args.mapping)?;
    let progress = Progress::start();

    if let Some(path) = &args.read {
        cache.coords.set_linear_import(true);
        read_phase(&cache, &progress, &mapping, path, &SkipFlags::from_env())?;
        cache.coords.set_linear_import(false);
        progress.reset();
        cache.coords.flush()?;
    }

    if args.write {
        progress.reset();
        let diff_cache = if args.diff {
            DiffCache::remove(&args.cachedir)?;
            Some(DiffCache::open(&args.cachedir)?)
        } else {
            None
        };

        let config = db::Config {
            db_type: "postgis".to_string(),
            connection_params: args.connection.clone().unwrap_or_default(),
            srid: 3857,
        };
        let mut database = db::open(&config)?;
        database.init(&mapping)?;
        write_phase(
            &cache,
            &progress,
            &mapping,
            database,
            diff_cache.as_ref(),
            config.srid,
            writer::batch_size_from_env(),
        )?;
        if let Some(diff) = diff_cache {
            diff.coords.close()?;
        }
    }

    progress.stop();
    cache.close();
    Ok(())
}
