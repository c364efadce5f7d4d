//! Persistent keyed stores for two-phase OSM imports.
//!
//! A planet dump defines nodes, ways and relations independently; joining
//! them by reference needs a random-access index far larger than memory.
//! This crate provides that index: one sorted key-value store per entity
//! kind under a common cache directory, written by the parallel read phase
//! and iterated by the assembly phase. The coord store additionally has a
//! bulk-load fast path for the initial linear import.

pub mod codec;
pub mod element;

mod coords;
mod diff;
mod error;
mod inserted;
mod nodes;
mod relations;
mod ways;

pub use coords::CoordStore;
pub use diff::{DiffCache, DiffCoordStore};
pub use error::{Error, Result};
pub use inserted::InsertedWayStore;
pub use nodes::NodeStore;
pub use relations::RelationStore;
pub use ways::WayStore;

use std::fs;
use std::path::Path;

use rocksdb::{Options, DB};

const STORES: [&str; 5] = ["coords", "nodes", "ways", "relations", "inserted_ways"];

pub(crate) fn open_db(path: &Path) -> Result<DB> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(4);
    opts.set_write_buffer_size(128 * 1024 * 1024);
    Ok(DB::open(&opts, path)?)
}

/// Facade over the per-entity stores. The read phase writes, the write
/// phase reads; the cache outlives the process and may be re-used to run
/// the write phase alone.
pub struct OsmCache {
    pub coords: CoordStore,
    pub nodes: NodeStore,
    pub ways: WayStore,
    pub relations: RelationStore,
    pub inserted_ways: InsertedWayStore,
}

impl OsmCache {
    pub fn exists(dir: &Path) -> bool {
        STORES.iter().any(|name| dir.join(name).exists())
    }

    /// Removes the entity stores. The diff index under `dir/diff` is left
    /// alone; `DiffCache::remove` handles it.
    pub fn remove(dir: &Path) -> Result<()> {
        for name in STORES {
            let path = dir.join(name);
            if path.exists() {
                fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }

    pub fn open(dir: &Path) -> Result<OsmCache> {
        fs::create_dir_all(dir)?;
        Ok(OsmCache {
            coords: CoordStore::open(&dir.join("coords"))?,
            nodes: NodeStore::open(&dir.join("nodes"))?,
            ways: WayStore::open(&dir.join("ways"))?,
            relations: RelationStore::open(&dir.join("relations"))?,
            inserted_ways: InsertedWayStore::open(&dir.join("inserted_ways"))?,
        })
    }

    pub fn close(self) {}
}
