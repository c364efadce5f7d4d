//! The coord store. Coordinates dominate cache volume (order 1e9 per
//! planet), so they are grouped into positional blocks keyed by
//! `id >> COORD_BLOCK_BITS` and delta-compressed within each block.
//!
//! The store has two modes. Linear-import buffers the current block and
//! writes blocks wholesale as the (mostly monotonic) id stream crosses block
//! boundaries; random-access serves point lookups. The transition from
//! linear to random requires an intervening `flush`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rocksdb::{IteratorMode, DB};

use crate::codec::{self, COORD_BLOCK_BITS};
use crate::element::{Coord, Way};
use crate::error::{Error, Result};
use crate::open_db;

struct LinearBuf {
    key: i64,
    entries: Vec<Coord>,
}

pub struct CoordStore {
    db: DB,
    linear: AtomicBool,
    dirty: AtomicBool,
    buf: Mutex<LinearBuf>,
}

impl CoordStore {
    pub fn open(path: &Path) -> Result<CoordStore> {
        Ok(CoordStore {
            db: open_db(path)?,
            linear: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            buf: Mutex::new(LinearBuf {
                key: 0,
                entries: Vec::new(),
            }),
        })
    }

    pub fn set_linear_import(&self, on: bool) {
        self.linear.store(on, Ordering::SeqCst);
    }

    fn check_linear(&self) -> Result<()> {
        if !self.linear.load(Ordering::SeqCst) {
            return Err(Error::Mode("bulk append requires linear-import mode"));
        }
        Ok(())
    }

    fn check_random(&self) -> Result<()> {
        if self.linear.load(Ordering::SeqCst) {
            return Err(Error::Mode("random access requires linear-import off"));
        }
        if self.dirty.load(Ordering::SeqCst) {
            return Err(Error::Mode("flush required before random access"));
        }
        Ok(())
    }

    /// Bulk write. Batches from the parse stage arrive with mostly
    /// monotonic ids; out-of-order stragglers are handled by merging with
    /// the block already on disk.
    pub fn put_coords(&self, coords: &[Coord]) -> Result<()> {
        self.check_linear()?;
        let mut buf = self.buf.lock().unwrap();
        self.dirty.store(true, Ordering::SeqCst);
        for &c in coords {
            let key = c.id >> COORD_BLOCK_BITS;
            if key != buf.key && !buf.entries.is_empty() {
                let entries = std::mem::take(&mut buf.entries);
                self.write_block(buf.key, entries)?;
            }
            buf.key = key;
            buf.entries.push(c);
        }
        Ok(())
    }

    /// Writes the buffered block and syncs the backing store. Must be
    /// called between the linear-import and random-access phases.
    pub fn flush(&self) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        if !buf.entries.is_empty() {
            let entries = std::mem::take(&mut buf.entries);
            self.write_block(buf.key, entries)?;
        }
        self.db.flush()?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, key: i64, mut entries: Vec<Coord>) -> Result<()> {
        if let Some(existing) = self.db.get(key.to_be_bytes())? {
            entries.extend(codec::unpack_coord_block(key, &existing)?);
        }
        entries.sort_by_key(|c| c.id);
        entries.dedup_by_key(|c| c.id);
        self.db
            .put(key.to_be_bytes(), codec::pack_coord_block(key, &entries))?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Coord> {
        self.check_random()?;
        let key = id >> COORD_BLOCK_BITS;
        let raw = self.db.get(key.to_be_bytes())?.ok_or(Error::NotFound)?;
        let block = codec::unpack_coord_block(key, &raw)?;
        let i = block
            .binary_search_by_key(&id, |c| c.id)
            .map_err(|_| Error::NotFound)?;
        Ok(block[i])
    }

    /// Resolves `way.refs` into `way.nodes`. `NotFound` if any referenced
    /// coord is missing; the way is left untouched in that case.
    pub fn fill_way(&self, way: &mut Way) -> Result<()> {
        self.check_random()?;
        let mut nodes = Vec::with_capacity(way.refs.len());
        // ways reference runs of nearby ids, so the last decoded block is
        // kept around
        let mut cached: Option<(i64, Vec<Coord>)> = None;
        for &id in &way.refs {
            let key = id >> COORD_BLOCK_BITS;
            if cached.as_ref().map(|(k, _)| *k) != Some(key) {
                let raw = self.db.get(key.to_be_bytes())?.ok_or(Error::NotFound)?;
                cached = Some((key, codec::unpack_coord_block(key, &raw)?));
            }
            let (_, block) = cached.as_ref().unwrap();
            let i = block
                .binary_search_by_key(&id, |c| c.id)
                .map_err(|_| Error::NotFound)?;
            nodes.push(block[i]);
        }
        way.nodes = nodes;
        Ok(())
    }

    /// Key-ordered scan over every persisted coord.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<Coord>> + '_> {
        self.check_random()?;
        Ok(self.db.iterator(IteratorMode::Start).flat_map(|res| {
            let entry = res.map_err(Error::from).and_then(|(k, v)| {
                let key = i64::from_be_bytes(
                    k.as_ref()
                        .try_into()
                        .map_err(|_| Error::Corrupt("coord block key".into()))?,
                );
                codec::unpack_coord_block(key, &v)
            });
            match entry {
                Ok(coords) => coords.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }
        }))
    }

}
