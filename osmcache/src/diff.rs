//! The optional diff index, recording which coords each way references so
//! later incremental updates can find the ways affected by a moved node.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rocksdb::{WriteBatch, DB};

use crate::codec;
use crate::element::Way;
use crate::error::{Error, Result};
use crate::open_db;

const FLUSH_EVERY: usize = 1024;

pub struct DiffCache {
    pub coords: DiffCoordStore,
}

impl DiffCache {
    pub fn open(cachedir: &Path) -> Result<DiffCache> {
        let dir = cachedir.join("diff");
        fs::create_dir_all(&dir)?;
        Ok(DiffCache {
            coords: DiffCoordStore::open(&dir.join("coords"))?,
        })
    }

    pub fn remove(cachedir: &Path) -> Result<()> {
        let dir = cachedir.join("diff");
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Single-writer store of way-id to referenced coord-ids, buffered behind
/// an internal lock. Abrupt termination may truncate the last buffered
/// batch but never corrupts what was flushed.
pub struct DiffCoordStore {
    db: DB,
    buf: Mutex<Vec<(i64, Vec<i64>)>>,
}

impl DiffCoordStore {
    fn open(path: &Path) -> Result<DiffCoordStore> {
        Ok(DiffCoordStore {
            db: open_db(path)?,
            buf: Mutex::new(Vec::new()),
        })
    }

    pub fn add_from_way(&self, way: &Way) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        buf.push((way.id, way.refs.clone()));
        if buf.len() >= FLUSH_EVERY {
            self.write(&mut buf)?;
        }
        Ok(())
    }

    fn write(&self, buf: &mut Vec<(i64, Vec<i64>)>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (way_id, refs) in buf.drain(..) {
            let mut value = Vec::with_capacity(4 * refs.len());
            codec::pack_refs(&mut value, &refs);
            batch.put(way_id.to_be_bytes(), value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// The coord ids recorded for a way, if any. Only meaningful after
    /// `close`.
    pub fn coord_refs(&self, way_id: i64) -> Result<Option<Vec<i64>>> {
        match self.db.get(way_id.to_be_bytes())? {
            Some(raw) => {
                let mut slice = raw.as_slice();
                let refs = codec::unpack_refs(&mut slice)?;
                Ok(Some(refs))
            }
            None => Ok(None),
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        self.write(&mut buf)?;
        self.db.flush().map_err(Error::from)
    }
}
