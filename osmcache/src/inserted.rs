use std::path::Path;

use rocksdb::{WriteBatch, DB};

use crate::element::{Member, MemberKind};
use crate::error::Result;
use crate::open_db;

/// Way ids that already contributed geometry through a parent relation.
/// Written only by the sequential relation pass; the parallel way pass is
/// reader-only, so membership is monotonic for the whole write phase.
pub struct InsertedWayStore {
    db: DB,
}

impl InsertedWayStore {
    pub fn open(path: &Path) -> Result<InsertedWayStore> {
        Ok(InsertedWayStore { db: open_db(path)? })
    }

    pub fn put_members(&self, members: &[Member]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for m in members {
            if m.kind == MemberKind::Way {
                batch.put(m.id.to_be_bytes(), b"");
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn is_inserted(&self, id: i64) -> Result<bool> {
        Ok(self.db.get(id.to_be_bytes())?.is_some())
    }
}
