use std::path::Path;

use rocksdb::{IteratorMode, WriteBatch, DB};

use crate::codec;
use crate::element::{Member, MemberKind, Way};
use crate::error::{Error, Result};
use crate::nodes::decode_id;
use crate::open_db;

/// Ways are persisted even when filtering strips every tag: relations
/// reference them structurally.
pub struct WayStore {
    db: DB,
}

impl WayStore {
    pub fn open(path: &Path) -> Result<WayStore> {
        Ok(WayStore { db: open_db(path)? })
    }

    pub fn put_ways(&self, ways: &[Way]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for way in ways {
            batch.put(way.id.to_be_bytes(), codec::pack_way(way));
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Way> {
        let raw = self.db.get(id.to_be_bytes())?.ok_or(Error::NotFound)?;
        codec::unpack_way(id, &raw)
    }

    /// Loads the full way record into every way-typed member. Members whose
    /// way is missing stay unfilled; `NotFound` is returned if any were
    /// missing, after the rest have been filled.
    pub fn fill_members(&self, members: &mut [Member]) -> Result<()> {
        let mut missing = false;
        for m in members {
            if m.kind != MemberKind::Way {
                continue;
            }
            match self.get(m.id) {
                Ok(way) => m.way = Some(way),
                Err(Error::NotFound) => missing = true,
                Err(e) => return Err(e),
            }
        }
        if missing {
            Err(Error::NotFound)
        } else {
            Ok(())
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Way>> + '_ {
        self.db.iterator(IteratorMode::Start).map(|res| {
            let (k, v) = res?;
            let id = decode_id(&k)?;
            codec::unpack_way(id, &v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn way(id: i64, refs: &[i64]) -> Way {
        Way {
            id,
            refs: refs.to_vec(),
            ..Default::default()
        }
    }

    fn member(id: i64, kind: MemberKind) -> Member {
        Member {
            id,
            kind,
            role: String::new(),
            way: None,
        }
    }

    #[test]
    fn refs_survive_the_store() {
        let dir = tempdir().unwrap();
        let store = WayStore::open(dir.path()).unwrap();
        store.put_ways(&[way(100, &[1, 2, 3])]).unwrap();
        assert_eq!(store.get(100).unwrap().refs, vec![1, 2, 3]);
    }

    #[test]
    fn fill_members_tolerates_missing_ways() {
        let dir = tempdir().unwrap();
        let store = WayStore::open(dir.path()).unwrap();
        store.put_ways(&[way(100, &[1, 2])]).unwrap();

        let mut members = vec![
            member(100, MemberKind::Way),
            member(999, MemberKind::Way),
            member(5, MemberKind::Node),
        ];
        assert!(matches!(
            store.fill_members(&mut members),
            Err(Error::NotFound)
        ));
        // the present member was still filled
        assert_eq!(members[0].way.as_ref().unwrap().refs, vec![1, 2]);
        assert!(members[1].way.is_none());
        assert!(members[2].way.is_none());
    }

    #[test]
    fn iter_is_id_ordered() {
        let dir = tempdir().unwrap();
        let store = WayStore::open(dir.path()).unwrap();
        store
            .put_ways(&[way(300, &[1]), way(100, &[2]), way(200, &[3])])
            .unwrap();
        let ids: Vec<_> = store.iter().map(|w| w.unwrap().id).collect();
        assert_eq!(ids, vec![100, 200, 300]);
    }
}
