use std::path::Path;

use rocksdb::{IteratorMode, WriteBatch, DB};

use crate::codec;
use crate::element::Relation;
use crate::error::Result;
use crate::nodes::decode_id;
use crate::open_db;

pub struct RelationStore {
    db: DB,
}

impl RelationStore {
    pub fn open(path: &Path) -> Result<RelationStore> {
        Ok(RelationStore { db: open_db(path)? })
    }

    pub fn put_relations(&self, relations: &[Relation]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for rel in relations {
            batch.put(rel.id.to_be_bytes(), codec::pack_relation(rel));
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Relation>> + '_ {
        self.db.iterator(IteratorMode::Start).map(|res| {
            let (k, v) = res?;
            let id = decode_id(&k)?;
            codec::unpack_relation(id, &v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Member, MemberKind};
    use tempfile::tempdir;

    #[test]
    fn members_roundtrip_through_the_store() {
        let dir = tempdir().unwrap();
        let store = RelationStore::open(dir.path()).unwrap();
        let rel = Relation {
            id: 9,
            members: vec![Member {
                id: 100,
                kind: MemberKind::Way,
                role: "outer".into(),
                way: None,
            }],
            ..Default::default()
        };
        store.put_relations(&[rel]).unwrap();

        let got: Vec<_> = store.iter().map(|r| r.unwrap()).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 9);
        assert_eq!(got[0].members[0].role, "outer");
    }
}
