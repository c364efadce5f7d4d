use std::path::Path;

use rocksdb::{IteratorMode, WriteBatch, DB};

use crate::codec;
use crate::element::Node;
use crate::error::{Error, Result};
use crate::open_db;

/// Tagged nodes. Nodes whose tag map is empty after filtering are not
/// persisted; only coords carry them.
pub struct NodeStore {
    db: DB,
}

impl NodeStore {
    pub fn open(path: &Path) -> Result<NodeStore> {
        Ok(NodeStore { db: open_db(path)? })
    }

    /// Returns the number of nodes actually persisted (post-filter).
    pub fn put_nodes(&self, nodes: &[Node]) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut written = 0;
        for node in nodes {
            if node.tags.is_empty() {
                continue;
            }
            batch.put(node.id.to_be_bytes(), codec::pack_node(node));
            written += 1;
        }
        self.db.write(batch)?;
        Ok(written)
    }

    pub fn get(&self, id: i64) -> Result<Node> {
        let raw = self.db.get(id.to_be_bytes())?.ok_or(Error::NotFound)?;
        codec::unpack_node(id, &raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Node>> + '_ {
        self.db.iterator(IteratorMode::Start).map(|res| {
            let (k, v) = res?;
            let id = decode_id(&k)?;
            codec::unpack_node(id, &v)
        })
    }
}

pub(crate) fn decode_id(key: &[u8]) -> Result<i64> {
    Ok(i64::from_be_bytes(
        key.try_into().map_err(|_| Error::Corrupt("id key".into()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Tags;
    use tempfile::tempdir;

    #[test]
    fn tagless_nodes_are_dropped() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        let mut tagged = Node {
            id: 2,
            lon: 10.0,
            lat: 50.0,
            ..Default::default()
        };
        tagged.tags.insert("amenity".into(), "cafe".into());
        let bare = Node {
            id: 1,
            lon: 0.0,
            lat: 0.0,
            tags: Tags::new(),
            geom: None,
        };

        let written = store.put_nodes(&[bare, tagged]).unwrap();
        assert_eq!(written, 1);
        assert!(matches!(store.get(1), Err(Error::NotFound)));
        assert_eq!(store.get(2).unwrap().tags["amenity"], "cafe");

        let ids: Vec<_> = store.iter().map(|n| n.unwrap().id).collect();
        assert_eq!(ids, vec![2]);
    }
}
