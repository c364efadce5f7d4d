use ahash::AHashMap;

/// Tag map of an OSM element. Cache contents only ever hold tags that
/// survived the per-kind retention filter.
pub type Tags = AHashMap<String, String>;

/// A raw node position without tags. Emitted for every node in the dump;
/// projected lazily at assembly time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
}

/// A tagged node. Only nodes with at least one surviving tag are persisted.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Tags,
    pub geom: Option<Vec<u8>>,
}

/// An ordered sequence of coord references. `nodes` and `geom` stay empty
/// until the write phase resolves and assembles them.
#[derive(Debug, Clone, Default)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Tags,
    pub nodes: Vec<Coord>,
    pub geom: Option<Vec<u8>>,
}

impl Way {
    /// A way is closed iff it has at least four coord references and the
    /// first equals the last. A triangle written as 3 refs + repeat is not
    /// closed.
    pub fn is_closed(&self) -> bool {
        self.refs.len() >= 4 && self.refs.first() == self.refs.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Node,
    Way,
    Relation,
}

impl MemberKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MemberKind::Node => 0,
            MemberKind::Way => 1,
            MemberKind::Relation => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<MemberKind> {
        match v {
            0 => Some(MemberKind::Node),
            1 => Some(MemberKind::Way),
            2 => Some(MemberKind::Relation),
            _ => None,
        }
    }
}

/// A typed member reference of a relation. `way` is populated by
/// `WayStore::fill_members` for way-typed members.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: i64,
    pub kind: MemberKind,
    pub role: String,
    pub way: Option<Way>,
}

#[derive(Debug, Clone, Default)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
    pub geom: Option<Vec<u8>>,
}
