//! The declarative tag mapping: which OSM tags to retain per entity kind,
//! which tables exist, and which tag rules emit rows into them.
//!
//! ```json
//! {
//!   "tables": {
//!     "roads": {
//!       "type": "linestring",
//!       "mapping": { "highway": ["__any__"] },
//!       "columns": [
//!         { "name": "osm_id", "type": "id" },
//!         { "name": "geometry", "type": "geometry" },
//!         { "name": "name", "type": "string", "key": "name" },
//!         { "name": "type", "type": "mapping_value" }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ahash::AHashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::db::{Row, SqlValue};
use osmcache::element::Tags;

/// Wildcard accepting any value of a mapped key.
const ANY: &str = "__any__";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("table {table}: {msg}")]
    Invalid { table: String, msg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Id,
    Geometry,
    String,
    Integer,
    Bool,
    MappingKey,
    MappingValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub geometry_type: GeometryType,
    /// Match rules: tag key to accepted values.
    pub mapping: Vec<(String, Vec<String>)>,
    pub columns: Vec<Column>,
}

#[derive(Deserialize)]
struct TableFile {
    #[serde(rename = "type")]
    kind: String,
    mapping: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    columns: Vec<Column>,
}

#[derive(Deserialize)]
struct MappingFile {
    tables: BTreeMap<String, TableFile>,
}

pub struct Mapping {
    tables: Vec<Table>,
}

impl Mapping {
    pub fn from_file(path: &Path) -> Result<Mapping, MappingError> {
        Mapping::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Mapping, MappingError> {
        let file: MappingFile = serde_json::from_str(text)?;
        let mut tables = Vec::with_capacity(file.tables.len());
        for (name, t) in file.tables {
            let geometry_type = match t.kind.as_str() {
                "point" => GeometryType::Point,
                "linestring" => GeometryType::LineString,
                "polygon" => GeometryType::Polygon,
                other => {
                    return Err(MappingError::Invalid {
                        table: name,
                        msg: format!("unknown geometry type {other:?}"),
                    })
                }
            };
            for col in &t.columns {
                let needs_key = matches!(
                    col.kind,
                    ColumnKind::String | ColumnKind::Integer | ColumnKind::Bool
                );
                if needs_key && col.key.is_none() {
                    return Err(MappingError::Invalid {
                        table: name,
                        msg: format!("column {} needs a tag key", col.name),
                    });
                }
            }
            tables.push(Table {
                name,
                geometry_type,
                mapping: t.mapping.into_iter().collect(),
                columns: t.columns,
            });
        }
        Ok(Mapping { tables })
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    fn by_type(&self, ty: GeometryType) -> Vec<&Table> {
        self.tables
            .iter()
            .filter(|t| t.geometry_type == ty)
            .collect()
    }

    pub fn point_matcher(&self) -> TagMatcher<'_> {
        TagMatcher {
            tables: self.by_type(GeometryType::Point),
        }
    }

    pub fn line_string_matcher(&self) -> TagMatcher<'_> {
        TagMatcher {
            tables: self.by_type(GeometryType::LineString),
        }
    }

    pub fn polygon_matcher(&self) -> TagMatcher<'_> {
        TagMatcher {
            tables: self.by_type(GeometryType::Polygon),
        }
    }

    pub fn node_tag_filter(&self) -> TagFilter {
        TagFilter::for_tables(&self.by_type(GeometryType::Point), &[])
    }

    pub fn way_tag_filter(&self) -> TagFilter {
        let mut tables = self.by_type(GeometryType::LineString);
        tables.extend(self.by_type(GeometryType::Polygon));
        TagFilter::for_tables(&tables, &[])
    }

    /// Relations additionally keep `type`, so area detection still works on
    /// filtered cache contents.
    pub fn relation_tag_filter(&self) -> TagFilter {
        TagFilter::for_tables(&self.by_type(GeometryType::Polygon), &["type"])
    }
}

// ---------------------------------------------------------------------------
// filtering

enum Accept {
    Any,
    Values(Vec<String>),
}

/// In-place tag retention for one entity kind. One instance per worker.
pub struct TagFilter {
    keep: AHashMap<String, Accept>,
}

impl TagFilter {
    fn for_tables(tables: &[&Table], extra_keys: &[&str]) -> TagFilter {
        let mut keep: AHashMap<String, Accept> = AHashMap::new();
        for table in tables {
            for (key, values) in &table.mapping {
                if values.iter().any(|v| v == ANY) {
                    keep.insert(key.clone(), Accept::Any);
                    continue;
                }
                match keep.entry(key.clone()).or_insert_with(|| Accept::Values(Vec::new())) {
                    Accept::Any => {}
                    Accept::Values(vs) => vs.extend(values.iter().cloned()),
                }
            }
            // column-sourced keys are kept with any value
            for col in &table.columns {
                if let Some(key) = &col.key {
                    keep.insert(key.clone(), Accept::Any);
                }
            }
        }
        for key in extra_keys {
            keep.insert((*key).to_string(), Accept::Any);
        }
        TagFilter { keep }
    }

    pub fn filter(&self, tags: &mut Tags) {
        tags.retain(|k, v| match self.keep.get(k) {
            Some(Accept::Any) => true,
            Some(Accept::Values(vs)) => vs.iter().any(|a| a == v),
            None => false,
        });
    }
}

// ---------------------------------------------------------------------------
// matching

/// One satisfied match rule: the table to insert into plus the tag pair
/// that triggered it.
pub struct Match<'a> {
    pub table: &'a Table,
    pub key: &'a str,
    pub value: String,
}

impl Match<'_> {
    /// Materializes one row. `geom` is the assembled geometry of the
    /// element, when the column set asks for one.
    pub fn row(&self, id: i64, tags: &Tags, geom: Option<&[u8]>) -> Row {
        self.table
            .columns
            .iter()
            .map(|col| match col.kind {
                ColumnKind::Id => SqlValue::Int(id),
                ColumnKind::Geometry => match geom {
                    Some(g) => SqlValue::Bytes(g.to_vec()),
                    None => SqlValue::Null,
                },
                ColumnKind::String => match col.key.as_deref().and_then(|k| tags.get(k)) {
                    Some(v) => SqlValue::Text(v.clone()),
                    None => SqlValue::Null,
                },
                ColumnKind::Integer => col
                    .key
                    .as_deref()
                    .and_then(|k| tags.get(k))
                    .and_then(|v| v.parse::<i64>().ok())
                    .map_or(SqlValue::Null, SqlValue::Int),
                ColumnKind::Bool => match col.key.as_deref().and_then(|k| tags.get(k)) {
                    Some(v) => SqlValue::Bool(matches!(v.as_str(), "yes" | "true" | "1")),
                    None => SqlValue::Null,
                },
                ColumnKind::MappingKey => SqlValue::Text(self.key.to_string()),
                ColumnKind::MappingValue => SqlValue::Text(self.value.clone()),
            })
            .collect()
    }
}

/// Answers which tables an element's tags feed. One row per satisfied
/// (table, rule) pair.
pub struct TagMatcher<'a> {
    tables: Vec<&'a Table>,
}

impl<'a> TagMatcher<'a> {
    pub fn matches(&self, tags: &Tags) -> Vec<Match<'a>> {
        let mut out = Vec::new();
        for &table in &self.tables {
            for (key, values) in &table.mapping {
                let Some(value) = tags.get(key) else { continue };
                if values.iter().any(|v| v == ANY || v == value) {
                    out.push(Match {
                        table,
                        key: key.as_str(),
                        value: value.clone(),
                    });
                }
            }
        }
        out
    }
}
