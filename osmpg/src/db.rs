//! The geospatial sink. The pipeline only sees the `Database` trait; the
//! PostGIS implementation speaks EWKB through prepared statements, one
//! transaction per batch.

use ahash::AHashMap;
use postgres::types::ToSql;
use postgres::{Client, NoTls};
use thiserror::Error;

use crate::mapping::{ColumnKind, Mapping, Table};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unsupported database type {0:?}")]
    Unsupported(String),
    #[error("table {0:?} was not initialized")]
    UnknownTable(String),
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

pub type Row = Vec<SqlValue>;

pub struct Config {
    pub db_type: String,
    pub connection_params: String,
    pub srid: i32,
}

pub trait Database: Send {
    /// Creates the output tables described by the mapping, dropping any
    /// previous versions.
    fn init(&mut self, mapping: &Mapping) -> Result<(), DbError>;

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<(), DbError>;
}

pub fn open(config: &Config) -> Result<Box<dyn Database>, DbError> {
    match config.db_type.as_str() {
        "postgis" => Ok(Box::new(PostGis::connect(config)?)),
        other => Err(DbError::Unsupported(other.to_string())),
    }
}

fn create_table_sql(table: &Table, srid: i32) -> String {
    let cols: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let ty = match c.kind {
                ColumnKind::Id | ColumnKind::Integer => "BIGINT".to_string(),
                ColumnKind::Geometry => format!("GEOMETRY(Geometry, {srid})"),
                ColumnKind::Bool => "BOOLEAN".to_string(),
                ColumnKind::String | ColumnKind::MappingKey | ColumnKind::MappingValue => {
                    "VARCHAR".to_string()
                }
            };
            format!("\"{}\" {}", c.name, ty)
        })
        .collect();
    format!("CREATE TABLE \"{}\" ({})", table.name, cols.join(", "))
}

fn insert_sql(table: &Table) -> String {
    let names: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect();
    let params: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| match c.kind {
            ColumnKind::Geometry => format!("ST_GeomFromEWKB(${})", i + 1),
            _ => format!("${}", i + 1),
        })
        .collect();
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table.name,
        names.join(", "),
        params.join(", ")
    )
}

struct TablePlan {
    insert_sql: String,
    kinds: Vec<ColumnKind>,
}

pub struct PostGis {
    client: Client,
    srid: i32,
    plans: AHashMap<String, TablePlan>,
}

impl PostGis {
    pub fn connect(config: &Config) -> Result<PostGis, DbError> {
        let client = Client::connect(&config.connection_params, NoTls)?;
        Ok(PostGis {
            client,
            srid: config.srid,
            plans: AHashMap::new(),
        })
    }
}

impl Database for PostGis {
    fn init(&mut self, mapping: &Mapping) -> Result<(), DbError> {
        for table in mapping.tables() {
            self.client
                .batch_execute(&format!("DROP TABLE IF EXISTS \"{}\"", table.name))?;
            self.client.batch_execute(&create_table_sql(table, self.srid))?;
            self.plans.insert(
                table.name.clone(),
                TablePlan {
                    insert_sql: insert_sql(table),
                    kinds: table.columns.iter().map(|c| c.kind).collect(),
                },
            );
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, rows: &[Row]) -> Result<(), DbError> {
        let Self { client, plans, .. } = self;
        let plan = plans
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?;
        let mut tx = client.transaction()?;
        let stmt = tx.prepare(&plan.insert_sql)?;
        for row in rows {
            let params: Vec<&(dyn ToSql + Sync)> = row
                .iter()
                .zip(&plan.kinds)
                .map(|(v, &kind)| sql_param(v, kind))
                .collect();
            tx.execute(&stmt, &params)?;
        }
        tx.commit()?;
        Ok(())
    }
}

static NULL_INT: Option<i64> = None;
static NULL_TEXT: Option<String> = None;
static NULL_BOOL: Option<bool> = None;
static NULL_BYTES: Option<Vec<u8>> = None;

fn sql_param<'a>(value: &'a SqlValue, kind: ColumnKind) -> &'a (dyn ToSql + Sync) {
    match value {
        SqlValue::Int(v) => v,
        SqlValue::Text(v) => v,
        SqlValue::Bool(v) => v,
        SqlValue::Bytes(v) => v,
        SqlValue::Null => match kind {
            ColumnKind::Id | ColumnKind::Integer => &NULL_INT,
            ColumnKind::Bool => &NULL_BOOL,
            ColumnKind::Geometry => &NULL_BYTES,
            ColumnKind::String | ColumnKind::MappingKey | ColumnKind::MappingValue => &NULL_TEXT,
        },
    }
}
