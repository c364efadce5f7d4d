use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Imports OSM planet dumps into a PostGIS database", version)]
pub struct Args {
    /// Directory holding the intermediate entity stores
    #[arg(long, default_value = "/tmp/osmpg")]
    pub cachedir: PathBuf,

    /// Remove an existing cache before the read phase
    #[arg(long)]
    pub overwritecache: bool,

    /// Append to an existing cache instead of refusing to touch it
    #[arg(long)]
    pub appendcache: bool,

    /// PBF file to read into the cache; omit to skip the read phase
    #[arg(long)]
    pub read: Option<PathBuf>,

    /// Assemble geometries from the cache and write them to the database
    #[arg(long)]
    pub write: bool,

    /// Database connection parameters
    #[arg(long)]
    pub connection: Option<String>,

    /// Maintain the way-to-coord diff index for incremental updates
    #[arg(long)]
    pub diff: bool,

    /// Tag mapping file (JSON)
    #[arg(long)]
    pub mapping: PathBuf,

    /// Write CPU time samples to this file
    #[arg(long)]
    pub cpuprofile: Option<PathBuf>,

    /// Write memory samples, format dir:interval (e.g. profiles:30s)
    #[arg(long)]
    pub memprofile: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
