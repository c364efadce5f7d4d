//! Progress reporting and the optional profilers. Counters are updated by
//! every worker; a ticker thread renders them once per second. Profilers
//! sample `/proc/self` on their own timers and stop with the process.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, tick, Sender};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    coords: AtomicU64,
    nodes: AtomicU64,
    ways: AtomicU64,
    relations: AtomicU64,
}

pub struct Progress {
    counters: Arc<Counters>,
    bar: ProgressBar,
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Progress {
    pub fn start() -> Progress {
        let counters = Arc::new(Counters::default());
        let bar = ProgressBar::new_spinner()
            .with_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(Duration::from_secs(1));
        let handle = {
            let counters = counters.clone();
            let bar = bar.clone();
            thread::spawn(move || loop {
                crossbeam_channel::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        bar.set_message(format!(
                            "[{} blocks] coords: {} nodes: {} ways: {} relations: {}",
                            counters.blocks.load(Ordering::Relaxed),
                            counters.coords.load(Ordering::Relaxed),
                            counters.nodes.load(Ordering::Relaxed),
                            counters.ways.load(Ordering::Relaxed),
                            counters.relations.load(Ordering::Relaxed),
                        ));
                        bar.tick();
                    }
                }
            })
        };
        Progress {
            counters,
            bar,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn add_blocks(&self, n: usize) {
        self.counters.blocks.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_coords(&self, n: usize) {
        self.counters.coords.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_nodes(&self, n: usize) {
        self.counters.nodes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_ways(&self, n: usize) {
        self.counters.ways.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_relations(&self, n: usize) {
        self.counters.relations.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Zeroes the counters between phases.
    pub fn reset(&self) {
        self.counters.blocks.store(0, Ordering::Relaxed);
        self.counters.coords.store(0, Ordering::Relaxed);
        self.counters.nodes.store(0, Ordering::Relaxed);
        self.counters.ways.store(0, Ordering::Relaxed);
        self.counters.relations.store(0, Ordering::Relaxed);
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// profilers

/// Samples process CPU time (utime/stime ticks from `/proc/self/stat`) once
/// per second into a CSV file.
pub fn start_cpu_profiler(path: &Path) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "elapsed_s,utime_ticks,stime_ticks")?;
    thread::spawn(move || {
        let start = Instant::now();
        loop {
            thread::sleep(Duration::from_secs(1));
            if let Some((utime, stime)) = read_cpu_ticks() {
                let _ = writeln!(
                    file,
                    "{:.1},{},{}",
                    start.elapsed().as_secs_f64(),
                    utime,
                    stime
                );
            }
        }
    });
    Ok(())
}

/// Takes `dir:interval` and samples resident set size into
/// `dir/memprofile.csv` on the given interval (default one minute).
pub fn start_mem_profiler(arg: &str) -> std::io::Result<()> {
    let (dir, interval) = match arg.split_once(':') {
        Some((dir, interval)) => (
            dir,
            parse_interval(interval).unwrap_or(Duration::from_secs(60)),
        ),
        None => (arg, Duration::from_secs(60)),
    };
    fs::create_dir_all(dir)?;
    let mut file = fs::File::create(Path::new(dir).join("memprofile.csv"))?;
    writeln!(file, "elapsed_s,vm_rss_kb")?;
    thread::spawn(move || {
        let start = Instant::now();
        loop {
            thread::sleep(interval);
            if let Some(rss) = read_vm_rss_kb() {
                let _ = writeln!(file, "{:.1},{}", start.elapsed().as_secs_f64(), rss);
            }
        }
    });
    Ok(())
}

fn parse_interval(s: &str) -> Option<Duration> {
    if let Some(m) = s.strip_suffix('m') {
        return m.parse::<u64>().ok().map(|m| Duration::from_secs(60 * m));
    }
    let s = s.strip_suffix('s').unwrap_or(s);
    s.parse::<u64>().ok().map(Duration::from_secs)
}

fn read_cpu_ticks() -> Option<(u64, u64)> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    // fields after the parenthesized command name; utime and stime are the
    // 12th and 13th of those
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    let utime = fields.nth(11)?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

fn read_vm_rss_kb() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let progress = Progress::start();
        progress.add_coords(10);
        progress.add_coords(5);
        assert_eq!(progress.counters.coords.load(Ordering::Relaxed), 15);
        progress.reset();
        assert_eq!(progress.counters.coords.load(Ordering::Relaxed), 0);
        progress.stop();
    }

    #[test]
    fn interval_suffixes() {
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_interval("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_interval("soon"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_sampling_works() {
        assert!(read_cpu_ticks().is_some());
        assert!(read_vm_rss_kb().is_some());
    }
}
