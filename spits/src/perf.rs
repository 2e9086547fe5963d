//! Process performance sampler.
//!
//! Scrapes `/proc/self/stat` and aggregates CPU utilization and resident
//! set size over a report window, appending one record per window to
//! `./perf/<uid>-cpu` and `./perf/<uid>-cpumem`. Records are
//! space-separated; each file starts with a `#`-commented header block.

use chrono::Utc;
use log::{debug, error, info};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PERF_DIR: &str = "./perf";

const CPU_HEADER: &str = "\
# (1) Number of compute workers
# (2) Total wall time (since beginning of sampling) [us]
# (3) Total user time (since beginning of sampling) [us]
# (4) Total system time (since beginning of sampling) [us]
# (5-7) CPU utilization in user mode (min, max, avg) [%]
# (8-10) CPU utilization in system mode (min, max, avg) [%]
# (11-13) Total user + system CPU utilization (min, max, avg) [%]";

const MEM_HEADER: &str = "\
# (1) Total wall time (since beginning of sampling) [us]
# (2-4) Resident set size (min, max, avg) [MiB]";

/// Handle to the sampling thread. The thread is daemon-style: it is never
/// joined and stops with the process, or earlier via [`PerfModule::stop`].
pub struct PerfModule {
    stop: Arc<AtomicBool>,
}

impl PerfModule {
    /// Start sampling. `report_interval` seconds per record, split into
    /// `subsamples` acquisition steps.
    pub fn start(uid: &str, workers: usize, report_interval: u64, subsamples: u32) -> PerfModule {
        info!("starting performance sampler...");
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let uid = uid.to_string();
        thread::spawn(move || {
            run_cpu(
                &uid,
                workers,
                report_interval.max(1),
                subsamples.max(1),
                &thread_stop,
            )
        });
        PerfModule { stop }
    }

    /// Signal the sampling thread to stop after its current step.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
struct Sample {
    wall: f64,
    user: f64,
    system: f64,
    rss_mib: f64,
}

/// Running min/max/sum accumulator for one statistic.
#[derive(Clone, Copy, Default)]
struct Agg {
    min: f64,
    max: f64,
    sum: f64,
    n: u32,
}

impl Agg {
    fn push(&mut self, value: f64) {
        if self.n == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.n += 1;
    }

    fn avg(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / f64::from(self.n)
        }
    }
}

fn run_cpu(uid: &str, workers: usize, report_interval: u64, subsamples: u32, stop: &AtomicBool) {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        error!("performance sampler: could not determine the page size");
        return;
    }
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        error!("performance sampler: could not determine the tick frequency");
        return;
    }
    debug!(
        "performance sampler: page size {} bytes, tick frequency {} Hz",
        page_size, ticks_per_sec
    );

    let delay = Duration::from_secs_f64(report_interval as f64 / f64::from(subsamples));
    let started = Instant::now();
    let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.6f");
    let cpu_header = format!("# {}\n{}", stamp, CPU_HEADER);
    let mem_header = format!("# {}\n{}", stamp, MEM_HEADER);

    info!("performance sampler started");

    let mut is_new = true;
    let mut previous: Option<Sample> = None;

    while !stop.load(Ordering::SeqCst) {
        let mut user_pct = Agg::default();
        let mut sys_pct = Agg::default();
        let mut total_pct = Agg::default();
        let mut rss = Agg::default();
        let mut first: Option<Sample> = None;
        let mut last: Option<Sample> = None;

        for _ in 0..subsamples {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            match sample(page_size as f64, ticks_per_sec as f64, &started) {
                Ok(current) => {
                    if let Some(prev) = previous {
                        let delta = (current.wall - prev.wall).max(f64::EPSILON);
                        let user = (current.user - prev.user) * 100.0 / delta;
                        let sys = (current.system - prev.system) * 100.0 / delta;
                        user_pct.push(user);
                        sys_pct.push(sys);
                        total_pct.push(user + sys);
                        rss.push(current.rss_mib);
                        if first.is_none() {
                            first = Some(prev);
                        }
                        last = Some(current);
                    }
                    previous = Some(current);
                }
                Err(err) => debug!("performance sampler: stat read failed: {}", err),
            }

            thread::sleep(delay);
        }

        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => continue,
        };

        let wall_us = (last.wall * 1_000_000.0) as i64;
        let user_us = (last.user * 1_000_000.0) as i64;
        let sys_us = (last.system * 1_000_000.0) as i64;

        // Window averages for the percentages come from the endpoints, not
        // the per-step mean, so short stalls do not skew them.
        let span = (last.wall - first.wall).max(f64::EPSILON);
        let avg_user = (last.user - first.user) * 100.0 / span;
        let avg_sys = (last.system - first.system) * 100.0 / span;
        let avg_total = avg_user + avg_sys;

        if !stop.load(Ordering::SeqCst) {
            dump(
                Path::new(PERF_DIR),
                uid,
                "cpu",
                &cpu_header,
                &format!(
                    "{} {} {} {} {} {} {} {} {} {} {} {} {}",
                    workers,
                    wall_us,
                    user_us,
                    sys_us,
                    user_pct.min,
                    user_pct.max,
                    avg_user,
                    sys_pct.min,
                    sys_pct.max,
                    avg_sys,
                    total_pct.min,
                    total_pct.max,
                    avg_total
                ),
                is_new,
            );
            dump(
                Path::new(PERF_DIR),
                uid,
                "cpumem",
                &mem_header,
                &format!("{} {} {} {}", wall_us, rss.min, rss.max, rss.avg()),
                is_new,
            );
            is_new = false;
        }
    }

    info!("performance sampler stopped");
}

fn sample(page_size: f64, ticks_per_sec: f64, started: &Instant) -> std::io::Result<Sample> {
    let stat = fs::read_to_string("/proc/self/stat")?;
    let (rss_pages, user_ticks, system_ticks) = parse_stat_line(&stat)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "short stat line"))?;

    Ok(Sample {
        wall: started.elapsed().as_secs_f64(),
        user: user_ticks / ticks_per_sec,
        system: system_ticks / ticks_per_sec,
        rss_mib: rss_pages * page_size / 1024.0 / 1024.0,
    })
}

/// Pull `(rss, utime, stime)` out of a `/proc/<pid>/stat` line. The comm
/// field may contain spaces and parentheses, so it is stripped first.
fn parse_stat_line(line: &str) -> Option<(f64, f64, f64)> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let stripped = format!("{}{}", &line[..open], &line[close..]);
    let fields: Vec<&str> = stripped.split_whitespace().collect();

    let user_ticks = fields.get(13)?.parse::<f64>().ok()?;
    let system_ticks = fields.get(14)?.parse::<f64>().ok()?;
    let rss_pages = fields.get(23)?.parse::<f64>().ok()?;
    Some((rss_pages, user_ticks, system_ticks))
}

fn dump(dir: &Path, uid: &str, tag: &str, header: &str, fields: &str, new: bool) {
    if let Err(err) = fs::create_dir_all(dir) {
        debug!(
            "performance sampler: cannot create {}: {}",
            dir.display(),
            err
        );
        return;
    }

    let path = dir.join(format!("{}-{}", uid, tag));
    let open = if new {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
    } else {
        OpenOptions::new().append(true).create(true).open(&path)
    };

    match open {
        Ok(mut file) => {
            let write = if new {
                writeln!(file, "{}", header).and_then(|_| writeln!(file, "{}", fields))
            } else {
                writeln!(file, "{}", fields)
            };
            if let Err(err) = write {
                debug!(
                    "performance sampler: write to {} failed: {}",
                    path.display(),
                    err
                );
            }
        }
        Err(err) => debug!(
            "performance sampler: cannot open {}: {}",
            path.display(),
            err
        ),
    }
}
