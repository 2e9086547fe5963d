//! Command-line options and runtime settings.

use anyhow::{ensure, Result};
use smart_default::SmartDefault;
use spits::endpoint::timeout_secs;
use spits::messaging::TM_PORT;
use std::time::Duration;
use structopt::clap::AppSettings as ClapSettings;
use structopt::StructOpt;

/// CLI flags. The first positional argument is the job module path; it
/// terminates flag parsing and everything after it is forwarded to the
/// module untouched.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "tm",
    about = "SPITS task manager",
    setting = ClapSettings::TrailingVarArg,
    setting = ClapSettings::AllowLeadingHyphen
)]
pub struct CliOptions {
    /// Verbosity level
    #[structopt(long = "verbosity", short = "v", parse(from_occurrences))]
    pub verbosity: u8,

    /// Bind address (a UDS path when tmport is 0)
    #[structopt(long = "tmaddr")]
    pub tmaddr: Option<String>,

    /// Bind port; 0 or negative selects a UNIX-domain socket
    #[structopt(long = "tmport")]
    pub tmport: Option<i32>,

    /// Number of compute workers; 0 or negative means the CPU count
    #[structopt(long = "nw")]
    pub nw: Option<i64>,

    /// Extra intake-queue slots beyond the worker count
    #[structopt(long = "overfill")]
    pub overfill: Option<usize>,

    /// Socket connect timeout, in seconds
    #[structopt(long = "ctimeout")]
    pub ctimeout: Option<f64>,

    /// Socket receive timeout, in seconds
    #[structopt(long = "rtimeout")]
    pub rtimeout: Option<f64>,

    /// Socket send timeout, in seconds
    #[structopt(long = "stimeout")]
    pub stimeout: Option<f64>,

    /// Performance report interval in seconds (0 disables sampling)
    #[structopt(long = "perf")]
    pub perf: Option<u64>,

    /// Job module path, followed by arguments forwarded to the module
    pub module_args: Vec<String>,
}

/// Validated runtime settings.
#[derive(Clone, Debug, SmartDefault)]
pub struct AppSettings {
    #[default("0.0.0.0".to_string())]
    pub address: String,

    #[default(TM_PORT as i32)]
    pub port: i32,

    #[default(1)]
    pub workers: usize,

    pub overfill: usize,

    pub conn_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,

    pub perf_interval: u64,

    #[default(log::LevelFilter::Warn)]
    pub verbosity: log::LevelFilter,

    /// Path to the job module shared object.
    pub module: String,

    /// Full argv forwarded to the module (module path first).
    pub module_args: Vec<String>,
}

impl AppSettings {
    /// Parse the process arguments into runtime settings.
    pub fn assemble() -> Result<Self> {
        Self::from_options(CliOptions::from_args())
    }

    pub fn from_options(opts: CliOptions) -> Result<Self> {
        ensure!(
            !opts.module_args.is_empty(),
            "USAGE: tm [--key=value ...] module [module args]"
        );

        let mut settings = Self::default();
        settings.verbosity = verbosity_level(opts.verbosity);
        if let Some(tmaddr) = opts.tmaddr {
            settings.address = tmaddr;
        }
        if let Some(tmport) = opts.tmport {
            settings.port = tmport;
        }
        settings.workers = match opts.nw {
            Some(nw) if nw > 0 => nw as usize,
            _ => num_cpus::get(),
        };
        settings.overfill = opts.overfill.unwrap_or(0);
        settings.conn_timeout = timeout_secs(opts.ctimeout);
        settings.recv_timeout = timeout_secs(opts.rtimeout);
        settings.send_timeout = timeout_secs(opts.stimeout);
        settings.perf_interval = opts.perf.unwrap_or(0);
        settings.module = opts.module_args[0].clone();
        settings.module_args = opts.module_args;
        Ok(settings)
    }
}

fn verbosity_level(occurrences: u8) -> log::LevelFilter {
    match occurrences {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<AppSettings> {
        let mut argv = vec!["tm"];
        argv.extend(args);
        AppSettings::from_options(CliOptions::from_iter(argv))
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&["module.so"]).unwrap();
        assert_eq!(settings.address, "0.0.0.0");
        assert_eq!(settings.port, 7727);
        assert_eq!(settings.workers, num_cpus::get());
        assert_eq!(settings.overfill, 0);
        assert_eq!(settings.module, "module.so");
    }

    #[test]
    fn test_nonpositive_worker_count_maps_to_cpu_count() {
        let settings = parse(&["--nw=0", "module.so"]).unwrap();
        assert_eq!(settings.workers, num_cpus::get());
        let settings = parse(&["--nw=-4", "module.so"]).unwrap();
        assert_eq!(settings.workers, num_cpus::get());
        let settings = parse(&["--nw=3", "module.so"]).unwrap();
        assert_eq!(settings.workers, 3);
    }

    #[test]
    fn test_uds_configuration() {
        let settings = parse(&["--tmaddr=/tmp/spits.sock", "--tmport=0", "module.so"]).unwrap();
        assert_eq!(settings.address, "/tmp/spits.sock");
        assert_eq!(settings.port, 0);
    }

    #[test]
    fn test_forwarded_module_args() {
        let settings = parse(&["--rtimeout=0.25", "module.so", "--nw=9"]).unwrap();
        assert_eq!(settings.recv_timeout, Some(Duration::from_millis(250)));
        // A flag after the module path belongs to the module.
        assert_eq!(settings.workers, num_cpus::get());
        assert_eq!(
            settings.module_args,
            vec!["module.so".to_string(), "--nw=9".to_string()]
        );
    }

    #[test]
    fn test_missing_module_is_an_error() {
        assert!(parse(&[]).is_err());
    }
}
