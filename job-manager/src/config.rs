//! Command-line options and runtime settings.

use anyhow::{ensure, Result};
use smart_default::SmartDefault;
use spits::endpoint::timeout_secs;
use std::path::PathBuf;
use std::time::Duration;
use structopt::clap::AppSettings as ClapSettings;
use structopt::StructOpt;

/// CLI flags. The first positional argument is the job module path; it
/// terminates flag parsing and everything after it is forwarded to the
/// module untouched.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "jm",
    about = "SPITS job manager",
    setting = ClapSettings::TrailingVarArg,
    setting = ClapSettings::AllowLeadingHyphen
)]
pub struct CliOptions {
    /// Verbosity level
    #[structopt(long = "verbosity", short = "v", parse(from_occurrences))]
    pub verbosity: u8,

    /// Send a termination message to all task managers once the job is done
    #[structopt(long = "killtms", parse(try_from_str))]
    pub killtms: Option<bool>,

    /// Socket connect timeout, in seconds
    #[structopt(long = "ctimeout")]
    pub ctimeout: Option<f64>,

    /// Socket receive timeout, in seconds
    #[structopt(long = "rtimeout")]
    pub rtimeout: Option<f64>,

    /// Socket send timeout, in seconds
    #[structopt(long = "stimeout")]
    pub stimeout: Option<f64>,

    /// Path to the node list file
    #[structopt(long = "nodefile")]
    pub nodefile: Option<PathBuf>,

    /// Performance report interval in seconds (0 disables sampling)
    #[structopt(long = "perf")]
    pub perf: Option<u64>,

    /// Job module path, followed by arguments forwarded to the module
    pub module_args: Vec<String>,
}

/// Validated runtime settings.
#[derive(Clone, Debug, SmartDefault)]
pub struct AppSettings {
    #[default(true)]
    pub killtms: bool,

    pub conn_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,

    #[default(PathBuf::from("./nodes.txt"))]
    pub nodefile: PathBuf,

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
            "USAGE: jm [--key=value ...] module [module args]"
        );

        let mut settings = Self::default();
        settings.verbosity = verbosity_level(opts.verbosity);
        if let Some(killtms) = opts.killtms {
            settings.killtms = killtms;
        }
        settings.conn_timeout = timeout_secs(opts.ctimeout);
        settings.recv_timeout = timeout_secs(opts.rtimeout);
        settings.send_timeout = timeout_secs(opts.stimeout);
        if let Some(nodefile) = opts.nodefile {
            settings.nodefile = nodefile;
        }
        settings.perf_interval = opts.perf.unwrap_or(0);
        settings.module = opts.module_args[0].clone();
        settings.module_args = opts.module_args;
        Ok(settings)
    }
}

pub(crate) fn verbosity_level(occurrences: u8) -> log::LevelFilter {
    match occurrences {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}
