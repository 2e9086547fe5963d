use anyhow::Result;
use log::debug;
use spits::perf::PerfModule;
use spits::JobBinary;
use std::sync::Arc;
use task_manager::config::AppSettings;
use task_manager::run;

fn main() -> Result<()> {
    let settings = AppSettings::assemble()?;

    env_logger::Builder::from_default_env()
        .filter(None, settings.verbosity)
        .init();
    debug!("application settings:\n{:#?}", &settings);

    let job = Arc::new(JobBinary::load(&settings.module)?);

    let _perf = if settings.perf_interval > 0 {
        Some(PerfModule::start(
            &format!("tm-{}", std::process::id()),
            settings.workers,
            settings.perf_interval,
            10,
        ))
    } else {
        None
    };

    run(job, &settings)?;

    debug!("bye");
    Ok(())
}
