use anyhow::Result;
use job_manager::config::AppSettings;
use job_manager::{kill_task_managers, run};
use log::{debug, error, info};
use spits::perf::PerfModule;
use spits::JobBinary;
use std::sync::Arc;

fn main() -> Result<()> {
    let settings = AppSettings::assemble()?;

    env_logger::Builder::from_default_env()
        .filter(None, settings.verbosity)
        .init();
    debug!("application settings:\n{:#?}", &settings);

    let job = Arc::new(JobBinary::load(&settings.module)?);

    let _perf = if settings.perf_interval > 0 {
        Some(PerfModule::start(
            &format!("jm-{}", std::process::id()),
            0,
            settings.perf_interval,
            10,
        ))
    } else {
        None
    };

    info!("running module");
    let run_job = job.clone();
    let run_settings = settings.clone();
    let status = job.main_entry(&settings.module_args, move |margs| {
        match run(&run_job, &run_settings, margs) {
            Ok((status, result)) => {
                info!(
                    "job finished with status {} and {} result bytes",
                    status,
                    result.as_ref().map(Vec::len).unwrap_or(0)
                );
                (status, result)
            }
            Err(err) => {
                error!("job failed: {:#}", err);
                (-1, None)
            }
        }
    })?;
    debug!("module returned {}", status);

    if settings.killtms {
        kill_task_managers(&settings);
    }

    debug!("bye");
    Ok(())
}
