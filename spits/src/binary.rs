//! Dynamic-library bridge to the user-supplied job module.
//!
//! The job module is a shared object exporting the `spits_*` C ABI. This
//! bridge owns the loaded library, marshals argv and byte buffers across
//! the boundary, and wraps the opaque handles the module hands back. Byte
//! buffers returned by the module are copied out before a call returns, so
//! the module is free to reuse or release its own memory.
//!
//! Result delivery from `spits_worker_run` and
//! `spits_committer_commit_job` happens through a push callback. The
//! callback must fire exactly once, with the context value the framework
//! passed in; violations are surfaced through the upper 32 bits of the
//! task status instead of a native fault.

use crate::errors::BridgeError;
use crate::messaging::{flagged_status, RES_MODULE_CTXER, RES_MODULE_NOANS};
use libloading::{Library, Symbol};
use log::{debug, error, warn};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex};

/// Runner callback handed to `spits_main`.
pub type RunnerCb =
    unsafe extern "C" fn(c_int, *const *const c_char, *mut *const c_void, *mut i64) -> c_int;
/// Push callback handed to `spits_worker_run` / `spits_committer_commit_job`.
pub type PushCb = unsafe extern "C" fn(*const c_void, i64, *const c_void);

type MainFn = unsafe extern "C" fn(c_int, *const *const c_char, RunnerCb) -> c_int;
type NewFn = unsafe extern "C" fn(c_int, *const *const c_char) -> *mut c_void;
type NextTaskFn = unsafe extern "C" fn(*mut c_void, *mut *const c_void, *mut i64) -> c_int;
type WorkerRunFn =
    unsafe extern "C" fn(*mut c_void, *const c_void, i64, PushCb, *const c_void) -> c_int;
type CommitPitFn = unsafe extern "C" fn(*mut c_void, *const c_void, i64) -> c_int;
type CommitJobFn = unsafe extern "C" fn(*mut c_void, PushCb, *const c_void) -> c_int;
type FinalizeFn = unsafe extern "C" fn(*mut c_void);

/// Outcome of one `spits_worker_run` call.
#[derive(Debug)]
pub struct WorkerResult {
    /// Module return code in the lower 32 bits, framework flags above.
    pub status: i64,
    /// Bytes the module pushed; empty when the callback never fired.
    pub payload: Vec<u8>,
}

macro_rules! module_handle {
    ($(#[$doc:meta])* $name:ident, $finalize:expr) => {
        $(#[$doc])*
        pub struct $name {
            raw: *mut c_void,
            lib: Arc<Library>,
        }

        // The handle is moved between threads but every call into the
        // module on it is serialized by its single owner.
        unsafe impl Send for $name {}

        impl Drop for $name {
            fn drop(&mut self) {
                let finalize: &[u8] = $finalize;
                if let Ok(finalize) = unsafe { self.lib.get::<FinalizeFn>(finalize) } {
                    unsafe { finalize(self.raw) }
                }
            }
        }
    };
}

module_handle!(
    /// Job-manager-side module state, owned by the push engine.
    JobManagerHandle,
    b"spits_job_manager_finalize\0"
);
module_handle!(
    /// Per-worker module state, owned by one pool worker thread.
    WorkerHandle,
    b"spits_worker_finalize\0"
);
module_handle!(
    /// Committer-side module state, owned by the pull engine and driver.
    CommitterHandle,
    b"spits_committer_finalize\0"
);

/// The loaded job module.
pub struct JobBinary {
    path: PathBuf,
    lib: Arc<Library>,
}

impl JobBinary {
    /// Load the shared object at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<JobBinary, BridgeError> {
        let path = path.as_ref();
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let lib = unsafe { Library::new(&resolved) }.map_err(|source| BridgeError::Load {
            path: resolved.clone(),
            source,
        })?;
        Ok(JobBinary {
            path: resolved,
            lib: Arc::new(lib),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn required<T>(&self, name: &'static str, symbol: &[u8]) -> Result<Symbol<'_, T>, BridgeError> {
        unsafe { self.lib.get(symbol) }.map_err(|_| BridgeError::MissingSymbol(name))
    }

    /// Run the job through the module's `spits_main`, or call `runner`
    /// directly when the module does not export one.
    ///
    /// The runner receives the argv the module chose to forward and must
    /// return the final job status plus the aggregate result bytes.
    pub fn main_entry<F>(&self, args: &[String], runner: F) -> Result<i64, BridgeError>
    where
        F: FnMut(&[String]) -> (i64, Option<Vec<u8>>) + Send + 'static,
    {
        let mut runner = runner;
        let main: Symbol<'_, MainFn> = match unsafe { self.lib.get(b"spits_main\0") } {
            Ok(main) => main,
            Err(_) => {
                debug!("job module has no spits_main, invoking the runner directly");
                let (status, _result) = runner(args);
                return Ok(status);
            }
        };

        install_runner(Box::new(move |argv| runner(&argv)));
        let argv = CArgv::new(args)?;
        let status = unsafe { main(argv.argc(), argv.argv(), run_trampoline) };
        clear_runner();
        Ok(i64::from(status))
    }

    pub fn job_manager_new(&self, args: &[String]) -> Result<JobManagerHandle, BridgeError> {
        let new: Symbol<'_, NewFn> =
            self.required("spits_job_manager_new", b"spits_job_manager_new\0")?;
        let argv = CArgv::new(args)?;
        let raw = unsafe { new(argv.argc(), argv.argv()) };
        if raw.is_null() {
            return Err(BridgeError::NullHandle("job manager"));
        }
        Ok(JobManagerHandle {
            raw,
            lib: self.lib.clone(),
        })
    }

    /// Ask the module for the next task payload. `None` means the module
    /// is done generating.
    pub fn next_task(&self, handle: &JobManagerHandle) -> Result<Option<Vec<u8>>, BridgeError> {
        let next: Symbol<'_, NextTaskFn> = self.required(
            "spits_job_manager_next_task",
            b"spits_job_manager_next_task\0",
        )?;

        let mut data: *const c_void = ptr::null();
        let mut len: i64 = 0;
        let produced = unsafe { next(handle.raw, &mut data, &mut len) };
        if produced == 0 {
            return Ok(None);
        }
        Ok(Some(unsafe { copy_out(data, len) }))
    }

    pub fn worker_new(&self, args: &[String]) -> Result<WorkerHandle, BridgeError> {
        let new: Symbol<'_, NewFn> = self.required("spits_worker_new", b"spits_worker_new\0")?;
        let argv = CArgv::new(args)?;
        let raw = unsafe { new(argv.argc(), argv.argv()) };
        if raw.is_null() {
            return Err(BridgeError::NullHandle("worker"));
        }
        Ok(WorkerHandle {
            raw,
            lib: self.lib.clone(),
        })
    }

    /// Execute one task. The `taskid` doubles as the push-callback context
    /// the module must echo back.
    pub fn worker_run(
        &self,
        handle: &WorkerHandle,
        taskid: i64,
        task: &[u8],
    ) -> Result<WorkerResult, BridgeError> {
        let run: Symbol<'_, WorkerRunFn> = self.required("spits_worker_run", b"spits_worker_run\0")?;

        let (data, len) = to_c_buffer(task);
        let (status, payload) = with_push_capture(taskid, || unsafe {
            run(handle.raw, data, len, capture_push, taskid as *const c_void)
        });

        Ok(WorkerResult {
            status,
            payload: payload.unwrap_or_default(),
        })
    }

    pub fn committer_new(&self, args: &[String]) -> Result<CommitterHandle, BridgeError> {
        let new: Symbol<'_, NewFn> =
            self.required("spits_committer_new", b"spits_committer_new\0")?;
        let argv = CArgv::new(args)?;
        let raw = unsafe { new(argv.argc(), argv.argv()) };
        if raw.is_null() {
            return Err(BridgeError::NullHandle("committer"));
        }
        Ok(CommitterHandle {
            raw,
            lib: self.lib.clone(),
        })
    }

    /// Feed one task result to the committer; returns its status code.
    pub fn commit_pit(&self, handle: &CommitterHandle, result: &[u8]) -> Result<i64, BridgeError> {
        let commit: Symbol<'_, CommitPitFn> =
            self.required("spits_committer_commit_pit", b"spits_committer_commit_pit\0")?;
        let (data, len) = to_c_buffer(result);
        Ok(i64::from(unsafe { commit(handle.raw, data, len) }))
    }

    /// Close out the job and collect the aggregate result bytes, if the
    /// module pushed any.
    pub fn commit_job(
        &self,
        handle: &CommitterHandle,
    ) -> Result<(i64, Option<Vec<u8>>), BridgeError> {
        let commit: Symbol<'_, CommitJobFn> =
            self.required("spits_committer_commit_job", b"spits_committer_commit_job\0")?;

        const JOB_CTX: i64 = 0;
        let (status, payload) = with_push_capture(JOB_CTX, || unsafe {
            commit(handle.raw, capture_push, JOB_CTX as *const c_void)
        });
        Ok((status, payload))
    }
}

/// Owned argv in C layout, alive for the duration of one module call.
struct CArgv {
    _strings: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CArgv {
    fn new(args: &[String]) -> Result<CArgv, BridgeError> {
        let strings = args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = strings.iter().map(|s| s.as_ptr()).collect();
        Ok(CArgv {
            _strings: strings,
            ptrs,
        })
    }

    fn argc(&self) -> c_int {
        self.ptrs.len() as c_int
    }

    fn argv(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }
}

fn to_c_buffer(bytes: &[u8]) -> (*const c_void, i64) {
    if bytes.is_empty() {
        (ptr::null(), 0)
    } else {
        (bytes.as_ptr() as *const c_void, bytes.len() as i64)
    }
}

unsafe fn copy_out(data: *const c_void, len: i64) -> Vec<u8> {
    if data.is_null() || len <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(data as *const u8, len as usize).to_vec()
}

// ---------------------------------------------------------------------------
// Push-callback capture.
//
// The push callback is a plain C function pointer and cannot close over
// framework state, so each call installs a capture cell in thread-local
// storage. Worker threads and the driver never share a thread, which keeps
// concurrent module calls isolated.
// ---------------------------------------------------------------------------

struct PushCapture {
    payload: Option<Vec<u8>>,
    ctx: i64,
    calls: u32,
}

thread_local! {
    static PUSH_CAPTURE: RefCell<Option<PushCapture>> = RefCell::new(None);
}

unsafe extern "C" fn capture_push(data: *const c_void, len: i64, ctx: *const c_void) {
    let payload = copy_out(data, len);
    PUSH_CAPTURE.with(|cell| match cell.borrow_mut().as_mut() {
        Some(capture) => {
            capture.calls += 1;
            capture.ctx = ctx as i64;
            capture.payload = Some(payload);
        }
        None => warn!("job module fired a push callback outside of a call"),
    });
}

/// Run `call` with a fresh capture cell and fold the callback outcome into
/// the returned status: `RES_MODULE_NOANS` when the callback never fired,
/// `RES_MODULE_CTXER` on a repeated call or a context mismatch.
fn with_push_capture<F>(expected_ctx: i64, call: F) -> (i64, Option<Vec<u8>>)
where
    F: FnOnce() -> c_int,
{
    PUSH_CAPTURE.with(|cell| {
        *cell.borrow_mut() = Some(PushCapture {
            payload: None,
            ctx: 0,
            calls: 0,
        })
    });

    let status = call();

    let capture = PUSH_CAPTURE
        .with(|cell| cell.borrow_mut().take())
        .unwrap_or(PushCapture {
            payload: None,
            ctx: 0,
            calls: 0,
        });

    let flags = if capture.calls == 0 {
        RES_MODULE_NOANS
    } else if capture.calls != 1 || capture.ctx != expected_ctx {
        RES_MODULE_CTXER
    } else {
        0
    };

    (flagged_status(status, flags), capture.payload)
}

// ---------------------------------------------------------------------------
// Runner trampoline for spits_main.
//
// The runner callback carries no context argument either; since spits_main
// wraps a whole process run, a process-wide slot is enough.
// ---------------------------------------------------------------------------

type Runner = Box<dyn FnMut(Vec<String>) -> (i64, Option<Vec<u8>>) + Send>;

static ACTIVE_RUNNER: Mutex<Option<Runner>> = Mutex::new(None);
// Keeps the result bytes alive after the trampoline returns, since the
// module only gets a borrowed pointer.
static MAIN_RESULT: Mutex<Option<Vec<u8>>> = Mutex::new(None);

fn install_runner(runner: Runner) {
    *ACTIVE_RUNNER.lock().expect("runner slot poisoned") = Some(runner);
}

fn clear_runner() {
    *ACTIVE_RUNNER.lock().expect("runner slot poisoned") = None;
}

unsafe extern "C" fn run_trampoline(
    argc: c_int,
    argv: *const *const c_char,
    out_data: *mut *const c_void,
    out_len: *mut i64,
) -> c_int {
    let mut args = Vec::with_capacity(argc.max(0) as usize);
    for i in 0..argc.max(0) as usize {
        let arg = *argv.add(i);
        if arg.is_null() {
            continue;
        }
        args.push(CStr::from_ptr(arg).to_string_lossy().into_owned());
    }

    let runner = ACTIVE_RUNNER.lock().expect("runner slot poisoned").take();
    let (status, result) = match runner {
        Some(mut runner) => runner(args),
        None => {
            error!("job module invoked the runner callback more than once");
            (-1, None)
        }
    };

    if !out_data.is_null() && !out_len.is_null() {
        match result {
            Some(bytes) => {
                let mut slot = MAIN_RESULT.lock().expect("result slot poisoned");
                *slot = Some(bytes);
                let held = slot.as_ref().expect("result bytes just stored");
                *out_data = held.as_ptr() as *const c_void;
                *out_len = held.len() as i64;
            }
            None => {
                *out_data = ptr::null();
                *out_len = 0;
            }
        }
    }

    status as c_int
}
