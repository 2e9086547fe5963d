//! Wire protocol constants.
//!
//! Every frame on the wire starts with a 64-bit big-endian opcode. The
//! values are spread out so a truncated or misaligned frame is unlikely to
//! collide with a valid one.

use std::time::Duration;

/// JM asks a TM whether it may push tasks.
pub const MSG_SEND_TASK: i64 = 0x0201;
/// TM asks the JM for (another) task.
pub const MSG_SEND_MORE: i64 = 0x0202;
/// TM is full, the JM should stop pushing.
pub const MSG_SEND_FULL: i64 = 0x0203;
/// TM rejected the last task; the JM must keep it for another TM.
pub const MSG_SEND_RJCT: i64 = 0x0204;

/// JM asks a TM for completed results; also the per-result acknowledgment.
pub const MSG_READ_RESULT: i64 = 0x0101;
/// TM has no more results to deliver.
pub const MSG_READ_EMPTY: i64 = 0x0000;

/// Unconditional TM shutdown.
pub const MSG_TERMINATE: i64 = 0xFFFF;

/// The module call itself failed.
pub const RES_MODULE_ERROR: i64 = 0xFFFF_FFFF_0000_0000_u64 as i64;
/// The module never delivered a result through the push callback.
pub const RES_MODULE_NOANS: i64 = 0xFFFF_FFFE_0000_0000_u64 as i64;
/// The push callback fired with a mismatched context.
pub const RES_MODULE_CTXER: i64 = 0xFFFF_FFFD_0000_0000_u64 as i64;

/// Default job manager port (reserved).
pub const JM_PORT: u16 = 7726;
/// Default task manager port.
pub const TM_PORT: u16 = 7727;

/// Pause between job manager push cycles.
pub const PUSH_BACKOFF: Duration = Duration::from_millis(250);
/// Pause between job manager pull cycles.
pub const PULL_BACKOFF: Duration = Duration::from_secs(2);
/// Pause after a failed accept on the listener.
pub const ACCEPT_BACKOFF: Duration = Duration::from_secs(10);

/// Framework flags carried in the upper 32 bits of a task status.
pub fn module_flags(status: i64) -> i64 {
    ((status as u64) & 0xFFFF_FFFF_0000_0000) as i64
}

/// The module's own return code, carried in the lower 32 bits.
pub fn module_status(status: i64) -> i32 {
    status as u32 as i32
}

/// Combine a module return code with framework flags.
pub fn flagged_status(module_status: i32, flags: i64) -> i64 {
    flags | (module_status as u32 as i64)
}
