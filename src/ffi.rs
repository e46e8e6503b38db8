//! The stable C recorder ABI (spec.md §6), used by language runtime shims
//! that inject checkpoint calls into instrumented source code.
//!
//! The checkpoint recorder is the one piece of process-wide global state
//! this crate owns (spec.md §9: "one process-wide checkpoint recorder...
//! an explicit singleton guarded by an atomic initialization flag; no
//! hidden constructors"). Everything else (sessions, coordinators,
//! providers) is instantiated explicitly by the embedding process.

use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::checkpoint::{self, CheckpointKind};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Brings up the process-wide checkpoint recorder. Returns `1` on success,
/// `0` on failure. Idempotent: calling this again while already
/// initialized is a no-op that still returns `1` and does not clear
/// previously recorded checkpoints.
#[unsafe(no_mangle)]
pub extern "C" fn nemb_initialize() -> i32 {
    INITIALIZED.store(true, Ordering::Release);
    1
}

/// Records one checkpoint on the calling thread. `name` must be a
/// NUL-terminated string of the form `"<kind>:<region_id>:<extra>"` where
/// `kind` is one of `"enter"`, `"exit"`, `"mark"`; `extra` is accepted but
/// ignored by this core (collaborators may use it for call-site metadata).
///
/// A no-op before `nemb_initialize` succeeds, on a null or non-UTF-8
/// pointer, or on an unparseable `name` — this ABI never aborts the calling
/// process (spec.md §7).
///
/// # Safety
/// `name`, if non-null, must point to a valid NUL-terminated C string for
/// the duration of this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn nemb_mark_checkpoint(name: *const c_char) {
    if !INITIALIZED.load(Ordering::Acquire) || name.is_null() {
        return;
    }
    // SAFETY: caller guarantees `name` is a valid NUL-terminated C string.
    let Ok(raw) = (unsafe { CStr::from_ptr(name) }).to_str() else {
        return;
    };
    let Some((kind, region_id)) = parse_checkpoint_name(raw) else {
        return;
    };

    let timestamp_ns = crate::timer::shared().now_ns();
    checkpoint::record(timestamp_ns, region_id, kind);
}

/// Releases the process-wide checkpoint recorder. Idempotent.
#[unsafe(no_mangle)]
pub extern "C" fn nemb_shutdown() {
    INITIALIZED.store(false, Ordering::Release);
    checkpoint::reset();
}

fn parse_checkpoint_name(raw: &str) -> Option<(CheckpointKind, &str)> {
    let mut parts = raw.splitn(3, ':');
    let kind = CheckpointKind::parse(parts.next()?)?;
    let region_id = parts.next()?;
    Some((kind, region_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::CString;

    #[test]
    fn parses_well_formed_names() {
        assert!(matches!(parse_checkpoint_name("enter:hot_loop:file.c:42"), Some((CheckpointKind::Enter, "hot_loop"))));
        assert!(matches!(parse_checkpoint_name("exit:hot_loop:"), Some((CheckpointKind::Exit, "hot_loop"))));
        assert!(matches!(parse_checkpoint_name("mark:tag"), Some((CheckpointKind::Mark, "tag"))));
    }

    #[test]
    fn rejects_unknown_kind_or_missing_region() {
        assert!(parse_checkpoint_name("bogus:hot_loop").is_none());
        assert!(parse_checkpoint_name("enter").is_none());
    }

    #[test]
    #[serial]
    fn mark_checkpoint_before_initialize_is_a_no_op() {
        checkpoint::reset();
        let name = CString::new("enter:uninitialized_region").unwrap();
        unsafe { nemb_mark_checkpoint(name.as_ptr()) };
        let snaps = checkpoint::snapshot_all();
        assert!(snaps.iter().all(|s| s.records.is_empty()));
    }

    #[test]
    #[serial]
    fn full_lifecycle_records_a_checkpoint() {
        checkpoint::reset();
        assert_eq!(nemb_initialize(), 1);

        let name = CString::new("enter:ffi_region").unwrap();
        unsafe { nemb_mark_checkpoint(name.as_ptr()) };

        let snaps = checkpoint::snapshot_all();
        assert!(snaps.iter().any(|s| !s.records.is_empty()));

        nemb_shutdown();
        let snaps = checkpoint::snapshot_all();
        assert!(snaps.is_empty());
    }

    #[test]
    #[serial]
    fn null_name_is_a_no_op() {
        checkpoint::reset();
        assert_eq!(nemb_initialize(), 1);
        unsafe { nemb_mark_checkpoint(std::ptr::null()) };
        nemb_shutdown();
    }
}
