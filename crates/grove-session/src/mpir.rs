//! MPIR debugger-attach surface.
//!
//! Debuggers that speak the MPIR process-acquisition interface locate
//! these symbols by name in the starter process, read the proc table,
//! and set breakpoints on `MPIR_Breakpoint`. The names and layouts are
//! fixed by that convention, so this is the one place in the launcher
//! where state is process-wide statics rather than session fields.
//!
//! The statics are written by the launcher and read (and in the case of
//! `MPIR_being_debugged`, written) by an attached debugger, hence the
//! volatile accesses.

use std::ffi::{c_char, c_int, CString};
use std::ptr;

/// One row of the proc table: where one process runs, what it execs,
/// and its pid.
#[repr(C)]
pub struct MpirProcdesc {
    pub host_name: *mut c_char,
    pub executable_name: *mut c_char,
    pub pid: c_int,
}

/// No debug event.
pub const MPIR_NULL: c_int = 0;
/// Processes have been spawned and the proc table is valid.
pub const MPIR_DEBUG_SPAWNED: c_int = 1;
/// The job is aborting.
pub const MPIR_DEBUG_ABORTING: c_int = 2;

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_proctable: *mut MpirProcdesc = ptr::null_mut();

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_proctable_size: c_int = 0;

/// Set to 1 by the debugger before it launches or attaches to us.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_being_debugged: c_int = 0;

#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_debug_state: c_int = MPIR_NULL;

/// Set to 1 in the root spawn process.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_i_am_starter: c_int = 0;

/// This launcher exposes no message queues.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut MPIR_ignore_queues: c_int = 1;

/// Debuggers set a breakpoint here; the launcher calls it after the
/// proc table is populated.
#[allow(non_snake_case)]
#[no_mangle]
#[inline(never)]
pub extern "C" fn MPIR_Breakpoint() {
    // The body stays empty; the call itself is the signal.
    std::hint::black_box(());
}

/// Whether a debugger flagged this process before startup.
pub fn being_debugged() -> bool {
    unsafe { ptr::read_volatile(ptr::addr_of!(MPIR_being_debugged)) != 0 }
}

/// Mark this process as the MPIR starter (root only).
pub fn set_i_am_starter() {
    unsafe { ptr::write_volatile(ptr::addr_of_mut!(MPIR_i_am_starter), 1) };
}

/// Publish the proc table and tell the debugger the job is spawned.
///
/// Each entry is `(host, executable, pid)`. The table and its strings
/// are leaked deliberately: the debugger may read them at any point for
/// the rest of the process lifetime.
pub fn publish_proctable(entries: &[(String, String, i32)]) {
    let mut table: Vec<MpirProcdesc> = entries
        .iter()
        .map(|(host, exe, pid)| MpirProcdesc {
            host_name: leak_cstring(host),
            executable_name: leak_cstring(exe),
            pid: *pid,
        })
        .collect();
    let size = table.len() as c_int;
    let ptr = table.as_mut_ptr();
    std::mem::forget(table);

    unsafe {
        ptr::write_volatile(ptr::addr_of_mut!(MPIR_proctable), ptr);
        ptr::write_volatile(ptr::addr_of_mut!(MPIR_proctable_size), size);
        ptr::write_volatile(ptr::addr_of_mut!(MPIR_debug_state), MPIR_DEBUG_SPAWNED);
    }
    MPIR_Breakpoint();
}

fn leak_cstring(s: &str) -> *mut c_char {
    CString::new(s.as_bytes())
        .unwrap_or_default()
        .into_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_fills_table_and_state() {
        publish_proctable(&[
            ("node0".to_string(), "/bin/app".to_string(), 100),
            ("node1".to_string(), "/bin/app".to_string(), 200),
        ]);
        unsafe {
            assert_eq!(ptr::read_volatile(ptr::addr_of!(MPIR_proctable_size)), 2);
            assert_eq!(
                ptr::read_volatile(ptr::addr_of!(MPIR_debug_state)),
                MPIR_DEBUG_SPAWNED
            );
            let table = ptr::read_volatile(ptr::addr_of!(MPIR_proctable));
            let first = &*table;
            assert_eq!(first.pid, 100);
            let host = std::ffi::CStr::from_ptr(first.host_name);
            assert_eq!(host.to_str().unwrap(), "node0");
        }
    }

    #[test]
    fn starter_flag_round_trips() {
        set_i_am_starter();
        unsafe {
            assert_eq!(ptr::read_volatile(ptr::addr_of!(MPIR_i_am_starter)), 1);
        }
    }
}
