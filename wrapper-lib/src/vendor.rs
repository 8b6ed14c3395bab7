//! Lazy access to the real vendor camera module.
//!
//! The module is dlopen'ed on first use from its renamed location and never
//! unloaded: device operation tables point into it for the rest of the
//! process lifetime. A failed load is retried on the next access, so a
//! module call that races the vendor partition mount recovers by itself.

use log::{error, info};
use std::ffi::{CStr, CString};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use shared::constants::VENDOR_MODULE_PATH;

use crate::hal::CameraModule;

static VENDOR_MODULE: AtomicPtr<CameraModule> = AtomicPtr::new(null_mut());

/// The vendor module's `HMI` table, loading the library on first call.
pub fn module() -> Option<&'static CameraModule> {
    let cached = VENDOR_MODULE.load(Ordering::SeqCst);
    if !cached.is_null() {
        // SAFETY: installed once from a successful dlsym; never unloaded.
        return Some(unsafe { &*cached });
    }

    let loaded = load(VENDOR_MODULE_PATH)?;

    // Race-free install if still null.
    match VENDOR_MODULE.compare_exchange(null_mut(), loaded, Ordering::SeqCst, Ordering::SeqCst) {
        // SAFETY: both pointers come out of dlsym on the same library,
        // which stays mapped forever.
        Ok(_) => Some(unsafe { &*loaded }),
        Err(existing) => Some(unsafe { &*existing }),
    }
}

fn load(path: &str) -> Option<*mut CameraModule> {
    let c_path = CString::new(path).ok()?;

    // SAFETY: c_path outlives the call. The handle is intentionally never
    // closed; the module must stay mapped as long as any device table
    // points into it.
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        error!("dlopen({path}) failed: {}", dlerror_message());
        return None;
    }

    // SAFETY: handle is a live dlopen result.
    let sym = unsafe { libc::dlsym(handle, c"HMI".as_ptr()) };
    if sym.is_null() {
        error!("{path} does not export HMI: {}", dlerror_message());
        // SAFETY: nothing references the library yet.
        unsafe { libc::dlclose(handle) };
        return None;
    }

    info!("vendor camera module loaded from {path}");
    Some(sym as *mut CameraModule)
}

fn dlerror_message() -> String {
    // SAFETY: dlerror returns a thread-local string or NULL.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dl error".into()
    } else {
        // SAFETY: non-null dlerror results are NUL-terminated.
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}
