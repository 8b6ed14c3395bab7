//! Process-global registry of wrapped camera devices.
//!
//! The host framework owns device identity and invokes the hooks through
//! raw function pointers, so the only place to carry state from `open` to
//! `initialize` to the capture-result callback is a guarded global map
//! keyed by pointer value. Entries are inserted on open and initialize and
//! never removed; a process opens a camera a handful of times over its
//! life. Pointer values are stored as plain addresses so the map itself
//! stays free of aliasing claims.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::hal::{Camera3CallbackOps, Camera3Device, Camera3DeviceOps};

#[derive(Default)]
struct Registry {
    /// device -> vendor operation table found at open
    original_ops: HashMap<usize, usize>,
    /// device -> callback table the framework passed to initialize
    framework_callbacks: HashMap<usize, usize>,
    /// wrapped callback table -> framework table to forward into
    forward_targets: HashMap<usize, usize>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(Mutex::default);

/// Remember the vendor's operation table for a freshly opened device.
pub fn record_open(device: *const Camera3Device, ops: *const Camera3DeviceOps) {
    if let Ok(mut reg) = REGISTRY.lock() {
        reg.original_ops.insert(device as usize, ops as usize);
    }
}

pub fn original_ops(device: *const Camera3Device) -> Option<*const Camera3DeviceOps> {
    let reg = REGISTRY.lock().ok()?;
    reg.original_ops
        .get(&(device as usize))
        .map(|&p| p as *const Camera3DeviceOps)
}

/// Remember both callback tables involved in an `initialize`.
pub fn record_initialize(
    device: *const Camera3Device,
    framework: *const Camera3CallbackOps,
    wrapped: *const Camera3CallbackOps,
) {
    if let Ok(mut reg) = REGISTRY.lock() {
        reg.framework_callbacks
            .insert(device as usize, framework as usize);
        reg.forward_targets
            .insert(wrapped as usize, framework as usize);
    }
}

pub fn framework_callbacks(device: *const Camera3Device) -> Option<*const Camera3CallbackOps> {
    let reg = REGISTRY.lock().ok()?;
    reg.framework_callbacks
        .get(&(device as usize))
        .map(|&p| p as *const Camera3CallbackOps)
}

/// Where a capture result arriving on `wrapped` must be forwarded.
pub fn forward_target(wrapped: *const Camera3CallbackOps) -> Option<*const Camera3CallbackOps> {
    let reg = REGISTRY.lock().ok()?;
    reg.forward_targets
        .get(&(wrapped as usize))
        .map(|&p| p as *const Camera3CallbackOps)
}
