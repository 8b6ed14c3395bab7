//! Vtable interposition over the vendor camera module.
//!
//! The exported `HMI` table passes every module-level call through to the
//! vendor. Device `open` is where the wrapping happens: the vendor's
//! operation table is recorded, bit-copied, and the copy's `initialize`
//! slot is pointed at our hook before the device is returned. `initialize`
//! repeats the trick on the framework's callback table so that every
//! capture result flows through [`process_capture_result`] on its way back.
//!
//! The replacement tables are leaked allocations: the framework and the
//! vendor may call through them for as long as the process lives, and the
//! vendor-allocated originals are never freed either.
//!
//! Hooks run on whatever thread the caller uses and may run concurrently.
//! The registry lookups take its mutex; the injection fast path after the
//! one-time ring mapping touches only the ring header atomics and a
//! mapping local to the call. A hook must never panic: every failure
//! degrades to forwarding the vendor's untouched output.

use core::ffi::{c_char, c_int, c_void};
use log::{debug, error, info, trace, warn};
use once_cell::sync::Lazy;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex};

use shared::constants::{
    DEFAULT_DEVICE_STRIDE, FRAME_SIZE, INJECT_FLAG_PATH, NUM_FRAMES, ring_total_size,
};
use shared::ring::monotonic_ms;

use crate::hal::{
    CAMERA3_BUFFER_STATUS_OK, CAMERA_HARDWARE_MODULE_ID, CAMERA_MODULE_API_VERSION_2_4,
    Camera3CallbackOps, Camera3CaptureResult, Camera3Device, CameraInfo, CameraModule,
    ERR_NO_DEVICE, HARDWARE_HAL_API_VERSION, HARDWARE_MODULE_TAG, HwDevice, HwModule,
    HwModuleMethods, InitializeFn, ModuleExport,
};
use crate::rendezvous::{self, RingConsumer};
use crate::{inject, registry, vendor};

static METHODS: HwModuleMethods = HwModuleMethods {
    open: Some(open_device),
};

/// The module table the platform loader resolves in place of the vendor's.
#[unsafe(no_mangle)]
pub static HMI: ModuleExport = ModuleExport(CameraModule {
    common: HwModule {
        tag: HARDWARE_MODULE_TAG,
        module_api_version: CAMERA_MODULE_API_VERSION_2_4,
        hal_api_version: HARDWARE_HAL_API_VERSION,
        id: CAMERA_HARDWARE_MODULE_ID.as_ptr(),
        name: c"QCamera wrapper module".as_ptr(),
        author: c"The Android Open Source Project".as_ptr(),
        methods: &raw const METHODS as *mut HwModuleMethods,
        dso: ptr::null_mut(),
        reserved: [0; 25],
    },
    get_number_of_cameras: Some(get_number_of_cameras),
    get_camera_info: Some(get_camera_info),
    set_callbacks: Some(set_callbacks),
    get_vendor_tag_ops: Some(get_vendor_tag_ops),
    open_legacy: Some(open_legacy),
    set_torch_mode: Some(set_torch_mode),
    init: Some(init),
    get_physical_camera_info: Some(get_physical_camera_info),
});

// ── Module-level pass-throughs ──────────────────────────────────────────

extern "C" fn get_number_of_cameras() -> c_int {
    match vendor::module().and_then(|m| m.get_number_of_cameras) {
        // SAFETY: calling into the loaded vendor table.
        Some(f) => unsafe { f() },
        None => 0,
    }
}

extern "C" fn get_camera_info(camera_id: c_int, info: *mut CameraInfo) -> c_int {
    match vendor::module().and_then(|m| m.get_camera_info) {
        // SAFETY: forwarding the framework's own out-pointer.
        Some(f) => unsafe { f(camera_id, info) },
        None => ERR_NO_DEVICE,
    }
}

extern "C" fn set_callbacks(callbacks: *const c_void) -> c_int {
    match vendor::module().and_then(|m| m.set_callbacks) {
        // SAFETY: as above.
        Some(f) => unsafe { f(callbacks) },
        None => ERR_NO_DEVICE,
    }
}

extern "C" fn get_vendor_tag_ops(ops: *mut c_void) {
    if let Some(f) = vendor::module().and_then(|m| m.get_vendor_tag_ops) {
        // SAFETY: as above.
        unsafe { f(ops) };
    }
}

extern "C" fn open_legacy(
    _module: *const HwModule,
    id: *const c_char,
    hal_version: u32,
    device: *mut *mut HwDevice,
) -> c_int {
    match vendor::module() {
        // SAFETY: the vendor expects its own module pointer, not ours.
        Some(m) => match m.open_legacy {
            Some(f) => unsafe { f(&m.common, id, hal_version, device) },
            None => ERR_NO_DEVICE,
        },
        None => ERR_NO_DEVICE,
    }
}

extern "C" fn set_torch_mode(camera_id: *const c_char, enabled: bool) -> c_int {
    match vendor::module().and_then(|m| m.set_torch_mode) {
        // SAFETY: as above.
        Some(f) => unsafe { f(camera_id, enabled) },
        None => ERR_NO_DEVICE,
    }
}

extern "C" fn init() -> c_int {
    match vendor::module().and_then(|m| m.init) {
        // SAFETY: as above.
        Some(f) => unsafe { f() },
        None => ERR_NO_DEVICE,
    }
}

extern "C" fn get_physical_camera_info(
    physical_camera_id: c_int,
    static_metadata: *mut *mut c_void,
) -> c_int {
    match vendor::module().and_then(|m| m.get_physical_camera_info) {
        // SAFETY: as above.
        Some(f) => unsafe { f(physical_camera_id, static_metadata) },
        None => ERR_NO_DEVICE,
    }
}

// ── Device open and vtable interposition ────────────────────────────────

extern "C" fn open_device(
    _module: *const HwModule,
    id: *const c_char,
    device: *mut *mut HwDevice,
) -> c_int {
    let Some(vendor) = vendor::module() else {
        return ERR_NO_DEVICE;
    };
    // SAFETY: the vendor's methods table lives inside the loaded module.
    let Some(open) = (unsafe { vendor.common.methods.as_ref() }).and_then(|m| m.open) else {
        return ERR_NO_DEVICE;
    };

    // SAFETY: the vendor expects its own hw_module_t; the out-pointer is
    // the framework's.
    let status = unsafe { open(&vendor.common, id, device) };
    if status != 0 || device.is_null() {
        return status;
    }
    // SAFETY: the vendor just stored the device pointer on success.
    let dev = unsafe { *device } as *mut Camera3Device;
    if dev.is_null() {
        return status;
    }

    // SAFETY: we own the brief window between the vendor populating the
    // device and the framework receiving it.
    unsafe { wrap_device(dev) };
    status
}

/// Swap the device's operation table for a copy whose `initialize` slot
/// points at our hook. The copy is leaked on purpose: the framework keeps
/// calling through it for as long as the process lives.
///
/// # Safety
/// `dev` must be a device freshly produced by the vendor's `open`, not yet
/// visible to any other thread.
unsafe fn wrap_device(dev: *mut Camera3Device) {
    // SAFETY: per the function contract.
    let orig = unsafe { (*dev).ops };
    if orig.is_null() {
        warn!("vendor device carries no operation table; leaving it alone");
        return;
    }

    // SAFETY: the vendor's table is valid while the module stays loaded.
    let mut ops = unsafe { *orig };
    if ops.initialize == Some(initialize_device as InitializeFn) {
        // The framework reopened the same device object; it is already ours.
        return;
    }

    registry::record_open(dev, orig);
    ops.initialize = Some(initialize_device);
    // SAFETY: storing a 'static copy into the device we still own.
    unsafe { (*dev).ops = Box::leak(Box::new(ops)) };
    info!("device operation table wrapped");
}

extern "C" fn initialize_device(
    dev: *const Camera3Device,
    callbacks: *const Camera3CallbackOps,
) -> c_int {
    let Some(orig_ops) = registry::original_ops(dev) else {
        error!("initialize on a device that was never wrapped");
        return ERR_NO_DEVICE;
    };
    // SAFETY: the original table points into the vendor module.
    let Some(orig_init) = (unsafe { (*orig_ops).initialize }) else {
        return ERR_NO_DEVICE;
    };

    if callbacks.is_null() {
        // SAFETY: pass the framework's (null) table straight through.
        return unsafe { orig_init(dev, callbacks) };
    }

    if registry::framework_callbacks(dev).is_some() {
        debug!("device re-initialized; replacing the recorded callbacks");
    }
    let wrapped = wrap_callbacks(dev, callbacks);
    debug!("initialize forwarded with wrapped callbacks");
    // SAFETY: the wrapped table is 'static and layout-identical.
    unsafe { orig_init(dev, wrapped) }
}

/// Bit-copy the framework's callback table with the capture-result slot
/// swapped for our hook. Leaked for the same lifetime reason as the ops
/// copy; the registry remembers where results must be forwarded.
fn wrap_callbacks(
    dev: *const Camera3Device,
    framework: *const Camera3CallbackOps,
) -> *const Camera3CallbackOps {
    // SAFETY: the framework guarantees the table outlives the device.
    let mut cbs = unsafe { *framework };
    cbs.process_capture_result = Some(process_capture_result);
    let wrapped: *const Camera3CallbackOps = Box::leak(Box::new(cbs));
    registry::record_initialize(dev, framework, wrapped);
    wrapped
}

// ── Capture-result hook ─────────────────────────────────────────────────

extern "C" fn process_capture_result(
    ops: *const Camera3CallbackOps,
    result: *const Camera3CaptureResult,
) {
    if injection_enabled() {
        inject_result(result);
    }

    let Some(target) = registry::forward_target(ops) else {
        error!("capture result arrived on an unknown callback table");
        return;
    };
    // SAFETY: `target` is the framework table recorded at initialize; the
    // framework expects its own table as the first argument.
    if let Some(forward) = unsafe { (*target).process_capture_result } {
        unsafe { forward(target, result) };
    }
}

fn injection_enabled() -> bool {
    Path::new(INJECT_FLAG_PATH).exists()
}

static RING: Lazy<Mutex<Option<Arc<RingConsumer>>>> = Lazy::new(Mutex::default);

/// The mapped ring, performing the rendezvous on first use. A failed
/// attempt leaves the slot empty so the next capture retries.
fn ring() -> Option<Arc<RingConsumer>> {
    let Ok(mut slot) = RING.lock() else {
        return None;
    };
    if slot.is_none() {
        match rendezvous::fetch(ring_total_size(NUM_FRAMES, FRAME_SIZE)) {
            Ok(consumer) => *slot = Some(Arc::new(consumer)),
            Err(e) => {
                debug!("ring rendezvous unavailable: {e}");
                return None;
            }
        }
    }
    slot.clone()
}

/// Overwrite every completed output buffer of `result` with the latest
/// ring frame. Every failure path leaves the vendor's pixels in place.
fn inject_result(result: *const Camera3CaptureResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: the vendor hands us a valid result for the duration of the
    // callback.
    let result = unsafe { &*result };
    if result.num_output_buffers == 0 || result.output_buffers.is_null() {
        return;
    }

    let Some(consumer) = ring() else {
        return;
    };
    let reader = consumer.reader();
    if reader.is_stale(monotonic_ms()) {
        debug!("ring is stale; vendor frames pass through");
        return;
    }
    let (slot, frame) = reader.latest();

    // SAFETY: count and pointer were checked above.
    let buffers = unsafe {
        std::slice::from_raw_parts(result.output_buffers, result.num_output_buffers as usize)
    };
    for buf in buffers {
        if buf.status != CAMERA3_BUFFER_STATUS_OK || buf.buffer.is_null() {
            continue;
        }
        // SAFETY: a non-null buffer field points at a live buffer handle.
        let handle = unsafe { *buf.buffer };
        if handle.is_null() {
            continue;
        }
        // SAFETY: gralloc handles carry their descriptors in data[0..num_fds].
        let Some(fd) = (unsafe { (*handle).first_fd() }) else {
            continue;
        };

        // TODO: take the row pitch from the stream configuration once it is
        // plumbed through; the default matches the current sensor mode.
        let stride = DEFAULT_DEVICE_STRIDE;
        // SAFETY: the descriptor refers to the buffer's pixel memory,
        // sized for the device pitch.
        if let Err(e) =
            unsafe { inject::overwrite_nv21(fd, frame, reader.width(), reader.height(), stride) }
        {
            info!("skipping buffer injection: {e}");
        }
    }
    trace!(
        "frame {}: ring slot {slot} over {} buffers",
        result.frame_number, result.num_output_buffers
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Camera3DeviceOps, NotifyFn, ProcessCaptureResultFn};
    use std::mem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leaked_device(ops: *mut Camera3DeviceOps) -> *mut Camera3Device {
        Box::leak(Box::new(Camera3Device {
            // SAFETY: all-zero bits are valid for a POD device head.
            common: unsafe { mem::zeroed::<HwDevice>() },
            ops,
            priv_: ptr::null_mut(),
        }))
    }

    // ── Pass-through stubs without a vendor module ─────────────────────

    #[test]
    fn stubs_answer_when_the_vendor_is_unloaded() {
        assert_eq!(get_number_of_cameras(), 0);
        assert_eq!(get_camera_info(0, ptr::null_mut()), ERR_NO_DEVICE);
        assert_eq!(set_callbacks(ptr::null()), ERR_NO_DEVICE);
        assert_eq!(init(), ERR_NO_DEVICE);
        assert_eq!(set_torch_mode(ptr::null(), true), ERR_NO_DEVICE);
    }

    #[test]
    fn exported_module_is_populated() {
        let module = &HMI.0;
        assert_eq!(module.common.tag, HARDWARE_MODULE_TAG);
        assert_eq!(module.common.module_api_version, CAMERA_MODULE_API_VERSION_2_4);
        // SAFETY: METHODS is a 'static table.
        let open = unsafe { (*module.common.methods).open };
        assert!(open.is_some());
        assert!(module.get_number_of_cameras.is_some());
        assert!(module.get_physical_camera_info.is_some());
    }

    // ── Vtable interposition ───────────────────────────────────────────

    static VENDOR_INIT_SAW: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn fake_vendor_initialize(
        _dev: *const Camera3Device,
        callbacks: *const Camera3CallbackOps,
    ) -> c_int {
        VENDOR_INIT_SAW.store(callbacks as usize, Ordering::SeqCst);
        0
    }

    extern "C" fn fw_notify(_: *const Camera3CallbackOps, _: *const c_void) {}

    fn vendor_ops() -> *mut Camera3DeviceOps {
        // SAFETY: all-zero bits mean every slot is None, a valid table.
        let mut ops: Camera3DeviceOps = unsafe { mem::zeroed() };
        ops.initialize = Some(fake_vendor_initialize as InitializeFn);
        Box::leak(Box::new(ops))
    }

    #[test]
    fn wrap_device_swaps_initialize_and_keeps_the_original() {
        let orig = vendor_ops();
        let dev = leaked_device(orig);

        unsafe { wrap_device(dev) };

        // The device now carries a different table with our hook in it.
        let patched = unsafe { (*dev).ops };
        assert_ne!(patched, orig);
        assert_eq!(
            unsafe { (*patched).initialize },
            Some(initialize_device as InitializeFn)
        );
        assert_eq!(registry::original_ops(dev), Some(orig as *const _));

        // Wrapping again must not stack another layer.
        unsafe { wrap_device(dev) };
        assert_eq!(unsafe { (*dev).ops }, patched);
        assert_eq!(registry::original_ops(dev), Some(orig as *const _));
    }

    #[test]
    fn initialize_hands_the_vendor_a_wrapped_callback_table() {
        let orig = vendor_ops();
        let dev = leaked_device(orig);
        unsafe { wrap_device(dev) };

        static RECORDED: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn fw_process_result(
            _ops: *const Camera3CallbackOps,
            result: *const Camera3CaptureResult,
        ) {
            RECORDED.store(result as usize, Ordering::SeqCst);
        }

        let framework: *const Camera3CallbackOps = Box::leak(Box::new(Camera3CallbackOps {
            process_capture_result: Some(fw_process_result as ProcessCaptureResultFn),
            notify: Some(fw_notify as NotifyFn),
        }));

        let status = initialize_device(dev, framework);
        assert_eq!(status, 0);

        let seen = VENDOR_INIT_SAW.load(Ordering::SeqCst) as *const Camera3CallbackOps;
        assert!(!seen.is_null());
        assert_ne!(seen, framework);

        // The wrapped table carries our hook and the framework's notify.
        // SAFETY: the wrapped table is leaked, hence still alive.
        let wrapped = unsafe { &*seen };
        assert_eq!(
            wrapped.process_capture_result,
            Some(process_capture_result as ProcessCaptureResultFn)
        );
        assert_eq!(wrapped.notify, Some(fw_notify as NotifyFn));
        assert_eq!(registry::forward_target(seen), Some(framework));
        assert_eq!(registry::framework_callbacks(dev), Some(framework));
    }

    // ── Capture-result forwarding ──────────────────────────────────────

    static FORWARD_RESULT: AtomicUsize = AtomicUsize::new(0);
    static FORWARD_OPS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn recording_process_result(
        ops: *const Camera3CallbackOps,
        result: *const Camera3CaptureResult,
    ) {
        FORWARD_OPS.store(ops as usize, Ordering::SeqCst);
        FORWARD_RESULT.store(result as usize, Ordering::SeqCst);
    }

    #[test]
    fn capture_result_is_forwarded_pointer_equal() {
        let framework: *const Camera3CallbackOps = Box::leak(Box::new(Camera3CallbackOps {
            process_capture_result: Some(recording_process_result as ProcessCaptureResultFn),
            notify: None,
        }));
        let dev = leaked_device(ptr::null_mut()) as *const Camera3Device;
        let wrapped = wrap_callbacks(dev, framework);

        // No injection flag on a development host: the result must reach
        // the framework untouched, first argument restored to its table.
        let result: Camera3CaptureResult = unsafe { mem::zeroed() };
        process_capture_result(wrapped, &result);

        assert_eq!(FORWARD_RESULT.load(Ordering::SeqCst), &result as *const _ as usize);
        assert_eq!(FORWARD_OPS.load(Ordering::SeqCst), framework as usize);
    }

    #[test]
    fn unknown_callback_table_drops_the_result_quietly() {
        let stray: *const Camera3CallbackOps = Box::leak(Box::new(Camera3CallbackOps {
            process_capture_result: None,
            notify: None,
        }));
        let result: Camera3CaptureResult = unsafe { mem::zeroed() };
        // Must not crash and must not forward anywhere.
        process_capture_result(stray, &result);
    }
}
