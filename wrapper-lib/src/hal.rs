//! C ABI of the platform camera HAL, declared by hand.
//!
//! These records must stay bit-compatible with the structures the loader,
//! the framework, and the vendor module agree on. All of them are plain
//! function-pointer tables and POD fields; `#[repr(C)]` plus the layout
//! tests below lock the shape down. The vendor allocates the device and
//! its tables; we only ever allocate the replacement copies and never free
//! anything on either side.

use core::ffi::{CStr, c_char, c_int, c_void};
use std::os::fd::RawFd;

pub const HARDWARE_MODULE_TAG: u32 = 0x4857_4D54; // "HWMT"
pub const CAMERA_MODULE_API_VERSION_2_4: u16 = 0x0204;
pub const HARDWARE_HAL_API_VERSION: u16 = 0x0001;
pub const CAMERA_HARDWARE_MODULE_ID: &CStr = c"camera";

pub const CAMERA3_BUFFER_STATUS_OK: c_int = 0;

/// Stub result for module calls that cannot reach a vendor device.
pub const ERR_NO_DEVICE: c_int = -libc::ENODEV;

pub type OpenFn =
    unsafe extern "C" fn(*const HwModule, *const c_char, *mut *mut HwDevice) -> c_int;
pub type InitializeFn =
    unsafe extern "C" fn(*const Camera3Device, *const Camera3CallbackOps) -> c_int;
pub type ProcessCaptureResultFn =
    unsafe extern "C" fn(*const Camera3CallbackOps, *const Camera3CaptureResult);
pub type NotifyFn = unsafe extern "C" fn(*const Camera3CallbackOps, *const c_void);

#[repr(C)]
pub struct HwModuleMethods {
    pub open: Option<OpenFn>,
}

#[repr(C)]
pub struct HwModule {
    pub tag: u32,
    pub module_api_version: u16,
    pub hal_api_version: u16,
    pub id: *const c_char,
    pub name: *const c_char,
    pub author: *const c_char,
    /// Non-const in the platform header; only ever read here.
    pub methods: *mut HwModuleMethods,
    pub dso: *mut c_void,
    pub reserved: [u32; 25],
}

#[repr(C)]
pub struct HwDevice {
    pub tag: u32,
    pub version: u32,
    pub module: *mut HwModule,
    pub reserved: [u32; 12],
    pub close: Option<unsafe extern "C" fn(*mut HwDevice) -> c_int>,
}

#[repr(C)]
pub struct CameraInfo {
    pub facing: c_int,
    pub orientation: c_int,
    pub device_version: u32,
    pub static_camera_characteristics: *const c_void,
    pub resource_cost: c_int,
    pub conflicting_devices: *const c_void,
    pub conflicting_devices_length: usize,
}

/// Top-level camera module table, the shape behind the `HMI` symbol on
/// both sides of the interposition.
#[repr(C)]
pub struct CameraModule {
    pub common: HwModule,
    pub get_number_of_cameras: Option<unsafe extern "C" fn() -> c_int>,
    pub get_camera_info: Option<unsafe extern "C" fn(c_int, *mut CameraInfo) -> c_int>,
    pub set_callbacks: Option<unsafe extern "C" fn(*const c_void) -> c_int>,
    pub get_vendor_tag_ops: Option<unsafe extern "C" fn(*mut c_void)>,
    pub open_legacy:
        Option<unsafe extern "C" fn(*const HwModule, *const c_char, u32, *mut *mut HwDevice) -> c_int>,
    pub set_torch_mode: Option<unsafe extern "C" fn(*const c_char, bool) -> c_int>,
    pub init: Option<unsafe extern "C" fn() -> c_int>,
    pub get_physical_camera_info: Option<unsafe extern "C" fn(c_int, *mut *mut c_void) -> c_int>,
}

/// Newtype that lets a [`CameraModule`] live in an exported static. The
/// table is written once at compile time and only ever read afterwards.
#[repr(transparent)]
pub struct ModuleExport(pub CameraModule);

// SAFETY: the wrapped table is immutable; the raw pointers inside refer to
// 'static string literals and a 'static methods table.
unsafe impl Sync for ModuleExport {}

#[repr(C)]
pub struct Camera3Device {
    pub common: HwDevice,
    pub ops: *mut Camera3DeviceOps,
    pub priv_: *mut c_void,
}

/// Per-device operation table. `Copy` because interposition bit-copies the
/// vendor's table before patching one slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Camera3DeviceOps {
    pub initialize: Option<InitializeFn>,
    pub configure_streams: Option<unsafe extern "C" fn(*const Camera3Device, *mut c_void) -> c_int>,
    pub register_stream_buffers:
        Option<unsafe extern "C" fn(*const Camera3Device, *const c_void) -> c_int>,
    pub construct_default_request_settings:
        Option<unsafe extern "C" fn(*const Camera3Device, c_int) -> *const c_void>,
    pub process_capture_request:
        Option<unsafe extern "C" fn(*const Camera3Device, *mut Camera3CaptureRequest) -> c_int>,
    pub get_metadata_vendor_tag_ops:
        Option<unsafe extern "C" fn(*const Camera3Device, *mut c_void)>,
    pub dump: Option<unsafe extern "C" fn(*const Camera3Device, c_int)>,
    pub flush: Option<unsafe extern "C" fn(*const Camera3Device) -> c_int>,
    pub reserved: [*mut c_void; 8],
}

/// Callback table the framework hands to `initialize`. `Copy` for the same
/// bit-copy reason as the ops table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Camera3CallbackOps {
    pub process_capture_result: Option<ProcessCaptureResultFn>,
    pub notify: Option<NotifyFn>,
}

#[repr(C)]
pub struct Camera3StreamBuffer {
    pub stream: *mut c_void,
    pub buffer: *const BufferHandle,
    pub status: c_int,
    pub acquire_fence: c_int,
    pub release_fence: c_int,
}

#[repr(C)]
pub struct Camera3CaptureResult {
    pub frame_number: u32,
    pub result: *const c_void,
    pub num_output_buffers: u32,
    pub output_buffers: *const Camera3StreamBuffer,
    pub input_buffer: *const c_void,
    pub partial_result: u32,
}

#[repr(C)]
pub struct Camera3CaptureRequest {
    pub frame_number: u32,
    pub settings: *const c_void,
    pub input_buffer: *mut c_void,
    pub num_output_buffers: u32,
    pub output_buffers: *mut Camera3StreamBuffer,
}

/// Gralloc-style handle: a fixed head followed by `num_fds` descriptors and
/// `num_ints` opaque words.
#[repr(C)]
pub struct NativeHandle {
    pub version: c_int,
    pub num_fds: c_int,
    pub num_ints: c_int,
    pub data: [c_int; 0],
}

pub type BufferHandle = *const NativeHandle;

impl NativeHandle {
    /// The first descriptor, which refers to the pixel memory.
    ///
    /// # Safety
    /// `self` must point into a real handle whose `data` array holds at
    /// least `num_fds` entries.
    pub unsafe fn first_fd(&self) -> Option<RawFd> {
        if self.num_fds <= 0 {
            return None;
        }
        // SAFETY: data[0] exists per the caller's contract.
        Some(unsafe { *self.data.as_ptr() })
    }
}
