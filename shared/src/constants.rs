pub const FRAME_WIDTH: u32 = 1920;
pub const FRAME_HEIGHT: u32 = 1080;

/// Fixed slot count of the frame ring. Two slots of headroom between the
/// producer's staging slot and the reader's current slot.
pub const NUM_FRAMES: u32 = 3;

/// Reserved header page at the start of the shared segment; frame slots
/// begin exactly at this offset.
pub const HEADER_BYTES: usize = 4096;

/// Byte size of one NV21 frame: a full-resolution Y plane followed by an
/// interleaved VU plane at quarter resolution.
pub const fn nv21_frame_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 / 2
}

pub const FRAME_SIZE: usize = nv21_frame_size(FRAME_WIDTH, FRAME_HEIGHT);

/// Total size of the shared segment: header page plus the slot array.
pub const fn ring_total_size(num_frames: u32, frame_size: usize) -> usize {
    HEADER_BYTES + num_frames as usize * frame_size
}

/// Name given to the anonymous shared-memory object backing the ring.
pub const SHM_NAME: &str = "vcam_shared_buffer";

/// Rendezvous socket where the feeder hands out the ring descriptor.
pub const CONTROL_SOCKET_PATH: &str = "/dev/socket/vcam_ipc";
/// Used when the primary path is not bindable (non-root feeder).
pub const CONTROL_SOCKET_FALLBACK_PATH: &str = "/data/local/tmp/vcam_ipc";

/// TCP port the desktop streamer pushes raw NV21 frames to.
pub const SOURCE_TCP_PORT: u16 = 5555;

/// Injection is enabled by the mere presence of this file.
pub const INJECT_FLAG_PATH: &str = "/data/local/tmp/vcam_enable";

/// Where the renamed vendor camera module lives.
pub const VENDOR_MODULE_PATH: &str = "/vendor/lib64/hw/camera.qcom.orig.so";

/// Consumers treat the ring as dead when the producer has not published a
/// frame for this long, and let vendor output pass through untouched.
pub const STALE_AFTER_MS: i64 = 1000;

/// Row pitch of the device-allocated output buffers.
pub const DEFAULT_DEVICE_STRIDE: u32 = FRAME_WIDTH;

/// Ashmem device node used to create the ring segment on device builds.
pub const ASHMEM_DEVICE: &str = "/dev/ashmem";
pub const ASHMEM_NAME_LEN: usize = 256;

const ASHMEM_IOC: u32 = 0x77;
const IOC_WRITE: u32 = 1;

/// _IOW(type, nr, size)
/// = (dir << 30) | (size << 16) | (type << 8) | nr
macro_rules! iow {
    ($ty:expr, $nr:expr, $size:expr) => {
        (IOC_WRITE << 30) | (($size as u32) << 16) | ($ty << 8) | $nr
    };
}

/// ASHMEM_SET_NAME: fixed 256-byte name buffer.
pub const ASHMEM_SET_NAME: u32 = iow!(ASHMEM_IOC, 1, ASHMEM_NAME_LEN);

/// ASHMEM_SET_SIZE: region size, must be set before the first mmap.
pub const ASHMEM_SET_SIZE: u32 = iow!(ASHMEM_IOC, 3, size_of::<usize>());

/// ASHMEM_SET_PROT_MASK: caps the protection later mmaps may request.
pub const ASHMEM_SET_PROT_MASK: u32 = iow!(ASHMEM_IOC, 5, size_of::<libc::c_ulong>());
