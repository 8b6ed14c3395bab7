//! Drop-in camera HAL module that wraps the real vendor driver.
//!
//! The platform loader finds this library on the HAL search path and
//! resolves the `HMI` symbol exported from [`hooks`]. Every module-level
//! operation passes straight through to the vendor module (loaded lazily
//! from its renamed location); only the device `open` path installs hooks,
//! and only two vtable slots are ever replaced: the device's `initialize`
//! and the callback table's `process_capture_result`.
//!
//! The capture-result hook is where frames get swapped: when the injection
//! flag file exists and the feeder's ring is fresh, the pixel contents of
//! every completed output buffer are overwritten in place with the latest
//! ring frame before the result is forwarded to the framework. Request
//! handling, metadata, and the vendor's 3A state machines are untouched.

mod hal;
mod hooks;
mod inject;
mod registry;
mod rendezvous;
mod vendor;
