//! Timestamp source. The admission pipeline and reliability protocol time
//! everything in nanoseconds since an arbitrary monotonic epoch; this module
//! is the one place that talks to the system clock.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "wasm32")] {
        compile_error!("fastpass-shared does not support wasm32 targets; the admission pipeline and reliability protocol are native-only.");
    } else {
        mod native;
        pub use native::{TimeError, Timestamp};
    }
}
