use std::sync::atomic::{AtomicI32, Ordering};

// Process-wide debug level. No init/teardown; read on every logging decision.
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);

pub fn set_debug_level(level: i32) {
    DEBUG_LEVEL.store(level, Ordering::Relaxed);
}

pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Hex-dumps a wire buffer at debug level >= 2. Long buffers are truncated;
/// protocol bugs show up in the first lines anyway.
pub(crate) fn dump_buffer(label: &str, data: &[u8]) {
    if debug_level() < 2 {
        return;
    }
    let shown = &data[..data.len().min(256)];
    for (i, chunk) in shown.chunks(16).enumerate() {
        log::trace!("{}: {:04x}  {}", label, i * 16, hex::encode(chunk));
    }
    if data.len() > shown.len() {
        log::trace!("{}: ... {} bytes total", label, data.len());
    }
}
