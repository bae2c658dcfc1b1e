//! Ring-buffer logging for constrained nodes.
//!
//! Protocol events are appended to a fixed ring behind a spin lock; a host
//! debugger or the test harness drains the buffer between rounds. The ring
//! overwrites its oldest bytes when full and never allocates on the log
//! path.

use core::fmt::{self, Write};

use spin::Mutex;

const LOG_BUF_SIZE: usize = 8 * 1024;

struct Ring {
    buf: [u8; LOG_BUF_SIZE],
    /// Total bytes ever written; the ring position is `written % LOG_BUF_SIZE`.
    written: usize,
}

static RING: Mutex<Ring> = Mutex::new(Ring { buf: [0; LOG_BUF_SIZE], written: 0 });

/// Writer implementing `core::fmt::Write` on top of the ring.
pub struct RingWriter;

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut guard = RING.lock();
        let ring = &mut *guard;
        for &b in s.as_bytes() {
            ring.buf[ring.written % LOG_BUF_SIZE] = b;
            ring.written = ring.written.wrapping_add(1);
        }
        Ok(())
    }
}

/// Append one formatted line to the log ring.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingWriter, format_args!($($arg)*));
        let _ = $crate::log::RingWriter.write_str("\n");
    }};
}

/// Copy out the current contents in chronological order.
pub fn snapshot() -> alloc::vec::Vec<u8> {
    let guard = RING.lock();
    if guard.written <= LOG_BUF_SIZE {
        guard.buf[..guard.written].to_vec()
    } else {
        let pos = guard.written % LOG_BUF_SIZE;
        let mut out = alloc::vec::Vec::with_capacity(LOG_BUF_SIZE);
        out.extend_from_slice(&guard.buf[pos..]);
        out.extend_from_slice(&guard.buf[..pos]);
        out
    }
}
