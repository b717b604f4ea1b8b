use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicI32, Ordering};
use libc::c_int;

/// The diagnostics stream. Defaults to stderr; finalization may retarget it
/// to /dev/tty when stderr has already been closed during teardown.
static OUT_FD: AtomicI32 = AtomicI32::new(libc::STDERR_FILENO);

#[inline]
pub fn out_fd() -> c_int {
    OUT_FD.load(Ordering::Relaxed)
}

pub fn use_colors() -> bool {
    unsafe { libc::isatty(out_fd()) == 1 }
}

/// If the diagnostics fd has been closed under us, fall back to the
/// controlling terminal so the final report still lands somewhere.
pub fn ensure_writable_output() {
    unsafe {
        let fd = out_fd();
        if libc::fcntl(fd, libc::F_GETFL) != -1 {
            return;
        }
        let tty = libc::open(c"/dev/tty".as_ptr(), libc::O_WRONLY);
        if tty >= 0 {
            OUT_FD.store(tty, Ordering::Relaxed);
        }
    }
}

fn write_all(fd: c_int, bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        let written =
            unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if written <= 0 {
            return;
        }
        rest = &rest[written as usize..];
    }
}

pub fn emit_line_fmt(args: fmt::Arguments<'_>) {
    let mut buffer = FixedWriter::<2048>::new();
    let _ = buffer.write_fmt(args);
    let _ = buffer.write_str("\n");
    write_all(out_fd(), buffer.as_str().as_bytes());
}

pub fn emit_error_fmt(kind: &str, args: fmt::Arguments<'_>) {
    let mut buffer = FixedWriter::<2304>::new();
    if use_colors() {
        let _ = write!(buffer, "\n\x1b[31;1m{} error: ", kind);
        let _ = buffer.write_fmt(args);
        let _ = buffer.write_str("\x1b[0m\n");
    } else {
        let _ = write!(buffer, "\n{} error: ", kind);
        let _ = buffer.write_fmt(args);
        let _ = buffer.write_str("\n");
    }
    write_all(out_fd(), buffer.as_str().as_bytes());
}

/// Print a single error line and terminate the process.
pub fn fatal_abort(kind: &str, message: &str) -> ! {
    emit_error_fmt(kind, format_args!("{}", message));
    unsafe { libc::abort() }
}

macro_rules! emit_line {
    ($($arg:tt)*) => {
        $crate::printer::emit_line_fmt(core::format_args!($($arg)*))
    };
}

macro_rules! emit_error {
    ($kind:expr, $($arg:tt)*) => {
        $crate::printer::emit_error_fmt($kind, core::format_args!($($arg)*))
    };
}

pub(crate) use {emit_error, emit_line};

/// A fixed-capacity text buffer for core::fmt formatting without touching
/// the heap. Overlong writes are truncated at a char boundary.
pub struct FixedWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedWriter<N> {
    pub const fn new() -> Self {
        FixedWriter { buf: [0; N], len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        N - self.len
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled through write_str, so the contents are UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.buf[..self.len]) }
    }

    pub fn trim_trailing_newline(&mut self) {
        if self.len > 0 && self.buf[self.len - 1] == b'\n' {
            self.len -= 1;
        }
    }
}

impl<const N: usize> fmt::Write for FixedWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut take = s.len().min(N - self.len);
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take == s.len() {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}
