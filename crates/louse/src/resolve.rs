//! Translates captured return addresses into source-qualified text by
//! shelling out to addr2line, one address at a time, with per-address
//! memoization. Resolution only ever runs on diagnostic and teardown
//! paths, never on the allocation fast path.

use crate::dispatch;
use crate::printer::FixedWriter;
use core::ffi::c_void;
use core::fmt::Write as _;
use core::ptr;
use hashbrown::HashMap;
use libc::{c_char, c_int};

const PATH_CAPACITY: usize = 512;
const OUTPUT_CAPACITY: usize = 1024;

/// Resolution stops early once the output buffer has less headroom than
/// one addr2line response.
const BUFFER_HEADROOM: usize = 1024;

pub struct StackResolver {
    progname: [u8; PATH_CAPACITY],
    progname_len: usize,
    directory: [u8; PATH_CAPACITY],
    directory_len: usize,
    /// Formatted line per address; empty string for elided frames.
    cache: HashMap<usize, String>,
}

impl StackResolver {
    pub fn new() -> Self {
        let mut resolver = StackResolver {
            progname: [0; PATH_CAPACITY],
            progname_len: 0,
            directory: [0; PATH_CAPACITY],
            directory_len: 0,
            cache: HashMap::new(),
        };
        unsafe {
            resolver.determine_progname();
            resolver.determine_directory();
        }
        resolver
    }

    /// Append the resolved text for a null-terminated address array to
    /// `out`, at most `max_frames` frames, trimming the final newline.
    /// Returns true iff anything was appended.
    ///
    /// # Safety
    /// `stack` must be null or point to a null-terminated array of return
    /// addresses.
    pub unsafe fn resolve<const N: usize>(
        &mut self,
        max_frames: usize,
        colors: bool,
        out: &mut FixedWriter<N>,
        stack: *const *mut c_void,
    ) -> bool {
        if stack.is_null() {
            return false;
        }

        let start = out.len();
        let mut cursor = stack;
        let mut frames = 0;
        while !(*cursor).is_null() {
            if frames >= max_frames {
                break;
            }
            frames += 1;
            let pc = *cursor as usize;

            match self.cache.get(&pc) {
                Some(line) => {
                    let _ = out.write_str(line);
                }
                None => {
                    let line = self.resolve_uncached(pc, colors);
                    let _ = out.write_str(&line);
                    // On reservation failure the line is reclaimed and the
                    // next occurrence resolves again.
                    if self.cache.try_reserve(1).is_ok() {
                        self.cache.insert(pc, line);
                    }
                }
            }

            if out.remaining() < BUFFER_HEADROOM {
                break;
            }
            cursor = cursor.add(1);
        }

        out.trim_trailing_newline();
        out.len() > start
    }

    /// Resolve one address to its formatted line; empty for frames that
    /// are elided or could not be resolved.
    unsafe fn resolve_uncached(&self, pc: usize, colors: bool) -> String {
        let mut info: libc::Dl_info = core::mem::zeroed();
        let known = libc::dladdr(pc as *const c_void, &mut info) != 0;

        // Addresses in the main executable (or with no usable mapping) are
        // passed raw; shared-object addresses are rebased onto the module.
        let (module, address) = if !known
            || info.dli_fname.is_null()
            || *info.dli_fname != b'/' as c_char
            || libc::strcmp(info.dli_fname, self.progname.as_ptr() as *const c_char) == 0
        {
            (self.progname.as_ptr() as *const c_char, pc)
        } else {
            (info.dli_fname, pc.wrapping_sub(info.dli_fbase as usize))
        };

        let mut output = [0u8; OUTPUT_CAPACITY];
        match self.run_addr2line(module, address, &mut output) {
            Some(length) => self.format_frame(&output[..length], colors),
            None => String::new(),
        }
    }

    /// Spawn /usr/bin/addr2line for one address with stdout and stderr
    /// piped back. The child gets an emptied environment so the preloaded
    /// engine cannot recurse into it.
    unsafe fn run_addr2line(
        &self,
        module: *const c_char,
        address: usize,
        output: &mut [u8; OUTPUT_CAPACITY],
    ) -> Option<usize> {
        let mut hex = FixedWriter::<24>::new();
        let _ = write!(hex, "0x{:x}", address);
        let mut hex_arg = [0u8; 25];
        hex_arg[..hex.len()].copy_from_slice(hex.as_str().as_bytes());

        let mut pipefd = [0 as c_int; 2];
        if libc::pipe(pipefd.as_mut_ptr()) != 0 {
            return None;
        }

        let pid = libc::fork();
        if pid < 0 {
            libc::close(pipefd[0]);
            libc::close(pipefd[1]);
            return None;
        }

        if pid == 0 {
            libc::close(pipefd[0]);
            libc::dup2(pipefd[1], libc::STDOUT_FILENO);
            libc::dup2(pipefd[1], libc::STDERR_FILENO);

            let argv: [*const c_char; 7] = [
                c"addr2line".as_ptr(),
                hex_arg.as_ptr() as *const c_char,
                c"-C".as_ptr(),
                c"-f".as_ptr(),
                c"-e".as_ptr(),
                module,
                ptr::null(),
            ];
            let envp: [*const c_char; 1] = [ptr::null()];
            libc::execve(c"/usr/bin/addr2line".as_ptr(), argv.as_ptr(), envp.as_ptr());

            libc::close(pipefd[1]);
            dispatch::exit_immediately(1);
        }

        libc::close(pipefd[1]);
        let length = libc::read(
            pipefd[0],
            output.as_mut_ptr() as *mut c_void,
            OUTPUT_CAPACITY - 1,
        );
        libc::close(pipefd[0]);

        if length <= 0 {
            libc::waitpid(pid, ptr::null_mut(), 0);
            return None;
        }
        if libc::waitpid(pid, ptr::null_mut(), 0) != pid {
            return None;
        }
        Some(length as usize)
    }

    /// Turn one addr2line response ("function\nfile:line") into a report
    /// line. Frames inside the engine and below main are elided.
    fn format_frame(&self, raw: &[u8], colors: bool) -> String {
        let text = String::from_utf8_lossy(raw);
        if text.contains("louse::") || text.contains("__libc_start_main") {
            return String::new();
        }

        let mut line = String::with_capacity(raw.len() + 16);
        line.push_str("  # ");
        match text.split_once('\n') {
            Some((function, location)) => {
                line.push_str(function);
                line.push_str(if colors { " (\x1b[33m" } else { " (" });
                let location = location.strip_suffix('\n').unwrap_or(location);
                let location = match core::str::from_utf8(self.directory()) {
                    Ok(directory) => location.strip_prefix(directory).unwrap_or(location),
                    Err(_) => location,
                };
                line.push_str(location);
                line.push_str(if colors { "\x1b[0m)\n" } else { ")\n" });
            }
            None => {
                line.push_str(text.trim_end_matches('\n'));
                line.push('\n');
            }
        }
        line
    }

    fn directory(&self) -> &[u8] {
        &self.directory[..self.directory_len]
    }

    unsafe fn determine_progname(&mut self) {
        let length = libc::readlink(
            c"/proc/self/exe".as_ptr(),
            self.progname.as_mut_ptr() as *mut c_char,
            PATH_CAPACITY - 1,
        );
        self.progname_len = if length < 0 { 0 } else { length as usize };
        self.progname[self.progname_len] = 0;
    }

    unsafe fn determine_directory(&mut self) {
        let mut length = 0;
        if !libc::getcwd(self.directory.as_mut_ptr() as *mut c_char, PATH_CAPACITY - 2).is_null()
        {
            length = libc::strlen(self.directory.as_ptr() as *const c_char);
        }
        self.directory[length] = b'/';
        self.directory[length + 1] = 0;
        self.directory_len = length + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_frames_are_elided() {
        let resolver = StackResolver::new();
        let raw = b"louse::tracker::allocate\n/src/tracker.rs:42\n";
        assert_eq!(resolver.format_frame(raw, false), "");
        let raw = b"__libc_start_main\n??:0\n";
        assert_eq!(resolver.format_frame(raw, false), "");
    }

    #[test]
    fn frames_format_with_location() {
        let resolver = StackResolver::new();
        let raw = b"do_work\n/src/worker.c:10\n";
        assert_eq!(
            resolver.format_frame(raw, false),
            "  # do_work (/src/worker.c:10)\n"
        );
    }

    #[test]
    fn unstructured_output_passes_through() {
        let resolver = StackResolver::new();
        let raw = b"?? at 0x1234";
        assert_eq!(resolver.format_frame(raw, false), "  # ?? at 0x1234\n");
    }

    #[test]
    fn working_directory_prefix_is_stripped() {
        let mut resolver = StackResolver::new();
        let prefix = b"/home/user/project/";
        resolver.directory[..prefix.len()].copy_from_slice(prefix);
        resolver.directory_len = prefix.len();
        let raw = b"do_work\n/home/user/project/src/worker.c:10\n";
        assert_eq!(
            resolver.format_frame(raw, false),
            "  # do_work (src/worker.c:10)\n"
        );
    }
}
