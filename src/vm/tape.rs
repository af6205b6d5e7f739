use std::process;
use std::ptr;
use std::slice;

/// The cell array the generated code runs against.
///
/// The writable region is flanked by one `PROT_NONE` guard page on each
/// side, so generated code needs no per-operation bounds checks: crossing
/// either bound faults into the signal handler, which grows the tape on the
/// right and reports a fatal error (via the debugger) on the left. The tape
/// is grown on demand and never shrunk.
#[derive(Debug)]
pub struct Tape {
    base: *mut u8,
    size: usize,
    page_size: usize,
    /// Maximum tape size in bytes; 0 means unlimited.
    limit: usize,
}

impl Tape {
    pub fn new(page_size: usize) -> Self {
        let mut tape = Self {
            base: ptr::null_mut(),
            size: 0,
            page_size,
            limit: 0,
        };
        tape.alloc(0);
        tape
    }

    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base, self.size) }
    }

    /// Cap the tape size. Exits with a diagnostic when the limit cannot hold
    /// even a single page.
    pub fn set_limit(&mut self, bytes: usize) {
        if bytes < self.page_size {
            eprintln!("memory limit too small (minimum: {} bytes)", self.page_size);
            process::exit(1);
        }
        self.limit = bytes;
    }

    /// Grow the tape, preserving `head`'s logical offset. The region may
    /// move, which is why the new head pointer is written back.
    ///
    /// The growth step scales with the current size: a quarter of the
    /// current page count, and at least one page.
    pub fn grow(&mut self, head: &mut *mut u8) {
        let head_pos = (*head as usize).wrapping_sub(self.base as usize);
        debug_assert!(self.size >= self.page_size);
        let extra_pages = (self.size / self.page_size + 3) / 4;
        self.alloc(self.size + extra_pages * self.page_size);
        *head = unsafe { self.base.add(head_pos) };
    }

    /// Map (or remap) the tape at `size` bytes, rounded up to whole pages,
    /// between fresh guard pages. Allocation failures and limit violations
    /// are fatal: this also runs under the fault handler, where there is no
    /// one to report an error to.
    fn alloc(&mut self, size: usize) {
        let size = if size == 0 {
            self.page_size
        } else {
            size.next_multiple_of(self.page_size)
        };
        if self.limit > 0 && size > self.limit {
            eprintln!("memory limit exceeded");
            process::exit(1);
        }

        let whole = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size + 2 * self.page_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if whole == libc::MAP_FAILED {
            eprintln!("out of memory");
            process::exit(1);
        }
        let start = unsafe { whole.cast::<u8>().add(self.page_size) };

        if self.base.is_null() {
            let mapped = unsafe {
                libc::mmap(
                    start.cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            assert_eq!(mapped.cast::<u8>(), start, "fixed tape mapping moved");
        } else {
            // Drop the old guard pages, then move the populated region into
            // the hole between the new ones.
            unsafe {
                let result = libc::munmap(
                    self.base.sub(self.page_size).cast::<libc::c_void>(),
                    self.page_size,
                );
                assert_eq!(result, 0);
                let result = libc::munmap(self.base.add(self.size).cast::<libc::c_void>(), self.page_size);
                assert_eq!(result, 0);
            }
            let moved = unsafe {
                libc::mremap(
                    self.base.cast::<libc::c_void>(),
                    self.size,
                    size,
                    libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                    start.cast::<libc::c_void>(),
                )
            };
            if moved == libc::MAP_FAILED {
                eprintln!("out of memory");
                process::exit(1);
            }
            assert_eq!(moved.cast::<u8>(), start, "fixed tape remapping moved");
        }

        self.base = start;
        self.size = size;
    }
}

impl Drop for Tape {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let result = unsafe {
                libc::munmap(
                    self.base.sub(self.page_size).cast::<libc::c_void>(),
                    self.size + 2 * self.page_size,
                )
            };
            debug_assert_eq!(result, 0, "failed to unmap tape");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_size() -> usize {
        usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap()
    }

    #[test]
    fn starts_at_one_zeroed_page() {
        let tape = Tape::new(page_size());
        assert_eq!(tape.size(), page_size());
        assert!(tape.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn growth_preserves_contents_and_head_offset() {
        let mut tape = Tape::new(page_size());
        let pattern: Vec<u8> = (0..=255).cycle().take(tape.size()).collect();
        unsafe {
            ptr::copy_nonoverlapping(pattern.as_ptr(), tape.base(), pattern.len());
        }

        let mut head = unsafe { tape.base().add(17) };
        let old_size = tape.size();
        tape.grow(&mut head);

        assert!(tape.size() > old_size);
        assert_eq!(unsafe { head.offset_from(tape.base()) }, 17);
        assert_eq!(&tape.bytes()[..old_size], &pattern[..]);
        // Newly grown cells start out zero.
        assert!(tape.bytes()[old_size..].iter().all(|&b| b == 0));
    }

    #[test]
    fn growth_step_is_a_quarter_of_the_size() {
        let page = page_size();
        let mut tape = Tape::new(page);
        let mut head = tape.base();

        // One page grows by the one-page minimum step.
        tape.grow(&mut head);
        assert_eq!(tape.size(), 2 * page);

        // Eight pages grow by two.
        while tape.size() < 8 * page {
            tape.grow(&mut head);
        }
        let size = tape.size();
        tape.grow(&mut head);
        assert_eq!(tape.size(), size + (size / page + 3) / 4 * page);
    }
}
