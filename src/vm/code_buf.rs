use std::ptr;
use std::slice;

/// A growable buffer of executable memory.
///
/// Backed by a `PROT_READ|PROT_WRITE|PROT_EXEC` mapping that is reallocated
/// with `mremap` as it fills up. The mapping may move when it grows, so all
/// emitted code must be position-independent.
#[derive(Debug)]
pub struct CodeBuf {
    data: *mut u8,
    size: usize,
    capacity: usize,
    page_size: usize,
}

impl CodeBuf {
    pub const fn new(page_size: usize) -> Self {
        Self {
            data: ptr::null_mut(),
            size: 0,
            capacity: 0,
            page_size,
        }
    }

    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub const fn base(&self) -> *const u8 {
        self.data
    }

    /// Byte offset of `addr` within the buffer, if it points into it.
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let base = self.data as usize;
        if addr >= base && addr < base + self.size {
            Some(addr - base)
        } else {
            None
        }
    }

    pub fn bytes(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.data, self.size) }
    }

    /// Discard the buffer contents before regenerating a program. The
    /// mapping itself is kept for reuse.
    pub const fn truncate(&mut self) {
        self.size = 0;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let new_size = self.size + bytes.len();
        self.reserve(new_size);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(self.size), bytes.len());
        }
        self.size = new_size;
    }

    /// Splice `bytes` in at `pos`, shifting everything after it. Used to
    /// place a loop's entry test once the body has been measured.
    pub fn insert(&mut self, bytes: &[u8], pos: usize) {
        assert!(pos <= self.size, "insertion point outside the buffer");
        let tail = self.size - pos;
        let new_size = self.size + bytes.len();
        self.reserve(new_size);
        unsafe {
            ptr::copy(self.data.add(pos), self.data.add(pos + bytes.len()), tail);
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(pos), bytes.len());
        }
        self.size = new_size;
    }

    fn reserve(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity {
            return;
        }
        let new_capacity = min_capacity.next_multiple_of(self.page_size);
        let new_data = if self.capacity == 0 {
            unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    new_capacity,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            }
        } else {
            unsafe {
                libc::mremap(
                    self.data.cast::<libc::c_void>(),
                    self.capacity,
                    new_capacity,
                    libc::MREMAP_MAYMOVE,
                )
            }
        };
        assert!(
            new_data != libc::MAP_FAILED,
            "failed to map executable memory: {}",
            std::io::Error::last_os_error()
        );
        self.data = new_data.cast::<u8>();
        self.capacity = new_capacity;
    }
}

impl Drop for CodeBuf {
    fn drop(&mut self) {
        if self.capacity > 0 {
            let result = unsafe { libc::munmap(self.data.cast::<libc::c_void>(), self.capacity) };
            debug_assert_eq!(result, 0, "failed to unmap code buffer");
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
    fn append_and_insert() {
        let mut code = CodeBuf::new(page_size());
        code.append(&[1, 2, 3, 7, 8]);
        code.insert(&[4, 5, 6], 3);
        assert_eq!(code.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        code.insert(&[0], 0);
        assert_eq!(code.bytes(), &[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        code.insert(&[9], 9);
        assert_eq!(code.len(), 10);
    }

    #[test]
    fn grows_past_one_page() {
        let page = page_size();
        let mut code = CodeBuf::new(page);
        let chunk = vec![0xc3u8; 1000];
        for _ in 0..(2 * page / 1000 + 1) {
            code.append(&chunk);
        }
        assert!(code.len() > 2 * page);
        assert!(code.bytes().iter().all(|&b| b == 0xc3));
    }

    #[test]
    fn offset_lookup() {
        let mut code = CodeBuf::new(page_size());
        code.append(&[0; 16]);
        let base = code.base() as usize;
        assert_eq!(code.offset_of(base), Some(0));
        assert_eq!(code.offset_of(base + 15), Some(15));
        assert_eq!(code.offset_of(base + 16), None);
        assert_eq!(code.offset_of(base.wrapping_sub(1)), None);
    }
}
