//! Guard-paged stack memory.
//!
//! Each fiber stack is an anonymous private mapping with a `PROT_NONE`
//! guard page at the bottom, so overflow faults instead of silently
//! corrupting the adjacent allocation. Sizes are rounded up to whole
//! pages; the guard page is in addition to the requested size.

// ── Windows virtual memory API ──────────────────────────────────────────

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn VirtualAlloc(
        addr: *mut std::ffi::c_void,
        size: usize,
        alloc_type: u32,
        protect: u32,
    ) -> *mut std::ffi::c_void;
    fn VirtualProtect(
        addr: *mut std::ffi::c_void,
        size: usize,
        new_protect: u32,
        old_protect: *mut u32,
    ) -> i32;
    fn VirtualFree(addr: *mut std::ffi::c_void, size: usize, free_type: u32) -> i32;
}

#[cfg(windows)]
const MEM_COMMIT: u32 = 0x1000;
#[cfg(windows)]
const MEM_RESERVE: u32 = 0x2000;
#[cfg(windows)]
const MEM_RELEASE: u32 = 0x8000;
#[cfg(windows)]
const PAGE_READWRITE: u32 = 0x04;
#[cfg(windows)]
const PAGE_NOACCESS: u32 = 0x01;

// ── Page size ───────────────────────────────────────────────────────────

/// Host page size in bytes.
#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

/// Host page size in bytes.
#[cfg(windows)]
fn page_size() -> usize {
    4096
}

// ── StackMemory ─────────────────────────────────────────────────────────

/// A fiber stack: `usable` bytes of read/write memory above one
/// inaccessible guard page.
pub struct StackMemory {
    /// Base of the allocation (the guard page starts here).
    base: *mut u8,
    /// Total allocation size (guard + usable).
    alloc_size: usize,
    /// Requested-and-rounded usable size.
    usable: usize,
}

// SAFETY: The mapping is exclusively owned by this `StackMemory`; only
// one thread touches it at a time, so transferring ownership across
// threads is sound.
unsafe impl Send for StackMemory {}

impl StackMemory {
    /// Map a stack with at least `stack_size` usable bytes.
    ///
    /// Returns `None` when the mapping or the guard-page protection
    /// fails; nothing is leaked on failure.
    #[must_use]
    pub fn new(stack_size: usize) -> Option<Self> {
        let page = page_size();
        let usable = stack_size.max(page).div_ceil(page) * page;
        let alloc_size = usable + page;

        #[cfg(unix)]
        let base_ptr = {
            // SAFETY: An anonymous private read/write mapping with fd -1
            // and offset 0; no file backing is involved.
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    alloc_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if base == libc::MAP_FAILED {
                return None;
            }

            // SAFETY: `base` was returned by mmap and `page` bytes lie
            // within the allocation. The bottom page becomes inaccessible
            // so overflow traps.
            let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
            if ret != 0 {
                // SAFETY: base/alloc_size match the mmap above.
                unsafe { libc::munmap(base, alloc_size) };
                return None;
            }

            base.cast::<u8>()
        };

        #[cfg(windows)]
        let base_ptr = {
            // SAFETY: MEM_COMMIT | MEM_RESERVE allocates and commits a
            // fresh region of virtual memory.
            let base = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    alloc_size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };

            if base.is_null() {
                return None;
            }

            let mut old_protect: u32 = 0;
            // SAFETY: base is a live allocation and `page` bytes lie
            // within it.
            let ret = unsafe { VirtualProtect(base, page, PAGE_NOACCESS, &mut old_protect) };
            if ret == 0 {
                // SAFETY: base was allocated by VirtualAlloc above.
                unsafe { VirtualFree(base, 0, MEM_RELEASE) };
                return None;
            }

            base.cast::<u8>()
        };

        Some(StackMemory {
            base: base_ptr,
            alloc_size,
            usable,
        })
    }

    /// One past the highest usable byte (stacks grow downward on x86-64
    /// and aarch64).
    #[must_use]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: `base + alloc_size` is one past the allocation, valid
        // for pointer arithmetic and never dereferenced as-is.
        unsafe { self.base.add(self.alloc_size) }
    }

    /// Usable bytes above the guard page.
    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.usable
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: base/alloc_size describe a live mapping that has
            // not been unmapped yet.
            unsafe {
                libc::munmap(self.base.cast::<libc::c_void>(), self.alloc_size);
            }
        }
        #[cfg(windows)]
        {
            // SAFETY: base was allocated by VirtualAlloc with
            // MEM_COMMIT | MEM_RESERVE.
            unsafe {
                VirtualFree(self.base.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

impl std::fmt::Debug for StackMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMemory")
            .field("base", &self.base)
            .field("alloc_size", &self.alloc_size)
            .field("usable", &self.usable)
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_pages() {
        let page = page_size();
        let stack = StackMemory::new(1).expect("mapping failed");
        assert_eq!(stack.usable_size(), page);
        assert_eq!(stack.alloc_size, 2 * page);
    }

    #[test]
    fn top_is_one_past_the_allocation() {
        let stack = StackMemory::new(64 * 1024).expect("mapping failed");
        assert_eq!(stack.top() as usize, stack.base as usize + stack.alloc_size);
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = StackMemory::new(16 * 1024).expect("mapping failed");
        // SAFETY: top - 8 lies inside the usable region, above the guard.
        unsafe {
            let slot = stack.top().sub(8).cast::<u64>();
            slot.write(0xdead_beef);
            assert_eq!(slot.read(), 0xdead_beef);
        }
    }

    #[test]
    fn exact_multiple_is_not_padded() {
        let page = page_size();
        let stack = StackMemory::new(4 * page).expect("mapping failed");
        assert_eq!(stack.usable_size(), 4 * page);
    }
}
