// This module owns the executable-memory lifecycle and is the crate's single unsafe boundary
// for running generated code. A WritableRegion is an anonymous private mapping created
// read+write (page-rounded, capped at MAX_CODE_SIZE); compiled bytes are copied into it and
// finalize() consumes it, flipping the pages to read+execute with mprotect and returning an
// ExecutableRegion. Because finalize takes the writable handle by value, no write path
// survives, so a region is never writable and executable at the same time and never becomes
// writable again. Each region is unmapped exactly once: by an explicit release(), which reports
// munmap failures, or by Drop. Executable pairs a sealed region with the Layout its code was
// compiled for and exposes invoke(), which checks the caller's slices against that layout and
// calls the entry point as extern "sysv64" fn(vm_state, registers, locals). The raw code
// pointer never leaves this module. Allocation and protection failures are reported as
// AllocationFailed / ProtectionChangeFailed and never retried.

//! Write-xor-execute memory for compiled programs.

use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use crate::core::{IndexSpace, Layout, VmError, VmResult};

/// Largest code buffer a single region may hold.
pub const MAX_CODE_SIZE: usize = 16 * 1024 * 1024;

/// Page protection of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// PROT_READ | PROT_WRITE, while code is copied in.
    ReadWrite,
    /// PROT_READ | PROT_EXEC, after finalize.
    ReadExecute,
}

impl Protection {
    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Protection::ReadExecute)
    }
}

/// A freshly mapped region that can be written but not executed.
pub struct WritableRegion {
    ptr: NonNull<u8>,
    mapped_len: usize,
    code_len: usize,
}

impl WritableRegion {
    /// Map at least `size` bytes read+write.
    pub fn allocate(size: usize) -> VmResult<Self> {
        if size == 0 {
            return Err(VmError::AllocationFailed {
                size,
                reason: "cannot map an empty code region".to_string(),
            });
        }
        if size > MAX_CODE_SIZE {
            return Err(VmError::AllocationFailed {
                size,
                reason: format!("exceeds the {MAX_CODE_SIZE}-byte code ceiling"),
            });
        }

        let mapped_len = sys::round_to_page(size);
        let ptr = sys::map_writable(mapped_len)?;
        log::trace!("mapped {mapped_len} writable bytes at {ptr:p}");
        Ok(Self {
            ptr,
            mapped_len,
            code_len: 0,
        })
    }

    /// Bytes available for code.
    pub fn capacity(&self) -> usize {
        self.mapped_len
    }

    pub fn protection(&self) -> Protection {
        Protection::ReadWrite
    }

    /// Copy `code` to the start of the region.
    pub fn write(&mut self, code: &[u8]) -> VmResult<()> {
        if code.len() > self.mapped_len {
            return Err(VmError::AllocationFailed {
                size: code.len(),
                reason: format!("region holds only {} bytes", self.mapped_len),
            });
        }
        // SAFETY: the mapping is live, writable and at least code.len() bytes;
        // `code` cannot overlap a mapping we own exclusively.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        self.code_len = code.len();
        Ok(())
    }

    /// Seal the region: drop write access and grant execute access.
    pub fn finalize(self) -> VmResult<ExecutableRegion> {
        // On failure `self` drops here and the mapping is released.
        sys::protect_read_execute(self.ptr, self.mapped_len)?;

        let this = ManuallyDrop::new(self);
        log::trace!("sealed {} bytes at {:p} read+execute", this.code_len, this.ptr);
        Ok(ExecutableRegion {
            ptr: this.ptr,
            mapped_len: this.mapped_len,
            code_len: this.code_len,
        })
    }
}

impl Drop for WritableRegion {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr, self.mapped_len) {
            log::warn!("{err}");
        }
    }
}

impl fmt::Debug for WritableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableRegion")
            .field("mapped_len", &self.mapped_len)
            .field("code_len", &self.code_len)
            .finish()
    }
}

/// A sealed region: readable and executable, never writable again.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    mapped_len: usize,
    code_len: usize,
}

impl ExecutableRegion {
    pub fn protection(&self) -> Protection {
        Protection::ReadExecute
    }

    /// Number of mapped bytes (whole pages).
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Number of code bytes written before sealing.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Start address, for diagnostics only.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The code as it sits in executable memory.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping stays readable until unmapped by release/drop,
        // which need `self` by value or unique access.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.code_len) }
    }

    /// Unmap the region now, reporting failure.
    pub fn release(self) -> VmResult<()> {
        let this = ManuallyDrop::new(self);
        sys::unmap(this.ptr, this.mapped_len)
    }

    fn entry(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr, self.mapped_len) {
            log::warn!("{err}");
        }
    }
}

impl fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("mapped_len", &self.mapped_len)
            .field("code_len", &self.code_len)
            .finish()
    }
}

/// A loaded program: sealed code plus the layout it expects.
#[derive(Debug)]
pub struct Executable {
    region: ExecutableRegion,
    layout: Layout,
}

impl Executable {
    pub(crate) fn new(region: ExecutableRegion, layout: Layout) -> Self {
        Self { region, layout }
    }

    pub fn region(&self) -> &ExecutableRegion {
        &self.region
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Run the compiled program against the given VM state.
    ///
    /// The slices must be at least as large as the layout the program was
    /// compiled for, since the generated code performs no bounds checks.
    pub fn invoke(&self, registers: &mut [u64], locals: &mut [u64]) -> VmResult<()> {
        check_capacity(IndexSpace::Register, self.layout.registers, registers.len())?;
        check_capacity(IndexSpace::Local, self.layout.locals, locals.len())?;

        // SAFETY: the region holds code produced by JitCompiler for
        // `self.layout`; it only touches registers[..layout.registers] and
        // locals[..layout.locals], both checked above, and returns with `ret`.
        unsafe {
            sys::call_entry(
                self.region.entry(),
                std::ptr::null_mut(),
                registers.as_mut_ptr(),
                locals.as_mut_ptr(),
            )
        }
    }

    /// Unmap the code now, reporting failure.
    pub fn release(self) -> VmResult<()> {
        self.region.release()
    }
}

fn check_capacity(space: IndexSpace, needed: usize, available: usize) -> VmResult<()> {
    if available < needed {
        return Err(VmError::IndexOutOfRange {
            space,
            index: (needed - 1) as u64,
            capacity: available,
        });
    }
    Ok(())
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod sys {
    use super::*;

    /// Signature of compiled programs: (vm_state, registers, locals).
    type EntryPoint = unsafe extern "sysv64" fn(*mut c_void, *mut u64, *mut u64);

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub(super) fn round_to_page(len: usize) -> usize {
        let page = page_size();
        len.div_ceil(page) * page
    }

    pub(super) fn map_writable(len: usize) -> VmResult<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::AllocationFailed {
                size: len,
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| VmError::AllocationFailed {
            size: len,
            reason: "mmap returned null".to_string(),
        })
    }

    pub(super) fn protect_read_execute(ptr: NonNull<u8>, len: usize) -> VmResult<()> {
        // SAFETY: `ptr..ptr+len` is a mapping owned by the caller.
        let rc = unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(VmError::ProtectionChangeFailed {
                reason: format!(
                    "mprotect(PROT_READ|PROT_EXEC) failed: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: NonNull<u8>, len: usize) -> VmResult<()> {
        // SAFETY: callers unmap each mapping exactly once.
        let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut c_void, len) };
        if rc != 0 {
            return Err(VmError::ReleaseFailed {
                reason: format!("munmap failed: {}", std::io::Error::last_os_error()),
            });
        }
        log::trace!("unmapped {len} bytes at {ptr:p}");
        Ok(())
    }

    /// # Safety
    ///
    /// `entry` must point at sealed code built by the JIT for slices at
    /// least as large as the ones behind `registers` and `locals`.
    pub(super) unsafe fn call_entry(
        entry: *const u8,
        vm_state: *mut c_void,
        registers: *mut u64,
        locals: *mut u64,
    ) -> VmResult<()> {
        let entry: EntryPoint = std::mem::transmute::<*const u8, EntryPoint>(entry);
        entry(vm_state, registers, locals);
        Ok(())
    }
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
mod sys {
    use super::*;

    const UNSUPPORTED: &str = "native code execution needs an x86-64 unix host";

    pub(super) fn round_to_page(len: usize) -> usize {
        len
    }

    pub(super) fn map_writable(len: usize) -> VmResult<NonNull<u8>> {
        Err(VmError::AllocationFailed {
            size: len,
            reason: UNSUPPORTED.to_string(),
        })
    }

    pub(super) fn protect_read_execute(_ptr: NonNull<u8>, _len: usize) -> VmResult<()> {
        Err(VmError::ProtectionChangeFailed {
            reason: UNSUPPORTED.to_string(),
        })
    }

    pub(super) fn unmap(_ptr: NonNull<u8>, _len: usize) -> VmResult<()> {
        Ok(())
    }

    pub(super) unsafe fn call_entry(
        _entry: *const u8,
        _vm_state: *mut c_void,
        _registers: *mut u64,
        _locals: *mut u64,
    ) -> VmResult<()> {
        Err(VmError::AllocationFailed {
            size: 0,
            reason: UNSUPPORTED.to_string(),
        })
    }
}
