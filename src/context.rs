//! Context-switch primitive
//!
//! The only place in the crate that touches stacks and machine context.
//! Two operations:
//! - `install`: prepare a context so that the first transfer into it runs an
//!   entry function on a private stack. Nothing of the entry runs yet.
//! - `transfer`: save the caller's resumption point into `from`, resume `to`.
//!
//! Built on `getcontext`/`makecontext`/`swapcontext`. The entry receives its
//! argument as two 32-bit halves, `makecontext` only promises `int` arguments.
//!
//! Author: Moroya Sakamoto

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("fiber-rt needs the glibc ucontext API (linux-gnu targets)");

/// Smallest accepted fiber stack.
///
/// Every stack also gets a guard page, so an overflow faults. Panic and
/// formatting machinery run on the fiber stack too; leave room for them.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
/// Largest accepted fiber stack
pub const MAX_STACK_SIZE: usize = 16 * 1024 * 1024;
/// Stack size used when nothing else was configured
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Entry signature accepted by [`Context::install`]
pub(crate) type EntryFn = extern "C" fn(u32, u32);

/// Fiber stack: an anonymous mapping with a `PROT_NONE` guard page below
/// the usable region, so running off the end faults instead of corrupting
/// memory. Unmapped on drop.
pub(crate) struct Stack {
    map: NonNull<u8>,
    map_len: usize,
    guard: usize,
}

impl Stack {
    /// Map a stack of at least `size` usable bytes (rounded up to pages).
    ///
    /// Out-of-range sizes are `InvalidStackSize`; mapping failure is
    /// `MemoryAllocation` and leaves the caller free to retry.
    pub fn new(size: usize) -> Result<Self> {
        check_stack_size(size)?;
        let page = page_size();
        let usable = (size + page - 1) / page * page;
        let map_len = usable + page;
        // SAFETY: fresh private anonymous mapping, no existing memory touched
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::MemoryAllocation(size));
        }
        let map = NonNull::new(raw.cast::<u8>()).ok_or(Error::MemoryAllocation(size))?;
        let stack = Self {
            map,
            map_len,
            guard: page,
        };
        // Stacks grow down: the lowest page is the guard
        // SAFETY: the first page lies inside the mapping created above
        if unsafe { libc::mprotect(raw, page, libc::PROT_NONE) } != 0 {
            return Err(Error::MemoryAllocation(size));
        }
        Ok(stack)
    }

    /// Lowest usable address
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: the guard page is part of the mapping
        unsafe { self.map.as_ptr().add(self.guard) }
    }

    /// Usable bytes, guard page excluded
    pub fn size(&self) -> usize {
        self.map_len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with exactly this length
        unsafe {
            libc::munmap(self.map.as_ptr().cast(), self.map_len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

/// Validate a requested stack size
pub fn check_stack_size(size: usize) -> Result<()> {
    if (MIN_STACK_SIZE..=MAX_STACK_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(Error::InvalidStackSize(size))
    }
}

/// Saved resumption point.
///
/// glibc keeps a pointer into the structure itself, so a context must stay
/// at the same address from the first save until it is no longer resumed.
/// Contexts therefore live inside `Rc` allocations and are never moved.
pub(crate) struct Context {
    uc: UnsafeCell<libc::ucontext_t>,
}

impl Context {
    pub fn new() -> Self {
        // SAFETY: ucontext_t is plain C data, all-zero is a valid bit pattern
        let uc = unsafe { MaybeUninit::<libc::ucontext_t>::zeroed().assume_init() };
        Self {
            uc: UnsafeCell::new(uc),
        }
    }

    /// Prepare this context to run `entry(arg)` on `stack`.
    ///
    /// # Safety
    /// `stack` must outlive every transfer into this context, `self` must not
    /// move afterwards, and `entry` must never return (it has no `uc_link`).
    pub unsafe fn install(&self, stack: &Stack, entry: EntryFn, arg: *const ()) -> Result<()> {
        let uc = self.uc.get();
        if libc::getcontext(uc) != 0 {
            return Err(Error::Failed("getcontext"));
        }
        (*uc).uc_stack.ss_sp = stack.bottom().cast();
        (*uc).uc_stack.ss_size = stack.size();
        (*uc).uc_stack.ss_flags = 0;
        (*uc).uc_link = ptr::null_mut();

        let (hi, lo) = split_ptr(arg);
        let entry = mem::transmute::<EntryFn, extern "C" fn()>(entry);
        libc::makecontext(uc, entry, 2, hi, lo);
        Ok(())
    }

    /// Save the current resumption point into `from` and resume `to`.
    ///
    /// Returns when some later transfer resumes `from`.
    ///
    /// # Safety
    /// `to` must hold a saved or installed context whose stack is still alive,
    /// and both contexts must stay in place until they are resumed.
    pub unsafe fn transfer(from: &Context, to: &Context) -> Result<()> {
        if libc::swapcontext(from.uc.get(), to.uc.get()) != 0 {
            return Err(Error::Failed("swapcontext"));
        }
        Ok(())
    }
}

fn split_ptr(arg: *const ()) -> (u32, u32) {
    let addr = arg as usize as u64;
    ((addr >> 32) as u32, addr as u32)
}

/// Rebuild the pointer handed to an installed entry
pub(crate) fn join_ptr(hi: u32, lo: u32) -> *const () {
    (((hi as u64) << 32) | lo as u64) as usize as *const ()
}
