//! Allocation entry-point interposition.
//!
//! Two layers: preload-style strong symbols for the native allocation
//! allowlist (built only with the `interpose` feature, chained to the real
//! functions through `dlsym(RTLD_NEXT)`), and shims for the interpreter's
//! three managed allocator domains, swapped into the interpreter's own
//! allocator table and chained to the saved original.
//!
//! Every shim consults the thread-local recursion guard before reporting.
//! A nested allocation (the writer growing a buffer, a free issued by the
//! interpreter mid-shim) is forwarded to the original untraced, which is
//! what lets the tracer allocate from inside its own hooks.

use std::cell::{Cell, UnsafeCell};
use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::interpreter::{
  AllocatorDomain, DomainAllocatorTable, Interpreter,
};
use crate::records::AllocatorKind;
use crate::tracker::Tracker;

/// Environment contract between the CLI front-end and the preload library.
pub const ENV_OUTPUT: &str = "MEMTRACE_OUTPUT";
pub const ENV_LIVE_PORT: &str = "MEMTRACE_LIVE_PORT";
pub const ENV_NATIVE: &str = "MEMTRACE_NATIVE";
pub const ENV_FOLLOW_FORK: &str = "MEMTRACE_FOLLOW_FORK";
pub const ENV_TRACE_PYTHON_ALLOCATORS: &str = "MEMTRACE_TRACE_PYTHON_ALLOCATORS";
pub const ENV_MEMORY_INTERVAL_MS: &str = "MEMTRACE_MEMORY_INTERVAL_MS";

/// Overrides the interpreter-allocator name recorded in the header; used to
/// force a specific interposition mode during tests.
pub const ENV_ALLOCATOR_OVERRIDE: &str = "MEMTRACE_PYTHON_ALLOCATOR";

thread_local! {
  static GUARD_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Thread-local reentrancy latch. Constructing it marks the thread as
/// inside the tracer; shims that observe the mark forward straight to the
/// original allocator without emitting a record.
pub(crate) struct RecursionGuard;

impl RecursionGuard {
  pub(crate) fn new() -> Self {
    let _ = GUARD_ACTIVE.try_with(|flag| flag.set(true));
    Self
  }

  /// During thread teardown the flag itself may already be gone; report
  /// active so nothing is traced from destructors.
  pub(crate) fn is_active() -> bool {
    GUARD_ACTIVE.try_with(Cell::get).unwrap_or(true)
  }

  /// Raw override for the fork hooks, which set the flag in one process
  /// state and clear it in another.
  pub(crate) fn force(active: bool) {
    let _ = GUARD_ACTIVE.try_with(|flag| flag.set(active));
  }
}

impl Drop for RecursionGuard {
  fn drop(&mut self) {
    let _ = GUARD_ACTIVE.try_with(|flag| flag.set(false));
  }
}

// ---------------------------------------------------------------------------
// Managed allocator domains
// ---------------------------------------------------------------------------

struct DomainState {
  domain: AllocatorDomain,
  original: DomainAllocatorTable,
}

struct DomainSlot(UnsafeCell<Option<DomainState>>);

// Written only during install/uninstall, both serialized by the caller
// holding the interpreter lock; read concurrently by the shims afterwards.
unsafe impl Sync for DomainSlot {}

static DOMAIN_SLOTS: [DomainSlot; 3] = [
  DomainSlot(UnsafeCell::new(None)),
  DomainSlot(UnsafeCell::new(None)),
  DomainSlot(UnsafeCell::new(None)),
];

fn slot_index(domain: AllocatorDomain) -> usize {
  match domain {
    AllocatorDomain::Raw => 0,
    AllocatorDomain::Mem => 1,
    AllocatorDomain::Obj => 2,
  }
}

fn domain_kind(domain: AllocatorDomain, kind: AllocatorKind) -> AllocatorKind {
  use AllocatorKind::{
    Calloc, Free, Malloc, PymallocMemCalloc, PymallocMemFree,
    PymallocMemMalloc, PymallocMemRealloc, PymallocObjCalloc, PymallocObjFree,
    PymallocObjMalloc, PymallocObjRealloc, PymallocRawCalloc, PymallocRawFree,
    PymallocRawMalloc, PymallocRawRealloc, Realloc,
  };

  match (domain, kind) {
    (AllocatorDomain::Raw, Malloc) => PymallocRawMalloc,
    (AllocatorDomain::Raw, Calloc) => PymallocRawCalloc,
    (AllocatorDomain::Raw, Realloc) => PymallocRawRealloc,
    (AllocatorDomain::Raw, Free) => PymallocRawFree,
    (AllocatorDomain::Mem, Malloc) => PymallocMemMalloc,
    (AllocatorDomain::Mem, Calloc) => PymallocMemCalloc,
    (AllocatorDomain::Mem, Realloc) => PymallocMemRealloc,
    (AllocatorDomain::Mem, Free) => PymallocMemFree,
    (AllocatorDomain::Obj, Malloc) => PymallocObjMalloc,
    (AllocatorDomain::Obj, Calloc) => PymallocObjCalloc,
    (AllocatorDomain::Obj, Realloc) => PymallocObjRealloc,
    (AllocatorDomain::Obj, Free) => PymallocObjFree,
    (_, other) => other,
  }
}

unsafe extern "C" fn domain_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
  let state = &*(ctx as *const DomainState);
  let original = state.original;
  let ptr = (original.malloc)(original.ctx, size);
  if !ptr.is_null() {
    Tracker::on_allocation(
      ptr as usize,
      size,
      domain_kind(state.domain, AllocatorKind::Malloc),
    );
  }
  ptr
}

unsafe extern "C" fn domain_calloc(
  ctx: *mut c_void,
  nelem: usize,
  elsize: usize,
) -> *mut c_void {
  let state = &*(ctx as *const DomainState);
  let original = state.original;
  let ptr = (original.calloc)(original.ctx, nelem, elsize);
  if !ptr.is_null() {
    Tracker::on_allocation(
      ptr as usize,
      nelem.saturating_mul(elsize),
      domain_kind(state.domain, AllocatorKind::Calloc),
    );
  }
  ptr
}

unsafe extern "C" fn domain_realloc(
  ctx: *mut c_void,
  ptr: *mut c_void,
  size: usize,
) -> *mut c_void {
  let state = &*(ctx as *const DomainState);
  let original = state.original;
  let new_ptr = (original.realloc)(original.ctx, ptr, size);
  if !new_ptr.is_null() {
    if !ptr.is_null() && ptr != new_ptr {
      Tracker::on_deallocation(
        ptr as usize,
        domain_kind(state.domain, AllocatorKind::Free),
      );
    }
    Tracker::on_allocation(
      new_ptr as usize,
      size,
      domain_kind(state.domain, AllocatorKind::Realloc),
    );
  }
  new_ptr
}

unsafe extern "C" fn domain_free(ctx: *mut c_void, ptr: *mut c_void) {
  let state = &*(ctx as *const DomainState);
  let original = state.original;
  if !ptr.is_null() {
    // Report before the address can be recycled by a concurrent allocation.
    Tracker::on_deallocation(
      ptr as usize,
      domain_kind(state.domain, AllocatorKind::Free),
    );
  }
  (original.free)(original.ctx, ptr);
}

/// Swap tracing shims into all three managed domains. Idempotent: a domain
/// already routed through the shims is left untouched.
pub(crate) fn install_domain_hooks(interpreter: &dyn Interpreter) {
  for domain in [
    AllocatorDomain::Raw,
    AllocatorDomain::Mem,
    AllocatorDomain::Obj,
  ] {
    let original = interpreter.allocator_table(domain);
    if original.malloc == domain_malloc as _ {
      continue;
    }

    let slot = &DOMAIN_SLOTS[slot_index(domain)];
    unsafe {
      *slot.0.get() = Some(DomainState { domain, original });
    }

    interpreter.set_allocator_table(
      domain,
      DomainAllocatorTable {
        ctx: slot.0.get() as *mut c_void,
        malloc: domain_malloc,
        calloc: domain_calloc,
        realloc: domain_realloc,
        free: domain_free,
      },
    );
  }
}

/// Restore the original allocator tables saved by
/// [`install_domain_hooks`].
pub(crate) fn remove_domain_hooks(interpreter: &dyn Interpreter) {
  for domain in [
    AllocatorDomain::Raw,
    AllocatorDomain::Mem,
    AllocatorDomain::Obj,
  ] {
    let slot = &DOMAIN_SLOTS[slot_index(domain)];
    let saved = unsafe { (*slot.0.get()).take() };
    if let Some(state) = saved {
      interpreter.set_allocator_table(domain, state.original);
    }
  }
}

// ---------------------------------------------------------------------------
// Native allocation entry points
// ---------------------------------------------------------------------------

/// Resolve every original entry point the shims chain to. Idempotent; call
/// again whenever the loader set changes.
///
/// # Errors
///
/// Returns the name of the first symbol that could not be resolved.
pub(crate) fn overwrite_symbols() -> Result<(), &'static str> {
  #[cfg(all(target_os = "linux", feature = "interpose"))]
  {
    preload::resolve_all()
  }
  #[cfg(not(all(target_os = "linux", feature = "interpose")))]
  {
    Ok(())
  }
}

#[cfg(all(target_os = "linux", feature = "interpose"))]
mod preload {
  //! Strong-symbol shims for the native allowlist. Loading this library
  //! with `LD_PRELOAD` routes every image's calls here; each shim chains
  //! to the next definition in lookup order via `dlsym(RTLD_NEXT)`.

  use super::*;
  use crate::interpreter::NoInterpreter;
  use crate::records::AllocatorKind;
  use crate::sink::{FileSink, Sink, SocketSink};
  use crate::tracker::TrackerOptions;
  use std::ffi::CStr;
  use std::sync::Arc;
  use std::time::Duration;

  // dlsym itself may allocate while we are resolving the allocator it
  // implements with. Allocations made during resolution are served from a
  // fixed pool and ignored by the free shim.
  const BOOTSTRAP_POOL_SIZE: usize = 64 * 1024;

  struct BootstrapPool {
    bytes: UnsafeCell<[u8; BOOTSTRAP_POOL_SIZE]>,
    offset: AtomicUsize,
  }

  unsafe impl Sync for BootstrapPool {}

  static BOOTSTRAP_POOL: BootstrapPool = BootstrapPool {
    bytes: UnsafeCell::new([0; BOOTSTRAP_POOL_SIZE]),
    offset: AtomicUsize::new(0),
  };

  impl BootstrapPool {
    fn alloc(&self, size: usize) -> *mut c_void {
      const ALIGN: usize = 16;
      let size = size.div_ceil(ALIGN) * ALIGN;
      let mut offset = self.offset.load(Ordering::Relaxed);
      loop {
        let end = offset + size;
        if end > BOOTSTRAP_POOL_SIZE {
          return std::ptr::null_mut();
        }
        match self.offset.compare_exchange(
          offset,
          end,
          Ordering::Relaxed,
          Ordering::Relaxed,
        ) {
          Ok(_) => {
            return unsafe { (self.bytes.get() as *mut u8).add(offset) }
              as *mut c_void;
          }
          Err(current) => offset = current,
        }
      }
    }

    fn contains(&self, ptr: *mut c_void) -> bool {
      let base = self.bytes.get() as usize;
      let addr = ptr as usize;
      addr >= base && addr < base + BOOTSTRAP_POOL_SIZE
    }
  }

  thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
  }

  struct OriginalSlot {
    address: AtomicUsize,
    name: &'static CStr,
  }

  impl OriginalSlot {
    const fn new(name: &'static CStr) -> Self {
      Self {
        address: AtomicUsize::new(0),
        name,
      }
    }

    fn resolve(&self) -> usize {
      let cached = self.address.load(Ordering::Relaxed);
      if cached != 0 {
        return cached;
      }

      // dlsym can allocate. A shim hit while we are already inside dlsym
      // must not re-enter it; reporting "unresolved" sends that call to
      // the bootstrap pool instead.
      if RESOLVING.try_with(Cell::get).unwrap_or(true) {
        return 0;
      }
      RESOLVING.with(|flag| flag.set(true));
      let address = unsafe {
        libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) as usize
      };
      RESOLVING.with(|flag| flag.set(false));

      self.address.store(address, Ordering::Relaxed);
      address
    }
  }

  static ORIG_MALLOC: OriginalSlot = OriginalSlot::new(c"malloc");
  static ORIG_FREE: OriginalSlot = OriginalSlot::new(c"free");
  static ORIG_CALLOC: OriginalSlot = OriginalSlot::new(c"calloc");
  static ORIG_REALLOC: OriginalSlot = OriginalSlot::new(c"realloc");
  static ORIG_POSIX_MEMALIGN: OriginalSlot =
    OriginalSlot::new(c"posix_memalign");
  static ORIG_ALIGNED_ALLOC: OriginalSlot = OriginalSlot::new(c"aligned_alloc");
  static ORIG_MEMALIGN: OriginalSlot = OriginalSlot::new(c"memalign");
  static ORIG_VALLOC: OriginalSlot = OriginalSlot::new(c"valloc");
  static ORIG_PVALLOC: OriginalSlot = OriginalSlot::new(c"pvalloc");
  static ORIG_MMAP: OriginalSlot = OriginalSlot::new(c"mmap");
  static ORIG_MUNMAP: OriginalSlot = OriginalSlot::new(c"munmap");
  static ORIG_DLOPEN: OriginalSlot = OriginalSlot::new(c"dlopen");
  static ORIG_DLCLOSE: OriginalSlot = OriginalSlot::new(c"dlclose");
  static ORIG_PTHREAD_CREATE: OriginalSlot =
    OriginalSlot::new(c"pthread_create");

  pub(super) fn resolve_all() -> Result<(), &'static str> {
    let slots: [&OriginalSlot; 14] = [
      &ORIG_MALLOC,
      &ORIG_FREE,
      &ORIG_CALLOC,
      &ORIG_REALLOC,
      &ORIG_POSIX_MEMALIGN,
      &ORIG_ALIGNED_ALLOC,
      &ORIG_MEMALIGN,
      &ORIG_VALLOC,
      &ORIG_PVALLOC,
      &ORIG_MMAP,
      &ORIG_MUNMAP,
      &ORIG_DLOPEN,
      &ORIG_DLCLOSE,
      &ORIG_PTHREAD_CREATE,
    ];

    for slot in slots {
      if slot.resolve() == 0 {
        return Err(slot.name.to_str().unwrap_or("allocator symbol"));
      }
    }
    Ok(())
  }

  macro_rules! original {
    ($slot:expr, $ty:ty) => {{
      let address = $slot.resolve();
      if address == 0 {
        None
      } else {
        Some(unsafe { std::mem::transmute::<usize, $ty>(address) })
      }
    }};
  }

  type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
  type FreeFn = unsafe extern "C" fn(*mut c_void);
  type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
  type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
  type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int;
  type AlignedAllocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
  type MmapFn = unsafe extern "C" fn(
    *mut c_void,
    usize,
    libc::c_int,
    libc::c_int,
    libc::c_int,
    libc::off_t,
  ) -> *mut c_void;
  type MunmapFn = unsafe extern "C" fn(*mut c_void, usize) -> libc::c_int;
  type DlopenFn =
    unsafe extern "C" fn(*const libc::c_char, libc::c_int) -> *mut c_void;
  type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> libc::c_int;
  type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut c_void) -> *mut c_void,
    *mut c_void,
  ) -> libc::c_int;

  #[no_mangle]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(real) = original!(ORIG_MALLOC, MallocFn) else {
      return BOOTSTRAP_POOL.alloc(size);
    };
    let ptr = real(size);
    if !ptr.is_null() {
      Tracker::on_allocation(ptr as usize, size, AllocatorKind::Malloc);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || BOOTSTRAP_POOL.contains(ptr) {
      return;
    }
    Tracker::on_deallocation(ptr as usize, AllocatorKind::Free);
    if let Some(real) = original!(ORIG_FREE, FreeFn) {
      real(ptr);
    }
  }

  #[no_mangle]
  pub unsafe extern "C" fn calloc(nelem: usize, elsize: usize) -> *mut c_void {
    let Some(real) = original!(ORIG_CALLOC, CallocFn) else {
      // dlsym bootstrapping path; the pool is pre-zeroed.
      return BOOTSTRAP_POOL.alloc(nelem.saturating_mul(elsize));
    };
    let ptr = real(nelem, elsize);
    if !ptr.is_null() {
      Tracker::on_allocation(
        ptr as usize,
        nelem.saturating_mul(elsize),
        AllocatorKind::Calloc,
      );
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn realloc(
    ptr: *mut c_void,
    size: usize,
  ) -> *mut c_void {
    let Some(real) = original!(ORIG_REALLOC, ReallocFn) else {
      return std::ptr::null_mut();
    };
    let new_ptr = real(ptr, size);
    if !new_ptr.is_null() {
      if !ptr.is_null() && ptr != new_ptr {
        Tracker::on_deallocation(ptr as usize, AllocatorKind::Free);
      }
      Tracker::on_allocation(new_ptr as usize, size, AllocatorKind::Realloc);
    }
    new_ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
  ) -> libc::c_int {
    let Some(real) = original!(ORIG_POSIX_MEMALIGN, PosixMemalignFn) else {
      return libc::ENOMEM;
    };
    let result = real(memptr, alignment, size);
    if result == 0 && !(*memptr).is_null() {
      Tracker::on_allocation(
        *memptr as usize,
        size,
        AllocatorKind::PosixMemalign,
      );
    }
    result
  }

  #[no_mangle]
  pub unsafe extern "C" fn aligned_alloc(
    alignment: usize,
    size: usize,
  ) -> *mut c_void {
    let Some(real) = original!(ORIG_ALIGNED_ALLOC, AlignedAllocFn) else {
      return std::ptr::null_mut();
    };
    let ptr = real(alignment, size);
    if !ptr.is_null() {
      Tracker::on_allocation(ptr as usize, size, AllocatorKind::AlignedAlloc);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn memalign(
    alignment: usize,
    size: usize,
  ) -> *mut c_void {
    let Some(real) = original!(ORIG_MEMALIGN, AlignedAllocFn) else {
      return std::ptr::null_mut();
    };
    let ptr = real(alignment, size);
    if !ptr.is_null() {
      Tracker::on_allocation(ptr as usize, size, AllocatorKind::Memalign);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let Some(real) = original!(ORIG_VALLOC, MallocFn) else {
      return std::ptr::null_mut();
    };
    let ptr = real(size);
    if !ptr.is_null() {
      Tracker::on_allocation(ptr as usize, size, AllocatorKind::Valloc);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let Some(real) = original!(ORIG_PVALLOC, MallocFn) else {
      return std::ptr::null_mut();
    };
    let ptr = real(size);
    if !ptr.is_null() {
      Tracker::on_allocation(ptr as usize, size, AllocatorKind::Pvalloc);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: libc::off_t,
  ) -> *mut c_void {
    let Some(real) = original!(ORIG_MMAP, MmapFn) else {
      return libc::MAP_FAILED;
    };
    let ptr = real(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
      Tracker::on_allocation(ptr as usize, length, AllocatorKind::Mmap);
    }
    ptr
  }

  #[no_mangle]
  pub unsafe extern "C" fn munmap(
    addr: *mut c_void,
    length: usize,
  ) -> libc::c_int {
    Tracker::on_deallocation(addr as usize, AllocatorKind::Munmap);
    let Some(real) = original!(ORIG_MUNMAP, MunmapFn) else {
      return -1;
    };
    real(addr, length)
  }

  #[no_mangle]
  pub unsafe extern "C" fn dlopen(
    filename: *const libc::c_char,
    flags: libc::c_int,
  ) -> *mut c_void {
    let Some(real) = original!(ORIG_DLOPEN, DlopenFn) else {
      return std::ptr::null_mut();
    };
    let handle = real(filename, flags);
    if !handle.is_null() {
      Tracker::invalidate_module_cache();
    }
    handle
  }

  #[no_mangle]
  pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> libc::c_int {
    let Some(real) = original!(ORIG_DLCLOSE, DlcloseFn) else {
      return -1;
    };
    let result = real(handle);
    Tracker::invalidate_module_cache();
    result
  }

  #[no_mangle]
  pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
  ) -> libc::c_int {
    // Interpreted threads announce themselves through the profile hook and
    // native threads are identified by their first CONTEXT_SWITCH, so the
    // shim only has to keep the chain intact.
    let Some(real) = original!(ORIG_PTHREAD_CREATE, PthreadCreateFn) else {
      return libc::EAGAIN;
    };
    real(thread, attr, start_routine, arg)
  }

  extern "C" fn preload_shutdown() {
    Tracker::destroy();
  }

  extern "C" fn preload_init() {
    let _ = pretty_env_logger::try_init();

    let output = std::env::var(ENV_OUTPUT).ok();
    let live_port = std::env::var(ENV_LIVE_PORT)
      .ok()
      .and_then(|port| port.parse::<u16>().ok());

    let sink: Box<dyn Sink> = if let Some(path) = output {
      match FileSink::create(&path) {
        Ok(sink) => Box::new(sink),
        Err(err) => {
          log::error!("cannot open capture file {path}: {err}");
          return;
        }
      }
    } else if let Some(port) = live_port {
      match SocketSink::bind(port) {
        Ok(sink) => Box::new(sink),
        Err(err) => {
          log::error!("cannot serve live capture on port {port}: {err}");
          return;
        }
      }
    } else {
      return;
    };

    let flag = |name: &str| std::env::var_os(name).is_some_and(|v| v == "1");
    let mut options = TrackerOptions::default()
      .with_native_traces(flag(ENV_NATIVE))
      .with_follow_fork(flag(ENV_FOLLOW_FORK))
      .with_trace_interpreter_allocators(flag(ENV_TRACE_PYTHON_ALLOCATORS));
    if let Some(interval) = std::env::var(ENV_MEMORY_INTERVAL_MS)
      .ok()
      .and_then(|ms| ms.parse::<u64>().ok())
    {
      options = options.with_memory_interval(Duration::from_millis(interval));
    }

    if let Err(err) =
      Tracker::create(sink, Arc::new(NoInterpreter), options)
    {
      log::error!("cannot start tracing: {err}");
      return;
    }

    unsafe {
      libc::atexit(preload_shutdown);
    }
  }

  #[used]
  #[link_section = ".init_array"]
  static PRELOAD_INIT: extern "C" fn() = preload_init;
}
