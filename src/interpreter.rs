//! Contract between the core and the hosted interpreter.
//!
//! The interpreter's C API is an external collaborator: the core consumes
//! exactly the capabilities below and nothing else. An embedding crate
//! implements [`Interpreter`] for the real runtime; tests drive the core
//! with an in-process fake.

use std::fmt::{self, Display, Formatter};
use std::os::raw::c_void;

/// Opaque identity of one interpreter frame, stable for the frame's
/// lifetime. Used only for matching pushes against pops.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct FrameHandle(pub usize);

/// The interpreter failed to produce a frame's name or filename (for
/// example, a non-UTF8 code object). Aborts only the affected push; the
/// embedding turns it into an ordinary interpreted-level exception.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameCaptureError;

impl Display for FrameCaptureError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "interpreter could not produce a frame name or filename")
  }
}

impl std::error::Error for FrameCaptureError {}

/// One frame of a captured interpreted stack.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
  pub handle: FrameHandle,
  pub function_name: String,
  pub filename: String,
  pub lineno: i32,
  pub is_entry_frame: bool,
}

/// The interpreter's three managed allocator domains.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AllocatorDomain {
  Raw,
  Mem,
  Obj,
}

/// Function table for one managed allocator domain, mirroring the
/// interpreter's own vtable layout so shims can chain to the original.
#[derive(Debug, Clone, Copy)]
pub struct DomainAllocatorTable {
  pub ctx: *mut c_void,
  pub malloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
  pub calloc: unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void,
  pub realloc:
    unsafe extern "C" fn(*mut c_void, *mut c_void, usize) -> *mut c_void,
  pub free: unsafe extern "C" fn(*mut c_void, *mut c_void),
}

// The ctx pointer is owned by the interpreter and valid process-wide; the
// table is only ever swapped while the caller holds the interpreter lock.
unsafe impl Send for DomainAllocatorTable {}
unsafe impl Sync for DomainAllocatorTable {}

/// Capabilities the core consumes from the hosted interpreter.
///
/// Implementations must call every method with the interpreter lock held
/// where the interpreter requires it; the core itself never takes that
/// lock, and in particular never from an allocation shim.
pub trait Interpreter: Send + Sync {
  /// Name of the allocator the interpreter was configured with
  /// (`"pymalloc"`, `"malloc"`, ...).
  fn allocator_name(&self) -> String;

  /// Snapshot every interpreted thread's current stack, innermost frame
  /// first, keyed by the thread's OS id. Taken with the interpreter lock
  /// held so no stack can change mid-capture.
  ///
  /// # Errors
  ///
  /// Returns [`FrameCaptureError`] when any frame's name or filename
  /// cannot be produced.
  fn capture_all_stacks(
    &self,
  ) -> Result<Vec<(u64, Vec<CapturedFrame>)>, FrameCaptureError>;

  /// Start delivering call/return/line events for every interpreted thread
  /// into [`crate::shadow::on_frame_call`] and friends.
  fn install_profile_hook(&self);

  /// Stop delivering profile events.
  fn remove_profile_hook(&self);

  /// Read one managed domain's current allocator table.
  fn allocator_table(&self, domain: AllocatorDomain) -> DomainAllocatorTable;

  /// Replace one managed domain's allocator table.
  fn set_allocator_table(
    &self,
    domain: AllocatorDomain,
    table: DomainAllocatorTable,
  );
}

/// Interpreter stub for purely native tracing: no interpreted threads, no
/// profile events, and a pass-through allocator table. Used by the preload
/// entry point and by tests that only exercise the native path.
#[derive(Debug, Default)]
pub struct NoInterpreter;

unsafe extern "C" fn null_malloc(_ctx: *mut c_void, _size: usize) -> *mut c_void {
  std::ptr::null_mut()
}

unsafe extern "C" fn null_calloc(
  _ctx: *mut c_void,
  _nelem: usize,
  _elsize: usize,
) -> *mut c_void {
  std::ptr::null_mut()
}

unsafe extern "C" fn null_realloc(
  _ctx: *mut c_void,
  _ptr: *mut c_void,
  _size: usize,
) -> *mut c_void {
  std::ptr::null_mut()
}

unsafe extern "C" fn null_free(_ctx: *mut c_void, _ptr: *mut c_void) {}

impl Interpreter for NoInterpreter {
  fn allocator_name(&self) -> String {
    "malloc".to_string()
  }

  fn capture_all_stacks(
    &self,
  ) -> Result<Vec<(u64, Vec<CapturedFrame>)>, FrameCaptureError> {
    Ok(Vec::new())
  }

  fn install_profile_hook(&self) {}

  fn remove_profile_hook(&self) {}

  fn allocator_table(&self, _domain: AllocatorDomain) -> DomainAllocatorTable {
    DomainAllocatorTable {
      ctx: std::ptr::null_mut(),
      malloc: null_malloc,
      calloc: null_calloc,
      realloc: null_realloc,
      free: null_free,
    }
  }

  fn set_allocator_table(
    &self,
    _domain: AllocatorDomain,
    _table: DomainAllocatorTable,
  ) {
  }
}
