//! Process-wide tracking singleton.
//!
//! The tracker owns the writer and the background sampler, and is the
//! target of every shim callback. The singleton is published as a raw
//! pointer because shims have no per-call context: the fast path is one
//! atomic-bool load and one pointer load, with no lock that could deadlock
//! against the allocator or survive a fork in a poisoned state.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::frames::RawFrame;
use crate::interpose::{self, RecursionGuard, ENV_ALLOCATOR_OVERRIDE};
use crate::interpreter::Interpreter;
use crate::native;
use crate::records::{
  AllocatorKind, ImageSegments, InterpreterAllocator, ThreadId,
};
use crate::sampler::MemorySampler;
use crate::shadow::{self, ShadowFrame};
use crate::sink::Sink;
use crate::writer::{RecordWriter, WriterInner};

/// Native frames between the shim entry and the traced call site.
const NATIVE_SKIP_FRAMES: usize = 2;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static INSTANCE: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static FORK_HOOKS: Once = Once::new();

/// Serializes every test that touches the process-wide singleton or the
/// domain slots, across modules.
#[cfg(test)]
pub(crate) static SINGLETON_TEST_LOCK: std::sync::Mutex<()> =
  std::sync::Mutex::new(());

#[must_use]
pub(crate) fn os_thread_id() -> ThreadId {
  #[cfg(unix)]
  {
    unsafe { libc::pthread_self() as u64 }
  }
  #[cfg(not(unix))]
  {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
  }
}

/// Failures surfaced by [`Tracker::create`].
#[derive(Debug)]
pub enum InitError {
  /// Another tracker instance is already installed.
  AlreadyActive,
  /// Writing the initial header or opening the sampler source failed.
  Io(io::Error),
  /// An allocation entry point could not be resolved for interposition.
  Interposer(&'static str),
  /// The interpreter could not produce a thread's starting stack.
  FrameCapture,
}

impl Display for InitError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::AlreadyActive => write!(f, "a tracker is already active"),
      Self::Io(err) => write!(f, "i/o error while starting tracking: {err}"),
      Self::Interposer(symbol) => {
        write!(f, "cannot interpose allocator symbol {symbol}")
      }
      Self::FrameCapture => {
        write!(f, "failed to capture a thread's interpreted stack")
      }
    }
  }
}

impl std::error::Error for InitError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for InitError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

/// Tracing configuration; plain data with builder-style helpers.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
  /// Attach a native backtrace to every allocation record.
  pub native_traces: bool,
  /// Cadence of the background resident-set sampler.
  pub memory_interval: Duration,
  /// Restart tracing in forked children when the sink supports it.
  pub follow_fork: bool,
  /// Shim the interpreter's managed allocator domains as well.
  pub trace_interpreter_allocators: bool,
  /// Recorded in the header; defaults to the process command line.
  pub command_line: Option<String>,
}

impl Default for TrackerOptions {
  fn default() -> Self {
    Self {
      native_traces: false,
      memory_interval: Duration::from_millis(10),
      follow_fork: false,
      trace_interpreter_allocators: false,
      command_line: None,
    }
  }
}

impl TrackerOptions {
  #[must_use]
  pub fn with_native_traces(mut self, enabled: bool) -> Self {
    self.native_traces = enabled;
    self
  }

  #[must_use]
  pub fn with_memory_interval(mut self, interval: Duration) -> Self {
    self.memory_interval = interval;
    self
  }

  #[must_use]
  pub fn with_follow_fork(mut self, enabled: bool) -> Self {
    self.follow_fork = enabled;
    self
  }

  #[must_use]
  pub fn with_trace_interpreter_allocators(mut self, enabled: bool) -> Self {
    self.trace_interpreter_allocators = enabled;
    self
  }

  #[must_use]
  pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
    self.command_line = Some(command_line.into());
    self
  }
}

pub struct Tracker {
  writer: Arc<RecordWriter>,
  interpreter: Arc<dyn Interpreter>,
  native_traces: bool,
  follow_fork: bool,
  trace_interpreter_allocators: bool,
  memory_interval: Duration,
  sampler: Option<MemorySampler>,
}

impl Tracker {
  /// Install the process-wide tracker and start tracing.
  ///
  /// Creation and destruction must be serialized by the caller (the
  /// embedding holds the interpreter lock across both, matching how the
  /// profile hooks are installed).
  ///
  /// # Errors
  ///
  /// Fails when a tracker is already active, the header cannot be
  /// written, the sampler source cannot be opened, interposition cannot
  /// resolve an entry point, or a starting stack cannot be captured.
  pub fn create(
    sink: Box<dyn Sink>,
    interpreter: Arc<dyn Interpreter>,
    options: TrackerOptions,
  ) -> Result<(), InitError> {
    if !INSTANCE.load(Ordering::Acquire).is_null() {
      return Err(InitError::AlreadyActive);
    }
    let _guard = RecursionGuard::new();

    let command_line = options
      .command_line
      .clone()
      .unwrap_or_else(process_command_line);
    let allocator_name = std::env::var(ENV_ALLOCATOR_OVERRIDE)
      .unwrap_or_else(|_| interpreter.allocator_name());

    let writer = Arc::new(RecordWriter::new(
      sink,
      options.native_traces,
      command_line,
      InterpreterAllocator::from_name(&allocator_name),
    ));
    writer.write_header(false)?;

    interpose::overwrite_symbols().map_err(InitError::Interposer)?;
    register_fork_hooks();

    let sampler = MemorySampler::start(
      Arc::clone(&writer),
      options.memory_interval,
    )?;

    let tracker = Box::new(Tracker {
      writer,
      interpreter,
      native_traces: options.native_traces,
      follow_fork: options.follow_fork,
      trace_interpreter_allocators: options.trace_interpreter_allocators,
      memory_interval: options.memory_interval,
      sampler: Some(sampler),
    });

    tracker.install()
  }

  /// Hook installation and publication shared by `create` and the
  /// post-fork rebuild. Consumes the tracker; on success the instance
  /// lives until [`Tracker::destroy`] or process exit.
  fn install(mut self: Box<Self>) -> Result<(), InitError> {
    shadow::set_native_tracking(self.native_traces);

    let stacks = match self.interpreter.capture_all_stacks() {
      Ok(stacks) => stacks,
      Err(_) => {
        shadow::set_native_tracking(false);
        if let Some(mut sampler) = self.sampler.take() {
          sampler.stop();
        }
        return Err(InitError::FrameCapture);
      }
    };

    let current = os_thread_id();
    let deposits = stacks
      .into_iter()
      .map(|(tid, frames)| {
        let mut frames: Vec<ShadowFrame> = frames
          .into_iter()
          .map(|frame| ShadowFrame::from_captured(frame, self.native_traces))
          .collect();
        if tid == current {
          // Everything above the frame that started tracking is noise.
          frames.truncate(1);
        }
        (tid, frames)
      })
      .collect();
    shadow::deposit_initial_stacks(deposits);

    self.interpreter.install_profile_hook();
    if self.trace_interpreter_allocators {
      interpose::install_domain_hooks(&*self.interpreter);
    }

    let native_traces = self.native_traces;
    let pointer = Box::into_raw(self);
    if INSTANCE
      .compare_exchange(
        ptr::null_mut(),
        pointer,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      let mut lost = unsafe { Box::from_raw(pointer) };
      if lost.trace_interpreter_allocators {
        interpose::remove_domain_hooks(&*lost.interpreter);
      }
      lost.interpreter.remove_profile_hook();
      if let Some(mut sampler) = lost.sampler.take() {
        sampler.stop();
      }
      return Err(InitError::AlreadyActive);
    }

    if native_traces {
      // SAFETY: the pointer was just published and cannot be destroyed
      // before this call returns; destruction is serialized with creation.
      unsafe { &*pointer }.update_module_cache();
    }

    ACTIVE.store(true, Ordering::Release);
    Ok(())
  }

  /// Tear down the active tracker: deactivate, stop the sampler, restore
  /// hooks, write the trailer and rewrite the header. A no-op without an
  /// active instance.
  pub fn destroy() {
    let _guard = RecursionGuard::new();
    ACTIVE.store(false, Ordering::Release);

    let pointer = INSTANCE.swap(ptr::null_mut(), Ordering::AcqRel);
    if pointer.is_null() {
      return;
    }
    let mut tracker = unsafe { Box::from_raw(pointer) };

    shadow::set_native_tracking(false);
    if let Some(mut sampler) = tracker.sampler.take() {
      sampler.stop();
    }
    if tracker.trace_interpreter_allocators {
      interpose::remove_domain_hooks(&*tracker.interpreter);
    }
    tracker.interpreter.remove_profile_hook();
    shadow::clear_initial_stacks();

    if let Err(err) = tracker.writer.write_trailer() {
      log::warn!("failed to write trailer: {err}");
    }
    if let Err(err) = tracker.writer.write_header(true) {
      log::warn!("failed to rewrite header: {err}");
    }
  }

  #[must_use]
  pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
  }

  pub(crate) fn deactivate() {
    ACTIVE.store(false, Ordering::Release);
  }

  /// Run `f` against the live instance, if tracking is active.
  pub(crate) fn with_active<F, R>(f: F) -> Option<R>
  where
    F: FnOnce(&Tracker) -> R,
  {
    if !Self::is_active() {
      return None;
    }
    let pointer = INSTANCE.load(Ordering::Acquire);
    // SAFETY: destroy() nulls the pointer before freeing the instance and
    // create/destroy are serialized by the embedding, so a non-null load
    // observed while active refers to a live tracker.
    unsafe { pointer.as_ref() }.map(f)
  }

  /// Shim entry point for every allocation-family call.
  pub fn on_allocation(address: usize, size: usize, kind: AllocatorKind) {
    if RecursionGuard::is_active() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();
    let _ = Self::with_active(|tracker| {
      tracker.track_allocation(address as u64, size as u64, kind);
    });
  }

  /// Shim entry point for every deallocation-family call.
  pub fn on_deallocation(address: usize, kind: AllocatorKind) {
    if RecursionGuard::is_active() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();
    let _ = Self::with_active(|tracker| {
      tracker.track_deallocation(address as u64, kind);
    });
  }

  fn track_allocation(&self, address: u64, size: u64, kind: AllocatorKind) {
    shadow::flush_pending(self);

    let tid = os_thread_id();
    let result = if self.native_traces {
      let ips = native::capture_native_stack(NATIVE_SKIP_FRAMES);
      let mut writer = self.writer.lock();
      writer.register_native_trace(&ips).and_then(|trace_id| {
        writer.write_allocation_with_native(tid, kind, address, size, trace_id)
      })
    } else {
      self.writer.lock().write_allocation(tid, kind, address, size)
    };

    if let Err(err) = result {
      deactivate_on_error("allocation record", &err);
    }
  }

  fn track_deallocation(&self, address: u64, kind: AllocatorKind) {
    shadow::flush_pending(self);

    let tid = os_thread_id();
    let result = self.writer.lock().write_allocation(tid, kind, address, 0);
    if let Err(err) = result {
      deactivate_on_error("deallocation record", &err);
    }
  }

  /// Emit `count` frame pops for the current thread. Returns false once
  /// tracking has been deactivated by a write failure.
  pub(crate) fn pop_frames(&self, count: u32) -> bool {
    let result = self.writer.lock().write_frame_pop(os_thread_id(), count);
    if let Err(err) = result {
      deactivate_on_error("frame pop", &err);
      return false;
    }
    true
  }

  /// Intern `frame` and emit its push for the current thread under one
  /// writer-lock acquisition.
  pub(crate) fn push_frame(&self, frame: &RawFrame) -> bool {
    let tid = os_thread_id();
    let mut writer = self.writer.lock();
    let result = writer
      .register_frame(frame)
      .and_then(|frame_id| writer.write_frame_push(tid, frame_id));
    drop(writer);

    if let Err(err) = result {
      deactivate_on_error("frame push", &err);
      return false;
    }
    true
  }

  /// Rewrite the image map: one `MEMORY_MAP_START` followed by the
  /// segments of every loaded image, atomically under the writer lock.
  pub fn update_module_cache(&self) {
    if !self.native_traces {
      return;
    }

    let images = collect_image_segments();
    let mut writer = self.writer.lock();
    if let Err(err) = write_image_map(&mut writer, &images) {
      drop(writer);
      deactivate_on_error("memory map", &err);
    }
  }

  /// Called by the `dlopen`/`dlclose` shims whenever the loader set
  /// changes: re-resolve interposed entry points and rewrite the map.
  pub fn invalidate_module_cache() {
    if RecursionGuard::is_active() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();

    if let Err(symbol) = interpose::overwrite_symbols() {
      log::warn!("cannot re-resolve {symbol} after loader change");
    }
    let _ = Self::with_active(Tracker::update_module_cache);
  }

  /// Record a human-readable name for the calling thread.
  pub fn register_thread_name(name: &str) {
    if RecursionGuard::is_active() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();
    let _ = Self::with_active(|tracker| {
      let result = tracker
        .writer
        .lock()
        .write_thread_record(os_thread_id(), name);
      if let Err(err) = result {
        deactivate_on_error("thread record", &err);
      }
    });
  }
}

fn deactivate_on_error(what: &str, err: &io::Error) {
  log::error!("failed to write {what}, deactivating tracking: {err}");
  Tracker::deactivate();
}

fn write_image_map(
  writer: &mut WriterInner,
  images: &[ImageSegments],
) -> io::Result<()> {
  writer.write_memory_map_start()?;
  for image in images {
    writer.write_segment_header(
      &image.filename,
      image.segments.len() as u64,
      image.addr,
    )?;
    for segment in &image.segments {
      writer.write_segment(segment.vaddr, segment.memsz)?;
    }
  }
  Ok(())
}

fn process_command_line() -> String {
  if let Ok(raw) = std::fs::read("/proc/self/cmdline") {
    let joined = raw
      .split(|&byte| byte == 0)
      .filter(|part| !part.is_empty())
      .map(String::from_utf8_lossy)
      .collect::<Vec<_>>()
      .join(" ");
    if !joined.is_empty() {
      return joined;
    }
  }
  std::env::args().collect::<Vec<_>>().join(" ")
}

#[cfg(target_os = "linux")]
fn collect_image_segments() -> Vec<ImageSegments> {
  use crate::records::Segment;
  use std::ffi::CStr;
  use std::os::raw::c_void;

  unsafe extern "C" fn callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
  ) -> libc::c_int {
    let images = &mut *(data as *mut Vec<ImageSegments>);
    let info = &*info;

    let filename = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
      executable_path()
    } else {
      CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };
    if filename.starts_with("linux-vdso.so") {
      // Synthetic image; nothing can ever be resolved against it.
      return 0;
    }

    let headers =
      std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum));
    let segments = headers
      .iter()
      .filter(|header| header.p_type == libc::PT_LOAD)
      .map(|header| Segment {
        vaddr: header.p_vaddr as u64,
        memsz: header.p_memsz as u64,
      })
      .collect();

    images.push(ImageSegments {
      filename,
      addr: info.dlpi_addr as u64,
      segments,
    });
    0
  }

  let mut images: Vec<ImageSegments> = Vec::new();
  unsafe {
    libc::dl_iterate_phdr(
      Some(callback),
      &mut images as *mut Vec<ImageSegments> as *mut c_void,
    );
  }
  images
}

#[cfg(target_os = "linux")]
fn executable_path() -> String {
  std::fs::read_link("/proc/self/exe")
    .map(|path| path.display().to_string())
    .unwrap_or_else(|_| "<unknown>".to_string())
}

#[cfg(not(target_os = "linux"))]
fn collect_image_segments() -> Vec<ImageSegments> {
  Vec::new()
}

fn register_fork_hooks() {
  FORK_HOOKS.call_once(|| unsafe {
    libc::pthread_atfork(
      Some(fork_prepare),
      Some(fork_parent),
      Some(fork_child),
    );
  });
}

extern "C" fn fork_prepare() {
  // Nothing allocated during the fork itself is traced.
  RecursionGuard::force(true);
}

extern "C" fn fork_parent() {
  RecursionGuard::force(false);
}

extern "C" fn fork_child() {
  // Leak the old tracker: its mutexes may be held by threads that do not
  // exist in this process, so its destructor can never run here.
  let was_active = ACTIVE.swap(false, Ordering::AcqRel);
  let old = INSTANCE.swap(ptr::null_mut(), Ordering::AcqRel);

  let Some(old_tracker) = (unsafe { old.as_ref() }) else {
    RecursionGuard::force(false);
    return;
  };

  if was_active && old_tracker.follow_fork {
    if let Some(writer) = old_tracker.writer.clone_in_child() {
      rebuild_in_child(writer, old_tracker);
    }
  }

  RecursionGuard::force(false);
}

/// Construct a brand-new tracker in a forked child around the cloned sink.
/// Failures leave the child untracked; the shims see a null singleton.
fn rebuild_in_child(writer: RecordWriter, old: &Tracker) {
  let writer = Arc::new(writer);
  if writer.write_header(false).is_err() {
    return;
  }

  let Ok(sampler) = MemorySampler::start(Arc::clone(&writer), old.memory_interval)
  else {
    return;
  };

  let tracker = Box::new(Tracker {
    writer,
    interpreter: Arc::clone(&old.interpreter),
    native_traces: old.native_traces,
    follow_fork: old.follow_fork,
    trace_interpreter_allocators: old.trace_interpreter_allocators,
    memory_interval: old.memory_interval,
    sampler: Some(sampler),
  });

  if let Err(err) = tracker.install() {
    log::warn!("cannot restart tracking in forked child: {err}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interpreter::{CapturedFrame, FrameCaptureError, FrameHandle};
  use crate::reader::{Allocation, StreamReader};
  use crate::sink::test_support::BufferSink;

  fn singleton_lock() -> std::sync::MutexGuard<'static, ()> {
    SINGLETON_TEST_LOCK
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  struct FakeInterpreter {
    stacks: Vec<(u64, Vec<CapturedFrame>)>,
  }

  impl FakeInterpreter {
    fn empty() -> Self {
      Self { stacks: Vec::new() }
    }

    fn with_current_thread_stack(frames: Vec<CapturedFrame>) -> Self {
      Self {
        stacks: vec![(os_thread_id(), frames)],
      }
    }
  }

  impl Interpreter for FakeInterpreter {
    fn allocator_name(&self) -> String {
      "pymalloc".to_string()
    }

    fn capture_all_stacks(
      &self,
    ) -> Result<Vec<(u64, Vec<CapturedFrame>)>, FrameCaptureError> {
      Ok(self.stacks.clone())
    }

    fn install_profile_hook(&self) {}

    fn remove_profile_hook(&self) {}

    fn allocator_table(
      &self,
      _domain: crate::interpreter::AllocatorDomain,
    ) -> crate::interpreter::DomainAllocatorTable {
      crate::interpreter::NoInterpreter.allocator_table(
        crate::interpreter::AllocatorDomain::Raw,
      )
    }

    fn set_allocator_table(
      &self,
      _domain: crate::interpreter::AllocatorDomain,
      _table: crate::interpreter::DomainAllocatorTable,
    ) {
    }
  }

  fn captured(
    handle: usize,
    function: &str,
    filename: &str,
    lineno: i32,
  ) -> CapturedFrame {
    CapturedFrame {
      handle: FrameHandle(handle),
      function_name: function.to_string(),
      filename: filename.to_string(),
      lineno,
      is_entry_frame: true,
    }
  }

  fn quiet_options() -> TrackerOptions {
    // A sampler interval long enough that no memory records land in the
    // stream while a test runs.
    TrackerOptions::default()
      .with_memory_interval(Duration::from_secs(3600))
      .with_command_line("test")
  }

  fn start_tracker(sink: &BufferSink, interpreter: FakeInterpreter) {
    crate::shadow::reset_for_test();
    Tracker::create(
      Box::new(sink.clone()),
      Arc::new(interpreter),
      quiet_options(),
    )
    .expect("create tracker");
  }

  fn decode_allocations(bytes: &[u8]) -> Vec<Allocation> {
    let mut reader = StreamReader::new(bytes).expect("open stream");
    let mut events = Vec::new();
    while let Some(event) = reader.next_allocation().expect("decode") {
      events.push(event);
    }
    events
  }

  #[test]
  fn only_one_tracker_may_be_active() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());

    let second = Tracker::create(
      Box::new(BufferSink::new(true)),
      Arc::new(FakeInterpreter::empty()),
      quiet_options(),
    );
    assert!(matches!(second, Err(InitError::AlreadyActive)));

    Tracker::destroy();
    assert!(!Tracker::is_active());

    // A full cycle later, creation works again.
    start_tracker(&BufferSink::new(true), FakeInterpreter::empty());
    Tracker::destroy();
  }

  #[test]
  fn traces_a_malloc_free_pair_end_to_end() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());

    Tracker::on_allocation(0x1000, 16, AllocatorKind::Malloc);
    Tracker::on_deallocation(0x1000, AllocatorKind::Free);
    Tracker::destroy();

    let bytes = sink.contents();
    let events = decode_allocations(&bytes);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].allocator, AllocatorKind::Malloc);
    assert_eq!(events[0].address, 0x1000);
    assert_eq!(events[0].size, 16);
    assert_eq!(events[1].allocator, AllocatorKind::Free);

    let mut finder = crate::aggregator::HighWatermarkFinder::new();
    for event in &events {
      finder.on_event(event);
    }
    assert_eq!(finder.peak(), 16);
    assert_eq!(finder.peak_index(), 1);

    // The rewritten header carries the final statistics.
    let reader = StreamReader::new(&bytes).expect("reopen");
    assert_eq!(reader.header().stats.n_allocations, 2);
    assert_ne!(reader.header().stats.end_time_ms, 0);
  }

  #[test]
  fn nested_frames_are_emitted_lazily_and_balanced() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());

    crate::shadow::on_frame_call(FrameHandle(1), "f", "app.py", 0, true);
    Tracker::on_allocation(0xa000, 10, AllocatorKind::Malloc);
    crate::shadow::on_frame_call(FrameHandle(2), "g", "app.py", 0, true);
    Tracker::on_allocation(0xb000, 10, AllocatorKind::Malloc);
    Tracker::on_deallocation(0xb000, AllocatorKind::Free);
    crate::shadow::on_frame_return(FrameHandle(2));
    crate::shadow::on_frame_return(FrameHandle(1));
    assert_eq!(crate::shadow::depth(), 0);
    Tracker::destroy();

    let bytes = sink.contents();
    let events = decode_allocations(&bytes);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].stack.len(), 1);
    assert_eq!(events[1].stack.len(), 2);
    assert_eq!(events[2].stack.len(), 2);

    let mut reader = StreamReader::new(&bytes).expect("reopen");
    while reader.next_allocation().expect("decode").is_some() {}
    let names: Vec<String> = events[1]
      .stack
      .iter()
      .map(|frame| {
        reader
          .resolve_frame(*frame)
          .expect("defined frame")
          .function_name
          .to_string()
      })
      .collect();
    assert_eq!(names, vec!["f".to_string(), "g".to_string()]);

    let mut aggregator = crate::aggregator::HighWaterMarkAggregator::new();
    let mut finder = crate::aggregator::HighWatermarkFinder::new();
    for event in &events {
      aggregator.on_event(event);
      finder.on_event(event);
    }
    assert_eq!(finder.peak(), 20);
    assert_eq!(finder.peak_index(), 2);

    // The only survivor is the block allocated under `f`.
    let report = aggregator.report();
    let leaked: Vec<_> = report
      .iter()
      .filter(|(_, stats)| stats.leaked_bytes > 0)
      .collect();
    assert_eq!(leaked.len(), 1);
    let top = reader
      .resolve_frame(leaked[0].0.frame.expect("frame"))
      .expect("defined frame");
    assert_eq!(top.function_name.as_ref(), "f");
  }

  #[test]
  fn line_changes_reemit_the_top_frame() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());

    crate::shadow::on_frame_call(FrameHandle(1), "f", "app.py", 0, true);
    Tracker::on_allocation(0x1, 1, AllocatorKind::Malloc);
    crate::shadow::on_line(7);
    Tracker::on_allocation(0x2, 1, AllocatorKind::Malloc);
    crate::shadow::on_frame_return(FrameHandle(1));
    Tracker::destroy();

    let bytes = sink.contents();
    let events = decode_allocations(&bytes);
    let mut reader = StreamReader::new(&bytes).expect("reopen");
    while reader.next_allocation().expect("decode").is_some() {}

    let first_top = reader
      .resolve_frame(events[0].stack[0])
      .expect("first frame");
    let second_top = reader
      .resolve_frame(events[1].stack[0])
      .expect("second frame");
    assert_eq!(first_top.lineno, 0);
    assert_eq!(second_top.lineno, 7);
    assert_eq!(events[1].stack.len(), 1);
  }

  #[test]
  fn a_new_session_reconstructs_stacks_from_the_interpreter() {
    let _serialized = singleton_lock();

    // First session: plain allocation, no interpreted stack.
    let first_sink = BufferSink::new(true);
    start_tracker(&first_sink, FakeInterpreter::empty());
    Tracker::on_allocation(0x1, 1, AllocatorKind::Malloc);
    Tracker::destroy();

    // Second session: the interpreter reports a running stack. Only the
    // innermost frame of the creating thread is kept.
    let second_sink = BufferSink::new(true);
    start_tracker(
      &second_sink,
      FakeInterpreter::with_current_thread_stack(vec![
        captured(10, "runner", "runner.py", 3),
        captured(11, "main", "main.py", 1),
      ]),
    );
    Tracker::on_allocation(0x2, 2, AllocatorKind::Malloc);
    Tracker::destroy();

    let bytes = second_sink.contents();
    let events = decode_allocations(&bytes);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].address, 0x2);
    assert_eq!(events[0].stack.len(), 1);

    let mut reader = StreamReader::new(&bytes).expect("reopen");
    while reader.next_allocation().expect("decode").is_some() {}
    let frame = reader
      .resolve_frame(events[0].stack[0])
      .expect("reconstructed frame");
    assert_eq!(frame.function_name.as_ref(), "runner");
  }

  #[test]
  fn thread_names_round_trip() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());
    Tracker::register_thread_name("worker");
    Tracker::on_allocation(0x1, 1, AllocatorKind::Malloc);
    Tracker::destroy();

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let event = reader
      .next_allocation()
      .expect("decode")
      .expect("allocation");
    assert_eq!(reader.thread_name(event.thread_id), Some("worker"));
  }

  #[test]
  fn managed_domain_events_keep_their_kind() {
    let _serialized = singleton_lock();

    let sink = BufferSink::new(true);
    start_tracker(&sink, FakeInterpreter::empty());
    Tracker::on_allocation(0x10, 32, AllocatorKind::PymallocObjMalloc);
    Tracker::on_deallocation(0x10, AllocatorKind::PymallocObjFree);
    Tracker::destroy();

    let events = decode_allocations(&sink.contents());
    assert_eq!(events[0].allocator, AllocatorKind::PymallocObjMalloc);
    assert_eq!(events[1].allocator, AllocatorKind::PymallocObjFree);
  }

  #[test]
  fn options_builders_compose() {
    let options = TrackerOptions::default()
      .with_native_traces(true)
      .with_follow_fork(true)
      .with_trace_interpreter_allocators(true)
      .with_memory_interval(Duration::from_millis(25))
      .with_command_line("python script.py");

    assert!(options.native_traces);
    assert!(options.follow_fork);
    assert!(options.trace_interpreter_allocators);
    assert_eq!(options.memory_interval, Duration::from_millis(25));
    assert_eq!(options.command_line.as_deref(), Some("python script.py"));
  }
}
