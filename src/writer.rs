//! Serializes records to a sink under a single mutex.
//!
//! The inner state owns the delta registers, the running statistics, and
//! both interning tables, so one lock acquisition covers serializing a
//! defining record together with the interning that triggered it. Callers
//! that need multi-record atomicity (the memory map, an allocation plus its
//! pending frame pushes) hold the guard from [`RecordWriter::lock`] across
//! the burst.

use std::io;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{self, DeltaState};
use crate::frames::{FrameRegistry, RawFrame};
use crate::native::NativeTraceTree;
use crate::records::{
  AllocatorKind, FrameId, InterpreterAllocator, MemoryRecord, RecordType,
  ThreadId, TrackerStats, CURRENT_VERSION, MAGIC,
};
use crate::sink::Sink;

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn epoch_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as u64)
    .unwrap_or(0)
}

pub struct RecordWriter {
  inner: Mutex<WriterInner>,
}

impl RecordWriter {
  #[must_use]
  pub fn new(
    sink: Box<dyn Sink>,
    native_traces: bool,
    command_line: String,
    python_allocator: InterpreterAllocator,
  ) -> Self {
    let stats = TrackerStats {
      start_time_ms: epoch_ms(),
      ..TrackerStats::default()
    };

    Self {
      inner: Mutex::new(WriterInner {
        sink,
        delta: DeltaState::default(),
        stats,
        native_traces,
        command_line,
        python_allocator,
        pid: std::process::id() as i32,
        last_thread: None,
        scratch: Vec::with_capacity(256),
        frames: FrameRegistry::new(),
        native_tree: NativeTraceTree::new(),
      }),
    }
  }

  /// Acquire the writer lock for a multi-record burst. Every record method
  /// lives on the guard target, so atomicity is exactly the guard scope.
  pub fn lock(&self) -> MutexGuard<'_, WriterInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  /// Writer for a forked child: same configuration, a sink from
  /// `clone_in_child`, and fresh delta/stats/interning state.
  #[must_use]
  pub fn clone_in_child(&self) -> Option<RecordWriter> {
    let inner = self.lock();
    let sink = inner.sink.clone_in_child()?;

    Some(RecordWriter::new(
      sink,
      inner.native_traces,
      inner.command_line.clone(),
      inner.python_allocator,
    ))
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_header(&self, seek_to_start: bool) -> io::Result<()> {
    self.lock().write_header(seek_to_start)
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_trailer(&self) -> io::Result<()> {
    self.lock().write_trailer()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_memory_record(&self, record: MemoryRecord) -> io::Result<()> {
    self.lock().write_memory_record(record)
  }

  #[must_use]
  pub fn stats(&self) -> TrackerStats {
    self.lock().stats
  }
}

pub struct WriterInner {
  sink: Box<dyn Sink>,
  delta: DeltaState,
  stats: TrackerStats,
  native_traces: bool,
  command_line: String,
  python_allocator: InterpreterAllocator,
  pid: i32,
  last_thread: Option<ThreadId>,
  scratch: Vec<u8>,
  frames: FrameRegistry,
  native_tree: NativeTraceTree,
}

impl WriterInner {
  fn commit(&mut self) -> io::Result<()> {
    let scratch = std::mem::take(&mut self.scratch);
    let result = self.sink.write_all(&scratch);
    self.scratch = scratch;
    self.scratch.clear();
    result
  }

  /// Emit a `CONTEXT_SWITCH` if `tid` differs from the last thread a
  /// thread-specific record was attributed to.
  fn ensure_thread(&mut self, tid: ThreadId) -> io::Result<()> {
    if self.last_thread == Some(tid) {
      return Ok(());
    }

    self.scratch.push(RecordType::ContextSwitch.token(0));
    self.scratch.extend_from_slice(&tid.to_le_bytes());
    self.commit()?;

    self.last_thread = Some(tid);
    self.delta.thread_id = tid;
    Ok(())
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn flush(&mut self) -> io::Result<()> {
    self.sink.flush()
  }

  /// Intern `frame`, serializing its `FRAME_INDEX` when first seen.
  ///
  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn register_frame(&mut self, frame: &RawFrame) -> io::Result<FrameId> {
    let (frame_id, is_new) = self.frames.intern(frame);
    if !is_new {
      return Ok(frame_id);
    }

    let flags = u8::from(!frame.is_entry_frame);
    self.scratch.push(RecordType::FrameIndex.token(flags));
    let diff = codec::delta_step(&mut self.delta.frame_id, u64::from(frame_id));
    codec::write_signed_varint(&mut self.scratch, diff);
    codec::write_cstr(&mut self.scratch, &frame.function_name);
    codec::write_cstr(&mut self.scratch, &frame.filename);
    let diff = codec::delta_step(&mut self.delta.lineno, frame.lineno as u64);
    codec::write_signed_varint(&mut self.scratch, diff);
    self.commit()?;

    self.stats.n_frames += 1;
    Ok(frame_id)
  }

  /// Intern a native backtrace (innermost first), serializing a
  /// `NATIVE_TRACE_INDEX` for every node not seen before.
  ///
  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn register_native_trace(&mut self, ips: &[u64]) -> io::Result<u32> {
    let mut tree = std::mem::take(&mut self.native_tree);
    let result =
      tree.intern(ips, |ip, parent| self.write_native_trace_index(ip, parent));
    self.native_tree = tree;
    result
  }

  fn write_native_trace_index(&mut self, ip: u64, parent: u32) -> io::Result<()> {
    self.scratch.push(RecordType::NativeTraceIndex.token(0));
    let diff = codec::delta_step(&mut self.delta.instruction_pointer, ip);
    codec::write_signed_varint(&mut self.scratch, diff);
    let diff =
      codec::delta_step(&mut self.delta.native_frame_id, u64::from(parent));
    codec::write_signed_varint(&mut self.scratch, diff);
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_frame_push(
    &mut self,
    tid: ThreadId,
    frame_id: FrameId,
  ) -> io::Result<()> {
    self.ensure_thread(tid)?;
    self.scratch.push(RecordType::FramePush.token(0));
    let diff = codec::delta_step(&mut self.delta.frame_id, u64::from(frame_id));
    codec::write_signed_varint(&mut self.scratch, diff);
    self.commit()
  }

  /// Pop `count` frames, batching up to 16 per record.
  ///
  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_frame_pop(
    &mut self,
    tid: ThreadId,
    mut count: u32,
  ) -> io::Result<()> {
    if count == 0 {
      return Ok(());
    }

    self.ensure_thread(tid)?;
    while count > 0 {
      let batch = count.min(16);
      self.scratch.push(RecordType::FramePop.token(batch as u8 - 1));
      self.commit()?;
      count -= batch;
    }
    Ok(())
  }

  fn push_allocation_token(&mut self, record_type: RecordType, kind: AllocatorKind) {
    let kind_value = kind as u8;
    if kind_value <= 0x0f {
      self.scratch.push(record_type.token(kind_value));
    } else {
      self.scratch.push(record_type.token(0));
      codec::write_varint(&mut self.scratch, u64::from(kind_value));
    }
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_allocation(
    &mut self,
    tid: ThreadId,
    kind: AllocatorKind,
    address: u64,
    size: u64,
  ) -> io::Result<()> {
    self.ensure_thread(tid)?;
    self.push_allocation_token(RecordType::Allocation, kind);
    let diff = codec::delta_step(&mut self.delta.data_pointer, address);
    codec::write_signed_varint(&mut self.scratch, diff);
    if !kind.is_deallocator() {
      codec::write_varint(&mut self.scratch, size);
    }
    self.commit()?;

    self.stats.n_allocations += 1;
    Ok(())
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_allocation_with_native(
    &mut self,
    tid: ThreadId,
    kind: AllocatorKind,
    address: u64,
    size: u64,
    native_trace_id: u32,
  ) -> io::Result<()> {
    self.ensure_thread(tid)?;
    self.push_allocation_token(RecordType::AllocationWithNative, kind);
    let diff = codec::delta_step(&mut self.delta.data_pointer, address);
    codec::write_signed_varint(&mut self.scratch, diff);
    codec::write_varint(&mut self.scratch, size);
    let diff = codec::delta_step(
      &mut self.delta.native_frame_id,
      u64::from(native_trace_id),
    );
    codec::write_signed_varint(&mut self.scratch, diff);
    self.commit()?;

    self.stats.n_allocations += 1;
    Ok(())
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_memory_record(&mut self, record: MemoryRecord) -> io::Result<()> {
    self.scratch.push(RecordType::MemoryRecord.token(0));
    codec::write_varint(&mut self.scratch, record.rss);
    codec::write_varint(&mut self.scratch, record.ms_since_epoch);
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_memory_map_start(&mut self) -> io::Result<()> {
    self.scratch.push(RecordType::MemoryMapStart.token(0));
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_segment_header(
    &mut self,
    filename: &str,
    n_segments: u64,
    addr: u64,
  ) -> io::Result<()> {
    self.scratch.push(RecordType::SegmentHeader.token(0));
    codec::write_cstr(&mut self.scratch, filename);
    codec::write_varint(&mut self.scratch, n_segments);
    self.scratch.extend_from_slice(&addr.to_le_bytes());
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_segment(&mut self, vaddr: u64, memsz: u64) -> io::Result<()> {
    self.scratch.push(RecordType::Segment.token(0));
    self.scratch.extend_from_slice(&vaddr.to_le_bytes());
    codec::write_varint(&mut self.scratch, memsz);
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_thread_record(
    &mut self,
    tid: ThreadId,
    name: &str,
  ) -> io::Result<()> {
    self.ensure_thread(tid)?;
    self.scratch.push(RecordType::ThreadRecord.token(0));
    codec::write_cstr(&mut self.scratch, name);
    self.commit()
  }

  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_trailer(&mut self) -> io::Result<()> {
    self.scratch.push(RecordType::Trailer.token(0));
    self.commit()?;
    self.flush()
  }

  /// Write the header block. With `seek_to_start` the sink is rewound
  /// first and the header carries final statistics; on a non-seekable sink
  /// the rewrite is skipped and the trailer stays authoritative.
  ///
  /// # Errors
  ///
  /// Returns the sink error, if any.
  pub fn write_header(&mut self, seek_to_start: bool) -> io::Result<()> {
    if seek_to_start {
      if !self.sink.seek_to_start()? {
        return Ok(());
      }
      self.stats.end_time_ms = epoch_ms();
    }

    self.scratch.extend_from_slice(&MAGIC);
    self.scratch.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
    self.scratch.push(u8::from(self.native_traces));
    for field in [
      self.stats.n_allocations,
      self.stats.n_frames,
      self.stats.start_time_ms,
      self.stats.end_time_ms,
    ] {
      self.scratch.extend_from_slice(&field.to_le_bytes());
    }
    let command_line = std::mem::take(&mut self.command_line);
    codec::write_cstr(&mut self.scratch, &command_line);
    self.command_line = command_line;
    self.scratch.extend_from_slice(&self.pid.to_le_bytes());
    self.scratch.push(self.python_allocator as u8);
    self.commit()?;

    if seek_to_start {
      self.flush()?;
    }
    Ok(())
  }

  #[must_use]
  pub fn stats(&self) -> TrackerStats {
    self.stats
  }
}
