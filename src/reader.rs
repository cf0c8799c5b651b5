//! Post-mortem decoding of a capture stream.
//!
//! The reader mirrors the writer's delta registers and replays the
//! per-thread shadow stacks, frame table, native-trace tree and image map,
//! yielding fully expanded [`Allocation`] events with the interpreted
//! stack snapshotted at allocation time.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use nohash_hasher::BuildNoHashHasher;

use crate::codec::{delta_apply, CodecError, Decoder, DeltaState};
use crate::frames::RawFrame;
use crate::records::{
  AllocatorKind, FrameId, HeaderRecord, ImageSegments, InterpreterAllocator,
  MemoryRecord, RecordType, Segment, ThreadId, TrackerStats, MAGIC,
  OLDEST_SUPPORTED_VERSION,
};

/// Typed decoding failure, carrying the byte offset of the offending
/// record. No recovery is attempted past the first error.
#[derive(Debug)]
pub enum ReadError {
  Io(io::Error),
  /// The stream does not begin with the expected magic bytes.
  BadMagic,
  /// The header version lies outside the supported range.
  UnsupportedVersion(u16),
  /// The stream ends in the middle of a record.
  Truncated { offset: usize },
  /// A token byte carries an unassigned record type.
  UnknownRecord { offset: usize, token: u8 },
  /// A `FRAME_PUSH` referenced a frame id with no prior `FRAME_INDEX`.
  UndefinedFrame { offset: usize, frame_id: FrameId },
  /// An allocation referenced a native trace with no prior definition.
  UndefinedNativeFrame { offset: usize, trace_id: u32 },
  /// A thread-specific record appeared before any `CONTEXT_SWITCH`.
  MissingContextSwitch { offset: usize },
  /// A string field was not valid UTF-8.
  InvalidString { offset: usize },
  /// A structurally invalid field value.
  Malformed { offset: usize, what: &'static str },
}

impl Display for ReadError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error while reading capture: {err}"),
      Self::BadMagic => write!(f, "not a capture file (bad magic)"),
      Self::UnsupportedVersion(version) => {
        write!(f, "unsupported capture format version {version}")
      }
      Self::Truncated { offset } => {
        write!(f, "record truncated at offset {offset}")
      }
      Self::UnknownRecord { offset, token } => {
        write!(f, "unknown record token {token:#04x} at offset {offset}")
      }
      Self::UndefinedFrame { offset, frame_id } => {
        write!(f, "frame {frame_id} referenced before definition at offset {offset}")
      }
      Self::UndefinedNativeFrame { offset, trace_id } => {
        write!(f, "native trace {trace_id} referenced before definition at offset {offset}")
      }
      Self::MissingContextSwitch { offset } => {
        write!(f, "thread-specific record without a context switch at offset {offset}")
      }
      Self::InvalidString { offset } => {
        write!(f, "invalid string at offset {offset}")
      }
      Self::Malformed { offset, what } => {
        write!(f, "malformed {what} at offset {offset}")
      }
    }
  }
}

impl std::error::Error for ReadError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<io::Error> for ReadError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

/// One reconstructed allocation or deallocation event.
#[derive(Debug, Clone)]
pub struct Allocation {
  pub thread_id: ThreadId,
  pub address: u64,
  pub size: u64,
  pub allocator: AllocatorKind,
  /// Leaf id in the native-trace tree, if native tracking was on.
  pub native_trace_id: Option<u32>,
  /// Interpreted stack at allocation time, outermost frame first.
  pub stack: Vec<FrameId>,
  /// 1-based position among allocation events in the stream.
  pub index: usize,
  /// Image-map epoch; bumps on every `MEMORY_MAP_START`.
  pub native_segment_generation: u32,
}

impl Allocation {
  /// Innermost interpreted frame, if any.
  #[must_use]
  pub fn top_frame(&self) -> Option<FrameId> {
    self.stack.last().copied()
  }
}

/// Streaming decoder over an in-memory capture.
#[derive(Debug)]
pub struct StreamReader<'a> {
  decoder: Decoder<'a>,
  header: HeaderRecord,
  delta: DeltaState,
  current_thread: Option<ThreadId>,
  frames: HashMap<FrameId, RawFrame, BuildNoHashHasher<FrameId>>,
  stacks: HashMap<ThreadId, Vec<FrameId>, BuildNoHashHasher<ThreadId>>,
  thread_names: HashMap<ThreadId, String, BuildNoHashHasher<ThreadId>>,
  native_nodes: Vec<(u64, u32)>,
  images: Vec<ImageSegments>,
  current_image: Option<(ImageSegments, u64)>,
  segment_generation: u32,
  memory_records: Vec<MemoryRecord>,
  counted_allocations: u64,
  counted_frames: u64,
  allocation_index: usize,
  trailer_seen: bool,
  tail_header: Option<HeaderRecord>,
}

fn parse_header(decoder: &mut Decoder<'_>) -> Result<HeaderRecord, ReadError> {
  let start = decoder.position();
  let truncated = |_: CodecError| ReadError::Truncated { offset: start };

  let magic: [u8; 8] = decoder.read_array().map_err(truncated)?;
  if magic != MAGIC {
    return Err(ReadError::BadMagic);
  }

  let version = decoder.read_u16().map_err(truncated)?;
  if !(OLDEST_SUPPORTED_VERSION..=crate::records::CURRENT_VERSION)
    .contains(&version)
  {
    return Err(ReadError::UnsupportedVersion(version));
  }

  let native_traces = decoder.read_u8().map_err(truncated)? != 0;
  let stats = TrackerStats {
    n_allocations: decoder.read_u64().map_err(truncated)?,
    n_frames: decoder.read_u64().map_err(truncated)?,
    start_time_ms: decoder.read_u64().map_err(truncated)?,
    end_time_ms: decoder.read_u64().map_err(truncated)?,
  };

  let command_line = {
    let offset = decoder.position();
    let bytes = decoder
      .read_cstr()
      .map_err(|_| ReadError::Truncated { offset })?;
    String::from_utf8(bytes.to_vec())
      .map_err(|_| ReadError::InvalidString { offset })?
  };

  let pid = i32::from_le_bytes(decoder.read_array().map_err(truncated)?);
  let allocator_byte = decoder.read_u8().map_err(truncated)?;
  let python_allocator = InterpreterAllocator::from_u8(allocator_byte)
    .ok_or(ReadError::Malformed {
      offset: start,
      what: "interpreter allocator",
    })?;

  Ok(HeaderRecord {
    version,
    native_traces,
    stats,
    command_line,
    pid,
    python_allocator,
  })
}

impl<'a> StreamReader<'a> {
  /// Parse the leading header and prepare to decode records.
  ///
  /// # Errors
  ///
  /// Fails on bad magic, an unsupported version, or a truncated header.
  pub fn new(data: &'a [u8]) -> Result<Self, ReadError> {
    let mut decoder = Decoder::new(data);
    let header = parse_header(&mut decoder)?;

    Ok(Self {
      decoder,
      header,
      delta: DeltaState::default(),
      current_thread: None,
      frames: HashMap::default(),
      stacks: HashMap::default(),
      thread_names: HashMap::default(),
      native_nodes: Vec::new(),
      images: Vec::new(),
      current_image: None,
      segment_generation: 0,
      memory_records: Vec::new(),
      counted_allocations: 0,
      counted_frames: 0,
      allocation_index: 0,
      trailer_seen: false,
      tail_header: None,
    })
  }

  #[must_use]
  pub fn header(&self) -> &HeaderRecord {
    &self.header
  }

  /// Decode records until the next allocation event, the trailer, or the
  /// end of the stream.
  ///
  /// # Errors
  ///
  /// Returns a typed error at the offending offset; the reader must not
  /// be advanced further afterwards.
  pub fn next_allocation(&mut self) -> Result<Option<Allocation>, ReadError> {
    loop {
      if self.trailer_seen || self.decoder.is_empty() {
        return Ok(None);
      }

      let offset = self.decoder.position();
      let token = self
        .decoder
        .read_u8()
        .map_err(|_| ReadError::Truncated { offset })?;
      let record_type = RecordType::from_token(token)
        .ok_or(ReadError::UnknownRecord { offset, token })?;
      let flags = token & 0x0f;

      match record_type {
        RecordType::MemoryRecord => {
          let rss = self.read_varint(offset)?;
          let ms_since_epoch = self.read_varint(offset)?;
          self.memory_records.push(MemoryRecord { ms_since_epoch, rss });
        }
        RecordType::ContextSwitch => {
          let tid = u64::from_le_bytes(
            self
              .decoder
              .read_array()
              .map_err(|_| ReadError::Truncated { offset })?,
          );
          self.current_thread = Some(tid);
          self.delta.thread_id = tid;
        }
        RecordType::FrameIndex => {
          let diff = self.read_signed_varint(offset)?;
          let frame_id =
            delta_apply(&mut self.delta.frame_id, diff) as FrameId;
          let function_name = self.read_string(offset)?;
          let filename = self.read_string(offset)?;
          let diff = self.read_signed_varint(offset)?;
          let lineno = delta_apply(&mut self.delta.lineno, diff) as i32;

          self.frames.insert(
            frame_id,
            RawFrame::new(function_name, filename, lineno, flags & 1 == 0),
          );
          self.counted_frames += 1;
        }
        RecordType::FramePush => {
          let tid = self.require_thread(offset)?;
          let diff = self.read_signed_varint(offset)?;
          let frame_id =
            delta_apply(&mut self.delta.frame_id, diff) as FrameId;
          if !self.frames.contains_key(&frame_id) {
            return Err(ReadError::UndefinedFrame { offset, frame_id });
          }
          self.stacks.entry(tid).or_default().push(frame_id);
        }
        RecordType::FramePop => {
          let tid = self.require_thread(offset)?;
          let count = usize::from(flags) + 1;
          let stack = self.stacks.entry(tid).or_default();
          let depth = stack.len();
          stack.truncate(depth.saturating_sub(count));
        }
        RecordType::Allocation => {
          let kind = self.read_allocator_kind(offset, flags)?;
          let diff = self.read_signed_varint(offset)?;
          let address = delta_apply(&mut self.delta.data_pointer, diff);
          let size = if kind.is_deallocator() {
            0
          } else {
            self.read_varint(offset)?
          };
          return self
            .finish_allocation(offset, kind, address, size, None)
            .map(Some);
        }
        RecordType::AllocationWithNative => {
          let kind = self.read_allocator_kind(offset, flags)?;
          let diff = self.read_signed_varint(offset)?;
          let address = delta_apply(&mut self.delta.data_pointer, diff);
          let size = self.read_varint(offset)?;
          let diff = self.read_signed_varint(offset)?;
          let trace_id =
            delta_apply(&mut self.delta.native_frame_id, diff) as u32;
          if u64::from(trace_id) > self.native_nodes.len() as u64 {
            return Err(ReadError::UndefinedNativeFrame { offset, trace_id });
          }
          let native = (trace_id != 0).then_some(trace_id);
          return self
            .finish_allocation(offset, kind, address, size, native)
            .map(Some);
        }
        RecordType::NativeTraceIndex => {
          let diff = self.read_signed_varint(offset)?;
          let ip = delta_apply(&mut self.delta.instruction_pointer, diff);
          let diff = self.read_signed_varint(offset)?;
          let parent =
            delta_apply(&mut self.delta.native_frame_id, diff) as u32;
          if u64::from(parent) > self.native_nodes.len() as u64 {
            return Err(ReadError::UndefinedNativeFrame {
              offset,
              trace_id: parent,
            });
          }
          self.native_nodes.push((ip, parent));
        }
        RecordType::MemoryMapStart => {
          self.images.clear();
          self.current_image = None;
          self.segment_generation += 1;
        }
        RecordType::SegmentHeader => {
          let filename = self.read_string(offset)?;
          let n_segments = self.read_varint(offset)?;
          let addr = u64::from_le_bytes(
            self
              .decoder
              .read_array()
              .map_err(|_| ReadError::Truncated { offset })?,
          );

          self.flush_current_image();
          let image = ImageSegments {
            filename,
            addr,
            segments: Vec::new(),
          };
          if n_segments == 0 {
            self.images.push(image);
          } else {
            self.current_image = Some((image, n_segments));
          }
        }
        RecordType::Segment => {
          let vaddr = u64::from_le_bytes(
            self
              .decoder
              .read_array()
              .map_err(|_| ReadError::Truncated { offset })?,
          );
          let memsz = self.read_varint(offset)?;

          let Some((image, remaining)) = self.current_image.as_mut() else {
            return Err(ReadError::Malformed {
              offset,
              what: "segment outside a segment header",
            });
          };
          image.segments.push(Segment { vaddr, memsz });
          *remaining -= 1;
          if *remaining == 0 {
            self.flush_current_image();
          }
        }
        RecordType::ThreadRecord => {
          let tid = self.require_thread(offset)?;
          let name = self.read_string(offset)?;
          self.thread_names.insert(tid, name);
        }
        RecordType::Trailer => {
          self.trailer_seen = true;
          if !self.decoder.is_empty() {
            self.tail_header = Some(parse_header(&mut self.decoder)?);
          }
          return Ok(None);
        }
      }
    }
  }

  fn finish_allocation(
    &mut self,
    offset: usize,
    kind: AllocatorKind,
    address: u64,
    size: u64,
    native_trace_id: Option<u32>,
  ) -> Result<Allocation, ReadError> {
    let thread_id = self.require_thread(offset)?;
    self.counted_allocations += 1;
    self.allocation_index += 1;

    Ok(Allocation {
      thread_id,
      address,
      size,
      allocator: kind,
      native_trace_id,
      stack: self.stacks.get(&thread_id).cloned().unwrap_or_default(),
      index: self.allocation_index,
      native_segment_generation: self.segment_generation,
    })
  }

  fn flush_current_image(&mut self) {
    if let Some((image, _remaining)) = self.current_image.take() {
      self.images.push(image);
    }
  }

  fn require_thread(&self, offset: usize) -> Result<ThreadId, ReadError> {
    self
      .current_thread
      .ok_or(ReadError::MissingContextSwitch { offset })
  }

  fn read_varint(&mut self, offset: usize) -> Result<u64, ReadError> {
    self.decoder.read_varint().map_err(|err| match err {
      CodecError::Eof => ReadError::Truncated { offset },
      CodecError::Overflow => ReadError::Malformed {
        offset,
        what: "varint",
      },
    })
  }

  fn read_signed_varint(&mut self, offset: usize) -> Result<i64, ReadError> {
    self.decoder.read_signed_varint().map_err(|err| match err {
      CodecError::Eof => ReadError::Truncated { offset },
      CodecError::Overflow => ReadError::Malformed {
        offset,
        what: "varint",
      },
    })
  }

  fn read_string(&mut self, offset: usize) -> Result<String, ReadError> {
    let bytes = self
      .decoder
      .read_cstr()
      .map_err(|_| ReadError::Truncated { offset })?;
    String::from_utf8(bytes.to_vec())
      .map_err(|_| ReadError::InvalidString { offset })
  }

  fn read_allocator_kind(
    &mut self,
    offset: usize,
    flags: u8,
  ) -> Result<AllocatorKind, ReadError> {
    let value = if flags == 0 {
      let extended = self.read_varint(offset)?;
      u8::try_from(extended).map_err(|_| ReadError::Malformed {
        offset,
        what: "allocator kind",
      })?
    } else {
      flags
    };

    AllocatorKind::from_u8(value).ok_or(ReadError::Malformed {
      offset,
      what: "allocator kind",
    })
  }

  /// Frame metadata for a previously defined id.
  #[must_use]
  pub fn resolve_frame(&self, frame_id: FrameId) -> Option<&RawFrame> {
    self.frames.get(&frame_id)
  }

  /// Instruction pointers of a native trace, innermost first.
  #[must_use]
  pub fn resolve_native_trace(&self, trace_id: u32) -> Vec<u64> {
    let mut ips = Vec::new();
    let mut current = trace_id;
    while current != 0 {
      let Some(&(ip, parent)) = self.native_nodes.get(current as usize - 1)
      else {
        break;
      };
      ips.push(ip);
      current = parent;
    }
    ips
  }

  #[must_use]
  pub fn thread_name(&self, tid: ThreadId) -> Option<&str> {
    self.thread_names.get(&tid).map(String::as_str)
  }

  #[must_use]
  pub fn images(&self) -> &[ImageSegments] {
    &self.images
  }

  #[must_use]
  pub fn memory_records(&self) -> &[MemoryRecord] {
    &self.memory_records
  }

  #[must_use]
  pub fn trailer_seen(&self) -> bool {
    self.trailer_seen
  }

  /// Final statistics: the tail header when present, the rewritten leading
  /// header when it carries an end time, and otherwise totals counted
  /// while decoding (the stream lost its writer before shutdown).
  #[must_use]
  pub fn final_stats(&self) -> TrackerStats {
    if let Some(tail) = &self.tail_header {
      return tail.stats;
    }
    if self.header.stats.end_time_ms != 0 {
      return self.header.stats;
    }
    TrackerStats {
      n_allocations: self.counted_allocations,
      n_frames: self.counted_frames,
      start_time_ms: self.header.stats.start_time_ms,
      end_time_ms: 0,
    }
  }
}

/// Memory-maps a capture file and hands out stream readers over it.
pub struct FileReader {
  mmap: Mmap,
}

impl FileReader {
  /// Open and validate a capture file. Magic and version problems are
  /// reported here, before any record decoding.
  ///
  /// # Errors
  ///
  /// Fails on I/O errors and on an invalid or unsupported header.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and lives as long as the reader.
    let mmap = unsafe { Mmap::map(&file)? };

    StreamReader::new(&mmap)?;
    Ok(Self { mmap })
  }

  /// Start decoding from the beginning of the file.
  ///
  /// # Errors
  ///
  /// Propagates header validation errors.
  pub fn stream(&self) -> Result<StreamReader<'_>, ReadError> {
    StreamReader::new(&self.mmap)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::records::CURRENT_VERSION;
  use crate::sink::test_support::BufferSink;
  use crate::writer::RecordWriter;

  fn writer_over(sink: &BufferSink, native: bool) -> RecordWriter {
    RecordWriter::new(
      Box::new(sink.clone()),
      native,
      "python app.py".to_string(),
      InterpreterAllocator::Pymalloc,
    )
  }

  fn drain(reader: &mut StreamReader<'_>) -> Vec<Allocation> {
    let mut events = Vec::new();
    while let Some(event) = reader.next_allocation().expect("decode") {
      events.push(event);
    }
    events
  }

  #[test]
  fn rejects_bad_magic_before_anything_else() {
    let err = StreamReader::new(b"notmagic-and-more-bytes").unwrap_err();
    assert!(matches!(err, ReadError::BadMagic));
  }

  #[test]
  fn rejects_unsupported_versions_at_open() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&(CURRENT_VERSION + 1).to_le_bytes());
    bytes.extend_from_slice(&[0u8; 64]);

    let err = StreamReader::new(&bytes).unwrap_err();
    assert!(matches!(err, ReadError::UnsupportedVersion(_)));
  }

  #[test]
  fn round_trips_a_simple_malloc_free_pair() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner
        .write_allocation(7, AllocatorKind::Malloc, 0x1000, 16)
        .expect("malloc");
      inner
        .write_allocation(7, AllocatorKind::Free, 0x1000, 0)
        .expect("free");
    }
    writer.write_trailer().expect("trailer");

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    assert_eq!(reader.header().command_line, "python app.py");

    let events = drain(&mut reader);
    assert_eq!(events.len(), 2);

    assert_eq!(events[0].thread_id, 7);
    assert_eq!(events[0].address, 0x1000);
    assert_eq!(events[0].size, 16);
    assert_eq!(events[0].allocator, AllocatorKind::Malloc);
    assert_eq!(events[0].index, 1);

    assert_eq!(events[1].allocator, AllocatorKind::Free);
    assert_eq!(events[1].address, 0x1000);
    assert_eq!(events[1].size, 0);
    assert!(reader.trailer_seen());
  }

  #[test]
  fn attaches_the_interpreted_stack_at_allocation_time() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      let f = RawFrame::new("f", "app.py", 1, true);
      let g = RawFrame::new("g", "app.py", 9, true);

      let f_id = inner.register_frame(&f).expect("intern f");
      inner.write_frame_push(1, f_id).expect("push f");
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0xa000, 10)
        .expect("alloc in f");

      let g_id = inner.register_frame(&g).expect("intern g");
      inner.write_frame_push(1, g_id).expect("push g");
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0xb000, 10)
        .expect("alloc in g");
      inner
        .write_allocation(1, AllocatorKind::Free, 0xb000, 0)
        .expect("free");
      inner.write_frame_pop(1, 1).expect("pop g");
      inner.write_frame_pop(1, 1).expect("pop f");
    }
    writer.write_trailer().expect("trailer");

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let events = drain(&mut reader);

    assert_eq!(events[0].stack, vec![0]);
    assert_eq!(events[1].stack, vec![0, 1]);
    assert_eq!(events[2].stack, vec![0, 1]);

    let top = reader.resolve_frame(events[1].top_frame().unwrap()).unwrap();
    assert_eq!(top.function_name.as_ref(), "g");
    assert_eq!(top.lineno, 9);
  }

  #[test]
  fn frame_push_requires_a_prior_definition() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      // A push for an id the stream never defined.
      inner.write_frame_push(1, 3).expect("push");
    }

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let err = reader.next_allocation().unwrap_err();
    assert!(matches!(
      err,
      ReadError::UndefinedFrame { frame_id: 3, .. }
    ));
  }

  #[test]
  fn thread_specific_records_need_a_context_switch() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");

    // Hand-craft a FRAME_POP with no preceding CONTEXT_SWITCH.
    let mut bytes = sink.contents();
    bytes.push(RecordType::FramePop.token(0));

    let mut reader = StreamReader::new(&bytes).expect("open");
    let err = reader.next_allocation().unwrap_err();
    assert!(matches!(err, ReadError::MissingContextSwitch { .. }));
  }

  #[test]
  fn native_allocations_resolve_their_traces() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, true);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      let trace_id = inner
        .register_native_trace(&[0x111, 0x222, 0x333])
        .expect("trace");
      inner
        .write_allocation_with_native(9, AllocatorKind::Mmap, 0x7000, 4096, trace_id)
        .expect("alloc");
    }
    writer.write_trailer().expect("trailer");

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let events = drain(&mut reader);

    assert_eq!(events.len(), 1);
    let trace_id = events[0].native_trace_id.expect("native trace");
    assert_eq!(reader.resolve_native_trace(trace_id), vec![0x111, 0x222, 0x333]);
  }

  #[test]
  fn native_references_need_a_prior_definition() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, true);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      // References trace id 5 without any NATIVE_TRACE_INDEX records.
      inner
        .write_allocation_with_native(1, AllocatorKind::Malloc, 0x10, 8, 5)
        .expect("alloc");
    }

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let err = reader.next_allocation().unwrap_err();
    assert!(matches!(
      err,
      ReadError::UndefinedNativeFrame { trace_id: 5, .. }
    ));
  }

  #[test]
  fn image_map_restarts_bump_the_generation() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, true);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner.write_memory_map_start().expect("map start");
      inner
        .write_segment_header("libfoo.so", 2, 0x4000_0000)
        .expect("segment header");
      inner.write_segment(0x0, 0x1000).expect("segment");
      inner.write_segment(0x2000, 0x800).expect("segment");
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x1, 1)
        .expect("alloc");

      inner.write_memory_map_start().expect("map restart");
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x2, 1)
        .expect("alloc");
    }
    writer.write_trailer().expect("trailer");

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");

    let first = reader.next_allocation().expect("decode").expect("first");
    assert_eq!(first.native_segment_generation, 1);
    assert_eq!(reader.images().len(), 1);
    assert_eq!(reader.images()[0].filename, "libfoo.so");
    assert_eq!(reader.images()[0].segments.len(), 2);

    let second = reader.next_allocation().expect("decode").expect("second");
    assert_eq!(second.native_segment_generation, 2);
    assert!(reader.images().is_empty());
  }

  #[test]
  fn thread_names_attach_to_the_current_thread() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner.write_thread_record(5, "worker-0").expect("name");
      inner
        .write_allocation(5, AllocatorKind::Malloc, 0x1, 1)
        .expect("alloc");
    }

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    drain(&mut reader);
    assert_eq!(reader.thread_name(5), Some("worker-0"));
  }

  #[test]
  fn missing_trailer_falls_back_to_counted_stats() {
    let sink = BufferSink::new(false);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x1, 8)
        .expect("alloc");
    }
    // No trailer, no rewrite: the writer lost its sink mid-run.

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    drain(&mut reader);

    let stats = reader.final_stats();
    assert_eq!(stats.n_allocations, 1);
    assert_eq!(stats.end_time_ms, 0);
  }

  #[test]
  fn non_seekable_shutdown_keeps_trailer_and_counted_stats() {
    let sink = BufferSink::new(false);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x1, 8)
        .expect("alloc");
      inner
        .write_allocation(1, AllocatorKind::Free, 0x1, 0)
        .expect("free");
    }
    writer.write_trailer().expect("trailer");
    writer.write_header(true).expect("skipped rewrite");

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let events = drain(&mut reader);

    assert_eq!(events.len(), 2);
    assert!(reader.trailer_seen());
    // The leading header still has its startup stats; counted totals win.
    assert_eq!(reader.final_stats().n_allocations, 2);
  }

  #[test]
  fn truncated_records_report_their_offset() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x1000, 16)
        .expect("alloc");
    }

    let bytes = sink.contents();
    // Chop the final record in half.
    let cut = bytes.len() - 2;
    let mut reader = StreamReader::new(&bytes[..cut]).expect("open");

    // The context switch decodes; the allocation is cut mid-payload.
    let err = reader.next_allocation().unwrap_err();
    assert!(matches!(err, ReadError::Truncated { .. }));
  }

  #[test]
  fn twenty_pops_arrive_as_sixteen_plus_four() {
    let sink = BufferSink::new(true);
    let writer = writer_over(&sink, false);
    writer.write_header(false).expect("header");
    {
      let mut inner = writer.lock();
      let frame = RawFrame::new("f", "app.py", 1, true);
      let frame_id = inner.register_frame(&frame).expect("intern");
      for _ in 0..20 {
        inner.write_frame_push(1, frame_id).expect("push");
      }
      inner.write_frame_pop(1, 20).expect("pops");
      inner
        .write_allocation(1, AllocatorKind::Malloc, 0x1, 1)
        .expect("alloc");
    }

    let bytes = sink.contents();
    let mut reader = StreamReader::new(&bytes).expect("open");
    let events = drain(&mut reader);

    // All twenty frames were popped before the allocation.
    assert_eq!(events[0].stack.len(), 0);
  }
}
