use serde::Serialize;

/// First eight bytes of every capture file. Byte-exact; the reader refuses
/// anything else before decoding further.
pub const MAGIC: [u8; 8] = *b"memray\0\0";

/// Version stamped into headers written by this crate.
pub const CURRENT_VERSION: u16 = 1;

/// Oldest header version the reader still understands.
pub const OLDEST_SUPPORTED_VERSION: u16 = 1;

/// Dense identifier assigned to an interned frame on first sight.
pub type FrameId = u32;

/// OS-level thread identifier as captured by the writer.
pub type ThreadId = u64;

/// One byte of record type (high nibble) and type-specific flags (low
/// nibble). Records are not self-delimiting; the decoder must follow the
/// payload layout for each type.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
  MemoryRecord = 1,
  ContextSwitch = 2,
  FrameIndex = 3,
  FramePush = 4,
  FramePop = 5,
  Allocation = 6,
  AllocationWithNative = 7,
  NativeTraceIndex = 8,
  MemoryMapStart = 9,
  SegmentHeader = 10,
  Segment = 11,
  ThreadRecord = 12,
  Trailer = 13,
}

impl RecordType {
  #[must_use]
  pub fn from_token(token: u8) -> Option<Self> {
    match token >> 4 {
      1 => Some(Self::MemoryRecord),
      2 => Some(Self::ContextSwitch),
      3 => Some(Self::FrameIndex),
      4 => Some(Self::FramePush),
      5 => Some(Self::FramePop),
      6 => Some(Self::Allocation),
      7 => Some(Self::AllocationWithNative),
      8 => Some(Self::NativeTraceIndex),
      9 => Some(Self::MemoryMapStart),
      10 => Some(Self::SegmentHeader),
      11 => Some(Self::Segment),
      12 => Some(Self::ThreadRecord),
      13 => Some(Self::Trailer),
      _ => None,
    }
  }

  #[must_use]
  pub fn token(self, flags: u8) -> u8 {
    debug_assert!(flags <= 0x0f);
    ((self as u8) << 4) | (flags & 0x0f)
  }
}

/// Which allocation entry point produced an event.
///
/// Discriminants are part of the wire contract. Kinds up to 15 ride in the
/// token's flags nibble; the managed-domain kinds use the `flags = 0` escape
/// with the kind as a leading varint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
  Malloc = 1,
  Free = 2,
  Calloc = 3,
  Realloc = 4,
  PosixMemalign = 5,
  AlignedAlloc = 6,
  Memalign = 7,
  Valloc = 8,
  Pvalloc = 9,
  Mmap = 10,
  Munmap = 11,
  PymallocRawMalloc = 12,
  PymallocRawCalloc = 13,
  PymallocRawRealloc = 14,
  PymallocRawFree = 15,
  PymallocMemMalloc = 16,
  PymallocMemCalloc = 17,
  PymallocMemRealloc = 18,
  PymallocMemFree = 19,
  PymallocObjMalloc = 20,
  PymallocObjCalloc = 21,
  PymallocObjRealloc = 22,
  PymallocObjFree = 23,
}

impl AllocatorKind {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(Self::Malloc),
      2 => Some(Self::Free),
      3 => Some(Self::Calloc),
      4 => Some(Self::Realloc),
      5 => Some(Self::PosixMemalign),
      6 => Some(Self::AlignedAlloc),
      7 => Some(Self::Memalign),
      8 => Some(Self::Valloc),
      9 => Some(Self::Pvalloc),
      10 => Some(Self::Mmap),
      11 => Some(Self::Munmap),
      12 => Some(Self::PymallocRawMalloc),
      13 => Some(Self::PymallocRawCalloc),
      14 => Some(Self::PymallocRawRealloc),
      15 => Some(Self::PymallocRawFree),
      16 => Some(Self::PymallocMemMalloc),
      17 => Some(Self::PymallocMemCalloc),
      18 => Some(Self::PymallocMemRealloc),
      19 => Some(Self::PymallocMemFree),
      20 => Some(Self::PymallocObjMalloc),
      21 => Some(Self::PymallocObjCalloc),
      22 => Some(Self::PymallocObjRealloc),
      23 => Some(Self::PymallocObjFree),
      _ => None,
    }
  }

  /// Deallocator records carry no size on the wire.
  #[must_use]
  pub fn is_deallocator(self) -> bool {
    matches!(
      self,
      Self::Free
        | Self::Munmap
        | Self::PymallocRawFree
        | Self::PymallocMemFree
        | Self::PymallocObjFree
    )
  }

  /// The realloc family replaces whatever was live at its address.
  #[must_use]
  pub fn is_realloc(self) -> bool {
    matches!(
      self,
      Self::Realloc
        | Self::PymallocRawRealloc
        | Self::PymallocMemRealloc
        | Self::PymallocObjRealloc
    )
  }

  #[must_use]
  pub fn name(self) -> &'static str {
    match self {
      Self::Malloc => "malloc",
      Self::Free => "free",
      Self::Calloc => "calloc",
      Self::Realloc => "realloc",
      Self::PosixMemalign => "posix_memalign",
      Self::AlignedAlloc => "aligned_alloc",
      Self::Memalign => "memalign",
      Self::Valloc => "valloc",
      Self::Pvalloc => "pvalloc",
      Self::Mmap => "mmap",
      Self::Munmap => "munmap",
      Self::PymallocRawMalloc => "pymalloc_raw_malloc",
      Self::PymallocRawCalloc => "pymalloc_raw_calloc",
      Self::PymallocRawRealloc => "pymalloc_raw_realloc",
      Self::PymallocRawFree => "pymalloc_raw_free",
      Self::PymallocMemMalloc => "pymalloc_mem_malloc",
      Self::PymallocMemCalloc => "pymalloc_mem_calloc",
      Self::PymallocMemRealloc => "pymalloc_mem_realloc",
      Self::PymallocMemFree => "pymalloc_mem_free",
      Self::PymallocObjMalloc => "pymalloc_obj_malloc",
      Self::PymallocObjCalloc => "pymalloc_obj_calloc",
      Self::PymallocObjRealloc => "pymalloc_obj_realloc",
      Self::PymallocObjFree => "pymalloc_obj_free",
    }
  }
}

impl Serialize for AllocatorKind {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(self.name())
  }
}

/// Which allocator the interpreter itself was configured with when tracing
/// started. Informational; recorded in the header.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum InterpreterAllocator {
  Pymalloc = 1,
  PymallocDebug = 2,
  Malloc = 3,
  Other = 4,
}

impl InterpreterAllocator {
  #[must_use]
  pub fn from_name(name: &str) -> Self {
    match name {
      "pymalloc" => Self::Pymalloc,
      "pymalloc_debug" => Self::PymallocDebug,
      "malloc" => Self::Malloc,
      _ => Self::Other,
    }
  }

  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(Self::Pymalloc),
      2 => Some(Self::PymallocDebug),
      3 => Some(Self::Malloc),
      4 => Some(Self::Other),
      _ => None,
    }
  }
}

/// Running totals maintained by the writer and rewritten into the final
/// header on shutdown. The initial header carries `end_time_ms = 0`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct TrackerStats {
  pub n_allocations: u64,
  pub n_frames: u64,
  pub start_time_ms: u64,
  pub end_time_ms: u64,
}

/// Decoded form of the fixed-layout block at the start (and optionally the
/// end) of every capture file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeaderRecord {
  pub version: u16,
  pub native_traces: bool,
  pub stats: TrackerStats,
  pub command_line: String,
  pub pid: i32,
  pub python_allocator: InterpreterAllocator,
}

/// Resident-set sample taken by the background sampler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct MemoryRecord {
  pub ms_since_epoch: u64,
  pub rss: u64,
}

/// One PT_LOAD-style segment of a loaded image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Segment {
  pub vaddr: u64,
  pub memsz: u64,
}

/// Snapshot entry for one dynamically linked image; the full set is
/// rewritten every time the loader set changes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ImageSegments {
  pub filename: String,
  pub addr: u64,
  pub segments: Vec<Segment>,
}
