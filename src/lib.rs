//! In-process memory-allocation tracer for interpreter-hosted programs.
//!
//! The live side interposes the native allocation entry points and the
//! interpreter's managed allocator domains, attributes every event to a
//! blended interpreted/native call stack, and streams compact binary
//! records to a sink. The offline side decodes the stream back into
//! allocation events and feeds them to aggregators.

mod aggregator;
mod codec;
mod frames;
mod interpose;
mod interpreter;
mod native;
mod reader;
mod records;
mod sampler;
mod shadow;
mod sink;
mod tracker;
mod writer;

pub use {
  aggregator::{
    HighWaterMarkAggregator, HighWaterMarkStats, HighWatermarkFinder,
    LocationKey, LocationStats, MultiSnapshotAggregator,
    SnapshotAllocationAggregator, TemporaryAllocationsAggregator,
  },
  frames::RawFrame,
  interpose::{
    ENV_ALLOCATOR_OVERRIDE, ENV_FOLLOW_FORK, ENV_LIVE_PORT,
    ENV_MEMORY_INTERVAL_MS, ENV_NATIVE, ENV_OUTPUT,
    ENV_TRACE_PYTHON_ALLOCATORS,
  },
  interpreter::{
    AllocatorDomain, CapturedFrame, DomainAllocatorTable, FrameCaptureError,
    FrameHandle, Interpreter, NoInterpreter,
  },
  reader::{Allocation, FileReader, ReadError, StreamReader},
  records::{
    AllocatorKind, FrameId, HeaderRecord, ImageSegments, InterpreterAllocator,
    MemoryRecord, Segment, ThreadId, TrackerStats, CURRENT_VERSION, MAGIC,
  },
  shadow::{on_frame_call, on_frame_return, on_line},
  sink::{FileSink, NullSink, Sink, SocketSink},
  tracker::{InitError, Tracker, TrackerOptions},
  writer::RecordWriter,
};
