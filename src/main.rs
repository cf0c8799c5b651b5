//! Thin command-line front-end over the tracing core and the readers.

use std::collections::HashMap;
use std::io::Write;
use std::process::Command;

use serde::Serialize;

use memtrace::{
  Allocation, AllocatorKind, FileReader, HighWaterMarkAggregator,
  HighWatermarkFinder, ReadError, SnapshotAllocationAggregator, StreamReader,
  TemporaryAllocationsAggregator, ENV_FOLLOW_FORK, ENV_LIVE_PORT,
  ENV_MEMORY_INTERVAL_MS, ENV_NATIVE, ENV_OUTPUT,
  ENV_TRACE_PYTHON_ALLOCATORS,
};

const USAGE: &str = "\
usage: memtrace <command> [options]

commands:
  run [--native] [--follow-fork] [--trace-python-allocators]
      [--memory-interval MS] [-o FILE | --live PORT] CMD [ARGS...]
  flamegraph INPUT [-o OUT] [--leaks] [--temporary-allocations N]
      [--split-threads]
  tree INPUT
  summary INPUT
  stats INPUT
  table INPUT
  transform INPUT
";

fn main() {
  pretty_env_logger::init();
  std::process::exit(dispatch());
}

fn dispatch() -> i32 {
  let args: Vec<String> = std::env::args().skip(1).collect();
  let Some((command, rest)) = args.split_first() else {
    eprint!("{USAGE}");
    return 2;
  };

  match command.as_str() {
    "run" => cmd_run(rest),
    "flamegraph" => cmd_flamegraph(rest),
    "tree" => single_input(rest, cmd_tree),
    "summary" => single_input(rest, cmd_summary),
    "stats" => single_input(rest, cmd_stats),
    "table" => single_input(rest, cmd_table),
    "transform" => single_input(rest, cmd_transform),
    "-h" | "--help" => {
      print!("{USAGE}");
      0
    }
    other => {
      eprintln!("unknown command: {other}");
      eprint!("{USAGE}");
      2
    }
  }
}

fn cmd_run(args: &[String]) -> i32 {
  let mut output: Option<String> = None;
  let mut live_port: Option<String> = None;
  let mut native = false;
  let mut follow_fork = false;
  let mut trace_python_allocators = false;
  let mut memory_interval: Option<String> = None;

  let mut iter = args.iter();
  let command = loop {
    let Some(arg) = iter.next() else {
      eprintln!("run: missing command");
      return 2;
    };
    match arg.as_str() {
      "--native" => native = true,
      "--follow-fork" => follow_fork = true,
      "--trace-python-allocators" => trace_python_allocators = true,
      "--memory-interval" => match iter.next() {
        Some(ms) if ms.parse::<u64>().is_ok() => {
          memory_interval = Some(ms.clone());
        }
        _ => {
          eprintln!("run: --memory-interval needs a millisecond value");
          return 2;
        }
      },
      "-o" => match iter.next() {
        Some(path) => output = Some(path.clone()),
        None => {
          eprintln!("run: -o needs a file path");
          return 2;
        }
      },
      "--live" => match iter.next() {
        Some(port) if port.parse::<u16>().is_ok() => {
          live_port = Some(port.clone());
        }
        _ => {
          eprintln!("run: --live needs a port number");
          return 2;
        }
      },
      flag if flag.starts_with('-') => {
        eprintln!("run: unknown option {flag}");
        return 2;
      }
      _ => break arg,
    }
  };
  let command_args: Vec<&String> = iter.collect();

  if output.is_some() && live_port.is_some() {
    eprintln!("run: -o and --live are mutually exclusive");
    return 2;
  }

  let preload = std::env::var("MEMTRACE_PRELOAD")
    .unwrap_or_else(|_| "libmemtrace.so".to_string());

  let mut child = Command::new(command);
  child.args(command_args).env("LD_PRELOAD", preload);
  if let Some(port) = live_port {
    child.env(ENV_LIVE_PORT, port);
  } else {
    child.env(ENV_OUTPUT, output.unwrap_or_else(|| "memtrace.out".into()));
  }
  if native {
    child.env(ENV_NATIVE, "1");
  }
  if follow_fork {
    child.env(ENV_FOLLOW_FORK, "1");
  }
  if trace_python_allocators {
    child.env(ENV_TRACE_PYTHON_ALLOCATORS, "1");
  }
  if let Some(ms) = memory_interval {
    child.env(ENV_MEMORY_INTERVAL_MS, ms);
  }

  match child.status() {
    Ok(status) => status.code().unwrap_or(1),
    Err(err) => {
      eprintln!("run: cannot start {command}: {err}");
      1
    }
  }
}

fn single_input(args: &[String], command: fn(&FileReader) -> i32) -> i32 {
  let [input] = args else {
    eprint!("{USAGE}");
    return 2;
  };

  match FileReader::open(input) {
    Ok(reader) => command(&reader),
    Err(err) => {
      eprintln!("cannot open {input}: {err}");
      1
    }
  }
}

/// Feed every allocation event to `f`. A stream cut mid-record is treated
/// as an end of capture (the writer was deactivated mid-write).
fn drive<F>(stream: &mut StreamReader<'_>, mut f: F) -> Result<(), ReadError>
where
  F: FnMut(&Allocation),
{
  loop {
    match stream.next_allocation() {
      Ok(Some(event)) => f(&event),
      Ok(None) => return Ok(()),
      Err(err @ ReadError::Truncated { .. }) => {
        log::warn!("capture ends mid-record: {err}");
        return Ok(());
      }
      Err(err) => return Err(err),
    }
  }
}

fn frame_label(stream: &StreamReader<'_>, frame: memtrace::FrameId) -> String {
  match stream.resolve_frame(frame) {
    Some(raw) => {
      format!("{} ({}:{})", raw.function_name, raw.filename, raw.lineno)
    }
    None => "<unknown>".to_string(),
  }
}

fn stack_label(stream: &StreamReader<'_>, event: &Allocation) -> String {
  if event.stack.is_empty() {
    return "<no interpreted stack>".to_string();
  }
  event
    .stack
    .iter()
    .map(|frame| frame_label(stream, *frame))
    .collect::<Vec<_>>()
    .join(";")
}

fn cmd_flamegraph(args: &[String]) -> i32 {
  let mut input: Option<&String> = None;
  let mut output: Option<&String> = None;
  let mut leaks = false;
  let mut temporary: Option<usize> = None;
  let mut split_threads = false;

  let mut iter = args.iter();
  while let Some(arg) = iter.next() {
    match arg.as_str() {
      "--leaks" => leaks = true,
      "--split-threads" => split_threads = true,
      "--temporary-allocations" => match iter.next() {
        Some(n) => match n.parse() {
          Ok(n) => temporary = Some(n),
          Err(_) => {
            eprintln!("flamegraph: --temporary-allocations needs a count");
            return 2;
          }
        },
        None => {
          eprintln!("flamegraph: --temporary-allocations needs a count");
          return 2;
        }
      },
      "-o" => output = iter.next(),
      flag if flag.starts_with('-') => {
        eprintln!("flamegraph: unknown option {flag}");
        return 2;
      }
      _ if input.is_none() => input = Some(arg),
      _ => {
        eprintln!("flamegraph: too many inputs");
        return 2;
      }
    }
  }
  let Some(input) = input else {
    eprint!("{USAGE}");
    return 2;
  };

  let reader = match FileReader::open(input) {
    Ok(reader) => reader,
    Err(err) => {
      eprintln!("cannot open {input}: {err}");
      return 1;
    }
  };

  let result = collect_flamegraph_rows(&reader, leaks, temporary);
  let rows = match result {
    Ok(rows) => rows,
    Err(err) => {
      eprintln!("cannot read {input}: {err}");
      return 1;
    }
  };

  let mut folded = String::new();
  let mut totals: HashMap<String, u64> = HashMap::new();
  for (thread_id, label, bytes) in rows {
    let line = if split_threads {
      format!("thread {thread_id:#x};{label}")
    } else {
      label
    };
    *totals.entry(line).or_default() += bytes;
  }
  let mut lines: Vec<_> = totals.into_iter().collect();
  lines.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
  for (line, bytes) in lines {
    folded.push_str(&format!("{line} {bytes}\n"));
  }

  match output {
    Some(path) => {
      if let Err(err) = std::fs::write(path, folded) {
        eprintln!("cannot write {path}: {err}");
        return 1;
      }
    }
    None => print!("{folded}"),
  }
  0
}

/// Folded-stack rows for the flamegraph: the allocations live at the
/// high-water mark by default, the leaked set with `--leaks`, or the
/// temporary set when a window is given.
fn collect_flamegraph_rows(
  reader: &FileReader,
  leaks: bool,
  temporary: Option<usize>,
) -> Result<Vec<(u64, String, u64)>, ReadError> {
  if let Some(window) = temporary {
    let mut stream = reader.stream()?;
    let mut aggregator = TemporaryAllocationsAggregator::new(window);
    drive(&mut stream, |event| aggregator.on_event(event))?;
    return Ok(
      aggregator
        .temporary_allocations()
        .iter()
        .map(|event| {
          (event.thread_id, stack_label(&stream, event), event.size)
        })
        .collect(),
    );
  }

  let stop_index = if leaks {
    usize::MAX
  } else {
    let mut stream = reader.stream()?;
    let mut finder = HighWatermarkFinder::new();
    drive(&mut stream, |event| finder.on_event(event))?;
    finder.peak_index()
  };

  let mut stream = reader.stream()?;
  let mut aggregator = SnapshotAllocationAggregator::new();
  drive(&mut stream, |event| {
    if event.index <= stop_index {
      aggregator.on_event(event);
    }
  })?;

  Ok(
    aggregator
      .live_allocations()
      .map(|event| (event.thread_id, stack_label(&stream, event), event.size))
      .collect(),
  )
}

fn cmd_summary(reader: &FileReader) -> i32 {
  let mut stream = match reader.stream() {
    Ok(stream) => stream,
    Err(err) => {
      eprintln!("cannot read capture: {err}");
      return 1;
    }
  };

  let mut aggregator = HighWaterMarkAggregator::new();
  let mut finder = HighWatermarkFinder::new();
  let driven = drive(&mut stream, |event| {
    aggregator.on_event(event);
    finder.on_event(event);
  });
  if let Err(err) = driven {
    eprintln!("cannot read capture: {err}");
    return 1;
  }

  println!("command line: {}", stream.header().command_line);
  println!("peak heap size: {} bytes", finder.peak());

  let mut rows: Vec<_> = aggregator.report().into_iter().collect();
  rows.sort_by(|a, b| b.1.peak_bytes.cmp(&a.1.peak_bytes));

  println!("{:<48} {:>14} {:>14}", "location", "peak bytes", "leaked bytes");
  for (key, stats) in rows.iter().take(20) {
    let location = key
      .frame
      .map(|frame| frame_label(&stream, frame))
      .unwrap_or_else(|| format!("<{}>", key.allocator.name()));
    println!(
      "{:<48} {:>14} {:>14}",
      location, stats.peak_bytes, stats.leaked_bytes
    );
  }
  0
}

#[derive(Serialize)]
struct StatsReport<'a> {
  command_line: &'a str,
  pid: i32,
  native_traces: bool,
  n_allocations: u64,
  n_frames: u64,
  start_time_ms: u64,
  end_time_ms: u64,
  peak_heap_bytes: u64,
  memory_samples: usize,
  allocations_by_kind: HashMap<&'static str, u64>,
}

fn cmd_stats(reader: &FileReader) -> i32 {
  let mut stream = match reader.stream() {
    Ok(stream) => stream,
    Err(err) => {
      eprintln!("cannot read capture: {err}");
      return 1;
    }
  };

  let mut finder = HighWatermarkFinder::new();
  let mut by_kind: HashMap<&'static str, u64> = HashMap::new();
  let driven = drive(&mut stream, |event| {
    finder.on_event(event);
    *by_kind.entry(event.allocator.name()).or_default() += 1;
  });
  if let Err(err) = driven {
    eprintln!("cannot read capture: {err}");
    return 1;
  }

  let stats = stream.final_stats();
  let report = StatsReport {
    command_line: &stream.header().command_line,
    pid: stream.header().pid,
    native_traces: stream.header().native_traces,
    n_allocations: stats.n_allocations,
    n_frames: stats.n_frames,
    start_time_ms: stats.start_time_ms,
    end_time_ms: stats.end_time_ms,
    peak_heap_bytes: finder.peak(),
    memory_samples: stream.memory_records().len(),
    allocations_by_kind: by_kind,
  };

  let stdout = std::io::stdout();
  if serde_json::to_writer_pretty(stdout.lock(), &report).is_err() {
    return 1;
  }
  println!();
  0
}

fn cmd_table(reader: &FileReader) -> i32 {
  let mut stream = match reader.stream() {
    Ok(stream) => stream,
    Err(err) => {
      eprintln!("cannot read capture: {err}");
      return 1;
    }
  };

  let mut aggregator = SnapshotAllocationAggregator::new();
  if let Err(err) = drive(&mut stream, |event| aggregator.on_event(event)) {
    eprintln!("cannot read capture: {err}");
    return 1;
  }

  let mut rows: Vec<&Allocation> = aggregator.live_allocations().collect();
  rows.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.index.cmp(&b.index)));

  println!(
    "{:>18} {:>10} {:<18} {:<10} location",
    "address", "size", "allocator", "thread"
  );
  for event in rows {
    let location = event
      .top_frame()
      .map(|frame| frame_label(&stream, frame))
      .unwrap_or_else(|| "<native>".to_string());
    println!(
      "{:>#18x} {:>10} {:<18} {:<10} {}",
      event.address,
      event.size,
      event.allocator.name(),
      stream
        .thread_name(event.thread_id)
        .unwrap_or(&format!("{:#x}", event.thread_id))
        .to_string(),
      location
    );
  }
  0
}

#[derive(Default)]
struct TreeNode {
  bytes: u64,
  count: u64,
  children: HashMap<memtrace::FrameId, TreeNode>,
}

fn print_tree(
  stream: &StreamReader<'_>,
  node: &TreeNode,
  frame: Option<memtrace::FrameId>,
  depth: usize,
) {
  if let Some(frame) = frame {
    println!(
      "{:indent$}{} [{} bytes in {} blocks]",
      "",
      frame_label(stream, frame),
      node.bytes,
      node.count,
      indent = depth * 2
    );
  }

  let mut children: Vec<_> = node.children.iter().collect();
  children.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes));
  for (child_frame, child) in children {
    print_tree(stream, child, Some(*child_frame), depth + 1);
  }
}

fn cmd_tree(reader: &FileReader) -> i32 {
  let mut stream = match reader.stream() {
    Ok(stream) => stream,
    Err(err) => {
      eprintln!("cannot read capture: {err}");
      return 1;
    }
  };

  let mut aggregator = SnapshotAllocationAggregator::new();
  if let Err(err) = drive(&mut stream, |event| aggregator.on_event(event)) {
    eprintln!("cannot read capture: {err}");
    return 1;
  }

  let mut root = TreeNode::default();
  for event in aggregator.live_allocations() {
    let mut node = &mut root;
    node.bytes += event.size;
    node.count += 1;
    for frame in &event.stack {
      node = node.children.entry(*frame).or_default();
      node.bytes += event.size;
      node.count += 1;
    }
  }

  println!("live allocations: {} bytes", root.bytes);
  print_tree(&stream, &root, None, 0);
  0
}

#[derive(Serialize)]
struct EventExport<'a> {
  thread_id: u64,
  address: u64,
  size: u64,
  allocator: AllocatorKind,
  stack: Vec<&'a str>,
  native_stack: Vec<u64>,
}

fn cmd_transform(reader: &FileReader) -> i32 {
  let mut stream = match reader.stream() {
    Ok(stream) => stream,
    Err(err) => {
      eprintln!("cannot read capture: {err}");
      return 1;
    }
  };

  // Buffer events so frame metadata (which may be defined later in the
  // stream for other threads) is resolved against the full table.
  let mut events = Vec::new();
  if let Err(err) = drive(&mut stream, |event| events.push(event.clone())) {
    eprintln!("cannot read capture: {err}");
    return 1;
  }

  let stdout = std::io::stdout();
  let mut out = stdout.lock();
  for event in &events {
    let export = EventExport {
      thread_id: event.thread_id,
      address: event.address,
      size: event.size,
      allocator: event.allocator,
      stack: event
        .stack
        .iter()
        .filter_map(|frame| stream.resolve_frame(*frame))
        .map(|raw| raw.function_name.as_ref())
        .collect(),
      native_stack: event
        .native_trace_id
        .map(|trace| stream.resolve_native_trace(trace))
        .unwrap_or_default(),
    };
    if serde_json::to_writer(&mut out, &export).is_err() {
      return 1;
    }
    if out.write_all(b"\n").is_err() {
      return 1;
    }
  }
  0
}
