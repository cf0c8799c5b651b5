//! Background thread that periodically samples the process resident-set
//! size and appends a `MEMORY_RECORD` through the shared writer.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::interpose::RecursionGuard;
use crate::records::MemoryRecord;
use crate::tracker::Tracker;
use crate::writer::{epoch_ms, RecordWriter};

struct SamplerShared {
  stop: Mutex<bool>,
  wakeup: Condvar,
}

pub(crate) struct MemorySampler {
  shared: Arc<SamplerShared>,
  handle: Option<JoinHandle<()>>,
}

impl MemorySampler {
  /// Spawn the sampling thread.
  ///
  /// # Errors
  ///
  /// Fails when the resident-set source cannot be opened.
  pub(crate) fn start(
    writer: Arc<RecordWriter>,
    interval: Duration,
  ) -> io::Result<Self> {
    let mut statm = open_statm()?;
    let shared = Arc::new(SamplerShared {
      stop: Mutex::new(false),
      wakeup: Condvar::new(),
    });

    let thread_shared = Arc::clone(&shared);
    let handle = std::thread::Builder::new()
      .name("memtrace-sampler".to_string())
      .spawn(move || {
        // Nothing this thread allocates is ever traced.
        RecursionGuard::force(true);

        loop {
          {
            let guard = thread_shared.stop.lock().unwrap_or_else(
              std::sync::PoisonError::into_inner,
            );
            let (guard, _timeout) = thread_shared
              .wakeup
              .wait_timeout_while(guard, interval, |stop| !*stop)
              .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *guard {
              break;
            }
          }

          let rss = match read_rss(&mut statm) {
            Ok(rss) if rss > 0 => rss,
            Ok(_) | Err(_) => {
              log::error!("cannot sample resident set size, deactivating tracking");
              Tracker::deactivate();
              break;
            }
          };

          let record = MemoryRecord {
            ms_since_epoch: epoch_ms(),
            rss,
          };
          if let Err(err) = writer.write_memory_record(record) {
            log::error!("failed to write memory record, deactivating tracking: {err}");
            Tracker::deactivate();
            break;
          }
        }
      })?;

    Ok(Self {
      shared,
      handle: Some(handle),
    })
  }

  /// Wake the thread, tell it to exit, and join it.
  pub(crate) fn stop(&mut self) {
    {
      let mut stop = self
        .shared
        .stop
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
      *stop = true;
      self.shared.wakeup.notify_one();
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

#[cfg(target_os = "linux")]
fn open_statm() -> io::Result<File> {
  File::open("/proc/self/statm")
}

#[cfg(not(target_os = "linux"))]
fn open_statm() -> io::Result<File> {
  File::open("/dev/null")
}

/// Resident-set size in bytes: field two of `/proc/self/statm` times the
/// page size.
#[cfg(target_os = "linux")]
fn read_rss(statm: &mut File) -> io::Result<u64> {
  let mut buffer = [0u8; 128];
  statm.seek(SeekFrom::Start(0))?;
  let filled = statm.read(&mut buffer)?;
  let text = std::str::from_utf8(&buffer[..filled])
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "statm not utf-8"))?;

  let resident_pages: u64 = text
    .split_whitespace()
    .nth(1)
    .and_then(|field| field.parse().ok())
    .ok_or_else(|| {
      io::Error::new(io::ErrorKind::InvalidData, "malformed statm contents")
    })?;

  Ok(resident_pages * page_size())
}

#[cfg(not(target_os = "linux"))]
fn read_rss(_statm: &mut File) -> io::Result<u64> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    "resident set sampling requires /proc",
  ))
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 {
    size as u64
  } else {
    4096
  }
}
