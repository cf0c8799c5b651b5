//! Byte channels the writer appends to.
//!
//! A sink is an append-only channel with two optional capabilities: seeking
//! back to the start (used for the final header rewrite) and producing a
//! replacement sink for a forked child. A failed write leaves the sink
//! consistent for close but refuses all further writes.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

pub trait Sink: Send {
  /// Append `bytes` in full; partial writes are never visible to callers.
  ///
  /// # Errors
  ///
  /// Returns the underlying I/O error. After the first failure every
  /// subsequent write fails fast.
  fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

  /// # Errors
  ///
  /// Returns the underlying I/O error.
  fn flush(&mut self) -> io::Result<()>;

  /// Rewind to offset zero. Returns `Ok(false)` when the channel cannot
  /// seek (sockets), in which case the caller skips the header rewrite.
  ///
  /// # Errors
  ///
  /// Returns the underlying I/O error.
  fn seek_to_start(&mut self) -> io::Result<bool>;

  /// A fresh sink for use by a forked child, or `None` when the channel
  /// cannot be reopened in the child (sockets).
  fn clone_in_child(&self) -> Option<Box<dyn Sink>>;
}

fn poisoned() -> io::Error {
  io::Error::new(io::ErrorKind::Other, "sink disabled after earlier failure")
}

/// Buffered, seekable file sink.
pub struct FileSink {
  file: BufWriter<File>,
  path: PathBuf,
  failed: bool,
}

impl FileSink {
  /// Create (truncating) the capture file.
  ///
  /// # Errors
  ///
  /// Returns the error from opening the file.
  pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(&path)?;

    Ok(Self {
      file: BufWriter::new(file),
      path,
      failed: false,
    })
  }
}

impl Sink for FileSink {
  fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
    if self.failed {
      return Err(poisoned());
    }
    if let Err(err) = self.file.write_all(bytes) {
      self.failed = true;
      return Err(err);
    }
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.file.flush()
  }

  fn seek_to_start(&mut self) -> io::Result<bool> {
    self.file.flush()?;
    self.file.get_mut().seek(SeekFrom::Start(0))?;
    Ok(true)
  }

  fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
    // The child gets its own file so both streams stay self-contained.
    let mut path = self.path.clone().into_os_string();
    path.push(format!(".{}", std::process::id()));
    FileSink::create(path)
      .ok()
      .map(|sink| Box::new(sink) as Box<dyn Sink>)
  }
}

/// Unbuffered TCP sink. Binds the given port and blocks until one reader
/// attaches; everything written afterwards streams to that reader.
pub struct SocketSink {
  stream: TcpStream,
  failed: bool,
}

impl SocketSink {
  /// # Errors
  ///
  /// Returns the error from binding or accepting.
  pub fn bind(port: u16) -> io::Result<Self> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let (stream, _peer) = listener.accept()?;
    stream.set_nodelay(true)?;

    Ok(Self {
      stream,
      failed: false,
    })
  }
}

impl Sink for SocketSink {
  fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
    if self.failed {
      return Err(poisoned());
    }
    if let Err(err) = self.stream.write_all(bytes) {
      self.failed = true;
      return Err(err);
    }
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.stream.flush()
  }

  fn seek_to_start(&mut self) -> io::Result<bool> {
    Ok(false)
  }

  fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
    // The reader on the other end belongs to the parent's stream.
    None
  }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Sink for NullSink {
  fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }

  fn seek_to_start(&mut self) -> io::Result<bool> {
    Ok(true)
  }

  fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
    Some(Box::new(NullSink))
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use super::*;
  use std::sync::{Arc, Mutex};

  /// In-memory sink shared with the test so round-trip tests can decode
  /// what the writer produced.
  #[derive(Clone, Default)]
  pub struct BufferSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    seekable: bool,
    position: usize,
  }

  impl BufferSink {
    pub fn new(seekable: bool) -> Self {
      Self {
        bytes: Arc::new(Mutex::new(Vec::new())),
        seekable,
        position: 0,
      }
    }

    pub fn contents(&self) -> Vec<u8> {
      self.bytes.lock().expect("buffer poisoned").clone()
    }
  }

  impl Sink for BufferSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
      let mut guard = self.bytes.lock().expect("buffer poisoned");
      let end = self.position + bytes.len();
      if guard.len() < end {
        guard.resize(end, 0);
      }
      guard[self.position..end].copy_from_slice(bytes);
      self.position = end;
      Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }

    fn seek_to_start(&mut self) -> io::Result<bool> {
      if self.seekable {
        self.position = 0;
      }
      Ok(self.seekable)
    }

    fn clone_in_child(&self) -> Option<Box<dyn Sink>> {
      Some(Box::new(BufferSink::new(self.seekable)))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("memtrace-sink-{}-{name}", std::process::id()));
    path
  }

  #[test]
  fn file_sink_appends_and_seeks() {
    let path = temp_path("append");
    let mut sink = FileSink::create(&path).expect("create sink");

    sink.write_all(b"abcdef").expect("write");
    assert!(sink.seek_to_start().expect("seek"));
    sink.write_all(b"XY").expect("overwrite");
    sink.flush().expect("flush");

    let contents = std::fs::read(&path).expect("read back");
    assert_eq!(contents, b"XYcdef");
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn file_sink_clone_in_child_uses_fresh_file() {
    let path = temp_path("clone");
    let sink = FileSink::create(&path).expect("create sink");

    let mut child = sink.clone_in_child().expect("clonable");
    child.write_all(b"child").expect("child write");
    child.flush().expect("child flush");

    let child_path = format!("{}.{}", path.display(), std::process::id());
    assert_eq!(std::fs::read(&child_path).expect("child file"), b"child");
    std::fs::remove_file(&path).ok();
    std::fs::remove_file(&child_path).ok();
  }

  #[test]
  fn null_sink_accepts_everything() {
    let mut sink = NullSink;
    sink.write_all(b"whatever").expect("write");
    assert!(sink.seek_to_start().expect("seek"));
    assert!(sink.clone_in_child().is_some());
  }

  #[test]
  fn buffer_sink_overwrites_from_start_when_seekable() {
    let mut sink = test_support::BufferSink::new(true);
    sink.write_all(b"0123456789").expect("write");
    assert!(sink.seek_to_start().expect("seek"));
    sink.write_all(b"ab").expect("rewrite");
    assert_eq!(sink.contents(), b"ab23456789");
  }
}
