//! Native-frame capture and the prefix tree that interns whole backtraces.

use std::collections::HashMap;
use std::io;

use smallvec::SmallVec;

/// Deepest native stack the capture path will record.
pub const MAX_NATIVE_DEPTH: usize = 128;

/// Scratch buffer for one captured backtrace; inline for the common case.
pub type NativeStackBuffer = SmallVec<[u64; 32]>;

/// Capture the current native backtrace as raw instruction pointers,
/// innermost first, skipping `skip` frames so the tracer's own plumbing
/// does not show up in traces.
#[must_use]
pub fn capture_native_stack(skip: usize) -> NativeStackBuffer {
  let mut ips = NativeStackBuffer::new();
  let mut remaining_skip = skip;

  backtrace::trace(|frame| {
    if remaining_skip > 0 {
      remaining_skip -= 1;
      return true;
    }

    ips.push(frame.ip() as u64);
    ips.len() < MAX_NATIVE_DEPTH
  });

  ips
}

/// Prefix tree of native stacks. Each node is an `(ip, parent)` pair with a
/// dense id assigned on first insertion; id 0 is the empty trace. A whole
/// stack is identified by its leaf node.
#[derive(Debug, Default)]
pub struct NativeTraceTree {
  nodes: HashMap<(u64, u32), u32>,
}

impl NativeTraceTree {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Intern `ips` (innermost first) and return the leaf id. `emit` is
  /// called once per newly created node with `(ip, parent_id)` so the
  /// defining record lands in the stream before any reference to the node.
  ///
  /// # Errors
  ///
  /// Propagates the first error from `emit`; the node is not retained so a
  /// retry re-emits it.
  pub fn intern<F>(&mut self, ips: &[u64], mut emit: F) -> io::Result<u32>
  where
    F: FnMut(u64, u32) -> io::Result<()>,
  {
    let mut parent = 0u32;

    for &ip in ips.iter().rev() {
      match self.nodes.get(&(ip, parent)) {
        Some(&id) => parent = id,
        None => {
          let id = self.nodes.len() as u32 + 1;
          emit(ip, parent)?;
          self.nodes.insert((ip, parent), id);
          parent = id;
        }
      }
    }

    Ok(parent)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn collect_intern(
    tree: &mut NativeTraceTree,
    ips: &[u64],
  ) -> (u32, Vec<(u64, u32)>) {
    let mut emitted = Vec::new();
    let id = tree
      .intern(ips, |ip, parent| {
        emitted.push((ip, parent));
        Ok(())
      })
      .expect("intern");
    (id, emitted)
  }

  #[test]
  fn shared_prefixes_share_nodes() {
    let mut tree = NativeTraceTree::new();

    // Stacks are innermost-first: `main -> f` and `main -> g`.
    let (f_id, emitted_f) = collect_intern(&mut tree, &[0xf0, 0x100]);
    let (g_id, emitted_g) = collect_intern(&mut tree, &[0xa0, 0x100]);

    assert_eq!(emitted_f, vec![(0x100, 0), (0xf0, 1)]);
    // Only the diverging leaf is new the second time.
    assert_eq!(emitted_g.len(), 1);
    assert_ne!(f_id, g_id);
    assert_eq!(tree.len(), 3);
  }

  #[test]
  fn repeated_stack_emits_nothing_new() {
    let mut tree = NativeTraceTree::new();

    let (first, _) = collect_intern(&mut tree, &[1, 2, 3]);
    let (second, emitted) = collect_intern(&mut tree, &[1, 2, 3]);

    assert_eq!(first, second);
    assert!(emitted.is_empty());
  }

  #[test]
  fn empty_stack_is_the_null_trace() {
    let mut tree = NativeTraceTree::new();
    let (id, emitted) = collect_intern(&mut tree, &[]);
    assert_eq!(id, 0);
    assert!(emitted.is_empty());
  }

  #[test]
  fn failed_emission_is_retried() {
    let mut tree = NativeTraceTree::new();

    let result = tree.intern(&[7], |_ip, _parent| {
      Err(io::Error::new(io::ErrorKind::Other, "sink down"))
    });
    assert!(result.is_err());
    assert!(tree.is_empty());

    let (id, emitted) = collect_intern(&mut tree, &[7]);
    assert_eq!(id, 1);
    assert_eq!(emitted, vec![(7, 0)]);
  }

  #[test]
  fn capture_returns_frames() {
    let ips = capture_native_stack(0);
    assert!(!ips.is_empty());
  }
}
