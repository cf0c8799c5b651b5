use std::collections::HashMap;
use std::sync::Arc;

use crate::records::FrameId;

/// One interpreted frame as it appears on the wire.
///
/// Identity is the whole tuple; two frames for the same function differing
/// only in line number intern separately.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RawFrame {
  pub function_name: Arc<str>,
  pub filename: Arc<str>,
  pub lineno: i32,
  pub is_entry_frame: bool,
}

impl RawFrame {
  #[must_use]
  pub fn new(
    function_name: impl Into<String>,
    filename: impl Into<String>,
    lineno: i32,
    is_entry_frame: bool,
  ) -> Self {
    Self {
      function_name: Arc::<str>::from(function_name.into()),
      filename: Arc::<str>::from(filename.into()),
      lineno,
      is_entry_frame,
    }
  }
}

/// Interns frames into dense, monotonically assigned 32-bit ids.
///
/// Ids start at zero and are never reused; each new frame is reported back
/// to the caller exactly once so its defining record can be serialized.
#[derive(Debug, Default)]
pub struct FrameRegistry {
  by_frame: HashMap<RawFrame, FrameId>,
}

impl FrameRegistry {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the id for `frame`, assigning the next dense id when the frame
  /// has not been seen before. The boolean is true exactly once per frame.
  pub fn intern(&mut self, frame: &RawFrame) -> (FrameId, bool) {
    if let Some(id) = self.by_frame.get(frame) {
      return (*id, false);
    }

    let id = self.by_frame.len() as FrameId;
    self.by_frame.insert(frame.clone(), id);
    (id, true)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_frame.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interns_dense_ids_from_zero() {
    let mut registry = FrameRegistry::new();

    let f = RawFrame::new("f", "app.py", 1, true);
    let g = RawFrame::new("g", "app.py", 7, true);

    assert_eq!(registry.intern(&f), (0, true));
    assert_eq!(registry.intern(&g), (1, true));
    assert_eq!(registry.intern(&f), (0, false));
    assert_eq!(registry.len(), 2);
  }

  #[test]
  fn line_number_is_part_of_identity() {
    let mut registry = FrameRegistry::new();

    let (first, _) = registry.intern(&RawFrame::new("f", "app.py", 1, true));
    let (second, is_new) =
      registry.intern(&RawFrame::new("f", "app.py", 2, true));

    assert_ne!(first, second);
    assert!(is_new);
  }
}
