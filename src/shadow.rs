//! Per-thread shadow of the interpreted call stack.
//!
//! Frames are not written to the stream when pushed. Pops and pushes are
//! batched until the thread's next allocation event, so stack churn that
//! brackets no allocation never reaches the sink. Each entry remembers
//! whether it has been emitted; a line-number change on an already-emitted
//! top entry schedules one pop and a re-emission with the new line.
//!
//! Every operation reaches the thread-local state through
//! `LocalKey::try_with`: once the thread's destructor has run, all shadow
//! operations degrade to no-ops for the remainder of teardown instead of
//! re-creating storage whose destructor has already fired.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

use crate::frames::RawFrame;
use crate::interpose::RecursionGuard;
use crate::interpreter::{CapturedFrame, FrameHandle};
use crate::tracker::{os_thread_id, Tracker};

/// A shadow-stack entry not yet reflected in the output stream has
/// `emitted == false`.
#[derive(Debug, Clone)]
pub(crate) struct ShadowFrame {
  pub handle: FrameHandle,
  pub frame: RawFrame,
  pub emitted: bool,
}

impl ShadowFrame {
  pub(crate) fn from_captured(captured: CapturedFrame, native: bool) -> Self {
    Self {
      handle: captured.handle,
      frame: RawFrame::new(
        captured.function_name,
        captured.filename,
        captured.lineno,
        // With native tracking off every frame counts as an entry frame;
        // the distinction only matters when native frames get zipped in.
        !native || captured.is_entry_frame,
      ),
      emitted: false,
    }
  }
}

#[derive(Debug, Default)]
struct ThreadShadow {
  stack: Vec<ShadowFrame>,
  pending_pops: u32,
  generation: u32,
}

static NATIVE_TRACKING: AtomicBool = AtomicBool::new(false);
static GENERATION: AtomicU32 = AtomicU32::new(0);

thread_local! {
  static SHADOW: RefCell<ThreadShadow> = RefCell::new(ThreadShadow::default());
}

fn initial_stacks() -> &'static DashMap<u64, Vec<ShadowFrame>> {
  static DEPOSITS: OnceLock<DashMap<u64, Vec<ShadowFrame>>> = OnceLock::new();
  DEPOSITS.get_or_init(DashMap::new)
}

fn with_shadow<F, R>(f: F) -> Option<R>
where
  F: FnOnce(&mut ThreadShadow) -> R,
{
  SHADOW.try_with(|cell| f(&mut cell.borrow_mut())).ok()
}

pub(crate) fn set_native_tracking(enabled: bool) {
  NATIVE_TRACKING.store(enabled, Ordering::Release);
}

pub(crate) fn native_tracking() -> bool {
  NATIVE_TRACKING.load(Ordering::Acquire)
}

/// Publish freshly captured stacks for every interpreted thread and bump
/// the tracker generation. Shadows that observe the new generation drop
/// whatever they hold and reload from their deposit, so a stopped and
/// restarted tracker never carries stale entries across the gap.
pub(crate) fn deposit_initial_stacks(stacks: Vec<(u64, Vec<ShadowFrame>)>) {
  let deposits = initial_stacks();
  deposits.clear();
  for (tid, stack) in stacks {
    deposits.insert(tid, stack);
  }
  // Entries must be visible before any thread observes the new generation.
  GENERATION.fetch_add(1, Ordering::Release);
}

pub(crate) fn clear_initial_stacks() {
  initial_stacks().clear();
}

impl ThreadShadow {
  fn reload_if_stale(&mut self) {
    let generation = GENERATION.load(Ordering::Acquire);
    if self.generation == generation {
      return;
    }

    // A new tracker captured this thread's stack for us; trust it over
    // anything we were holding.
    self.stack.clear();
    self.pending_pops = 0;
    self.generation = generation;

    if let Some((_tid, deposit)) = initial_stacks().remove(&os_thread_id()) {
      for frame in deposit.into_iter().rev() {
        self.stack.push(frame);
      }
    }
  }

  fn set_top_lineno(&mut self, lineno: i32) {
    let Some(top) = self.stack.last_mut() else {
      return;
    };
    if top.frame.lineno == lineno {
      return;
    }

    top.frame.lineno = lineno;
    if top.emitted {
      // Re-emit under the new line number at the next flush.
      self.pending_pops += 1;
      top.emitted = false;
    }
  }
}

/// Profile-hook entry for a frame call. `call_lineno` is the caller's line
/// at the call site and updates the caller's shadow entry first.
pub fn on_frame_call(
  handle: FrameHandle,
  function_name: &str,
  filename: &str,
  call_lineno: i32,
  is_entry_frame: bool,
) {
  if !Tracker::is_active() {
    return;
  }
  let _guard = RecursionGuard::new();

  let is_entry = !native_tracking() || is_entry_frame;
  let _ = with_shadow(|shadow| {
    shadow.reload_if_stale();
    shadow.set_top_lineno(call_lineno);
    shadow.stack.push(ShadowFrame {
      handle,
      frame: RawFrame::new(function_name, filename, 0, is_entry),
      emitted: false,
    });
  });
}

/// Profile-hook entry for a frame return.
pub fn on_frame_return(handle: FrameHandle) {
  if !Tracker::is_active() {
    return;
  }
  let _guard = RecursionGuard::new();

  let _ = with_shadow(|shadow| {
    shadow.reload_if_stale();

    // A return for a frame we never saw pushed (for example a profiled
    // native extension call discarded when the stack was reloaded) is
    // ignored rather than unbalancing the shadow.
    let matches = shadow
      .stack
      .last()
      .is_some_and(|top| top.handle == handle);
    if !matches {
      return;
    }

    let top = shadow.stack.pop().expect("checked non-empty");
    if top.emitted {
      shadow.pending_pops += 1;
    }

    if shadow.stack.is_empty() && shadow.pending_pops > 0 {
      // Last chance before a clean thread exit: balance the stream now.
      let pops = std::mem::take(&mut shadow.pending_pops);
      let _ = Tracker::with_active(|tracker| {
        let _ = tracker.pop_frames(pops);
      });
    }
  });
}

/// Profile-hook entry for a line event on the current frame.
pub fn on_line(lineno: i32) {
  if !Tracker::is_active() {
    return;
  }
  let _guard = RecursionGuard::new();

  let _ = with_shadow(|shadow| {
    shadow.reload_if_stale();
    shadow.set_top_lineno(lineno);
  });
}

/// Reflect this thread's pending pops and unemitted pushes into the
/// stream. Called by the tracker before each allocation record so the
/// attributed stack is current. The caller holds the recursion guard.
pub(crate) fn flush_pending(tracker: &Tracker) {
  let _ = with_shadow(|shadow| {
    shadow.reload_if_stale();

    let pops = std::mem::take(&mut shadow.pending_pops);
    if pops > 0 && !tracker.pop_frames(pops) {
      return;
    }

    let first_unemitted = shadow
      .stack
      .iter()
      .rposition(|entry| entry.emitted)
      .map_or(0, |last_emitted| last_emitted + 1);

    for entry in &mut shadow.stack[first_unemitted..] {
      if !tracker.push_frame(&entry.frame) {
        break;
      }
      entry.emitted = true;
    }
  });
}

#[cfg(test)]
pub(crate) fn depth() -> usize {
  with_shadow(|shadow| shadow.stack.len()).unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
  let _ = with_shadow(|shadow| {
    shadow.stack.clear();
    shadow.pending_pops = 0;
    shadow.generation = GENERATION.load(Ordering::Acquire);
  });
  clear_initial_stacks();
}
