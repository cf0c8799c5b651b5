//! Consumers of the decoded allocation-event sequence.
//!
//! All aggregators are single-pass: feed every event in stream order
//! through `on_event` and query afterwards (or, for snapshots, between
//! events). Deallocations are attributed to the location that allocated
//! the address, not to the location of the free.

use std::collections::{HashMap, VecDeque};

use nohash_hasher::BuildNoHashHasher;

use crate::reader::Allocation;
use crate::records::{AllocatorKind, FrameId, ThreadId};

type AddressMap<V> = HashMap<u64, V, BuildNoHashHasher<u64>>;

/// Grouping key for reported allocations.
///
/// The segment generation keeps unresolved native frames from different
/// loader epochs apart: the same native id before and after a `dlopen`
/// names different code.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct LocationKey {
  pub thread_id: ThreadId,
  pub frame: Option<FrameId>,
  pub native_trace_id: u32,
  pub native_segment_generation: u32,
  pub allocator: AllocatorKind,
}

impl LocationKey {
  #[must_use]
  pub fn of(event: &Allocation) -> Self {
    Self {
      thread_id: event.thread_id,
      frame: event.top_frame(),
      native_trace_id: event.native_trace_id.unwrap_or(0),
      native_segment_generation: event.native_segment_generation,
      allocator: event.allocator,
    }
  }
}

/// Single pass over the stream that finds where the heap peaked.
///
/// The reported index is the 1-based count of allocation events processed
/// when the peak was first reached.
#[derive(Debug, Default)]
pub struct HighWatermarkFinder {
  live: AddressMap<u64>,
  current_heap: u64,
  peak: u64,
  peak_index: usize,
  processed: usize,
}

impl HighWatermarkFinder {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_event(&mut self, event: &Allocation) {
    self.processed += 1;

    if event.allocator.is_deallocator() {
      if let Some(size) = self.live.remove(&event.address) {
        self.current_heap -= size;
      }
      return;
    }

    // The live map is single-valued per address: an allocation landing on
    // a tracked address (in-place realloc, recycled block) replaces it.
    if let Some(old) = self.live.insert(event.address, event.size) {
      self.current_heap -= old;
    }
    self.current_heap += event.size;

    if self.current_heap > self.peak {
      self.peak = self.current_heap;
      self.peak_index = self.processed;
    }
  }

  #[must_use]
  pub fn peak(&self) -> u64 {
    self.peak
  }

  #[must_use]
  pub fn peak_index(&self) -> usize {
    self.peak_index
  }

  #[must_use]
  pub fn current_heap(&self) -> u64 {
    self.current_heap
  }
}

/// Detects allocator churn: an allocation is temporary when it is freed
/// while still among the most recent `max_items` allocations of its
/// thread.
#[derive(Debug)]
pub struct TemporaryAllocationsAggregator {
  max_items: usize,
  recent: HashMap<ThreadId, VecDeque<Allocation>, BuildNoHashHasher<ThreadId>>,
  temporary: Vec<Allocation>,
}

impl TemporaryAllocationsAggregator {
  #[must_use]
  pub fn new(max_items: usize) -> Self {
    Self {
      max_items: max_items.max(1),
      recent: HashMap::default(),
      temporary: Vec::new(),
    }
  }

  pub fn on_event(&mut self, event: &Allocation) {
    if event.allocator.is_deallocator() {
      if let Some(window) = self.recent.get_mut(&event.thread_id) {
        if let Some(position) = window
          .iter()
          .rposition(|candidate| candidate.address == event.address)
        {
          let allocation = window.remove(position).expect("position in range");
          self.temporary.push(allocation);
        }
      }
      return;
    }

    let window = self.recent.entry(event.thread_id).or_default();
    window.push_back(event.clone());
    if window.len() > self.max_items {
      window.pop_front();
    }
  }

  /// Allocations that proved temporary, in the order they were freed.
  #[must_use]
  pub fn temporary_allocations(&self) -> &[Allocation] {
    &self.temporary
  }
}

/// Per-location statistics for a set of live allocations.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LocationStats {
  pub total_bytes: u64,
  pub allocation_count: u64,
}

/// Tracks the multiset of live allocations so a caller can snapshot it at
/// any event index.
#[derive(Debug, Default)]
pub struct SnapshotAllocationAggregator {
  live: AddressMap<Allocation>,
}

impl SnapshotAllocationAggregator {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_event(&mut self, event: &Allocation) {
    if event.allocator.is_deallocator() {
      self.live.remove(&event.address);
    } else {
      self.live.insert(event.address, event.clone());
    }
  }

  /// Live allocations grouped by location key.
  #[must_use]
  pub fn snapshot(&self) -> HashMap<LocationKey, LocationStats> {
    let mut grouped: HashMap<LocationKey, LocationStats> = HashMap::new();
    for event in self.live.values() {
      let stats = grouped.entry(LocationKey::of(event)).or_default();
      stats.total_bytes += event.size;
      stats.allocation_count += 1;
    }
    grouped
  }

  pub fn live_allocations(&self) -> impl Iterator<Item = &Allocation> {
    self.live.values()
  }
}

/// Per-location usage while hunting the global peak. Folding is lazy: a
/// key copies its current usage into its at-peak usage the first time it
/// is touched after a new peak, since nothing about it can have changed
/// in between.
#[derive(Debug, Clone, Copy, Default)]
struct KeyUsage {
  current_bytes: u64,
  current_count: u64,
  peak_bytes: u64,
  peak_count: u64,
  seen_peak: u64,
}

impl KeyUsage {
  fn fold_to(&mut self, peak_epoch: u64) {
    if self.seen_peak < peak_epoch {
      self.peak_bytes = self.current_bytes;
      self.peak_count = self.current_count;
      self.seen_peak = peak_epoch;
    }
  }
}

/// Reported usage for one location key.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct HighWaterMarkStats {
  /// Bytes and blocks this location had live at the process-wide peak.
  pub peak_bytes: u64,
  pub peak_count: u64,
  /// Bytes and blocks still live at the end of the stream.
  pub leaked_bytes: u64,
  pub leaked_count: u64,
}

/// Single-pass structure that keeps, per location key, the allocations
/// live at the high-water mark alongside what survived to the end.
#[derive(Debug, Default)]
pub struct HighWaterMarkAggregator {
  live: AddressMap<(LocationKey, u64)>,
  usage: HashMap<LocationKey, KeyUsage>,
  current_total: u64,
  peak_total: u64,
  peak_epoch: u64,
}

impl HighWaterMarkAggregator {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  fn release(&mut self, key: LocationKey, size: u64) {
    let usage = self.usage.entry(key).or_default();
    usage.fold_to(self.peak_epoch);
    usage.current_bytes -= size;
    usage.current_count -= 1;
    self.current_total -= size;
  }

  pub fn on_event(&mut self, event: &Allocation) {
    if event.allocator.is_deallocator() {
      if let Some((key, size)) = self.live.remove(&event.address) {
        self.release(key, size);
      }
      return;
    }

    if let Some((old_key, old_size)) = self.live.remove(&event.address) {
      self.release(old_key, old_size);
    }

    let key = LocationKey::of(event);
    self.live.insert(event.address, (key, event.size));
    self.current_total += event.size;

    let peak_epoch = self.peak_epoch;
    let usage = self.usage.entry(key).or_default();
    usage.fold_to(peak_epoch);
    usage.current_bytes += event.size;
    usage.current_count += 1;

    if self.current_total > self.peak_total {
      self.peak_total = self.current_total;
      self.peak_epoch += 1;
      // This event defines the new peak, so its key is exact; every other
      // key folds lazily on its next touch or at reporting time.
      let usage = self.usage.get_mut(&key).expect("just inserted");
      usage.peak_bytes = usage.current_bytes;
      usage.peak_count = usage.current_count;
      usage.seen_peak = self.peak_epoch;
    }
  }

  #[must_use]
  pub fn peak_total(&self) -> u64 {
    self.peak_total
  }

  /// Final per-location report. Keys untouched since the last peak carry
  /// their current usage as their at-peak usage.
  #[must_use]
  pub fn report(&self) -> HashMap<LocationKey, HighWaterMarkStats> {
    self
      .usage
      .iter()
      .map(|(key, usage)| {
        let mut folded = *usage;
        folded.fold_to(self.peak_epoch);
        (
          *key,
          HighWaterMarkStats {
            peak_bytes: folded.peak_bytes,
            peak_count: folded.peak_count,
            leaked_bytes: usage.current_bytes,
            leaked_count: usage.current_count,
          },
        )
      })
      .collect()
  }
}

/// Captures arbitrary snapshots while the stream is being read and
/// reports, per location key, how usage moved between consecutive
/// snapshots.
#[derive(Debug, Default)]
pub struct MultiSnapshotAggregator {
  live: AddressMap<(LocationKey, u64)>,
  current: HashMap<LocationKey, LocationStats>,
  snapshots: Vec<HashMap<LocationKey, LocationStats>>,
}

impl MultiSnapshotAggregator {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_event(&mut self, event: &Allocation) {
    if event.allocator.is_deallocator() {
      if let Some((key, size)) = self.live.remove(&event.address) {
        let stats = self.current.entry(key).or_default();
        stats.total_bytes -= size;
        stats.allocation_count -= 1;
      }
      return;
    }

    if let Some((old_key, old_size)) = self.live.remove(&event.address) {
      let stats = self.current.entry(old_key).or_default();
      stats.total_bytes -= old_size;
      stats.allocation_count -= 1;
    }

    let key = LocationKey::of(event);
    self.live.insert(event.address, (key, event.size));
    let stats = self.current.entry(key).or_default();
    stats.total_bytes += event.size;
    stats.allocation_count += 1;
  }

  /// Record the current live usage as the next snapshot.
  pub fn capture(&mut self) {
    self.snapshots.push(self.current.clone());
  }

  #[must_use]
  pub fn snapshot_count(&self) -> usize {
    self.snapshots.len()
  }

  /// Per-key deltas between consecutive snapshots; entry `i` is snapshot
  /// `i` minus snapshot `i - 1` (the first snapshot diffs against empty).
  #[must_use]
  pub fn deltas(&self) -> HashMap<LocationKey, Vec<(i64, i64)>> {
    let mut keys: Vec<LocationKey> = Vec::new();
    for snapshot in &self.snapshots {
      for key in snapshot.keys() {
        if !keys.contains(key) {
          keys.push(*key);
        }
      }
    }

    let mut deltas: HashMap<LocationKey, Vec<(i64, i64)>> = HashMap::new();
    for key in keys {
      let mut previous = LocationStats::default();
      let mut series = Vec::with_capacity(self.snapshots.len());
      for snapshot in &self.snapshots {
        let stats = snapshot.get(&key).copied().unwrap_or_default();
        series.push((
          stats.total_bytes as i64 - previous.total_bytes as i64,
          stats.allocation_count as i64 - previous.allocation_count as i64,
        ));
        previous = stats;
      }
      deltas.insert(key, series);
    }
    deltas
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event(
    thread_id: ThreadId,
    address: u64,
    size: u64,
    allocator: AllocatorKind,
    stack: Vec<FrameId>,
    index: usize,
  ) -> Allocation {
    Allocation {
      thread_id,
      address,
      size,
      allocator,
      native_trace_id: None,
      stack,
      index,
      native_segment_generation: 0,
    }
  }

  #[test]
  fn finder_reports_peak_and_index_for_malloc_free() {
    let mut finder = HighWatermarkFinder::new();
    finder.on_event(&event(1, 0x10, 16, AllocatorKind::Malloc, vec![], 1));
    finder.on_event(&event(1, 0x10, 0, AllocatorKind::Free, vec![], 2));

    assert_eq!(finder.peak(), 16);
    assert_eq!(finder.peak_index(), 1);
    assert_eq!(finder.current_heap(), 0);
  }

  #[test]
  fn finder_tracks_nested_frames_peak() {
    let mut finder = HighWatermarkFinder::new();
    finder.on_event(&event(1, 0xa, 10, AllocatorKind::Malloc, vec![0], 1));
    finder.on_event(&event(1, 0xb, 10, AllocatorKind::Malloc, vec![0, 1], 2));
    finder.on_event(&event(1, 0xb, 0, AllocatorKind::Free, vec![0, 1], 3));

    assert_eq!(finder.peak(), 20);
    assert_eq!(finder.peak_index(), 2);
  }

  #[test]
  fn finder_treats_realloc_as_replacing_its_address() {
    let mut finder = HighWatermarkFinder::new();
    finder.on_event(&event(1, 0x10, 16, AllocatorKind::Malloc, vec![], 1));
    // In-place growth: same address, new size, no separate free record.
    finder.on_event(&event(1, 0x10, 32, AllocatorKind::Realloc, vec![], 2));

    assert_eq!(finder.current_heap(), 32);
    assert_eq!(finder.peak(), 32);
  }

  #[test]
  fn temporary_allocations_detected_within_the_window() {
    let mut aggregator = TemporaryAllocationsAggregator::new(2);
    aggregator.on_event(&event(1, 0x1, 8, AllocatorKind::Malloc, vec![], 1));
    aggregator.on_event(&event(1, 0x2, 8, AllocatorKind::Malloc, vec![], 2));
    aggregator.on_event(&event(1, 0x2, 0, AllocatorKind::Free, vec![], 3));

    assert_eq!(aggregator.temporary_allocations().len(), 1);
    assert_eq!(aggregator.temporary_allocations()[0].address, 0x2);
  }

  #[test]
  fn allocations_pushed_out_of_the_window_are_not_temporary() {
    let mut aggregator = TemporaryAllocationsAggregator::new(1);
    aggregator.on_event(&event(1, 0x1, 8, AllocatorKind::Malloc, vec![], 1));
    aggregator.on_event(&event(1, 0x2, 8, AllocatorKind::Malloc, vec![], 2));
    // 0x1 left the window when 0x2 arrived.
    aggregator.on_event(&event(1, 0x1, 0, AllocatorKind::Free, vec![], 3));

    assert!(aggregator.temporary_allocations().is_empty());
  }

  #[test]
  fn windows_are_tracked_per_thread() {
    let mut aggregator = TemporaryAllocationsAggregator::new(1);
    aggregator.on_event(&event(1, 0x1, 8, AllocatorKind::Malloc, vec![], 1));
    aggregator.on_event(&event(2, 0x2, 8, AllocatorKind::Malloc, vec![], 2));
    aggregator.on_event(&event(1, 0x1, 0, AllocatorKind::Free, vec![], 3));

    assert_eq!(aggregator.temporary_allocations().len(), 1);
  }

  #[test]
  fn snapshot_groups_live_allocations_by_location() {
    let mut aggregator = SnapshotAllocationAggregator::new();
    aggregator.on_event(&event(1, 0xa, 10, AllocatorKind::Malloc, vec![0], 1));
    aggregator.on_event(&event(1, 0xb, 10, AllocatorKind::Malloc, vec![0], 2));
    aggregator.on_event(&event(1, 0xc, 5, AllocatorKind::Malloc, vec![0, 1], 3));
    aggregator.on_event(&event(1, 0xb, 0, AllocatorKind::Free, vec![0, 1], 4));

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.len(), 2);

    let under_f = snapshot
      .iter()
      .find(|(key, _)| key.frame == Some(0))
      .map(|(_, stats)| *stats)
      .expect("group under frame 0");
    assert_eq!(under_f.total_bytes, 10);
    assert_eq!(under_f.allocation_count, 1);
  }

  #[test]
  fn high_water_mark_keeps_usage_live_at_the_peak() {
    let mut aggregator = HighWaterMarkAggregator::new();
    aggregator.on_event(&event(1, 0xa, 10, AllocatorKind::Malloc, vec![0], 1));
    aggregator.on_event(&event(1, 0xb, 10, AllocatorKind::Malloc, vec![0, 1], 2));
    aggregator.on_event(&event(1, 0xb, 0, AllocatorKind::Free, vec![0, 1], 3));

    assert_eq!(aggregator.peak_total(), 20);

    let report = aggregator.report();
    let f_key = report.keys().find(|key| key.frame == Some(0)).copied();
    let g_key = report.keys().find(|key| key.frame == Some(1)).copied();

    let f_stats = report[&f_key.expect("f key")];
    assert_eq!(f_stats.peak_bytes, 10);
    assert_eq!(f_stats.leaked_bytes, 10);

    let g_stats = report[&g_key.expect("g key")];
    assert_eq!(g_stats.peak_bytes, 10);
    assert_eq!(g_stats.leaked_bytes, 0);
  }

  #[test]
  fn keys_untouched_after_the_peak_fold_correctly() {
    let mut aggregator = HighWaterMarkAggregator::new();
    // Key A allocates and is never touched again.
    aggregator.on_event(&event(1, 0xa, 100, AllocatorKind::Malloc, vec![0], 1));
    // Key B drives the peak afterwards, then shrinks.
    aggregator.on_event(&event(1, 0xb, 50, AllocatorKind::Malloc, vec![1], 2));
    aggregator.on_event(&event(1, 0xb, 0, AllocatorKind::Free, vec![1], 3));
    aggregator.on_event(&event(1, 0xc, 10, AllocatorKind::Malloc, vec![1], 4));

    assert_eq!(aggregator.peak_total(), 150);
    let report = aggregator.report();

    let a_stats = report
      .iter()
      .find(|(key, _)| key.frame == Some(0))
      .map(|(_, stats)| *stats)
      .expect("key A");
    assert_eq!(a_stats.peak_bytes, 100);

    let b_stats = report
      .iter()
      .find(|(key, _)| key.frame == Some(1))
      .map(|(_, stats)| *stats)
      .expect("key B");
    assert_eq!(b_stats.peak_bytes, 50);
    assert_eq!(b_stats.leaked_bytes, 10);
  }

  #[test]
  fn deallocations_are_charged_to_the_allocating_location() {
    let mut aggregator = HighWaterMarkAggregator::new();
    aggregator.on_event(&event(1, 0xa, 10, AllocatorKind::Malloc, vec![0], 1));
    // The free happens under a different stack; it must still release the
    // bytes from frame 0's bucket.
    aggregator.on_event(&event(1, 0xa, 0, AllocatorKind::Free, vec![5], 2));

    let report = aggregator.report();
    let stats = report
      .iter()
      .find(|(key, _)| key.frame == Some(0))
      .map(|(_, stats)| *stats)
      .expect("allocating key");
    assert_eq!(stats.leaked_bytes, 0);
    assert!(!report.keys().any(|key| key.frame == Some(5)));
  }

  #[test]
  fn multi_snapshot_reports_per_interval_deltas() {
    let mut aggregator = MultiSnapshotAggregator::new();
    aggregator.on_event(&event(1, 0xa, 10, AllocatorKind::Malloc, vec![0], 1));
    aggregator.capture();
    aggregator.on_event(&event(1, 0xb, 30, AllocatorKind::Malloc, vec![0], 2));
    aggregator.on_event(&event(1, 0xa, 0, AllocatorKind::Free, vec![0], 3));
    aggregator.capture();

    assert_eq!(aggregator.snapshot_count(), 2);

    let deltas = aggregator.deltas();
    assert_eq!(deltas.len(), 1);
    let series = deltas.values().next().expect("one key");
    assert_eq!(series.as_slice(), &[(10, 1), (20, 0)]);
  }
}
