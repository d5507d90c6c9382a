/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Live ranges and their building blocks.
//!
//! Every instruction owns two lifetime positions: `2n` (start) and `2n + 1`
//! (end).  A [`LiveRange`] is a chain of half-open use intervals plus a
//! sorted list of uses and safepoints; splitting a range produces a sibling
//! covering the tail.  All nodes live in the [`Ranges`] arena and link to
//! each other by id, never by pointer.
//!
//! Ranges are built by walking blocks (and instructions within blocks)
//! backwards, so intervals are only ever prepended and the first interval
//! is shrunk when the definition is finally seen.

use log::trace;

use crate::ir::{Rep, SummaryId, VReg};
use crate::location::{Location, Policy, SlotId, Slots};

/// Pseudo vreg of a range that only blocks a register.
pub const NO_VREG: VReg = -1;
/// Pseudo vreg of a temporary range.
pub const TEMP_VREG: VReg = -2;

pub const ILLEGAL_POSITION: i32 = -1;
pub const MAX_POSITION: i32 = i32::MAX;

/// Lifetime positions of a graph entry block; parallel moves are only legal
/// from the first function entry onwards.
pub const NORMAL_ENTRY_POS: i32 = 2;

pub fn is_instruction_start_position(pos: i32) -> bool {
  (pos & 1) == 0
}

pub fn is_instruction_end_position(pos: i32) -> bool {
  (pos & 1) == 1
}

pub fn to_instruction_start(pos: i32) -> i32 {
  pos & !1
}

pub fn to_instruction_end(pos: i32) -> i32 {
  pos | 1
}

/// Loops beyond this many lose the unconstrained-uses optimization.
const MAX_TRACKED_LOOPS: usize = 64;

macro_rules! define_node_index {
  ($name:ident, $prefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct $name(u32);

    impl $name {
      fn index(self) -> usize {
        self.0 as usize
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, concat!($prefix, "{}"), self.0)
      }
    }
  };
}

define_node_index!(RangeId, "lr");
define_node_index!(IntervalId, "iv");
define_node_index!(UseId, "u");
define_node_index!(SafepointId, "sp");

/// Holeless half-open `[start, end)` segment of liveness.
#[derive(Clone, Copy, Debug)]
pub struct UseInterval {
  pub start: i32,
  pub end: i32,
  pub next: Option<IntervalId>,
}

impl UseInterval {
  pub fn contains(&self, pos: i32) -> bool {
    self.start <= pos && pos < self.end
  }

  /// Smallest position covered by both intervals, or `ILLEGAL_POSITION`.
  pub fn intersect(&self, other: &UseInterval) -> i32 {
    if self.start <= other.start {
      if other.start < self.end {
        return other.start;
      }
    } else if self.start < other.end {
      return self.start;
    }
    ILLEGAL_POSITION
  }
}

/// A single use of an SSA value.  `slot` is the location cell the allocator
/// eventually rewrites; `hint` is a non-binding preference.
#[derive(Clone, Copy, Debug)]
pub struct UsePosition {
  pub pos: i32,
  pub slot: SlotId,
  pub hint: Option<SlotId>,
  pub next: Option<UseId>,
}

#[derive(Clone, Copy, Debug)]
pub struct SafepointPosition {
  pub pos: i32,
  pub summary: SummaryId,
  pub next: Option<SafepointId>,
}

/// Cursor over a range: caches the first pending interval and the first
/// interesting uses so the allocator never rescans from the range start.
/// Advanced monotonically; must be refreshed after a split.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationFinger {
  first_pending_use_interval: Option<IntervalId>,
  first_register_use: Option<UseId>,
  first_register_beneficial_use: Option<UseId>,
  first_hinted_use: Option<UseId>,
}

pub struct LiveRange {
  pub vreg: VReg,
  pub rep: Rep,
  /// Location assigned to this range; a slot so that phi hints can point at
  /// it before it is filled.
  pub assigned_slot: SlotId,
  pub spill_slot: Location,
  pub first_use: Option<UseId>,
  pub first_interval: Option<IntervalId>,
  pub last_interval: Option<IntervalId>,
  pub first_safepoint: Option<SafepointId>,
  last_safepoint: Option<SafepointId>,
  pub next_sibling: Option<RangeId>,
  has_only_any_uses_in_loops: u64,
  pub is_loop_phi: bool,
  pub has_uses_which_require_stack: bool,
  pub finger: AllocationFinger,
}

impl LiveRange {
  pub fn has_only_unconstrained_uses_in_loop(&self, loop_id: usize) -> bool {
    if loop_id < MAX_TRACKED_LOOPS {
      return (self.has_only_any_uses_in_loops & (1u64 << loop_id)) != 0;
    }
    false
  }

  pub fn mark_has_only_unconstrained_uses_in_loop(&mut self, loop_id: usize) {
    if loop_id < MAX_TRACKED_LOOPS {
      self.has_only_any_uses_in_loops |= 1u64 << loop_id;
    }
  }
}

/// Arena owning every live range, interval, use and safepoint of one
/// allocation.
pub struct Ranges {
  ranges: Vec<LiveRange>,
  intervals: Vec<UseInterval>,
  uses: Vec<UsePosition>,
  safepoints: Vec<SafepointPosition>,
}

impl Ranges {
  pub fn new() -> Ranges {
    Ranges {
      ranges: Vec::new(),
      intervals: Vec::new(),
      uses: Vec::new(),
      safepoints: Vec::new(),
    }
  }

  pub fn new_range(&mut self, slots: &mut Slots, vreg: VReg, rep: Rep)
    -> RangeId {
    let assigned_slot = slots.alloc(Location::Invalid);
    let id = RangeId(self.ranges.len() as u32);
    self.ranges.push(LiveRange {
      vreg,
      rep,
      assigned_slot,
      spill_slot: Location::Invalid,
      first_use: None,
      first_interval: None,
      last_interval: None,
      first_safepoint: None,
      last_safepoint: None,
      next_sibling: None,
      has_only_any_uses_in_loops: 0,
      is_loop_phi: false,
      has_uses_which_require_stack: false,
      finger: AllocationFinger::default(),
    });
    id
  }

  pub fn range(&self, id: RangeId) -> &LiveRange {
    &self.ranges[id.index()]
  }

  pub fn range_mut(&mut self, id: RangeId) -> &mut LiveRange {
    &mut self.ranges[id.index()]
  }

  pub fn interval(&self, id: IntervalId) -> &UseInterval {
    &self.intervals[id.index()]
  }

  pub fn use_pos(&self, id: UseId) -> &UsePosition {
    &self.uses[id.index()]
  }

  pub fn safepoint(&self, id: SafepointId) -> &SafepointPosition {
    &self.safepoints[id.index()]
  }

  pub fn start(&self, id: RangeId) -> i32 {
    let first = self.ranges[id.index()].first_interval
      .expect("range has no intervals");
    self.intervals[first.index()].start
  }

  pub fn end(&self, id: RangeId) -> i32 {
    let last = self.ranges[id.index()].last_interval
      .expect("range has no intervals");
    self.intervals[last.index()].end
  }

  /// Fast conservative check: can return true inside a lifetime hole.
  pub fn can_cover(&self, id: RangeId, pos: i32) -> bool {
    self.ranges[id.index()].first_interval.is_some()
      && self.start(id) <= pos && pos < self.end(id)
  }

  pub fn contains(&self, id: RangeId, pos: i32) -> bool {
    if !self.can_cover(id, pos) {
      return false;
    }
    let mut interval = self.ranges[id.index()].first_interval;
    while let Some(iv) = interval {
      if self.intervals[iv.index()].contains(pos) {
        return true;
      }
      interval = self.intervals[iv.index()].next;
    }
    false
  }

  /// Record a use at `pos`.  Uses are normally prepended (construction runs
  /// backwards); an instruction using the same value both as a fixed input
  /// (at `pos - 1`) and a plain input (at `pos`) inserts mid-list, which is
  /// handled here to keep the list sorted.
  pub fn add_use(&mut self, id: RangeId, pos: i32, slot: SlotId) -> UseId {
    {
      let range = &self.ranges[id.index()];
      let first = range.first_interval.expect("no interval for use");
      debug_assert!(self.intervals[first.index()].start <= pos);
      debug_assert!(pos <= self.intervals[first.index()].end);
    }
    if let Some(head) = self.ranges[id.index()].first_use {
      let head_pos = self.uses[head.index()].pos;
      if head_pos == pos && self.uses[head.index()].slot == slot {
        return head;
      } else if head_pos < pos {
        let mut insert_after = head;
        while let Some(next) = self.uses[insert_after.index()].next {
          if self.uses[next.index()].pos >= pos {
            break;
          }
          insert_after = next;
        }

        let mut insert_before = self.uses[insert_after.index()].next;
        while let Some(before) = insert_before {
          if self.uses[before.index()].pos != pos {
            break;
          }
          if self.uses[before.index()].slot == slot {
            return before;
          }
          insert_before = self.uses[before.index()].next;
        }

        let new_use = UseId(self.uses.len() as u32);
        self.uses.push(UsePosition {
          pos,
          slot,
          hint: None,
          next: self.uses[insert_after.index()].next,
        });
        self.uses[insert_after.index()].next = Some(new_use);
        return new_use;
      }
    }
    let new_use = UseId(self.uses.len() as u32);
    self.uses.push(UsePosition {
      pos,
      slot,
      hint: None,
      next: self.ranges[id.index()].first_use,
    });
    self.ranges[id.index()].first_use = Some(new_use);
    new_use
  }

  pub fn add_hinted_use(
    &mut self, id: RangeId, pos: i32, slot: SlotId, hint: SlotId,
  ) {
    let use_id = self.add_use(id, pos, slot);
    self.uses[use_id.index()].hint = Some(hint);
  }

  /// Attach a safepoint.  `always_calls` is true when the safepoint always
  /// calls and is not callee safe; constants have a pseudo spill slot from
  /// the very beginning and will never be spilled, so such safepoints are
  /// irrelevant for them.
  pub fn add_safepoint(
    &mut self, id: RangeId, pos: i32, summary: SummaryId, always_calls: bool,
  ) {
    if self.ranges[id.index()].spill_slot.is_constant() && always_calls {
      return;
    }

    debug_assert!(is_instruction_start_position(pos));
    let sp = SafepointId(self.safepoints.len() as u32);
    self.safepoints.push(SafepointPosition {
      pos: to_instruction_end(pos),
      summary,
      next: None,
    });

    match self.ranges[id.index()].last_safepoint {
      None => {
        debug_assert!(self.ranges[id.index()].first_safepoint.is_none());
        self.ranges[id.index()].first_safepoint = Some(sp);
        self.ranges[id.index()].last_safepoint = Some(sp);
      }
      Some(last) => {
        // Safepoints are discovered in ascending position order.
        assert!(self.safepoints[last.index()].pos < pos);
        self.safepoints[last.index()].next = Some(sp);
        self.ranges[id.index()].last_safepoint = Some(sp);
      }
    }
  }

  pub fn set_first_use(&mut self, id: RangeId, use_id: Option<UseId>) {
    self.ranges[id.index()].first_use = use_id;
  }

  pub fn set_use_next(&mut self, use_id: UseId, next: Option<UseId>) {
    self.uses[use_id.index()].next = next;
  }

  /// Prepend (or merge into) the first use interval.
  pub fn add_use_interval(&mut self, id: RangeId, start: i32, end: i32) {
    assert!(start < end);

    if let Some(first) = self.ranges[id.index()].first_interval {
      let first_start = self.intervals[first.index()].start;
      let first_end = self.intervals[first.index()].end;
      if start > first_start {
        // Only register-blocking ranges grow backwards into an existing
        // interval: they accumulate overlapping blocks.
        debug_assert_eq!(self.ranges[id.index()].vreg, NO_VREG);
        debug_assert!(end <= first_end);
        return;
      } else if start == first_start {
        if end <= first_end {
          return;
        }
        self.intervals[first.index()].end = end;
        return;
      } else if end == first_start {
        self.intervals[first.index()].start = start;
        return;
      } else if end == first_end {
        debug_assert!(start < first_start);
        self.intervals[first.index()].start = start;
        return;
      }
      debug_assert!(end < first_start);
    }

    let iv = IntervalId(self.intervals.len() as u32);
    self.intervals.push(UseInterval {
      start,
      end,
      next: self.ranges[id.index()].first_interval,
    });
    self.ranges[id.index()].first_interval = Some(iv);
    if self.ranges[id.index()].last_interval.is_none() {
      debug_assert!(self.intervals[iv.index()].next.is_none());
      self.ranges[id.index()].last_interval = Some(iv);
    }
  }

  /// Shrink the optimistically expanded first interval down to the
  /// definition, or create the definition's point interval.
  pub fn define_at(&mut self, id: RangeId, pos: i32) {
    match self.ranges[id.index()].first_interval {
      None => {
        // Definition without a use.
        let iv = IntervalId(self.intervals.len() as u32);
        self.intervals.push(UseInterval { start: pos, end: pos + 1,
                                          next: None });
        self.ranges[id.index()].first_interval = Some(iv);
        self.ranges[id.index()].last_interval = Some(iv);
      }
      Some(first) => {
        debug_assert!(self.intervals[first.index()].start <= pos);
        self.intervals[first.index()].start = pos;
      }
    }
  }

  // --- finger ---------------------------------------------------------

  pub fn finger_initialize(&mut self, id: RangeId) {
    let (first_interval, first_use) = {
      let range = &self.ranges[id.index()];
      (range.first_interval, range.first_use)
    };
    let finger = &mut self.ranges[id.index()].finger;
    finger.first_pending_use_interval = first_interval;
    finger.first_register_use = first_use;
    finger.first_register_beneficial_use = first_use;
    finger.first_hinted_use = first_use;
  }

  /// Returns true when no pending interval remains.
  pub fn finger_advance(&mut self, id: RangeId, start: i32) -> bool {
    let mut interval = self.ranges[id.index()].finger
      .first_pending_use_interval;
    while let Some(iv) = interval {
      if self.intervals[iv.index()].end > start {
        break;
      }
      interval = self.intervals[iv.index()].next;
    }
    self.ranges[id.index()].finger.first_pending_use_interval = interval;
    interval.is_none()
  }

  pub fn first_pending_interval(&self, id: RangeId) -> Option<IntervalId> {
    self.ranges[id.index()].finger.first_pending_use_interval
  }

  pub fn first_hint(&self, id: RangeId, slots: &Slots) -> Location {
    let mut use_id = self.ranges[id.index()].finger.first_hinted_use;
    while let Some(u) = use_id {
      if let Some(hint) = self.uses[u.index()].hint {
        if !slots[hint].is_unallocated() {
          return slots[hint];
        }
      }
      use_id = self.uses[u.index()].next;
    }
    Location::Invalid
  }

  fn first_use_after(&self, mut use_id: Option<UseId>, after: i32)
    -> Option<UseId> {
    while let Some(u) = use_id {
      if self.uses[u.index()].pos >= after {
        break;
      }
      use_id = self.uses[u.index()].next;
    }
    use_id
  }

  pub fn first_register_use(
    &mut self, id: RangeId, after: i32, slots: &Slots,
  ) -> Option<UseId> {
    let cached = self.ranges[id.index()].finger.first_register_use;
    let mut use_id = self.first_use_after(cached, after);
    while let Some(u) = use_id {
      match slots[self.uses[u.index()].slot] {
        Location::Unallocated(Policy::RequiresRegister)
        | Location::Unallocated(Policy::RequiresFpuRegister) => {
          self.ranges[id.index()].finger.first_register_use = Some(u);
          return Some(u);
        }
        _ => {}
      }
      use_id = self.uses[u.index()].next;
    }
    None
  }

  pub fn first_register_beneficial_use(
    &mut self, id: RangeId, after: i32, slots: &Slots,
  ) -> Option<UseId> {
    let cached = self.ranges[id.index()].finger.first_register_beneficial_use;
    let mut use_id = self.first_use_after(cached, after);
    while let Some(u) = use_id {
      let loc = slots[self.uses[u.index()].slot];
      if loc.is_unallocated() && loc.is_register_beneficial() {
        self.ranges[id.index()].finger.first_register_beneficial_use =
          Some(u);
        return Some(u);
      }
      use_id = self.uses[u.index()].next;
    }
    None
  }

  /// First use that actually needs the register; a use at an instruction
  /// end position does not interfere with an allocation starting there.
  pub fn first_interfering_use(
    &mut self, id: RangeId, mut after: i32, slots: &Slots,
  ) -> Option<UseId> {
    if is_instruction_end_position(after) {
      after += 1;
    }
    self.first_register_use(id, after, slots)
  }

  fn finger_update_after_split(&mut self, id: RangeId,
                               first_use_after_split_pos: i32) {
    let finger = &mut self.ranges[id.index()].finger;
    if let Some(u) = finger.first_register_use {
      if self.uses[u.index()].pos >= first_use_after_split_pos {
        finger.first_register_use = None;
      }
    }
    let finger = &mut self.ranges[id.index()].finger;
    if let Some(u) = finger.first_register_beneficial_use {
      if self.uses[u.index()].pos >= first_use_after_split_pos {
        finger.first_register_beneficial_use = None;
      }
    }
  }

  // --- intersections --------------------------------------------------

  /// Smallest position covered by both interval chains, or `MAX_POSITION`.
  pub fn first_intersection(
    &self, mut a: Option<IntervalId>, mut b: Option<IntervalId>,
  ) -> i32 {
    while let (Some(ai), Some(bi)) = (a, b) {
      let av = self.intervals[ai.index()];
      let bv = self.intervals[bi.index()];
      let pos = av.intersect(&bv);
      if pos != ILLEGAL_POSITION {
        return pos;
      }
      if av.start < bv.start {
        a = av.next;
      } else {
        b = bv.next;
      }
    }
    MAX_POSITION
  }

  // --- splitting ------------------------------------------------------

  fn split_use_list(&mut self, id: RangeId, split_pos: i32,
                    split_at_start: bool) -> Option<UseId> {
    let mut last_before: Option<UseId> = None;
    let mut use_id = self.ranges[id.index()].first_use;
    while let Some(u) = use_id {
      let pos = self.uses[u.index()].pos;
      let before = if split_at_start { pos < split_pos } else {
        pos <= split_pos
      };
      if !before {
        break;
      }
      last_before = Some(u);
      use_id = self.uses[u.index()].next;
    }
    match last_before {
      None => self.ranges[id.index()].first_use = None,
      Some(u) => self.uses[u.index()].next = None,
    }
    use_id
  }

  fn split_safepoint_list(&mut self, id: RangeId, split_pos: i32,
                          split_at_start: bool) -> Option<SafepointId> {
    let mut last_before: Option<SafepointId> = None;
    let mut sp_id = self.ranges[id.index()].first_safepoint;
    while let Some(sp) = sp_id {
      let pos = self.safepoints[sp.index()].pos;
      let before = if split_at_start { pos < split_pos } else {
        pos <= split_pos
      };
      if !before {
        break;
      }
      last_before = Some(sp);
      sp_id = self.safepoints[sp.index()].next;
    }
    match last_before {
      None => self.ranges[id.index()].first_safepoint = None,
      Some(sp) => self.safepoints[sp.index()].next = None,
    }
    sp_id
  }

  /// Split the range at `split_pos`; the new sibling covers positions from
  /// the split onwards.  Returns the original range when the split position
  /// is its start.
  pub fn split_at(&mut self, slots: &mut Slots, id: RangeId, split_pos: i32)
    -> RangeId {
    if self.start(id) == split_pos {
      return id;
    }

    let mut interval = self.ranges[id.index()].finger
      .first_pending_use_interval;
    if interval.is_none() {
      self.finger_initialize(id);
      interval = self.ranges[id.index()].finger.first_pending_use_interval;
    }

    debug_assert!(split_pos < self.end(id));

    // The split position can be inside a lifetime hole preceding the
    // pending interval; start over from the first interval.
    let mut iv = interval.expect("no pending interval");
    if split_pos <= self.intervals[iv.index()].start {
      iv = self.ranges[id.index()].first_interval.unwrap();
    }

    let mut last_before_split: Option<IntervalId> = None;
    while self.intervals[iv.index()].end <= split_pos {
      last_before_split = Some(iv);
      iv = self.intervals[iv.index()].next.expect("split past range end");
    }

    let split_at_start = self.intervals[iv.index()].start == split_pos;
    let mut first_after_split = iv;
    if !split_at_start && self.intervals[iv.index()].contains(split_pos) {
      let tail = IntervalId(self.intervals.len() as u32);
      self.intervals.push(UseInterval {
        start: split_pos,
        end: self.intervals[iv.index()].end,
        next: self.intervals[iv.index()].next,
      });
      self.intervals[iv.index()].end = split_pos;
      self.intervals[iv.index()].next = Some(tail);
      last_before_split = Some(iv);
      first_after_split = tail;
    }

    let last_before = last_before_split.expect("split would be empty");
    debug_assert_eq!(self.intervals[last_before.index()].next,
                     Some(first_after_split));
    debug_assert!(self.intervals[last_before.index()].end <= split_pos);
    debug_assert!(split_pos <= self.intervals[first_after_split.index()]
                  .start);

    let first_use_after_split =
      self.split_use_list(id, split_pos, split_at_start);
    let first_safepoint_after_split =
      self.split_safepoint_list(id, split_pos, split_at_start);

    let sibling_last_interval =
      if Some(last_before) == self.ranges[id.index()].last_interval {
        first_after_split
      } else {
        self.ranges[id.index()].last_interval.unwrap()
      };

    let assigned_slot = slots.alloc(Location::Invalid);
    let sibling = RangeId(self.ranges.len() as u32);
    let (vreg, rep, next_sibling) = {
      let range = &self.ranges[id.index()];
      (range.vreg, range.rep, range.next_sibling)
    };
    self.ranges.push(LiveRange {
      vreg,
      rep,
      assigned_slot,
      spill_slot: Location::Invalid,
      first_use: first_use_after_split,
      first_interval: Some(first_after_split),
      last_interval: Some(sibling_last_interval),
      first_safepoint: first_safepoint_after_split,
      last_safepoint: None,
      next_sibling,
      has_only_any_uses_in_loops: 0,
      is_loop_phi: false,
      has_uses_which_require_stack: false,
      finger: AllocationFinger::default(),
    });

    self.ranges[id.index()].next_sibling = Some(sibling);
    self.ranges[id.index()].last_interval = Some(last_before);
    self.intervals[last_before.index()].next = None;

    if let Some(u) = first_use_after_split {
      let pos = self.uses[u.index()].pos;
      self.finger_update_after_split(id, pos);
    }

    trace!("  split sibling [{}, {})", self.start(sibling),
           self.end(sibling));
    sibling
  }

  // --- queries used by the allocator ----------------------------------

  /// True when every use (up to `boundary` if given) has the `Any` policy.
  pub fn has_only_unconstrained_uses(
    &self, id: RangeId, slots: &Slots, boundary: Option<i32>,
  ) -> bool {
    let mut use_id = self.ranges[id.index()].first_use;
    while let Some(u) = use_id {
      let use_pos = &self.uses[u.index()];
      if let Some(boundary) = boundary {
        if use_pos.pos >= boundary {
          break;
        }
      }
      if slots[use_pos.slot] != Location::any() {
        return false;
      }
      use_id = use_pos.next;
    }
    true
  }
}
