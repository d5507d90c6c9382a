/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The allocation core: a priority-driven linear scan.
//!
//! Ranges are processed in ascending start order, once per register class.
//! For each range the allocator tries a free register first (honouring
//! hints), and failing that evicts interference from the register with the
//! furthest next use, or spills.  Split tails go back on the worklist, so
//! no range is ever processed before anything that starts ahead of it.

use std::mem;

use log::trace;

use crate::allocator::{AllocError, Allocator};
use crate::ir::{BlockId, LoopId, Rep};
use crate::location::{Location, RegKind};
use crate::ranges::{to_instruction_start, RangeId, MAX_POSITION, NO_VREG};

fn location_has_kind(loc: Location, kind: RegKind) -> bool {
  loc.is_machine_register() && loc.kind() == kind
}

impl<'g> Allocator<'g> {
  pub fn prepare_for_allocation(&mut self, kind: RegKind) {
    self.register_kind = Some(kind);
    self.number_of_registers = self.target.number_of_registers(kind);

    self.blocked_registers.clear();
    self.registers.clear();
    for _ in 0..self.number_of_registers {
      self.blocked_registers.push(false);
      self.registers.push(Vec::new());
    }
    debug_assert!(self.unallocated.is_empty());
    self.unallocated = match kind {
      RegKind::Cpu => mem::replace(&mut self.unallocated_cpu, Vec::new()),
      RegKind::Fpu => mem::replace(&mut self.unallocated_fpu, Vec::new()),
    };

    let (blocked, blocking) = match kind {
      RegKind::Cpu => (self.blocked_cpu.clone(), self.cpu_blocking.clone()),
      RegKind::Fpu => (self.blocked_fpu.clone(), self.fpu_blocking.clone()),
    };
    for i in 0..self.number_of_registers {
      let reg = (i + self.target.allocation_bias) % self.number_of_registers;
      self.blocked_registers[reg] = blocked[reg];
      debug_assert!(self.registers[reg].is_empty());
      if let Some(range) = blocking[reg] {
        self.rs.finger_initialize(range);
        self.registers[reg].push(Some(range));
      }
    }
  }

  /// Process live ranges sorted by start and assign registers to them.
  pub fn allocate_unallocated_ranges(&mut self) -> Result<(), AllocError> {
    #[cfg(debug_assertions)]
    debug_assert!(self.unallocated_is_sorted());

    while let Some(range) = self.unallocated.pop() {
      let start = self.rs.start(range);
      trace!("processing live range for v{} starting at {}",
             self.rs.range(range).vreg, start);

      self.advance_active_intervals(start);

      if !self.allocate_free_register(range) {
        if self.intrinsic_mode {
          // Intrinsic code has to be written to fit within the available
          // registers.
          return Err(AllocError::OutOfRegisters(
            self.register_kind.unwrap(),
          ));
        }
        self.allocate_any_register(range);
      }
    }

    debug_assert!(self.unallocated.is_empty());
    self.advance_active_intervals(MAX_POSITION);

    // A value live into a catch entry arrives through its spill slot when
    // the exception fires; any such value held in a register needs the
    // slot allocated even though no spill was otherwise required.
    for bi in 0..self.graph.blocks.len() {
      let block = BlockId(bi as u32);
      if !self.graph[block].is_catch_entry() {
        continue;
      }
      let start = self.graph[block].start_pos;
      let live: Vec<usize> =
        self.liveness.live_in(block).iter_set_bits(..).collect();
      for vreg in live {
        let parent = self.live_ranges[vreg].expect("live-in without range");
        let cover = self.find_cover(parent, start);
        let dst = self.assigned_loc(cover);

        if self.target_location_is_spill_slot(cover, dst) {
          // Eagerly spilled; the slot already holds the value.
          continue;
        }
        if dst == self.target.exception_location()
          || dst == self.target.stacktrace_location() {
          continue;
        }
        if dst.is_register() || dst.is_fpu_register() {
          if self.rs.range(parent).spill_slot.is_invalid() {
            self.allocate_spill_slot_for(parent);
          }
        }
      }
    }

    trace!("allocation completed");
    Ok(())
  }

  /// Drop ranges that end before `start` from the per-register lists,
  /// committing their final locations.
  pub fn advance_active_intervals(&mut self, start: i32) {
    for i in 0..self.number_of_registers {
      let reg = (i + self.target.allocation_bias) % self.number_of_registers;
      if self.registers[reg].is_empty() {
        continue;
      }

      let mut first_evicted: Option<usize> = None;
      for idx in (0..self.registers[reg].len()).rev() {
        let range = match self.registers[reg][idx] {
          Some(range) => range,
          None => continue,
        };
        if self.rs.finger_advance(range, start) {
          self.convert_all_uses(range);
          self.registers[reg][idx] = None;
          first_evicted = Some(idx);
        }
      }

      if let Some(first) = first_evicted {
        self.remove_evicted(reg, first);
      }
    }
  }

  fn remove_evicted(&mut self, reg: usize, first_evicted: usize) {
    let mut to = first_evicted;
    for from in (first_evicted + 1)..self.registers[reg].len() {
      if let Some(range) = self.registers[reg][from] {
        self.registers[reg][to] = Some(range);
        to += 1;
      }
    }
    self.registers[reg].truncate(to);
  }

  /// First position at which `unallocated` collides with anything already
  /// holding `reg`.
  fn first_intersection_with_allocated(
    &self, reg: usize, unallocated: RangeId,
  ) -> i32 {
    let mut intersection = MAX_POSITION;
    for i in 0..self.registers[reg].len() {
      let allocated = match self.registers[reg][i] {
        Some(allocated) => allocated,
        None => continue,
      };
      let head = self.rs.first_pending_interval(allocated)
        .expect("allocated range with no pending interval");
      if self.rs.interval(head).start >= intersection {
        continue;
      }
      let pos = self.rs.first_intersection(
        self.rs.first_pending_interval(unallocated), Some(head),
      );
      if pos < intersection {
        intersection = pos;
      }
    }
    intersection
  }

  /// Try to find a free register for an unallocated live range.
  pub fn allocate_free_register(&mut self, unallocated: RangeId) -> bool {
    let kind = self.register_kind.expect("no active register kind");
    let num_regs = self.number_of_registers;
    let bias = self.target.allocation_bias;
    let vreg = self.rs.range(unallocated).vreg;

    let mut candidate: Option<usize> = None;
    let mut free_until = 0;

    // If a hint is available try it first.
    let mut hint = self.rs.first_hint(unallocated, &self.graph.slots);

    // Incoming register parameters are bound directly instead of through a
    // prefilled move, so there is no hinted use; fall back to the register
    // the previous sibling occupied, if this sibling continues it
    // seamlessly.
    if !location_has_kind(hint, kind) && vreg >= 0 {
      let parent = self.live_ranges[vreg as usize].unwrap();
      if self.rs.end(parent) == self.rs.start(unallocated)
        && !self.is_block_entry(self.rs.start(unallocated))
        && self.assigned_loc(parent).is_machine_register() {
        hint = self.assigned_loc(parent);
      }
    }

    if location_has_kind(hint, kind) {
      let code = hint.register_code();
      if !self.blocked_registers[code] {
        free_until =
          self.first_intersection_with_allocated(code, unallocated);
        candidate = Some(code);
      }
      trace!("found hint {} for v{}: free until {}", hint, vreg,
             free_until);
    } else {
      for i in 0..num_regs {
        let reg = (i + bias) % num_regs;
        if !self.blocked_registers[reg] && self.registers[reg].is_empty() {
          candidate = Some(reg);
          free_until = MAX_POSITION;
          break;
        }
      }
    }

    if free_until != MAX_POSITION {
      for i in 0..num_regs {
        let reg = (i + bias) % num_regs;
        if self.blocked_registers[reg] || Some(reg) == candidate {
          continue;
        }
        let intersection =
          self.first_intersection_with_allocated(reg, unallocated);
        if intersection > free_until {
          candidate = Some(reg);
          free_until = intersection;
          if free_until == MAX_POSITION {
            break;
          }
        }
      }
    }

    // All registers are blocked by active ranges.
    if free_until <= self.rs.start(unallocated) {
      return false;
    }
    let mut candidate = candidate.expect("free register without candidate");

    // We have a good candidate (hinted or free).  Inside a loop, try to
    // reduce the number of moves on the back edge by picking a register
    // that does not interfere with the phis there.
    let start = self.rs.start(unallocated);
    let start_block = self.block_entry_at(start);
    if vreg >= 0 {
      if let Some(loop_id) = self.graph[start_block].loop_id {
        let li = loop_id.index();
        let interferes = self.extra_loops[li].backedge_interference.as_ref()
          .map_or(false, |set| set.get(vreg as usize).unwrap_or(false));
        if free_until >= self.extra_loops[li].end && interferes {
          let used_on_backedge = self.registers_used_on_backedge(
            loop_id, kind, vreg,
          );

          if used_on_backedge[candidate] {
            trace!(
              "considering {} for v{}: has interference on the back edge \
               {{loop [{}, {})}}",
              self.make_register_location(candidate), vreg,
              self.extra_loops[li].start, self.extra_loops[li].end,
            );
            for i in 0..num_regs {
              let reg = (i + bias) % num_regs;
              if self.blocked_registers[reg] || reg == candidate
                || used_on_backedge[reg] {
                continue;
              }
              let intersection =
                self.first_intersection_with_allocated(reg, unallocated);
              if intersection >= free_until {
                candidate = reg;
                free_until = intersection;
                trace!(
                  "found {} for v{} with no interference on the back edge",
                  self.make_register_location(candidate), vreg,
                );
                break;
              }
            }
          }
        }
      }
    }

    if free_until != MAX_POSITION {
      // There is an intersection; keep the register only up to it.
      trace!("  splitting at {}", free_until);
      let tail =
        self.rs.split_at(&mut self.graph.slots, unallocated, free_until);
      self.add_to_unallocated(tail);

      // A constant-valued range with no uses left should not hold a
      // register.
      if self.rs.range(unallocated).first_use.is_none() && vreg >= 0 {
        let parent = self.live_ranges[vreg as usize].unwrap();
        if self.rs.range(parent).spill_slot.is_constant() {
          self.spill(unallocated);
          return true;
        }
      }
    }

    trace!("  assigning free register {} to v{}",
           self.make_register_location(candidate), vreg);
    self.registers[candidate].push(Some(unallocated));
    let loc = self.make_register_location(candidate);
    self.set_assigned_loc(unallocated, loc);
    true
  }

  /// Registers holding loop-header phis on the back edge whose reaching
  /// defs do not include `vreg`; giving `vreg` one of those would force a
  /// move on the back edge.
  fn registers_used_on_backedge(
    &mut self, loop_id: LoopId, kind: RegKind, vreg: i32,
  ) -> Vec<bool> {
    let mut used = vec![false; self.number_of_registers];
    let header = self.graph[loop_id].header;
    for phi_index in 0..self.graph[header].phis.len() {
      let phi_def = self.graph[header].phis[phi_index].def;
      let phi_vreg = self.graph[phi_def].vreg;
      let second_vreg = self.graph[phi_def].second_vreg;

      let phi_range = self.get_live_range(phi_vreg);
      let loc = self.assigned_loc(phi_range);
      if location_has_kind(loc, kind) {
        let reg = loc.register_code();
        let reaches = self.reaching_defs.get(&*self.graph, phi_def)
          .get(vreg as usize).unwrap_or(false);
        if !reaches {
          used[reg] = true;
        }
      }
      if let Some(second) = second_vreg {
        let second_range = self.get_live_range(second);
        let loc = self.assigned_loc(second_range);
        if location_has_kind(loc, kind) {
          let reg = loc.register_code();
          let reaches = self.reaching_defs.get(&*self.graph, phi_def)
            .get(vreg as usize).unwrap_or(false);
          if !reaches {
            used[reg] = true;
          }
        }
      }
    }
    used
  }

  /// Every register is occupied at the range's start: find the one whose
  /// interference is farthest away, evict what can be evicted, and spill
  /// whatever must wait.
  pub fn allocate_any_register(&mut self, unallocated: RangeId) {
    // A loop phi with no register uses may still deserve a register when
    // one is blocked only by ranges that are cheap to evict; spilling a
    // loop phi puts memory traffic on the back edge.
    let start = self.rs.start(unallocated);
    let register_use =
      self.rs.first_register_use(unallocated, start, &self.graph.slots);
    if register_use.is_none()
      && !(self.rs.range(unallocated).is_loop_phi
           && self.has_cheap_eviction_candidate(unallocated)) {
      self.spill(unallocated);
      return;
    }

    let num_regs = self.number_of_registers;
    let bias = self.target.allocation_bias;
    let mut candidate: Option<usize> = None;
    let mut free_until = 0;
    let mut blocked_at = MAX_POSITION;

    for i in 0..num_regs {
      let reg = (i + bias) % num_regs;
      if self.blocked_registers[reg] {
        continue;
      }
      if self.update_free_until(reg, unallocated, &mut free_until,
                                &mut blocked_at) {
        candidate = Some(reg);
      }
    }

    let register_use_pos = register_use
      .map(|u| self.rs.use_pos(u).pos).unwrap_or(start);
    if free_until < register_use_pos {
      // Can't acquire a free register; spill until one is really needed.
      let use_id = register_use.expect("spill without register use");
      let use_pos = self.rs.use_pos(use_id).pos;
      debug_assert!(start < to_instruction_start(use_pos));
      self.spill_between(unallocated, start, use_pos);
      return;
    }

    let candidate = candidate.expect("no evictable register");
    trace!("assigning blocked register {} to v{} until {}",
           self.make_register_location(candidate),
           self.rs.range(unallocated).vreg, blocked_at);

    if blocked_at < self.rs.end(unallocated) {
      // An unevictable range resumes before this one ends; keep the
      // register at most until then.
      let tail = self.split_between(unallocated, start, blocked_at + 1);
      self.add_to_unallocated(tail);
    }

    self.assign_non_free_register(unallocated, candidate);
  }

  /// How long `reg` could be lent to `unallocated`: bounded by the first
  /// interfering use of any active range on it and the first intersection
  /// with any inactive one.  Returns true (and updates the cursors) when
  /// `reg` beats the current best.
  fn update_free_until(
    &mut self, reg: usize, unallocated: RangeId, cur_free_until: &mut i32,
    cur_blocked_at: &mut i32,
  ) -> bool {
    let mut free_until = MAX_POSITION;
    let mut blocked_at = MAX_POSITION;
    let start = self.rs.start(unallocated);

    for i in 0..self.registers[reg].len() {
      let allocated = match self.registers[reg][i] {
        Some(allocated) => allocated,
        None => continue,
      };

      let first_pending = self.rs.first_pending_interval(allocated)
        .expect("allocated range with no pending interval");
      if self.rs.interval(first_pending).contains(start) {
        // Active interval.
        if self.rs.range(allocated).vreg < 0 {
          // Blocked by a range that can't be spilled.
          return false;
        }

        let interfering = self.rs.first_interfering_use(allocated, start,
                                                        &self.graph.slots);
        if let Some(use_id) = interfering {
          let use_pos = self.rs.use_pos(use_id).pos;
          if (to_instruction_start(use_pos) - start) <= 1 {
            // Used as a register by the current instruction; can't be
            // spilled.
            return false;
          }
        }

        let use_pos = interfering.map(|u| self.rs.use_pos(u).pos)
          .unwrap_or_else(|| self.rs.end(allocated));
        if use_pos < free_until {
          free_until = use_pos;
        }
      } else {
        // Inactive interval.
        let intersection = self.rs.first_intersection(
          Some(first_pending), self.rs.range(unallocated).first_interval,
        );
        if intersection != MAX_POSITION {
          if intersection < free_until {
            free_until = intersection;
          }
          if self.rs.range(allocated).vreg == NO_VREG {
            blocked_at = intersection;
          }
        }
      }

      if free_until <= *cur_free_until {
        return false;
      }
    }

    debug_assert!(free_until > *cur_free_until);
    *cur_free_until = free_until;
    *cur_blocked_at = blocked_at;
    true
  }

  /// Assign the selected non-free register, evicting whatever interference
  /// can be split and spilled out of the way.
  fn assign_non_free_register(&mut self, unallocated: RangeId, reg: usize) {
    let mut first_evicted: Option<usize> = None;
    for i in (0..self.registers[reg].len()).rev() {
      let allocated = match self.registers[reg][i] {
        Some(allocated) => allocated,
        None => continue,
      };
      if self.rs.range(allocated).vreg < 0 {
        continue; // Can't be evicted.
      }
      if self.evict_intersection(allocated, unallocated) {
        // If the evicted range kept its register (only its tail moved),
        // commit its remaining uses now.
        if self.assigned_loc(allocated).is_machine_register() {
          debug_assert!(self.rs.end(allocated) <=
                        self.rs.start(unallocated));
          self.convert_all_uses(allocated);
        }
        self.registers[reg][i] = None;
        first_evicted = Some(i);
      }
    }

    if let Some(first) = first_evicted {
      self.remove_evicted(reg, first);
    }

    self.registers[reg].push(Some(unallocated));
    let loc = self.make_register_location(reg);
    self.set_assigned_loc(unallocated, loc);
  }

  fn evict_intersection(&mut self, allocated: RangeId,
                        unallocated: RangeId) -> bool {
    let first_unallocated = self.rs.first_pending_interval(unallocated)
      .expect("unallocated range with no pending interval");
    let intersection = self.rs.first_intersection(
      self.rs.first_pending_interval(allocated), Some(first_unallocated),
    );
    if intersection == MAX_POSITION {
      return false;
    }

    let spill_position = self.rs.interval(first_unallocated).start;
    let interfering = self.rs.first_interfering_use(allocated,
                                                    spill_position,
                                                    &self.graph.slots);
    match interfering {
      None => {
        // No register uses after this point.
        self.spill_after(allocated, spill_position);
      }
      Some(use_id) => {
        let use_pos = self.rs.use_pos(use_id).pos;
        let restore_position = if spill_position < intersection {
          intersection.min(use_pos)
        } else {
          use_pos
        };
        self.spill_between(allocated, spill_position, restore_position);
      }
    }
    true
  }

  // --- loop-phi eviction heuristics -----------------------------------

  fn range_has_only_unconstrained_uses_in_loop(
    &self, range: RangeId, loop_id: usize,
  ) -> bool {
    let vreg = self.rs.range(range).vreg;
    if vreg >= 0 {
      let parent = self.live_ranges[vreg as usize].unwrap();
      return self.rs.range(parent)
        .has_only_unconstrained_uses_in_loop(loop_id);
    }
    false
  }

  /// A register is cheap to evict inside a loop when everything holding it
  /// there has only unconstrained uses in the loop.
  fn is_cheap_to_evict_register_in_loop(
    &self, loop_id: LoopId, reg: usize,
  ) -> bool {
    let loop_start = self.extra_loops[loop_id.index()].start;
    let loop_end = self.extra_loops[loop_id.index()].end;

    for i in 0..self.registers[reg].len() {
      let allocated = match self.registers[reg][i] {
        Some(allocated) => allocated,
        None => continue,
      };
      let interval = self.rs.first_pending_interval(allocated)
        .expect("allocated range with no pending interval");
      if self.rs.interval(interval).contains(loop_start) {
        if !self.range_has_only_unconstrained_uses_in_loop(
          allocated, loop_id.index()) {
          return false;
        }
      } else if self.rs.interval(interval).start < loop_end {
        return false;
      }
    }
    true
  }

  fn has_cheap_eviction_candidate(&mut self, phi_range: RangeId) -> bool {
    debug_assert!(self.rs.range(phi_range).is_loop_phi);

    let header = self.block_entry_at(self.rs.start(phi_range));
    let loop_id = self.graph.loop_headed_by(header)
      .expect("loop phi outside a loop header");
    debug_assert_eq!(self.rs.start(phi_range),
                     self.graph[header].start_pos);

    for reg in 0..self.number_of_registers {
      if self.blocked_registers[reg] {
        continue;
      }
      if self.is_cheap_to_evict_register_in_loop(loop_id, reg) {
        return true;
      }
    }
    false
  }

  // --- splitting and spilling -----------------------------------------

  /// Split `range` in an optimal position between `from` and `to`: at a
  /// block boundary when the interval spans blocks (preferring the
  /// outermost loop header after the definition), else right before the
  /// instruction at `to`.
  pub fn split_between(&mut self, range: RangeId, from: i32, to: i32)
    -> RangeId {
    trace!("split v{} [{}, {}) between [{}, {})",
           self.rs.range(range).vreg, self.rs.start(range),
           self.rs.end(range), from, to);

    let mut split_block = self.block_entry_at(to);
    let split_pos;
    if from < self.graph[split_block].start_pos {
      // The interval spans multiple blocks: split at a block boundary.
      // If the boundary lies inside a loop, prefer the outermost loop
      // header following the definition; splitting in the middle of a
      // loop disconnects the loop prefix from everything after it.
      let mut loop_id = self.graph[split_block].loop_id;
      if loop_id.is_none() {
        for li in 0..self.extra_loops.len() {
          if self.extra_loops[li].start < to && to < self.extra_loops[li].end
          {
            loop_id = Some(LoopId(li as u32));
            break;
          }
        }
      }
      while let Some(current) = loop_id {
        let header = self.graph[current].header;
        if from >= self.graph[header].start_pos {
          break;
        }
        split_block = header;
        loop_id = self.graph[current].outer;
        trace!("  move back to loop header {:?} at {}", split_block,
               self.graph[split_block].start_pos);
      }

      split_pos = self.graph[split_block].start_pos;
    } else {
      // Contained in a single block; split at the end of the previous
      // instruction.
      split_pos = to_instruction_start(to) - 1;
    }

    debug_assert!(from < split_pos);
    self.rs.split_at(&mut self.graph.slots, range, split_pos)
  }

  /// Spill `range` from `from` onwards, hoisting the spill out of a loop
  /// when every use inside the loop tolerates the stack.
  pub fn spill_after(&mut self, range: RangeId, from: i32) {
    trace!("spill v{} [{}, {}) after {}", self.rs.range(range).vreg,
           self.rs.start(range), self.rs.end(range), from);

    let mut from = from;
    let block = self.block_entry_at(from);
    if let Some(loop_id) = self.graph[block].loop_id {
      let header = self.graph[loop_id].header;
      let header_start = self.graph[header].start_pos;
      if self.rs.start(range) <= header_start
        && self.range_has_only_unconstrained_uses_in_loop(
          range, loop_id.index()) {
        debug_assert!(header_start <= from);
        from = header_start;
        trace!("  moved spill position to loop header {}", from);
      }
    }

    let tail = self.rs.split_at(&mut self.graph.slots, range, from);
    self.spill(tail);
  }

  /// Spill `range` over `[from, to)`, re-queueing the part from `to` on.
  pub fn spill_between(&mut self, range: RangeId, from: i32, to: i32) {
    assert!(from < to);
    trace!("spill v{} [{}, {}) between [{}, {})",
           self.rs.range(range).vreg, self.rs.start(range),
           self.rs.end(range), from, to);

    let tail = self.rs.split_at(&mut self.graph.slots, range, from);
    if self.rs.start(tail) < to {
      let tail_start = self.rs.start(tail);
      let tail_tail = self.split_between(tail, tail_start, to);
      self.spill(tail);
      self.add_to_unallocated(tail_tail);
    } else {
      // No intersection with [from, to) after all.
      self.add_to_unallocated(tail);
    }
  }

  /// Move `range` to its parent's spill slot, allocating one on first use.
  pub fn spill(&mut self, range: RangeId) {
    let vreg = self.rs.range(range).vreg;
    let parent = self.get_live_range(vreg);
    if self.rs.range(parent).spill_slot.is_invalid() {
      self.allocate_spill_slot_for(parent);
      if self.rs.range(range).rep == Rep::Tagged {
        self.mark_as_object_at_safepoints(parent);
      }
    }
    let slot = self.rs.range(parent).spill_slot;
    self.set_assigned_loc(range, slot);
    self.convert_all_uses(range);
  }

  /// Find (or create) a spill slot whose previous occupant expired before
  /// this range starts.  Quad slots take two adjacent double slots and the
  /// indexes of quad/untagged slots never mix with plain ones.
  pub fn allocate_spill_slot_for(&mut self, range: RangeId) {
    debug_assert!(self.rs.range(range).spill_slot.is_invalid());

    let mut last_sibling = range;
    while let Some(next) = self.rs.range(last_sibling).next_sibling {
      last_sibling = next;
    }

    let start = self.rs.start(range);
    let end = self.rs.end(last_sibling);
    let rep = self.rs.range(range).rep;

    // During FPU allocation slot indices count double (64-bit) slots.
    let need_quad = self.register_kind == Some(RegKind::Fpu)
      && rep.is_quad();
    let need_untagged = self.register_kind == Some(RegKind::Cpu)
      && rep == Rep::Untagged;

    // The first `fixed_slot_count` word slots are reserved for catch
    // entries.
    let mut idx = if self.register_kind == Some(RegKind::Cpu) {
      self.graph.fixed_slot_count
    } else {
      0
    };
    while idx < self.spill_slots.len() {
      if need_quad == self.quad_spill_slots[idx]
        && need_untagged == self.untagged_spill_slots[idx]
        && self.spill_slots[idx] <= start {
        break;
      }
      idx += 1;
    }

    while self.spill_slots.len() < idx {
      self.spill_slots.push(MAX_POSITION);
      self.quad_spill_slots.push(false);
      self.untagged_spill_slots.push(false);
    }

    if idx == self.spill_slots.len() {
      // No free slot found; allocate a new one (two for quads).
      self.spill_slots.push(0);
      self.quad_spill_slots.push(need_quad);
      self.untagged_spill_slots.push(need_untagged);
      if need_quad {
        self.spill_slots.push(0);
        self.quad_spill_slots.push(need_quad);
        self.untagged_spill_slots.push(need_untagged);
      }
    }

    // The slot is busy until the last sibling ends.
    self.spill_slots[idx] = end;
    if need_quad {
      assert!(self.quad_spill_slots[idx] && self.quad_spill_slots[idx + 1]);
      // Use the higher index; it corresponds to the lower stack address.
      idx += 1;
      self.spill_slots[idx] = end;
    } else {
      assert!(!self.quad_spill_slots[idx]);
    }

    let frame = &self.target.frame;
    let location = if rep.fits_word_slot() {
      let slot_index = frame.frame_slot_for_variable_index(-(idx as i32));
      Location::stack_slot(slot_index, crate::location::BaseReg::Fp)
    } else {
      // FPU spill slots sit below every word slot; their indices are in
      // double-slot units.
      let factor = self.target.double_spill_factor;
      let slot_index = frame.frame_slot_for_variable_index(
        -((self.cpu_spill_slot_count + idx * factor + (factor - 1)) as i32),
      );
      if rep.is_quad() {
        assert!(need_quad);
        Location::quad_stack_slot(slot_index, crate::location::BaseReg::Fp)
      } else {
        assert!(rep == Rep::UnboxedFloat || rep == Rep::UnboxedDouble);
        Location::double_stack_slot(slot_index, crate::location::BaseReg::Fp)
      }
    };
    self.rs.range_mut(range).spill_slot = location;

    self.spilled.push(range);
  }

  /// Reserve the slot of an initial definition already living in the spill
  /// area (OSR and catch-entry parameters).
  pub fn allocate_spill_slot_for_initial_definition(
    &mut self, slot_index: usize, range_end: i32,
  ) {
    if slot_index < self.spill_slots.len() {
      // Multiple initial definitions may share a spill slot when the
      // function has both an OSR entry and a catch entry.
      self.spill_slots[slot_index] =
        self.spill_slots[slot_index].max(range_end);
      assert!(!self.quad_spill_slots[slot_index]);
      assert!(!self.untagged_spill_slots[slot_index]);
    } else {
      while self.spill_slots.len() < slot_index {
        self.spill_slots.push(MAX_POSITION);
        self.quad_spill_slots.push(false);
        self.untagged_spill_slots.push(false);
      }
      self.spill_slots.push(range_end);
      self.quad_spill_slots.push(false);
      self.untagged_spill_slots.push(false);
    }
  }

  // --- resolution helpers ---------------------------------------------

  /// Sibling of `parent`'s chain covering `pos`; resolution requires one
  /// to exist.
  pub fn find_cover(&self, parent: RangeId, pos: i32) -> RangeId {
    let mut current = Some(parent);
    while let Some(range) = current {
      if self.rs.can_cover(range, pos) {
        return range;
      }
      current = self.rs.range(range).next_sibling;
    }
    panic!("range v{} is not covered at position {}",
           self.rs.range(parent).vreg, pos);
  }

  pub fn target_location_is_spill_slot(
    &self, range: RangeId, target: Location,
  ) -> bool {
    let vreg = self.rs.range(range).vreg;
    let parent = self.live_ranges[vreg as usize].expect("no parent range");
    self.rs.range(parent).spill_slot == target
  }
}
