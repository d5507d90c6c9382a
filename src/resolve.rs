/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Post-allocation resolution.
//!
//! Split siblings of a live range may sit in different locations, so moves
//! are needed wherever control passes from one sibling to the next: inside
//! blocks where they touch, and on every control-flow edge.  At joins,
//! moves duplicated on every incoming edge are sunk into the join itself
//! when no predecessor clobbers the source first.  Afterwards the frame is
//! elided when nothing needs one, outgoing arguments get their stack
//! locations, and every parallel move is handed to the external resolver.

use log::{info, trace};
use smallvec::SmallVec;

use crate::allocator::{Allocator, MoveResolver};
use crate::ir::{
  ArgMoveId, BlockId, BlockKind, DefId, DefKind, InstrKind, Rep, VReg,
};
use crate::location::{BaseReg, Location};

impl<'g> Allocator<'g> {
  fn emit_move_on_edge(
    &mut self, succ: BlockId, pred: BlockId, dst: Location, src: Location,
  ) {
    let last = self.graph.terminator(pred);
    let pred_is_entry = self.graph[pred].kind == BlockKind::GraphEntry;
    match last {
      Some(last)
        if !pred_is_entry
          && matches!(self.graph[last].kind, InstrKind::Goto { .. }) =>
      {
        debug_assert_eq!(self.graph[last].successors(), vec![succ]);
        let pm = self.edge_parallel_move(last);
        self.graph.add_move_to(pm, dst, src);
      }
      _ => {
        let pos = self.graph[succ].start_pos;
        let pm = self.block_entry_parallel_move(succ, pos);
        self.graph.add_move_to(pm, dst, src);
      }
    }
  }

  pub fn resolve_control_flow(&mut self) {
    info!("resolving control flow");

    // Connect touching split siblings inside basic blocks.  A move is not
    // needed when the next sibling lives in the parent's spill slot (it was
    // spilled eagerly) or when the boundary is a block edge (resolved
    // below); constants flowing into a catch entry are materialized right
    // after it regardless.
    for vreg in 0..self.live_ranges.len() {
      let parent = match self.live_ranges[vreg] {
        Some(parent) => parent,
        None => continue,
      };
      let mut range = parent;
      while let Some(sibling) = self.rs.range(range).next_sibling {
        let range_loc = self.assigned_loc(range);
        let sibling_loc = self.assigned_loc(sibling);
        let range_end = self.rs.end(range);
        let sibling_start = self.rs.start(sibling);
        trace!("connecting [{}, {}) [{}] to [{}, {}) [{}]",
               self.rs.start(range), range_end, range_loc, sibling_start,
               self.rs.end(sibling), sibling_loc);

        let constant_to_catch = self.is_catch_block_entry(sibling_start)
          && range_loc.is_constant();
        if (range_end == sibling_start || constant_to_catch)
          && !self.target_location_is_spill_slot(range, sibling_loc)
          && range_loc != sibling_loc
          && (!self.is_block_entry(range_end) || constant_to_catch) {
          if self.is_catch_block_entry(sibling_start) {
            debug_assert!(!range_loc.is_register());
          }
          let pos = sibling_start
            + if self.is_catch_block_entry(sibling_start) { 1 } else { 0 };
          self.add_move_at(pos, sibling_loc, range_loc);
        }
        range = sibling;
      }
    }

    // Resolve non-linear control flow across branches.  Moves whose source
    // is the same on every incoming edge are candidates for sinking into
    // the join; they are collected in `pending` and emitted at the join
    // unless some predecessor overwrites their source first.
    let mut pending: Vec<(Location, Location)> = Vec::new();
    for bi in 1..self.graph.blocks.len() {
      let block = BlockId(bi as u32);
      let is_catch_entry = self.graph[block].is_catch_entry();
      let block_start = self.graph[block].start_pos;
      let live: Vec<usize> =
        self.liveness.live_in(block).iter_set_bits(..).collect();

      for vreg in live {
        let parent = self.live_ranges[vreg].expect("live-in without range");
        if self.rs.range(parent).next_sibling.is_none() && !is_catch_entry {
          // The whole range lives in one location; nothing to connect.
          trace!("range v{} has no siblings", vreg);
          continue;
        }

        let dst_cover = self.find_cover(parent, block_start);
        let dst = self.assigned_loc(dst_cover);
        trace!("range v{} is allocated to {} on entry to {:?}", vreg, dst,
               block);

        if self.target_location_is_spill_slot(dst_cover, dst) {
          // Eagerly spilled; the spill slot holds the value on every path.
          trace!("  [no resolution necessary - range is spilled]");
          continue;
        }

        if is_catch_entry {
          // Values arrive at a catch through spill slots; registers are
          // restored right after the catch entry.  The exception and stack
          // trace pseudo parameters have hard-coded locations.
          if dst != self.target.exception_location()
            && dst != self.target.stacktrace_location() {
            if dst.is_register() || dst.is_fpu_register() {
              let parent_spill = self.rs.range(parent).spill_slot;
              debug_assert!(!parent_spill.is_invalid());
              if dst != parent_spill {
                let pm =
                  self.block_entry_parallel_move(block, block_start + 1);
                self.graph.add_move_to(pm, dst, parent_spill);
              }
            }
          }
          continue;
        }

        let preds = self.graph[block].preds.clone();
        let mut src_locs: SmallVec<[Location; 2]> = SmallVec::new();
        for &pred in &preds {
          let src_cover =
            self.find_cover(parent, self.graph[pred].end_pos - 1);
          let src = self.assigned_loc(src_cover);
          src_locs.push(src);
          trace!("| incoming value in {} on exit from {:?}", src, pred);
        }

        // A single move at the join beats one per edge, but whether the
        // source survives every edge move is only known once all live-ins
        // are processed.
        if src_locs.len() > 1
          && src_locs.iter().all(|&loc| loc == src_locs[0]) {
          if dst != src_locs[0] {
            pending.push((dst, src_locs[0]));
          }
          continue;
        }

        for (j, &pred) in preds.iter().enumerate() {
          if dst == src_locs[j] {
            continue;
          }
          self.emit_move_on_edge(block, pred, dst, src_locs[j]);
        }
      }

      if !pending.is_empty() {
        let preds = self.graph[block].preds.clone();
        let mut can_emit = vec![true; pending.len()];
        let mut changed = false;

        // A pending move cannot sink into the join when a predecessor's
        // edge move overwrites its source.
        for j in 0..pending.len() {
          let src = pending[j].1;
          'preds: for &pred in &preds {
            let last =
              self.graph.terminator(pred).expect("empty predecessor");
            let pm = match self.graph[last].kind {
              InstrKind::Goto { .. } | InstrKind::TryEntry { .. } => {
                self.graph[last].edge_move
              }
              _ => panic!("join predecessor must end in a goto"),
            };
            if let Some(pm) = pm {
              for k in 0..self.graph[pm].moves.len() {
                let mv = self.graph[pm].moves[k];
                if !self.graph.move_is_redundant(mv)
                  && self.graph.slots[mv.dst] == src {
                  can_emit[j] = false;
                  changed = true;
                  break 'preds;
                }
              }
            }
          }
        }

        // Newly blocked moves stay on the edges, where they clobber their
        // destination; that may block further pending moves.
        while changed {
          changed = false;
          for j in 0..pending.len() {
            if !can_emit[j] {
              continue;
            }
            for k in 0..pending.len() {
              if !can_emit[k] && pending[k].0 == pending[j].1 {
                can_emit[j] = false;
                changed = true;
                break;
              }
            }
          }
        }

        for j in 0..pending.len() {
          let (dst, src) = pending[j];
          if can_emit[j] {
            let pm = self.block_entry_parallel_move(block, block_start);
            self.graph.add_move_to(pm, dst, src);
          } else {
            for &pred in &preds {
              self.emit_move_on_edge(block, pred, dst, src);
            }
          }
        }
        pending.clear();
      }
    }

    // Eagerly spill values at their definition.
    for i in 0..self.spilled.len() {
      let range = self.spilled[i];
      let assigned = self.assigned_loc(range);
      let spill_slot = self.rs.range(range).spill_slot;
      if assigned == spill_slot {
        continue;
      }
      if self.rs.start(range) == 0 {
        // Constants spilled from position 0 are materialized into their
        // slot in the function entries instead.
        assert!(assigned.is_constant());
        let succs = self.graph[BlockId(0)].succs.clone();
        for succ in succs {
          if self.graph[succ].kind == BlockKind::FunctionEntry {
            let pos = self.graph[succ].start_pos + 1;
            self.add_move_at(pos, spill_slot, assigned);
          }
        }
      } else {
        trace!("inserting eager spill to {} at {} for v{} allocated to {}",
               spill_slot, self.rs.start(range) + 1,
               self.rs.range(range).vreg, assigned);
        let pos = self.rs.start(range) + 1;
        self.add_move_at(pos, spill_slot, assigned);
      }
    }
  }

  /// Leaf functions with no spills and no frame-demanding instructions run
  /// without a frame; their parameters are rebased from FP to the entry SP.
  pub fn remove_frame_if_not_needed(&mut self) {
    // Intrinsic functions are naturally frameless.
    if self.intrinsic_mode {
      self.graph.frameless = true;
      return;
    }
    if !self.allow_frameless {
      return;
    }

    // Copying of parameters accesses the frame directly.
    if self.graph.makes_copy_of_parameters {
      return;
    }

    if self.graph.spill_slot_count > 0 {
      return;
    }

    let mut has_write_barrier_call = false;
    let mut calls_on_shared_slow_path = 0;
    for block in &self.graph.blocks {
      for &instr in &block.instrs {
        let summary = self.graph.instrs[instr.index()].summary;
        if self.graph.summaries[summary.index()].can_call() {
          if !self.graph.summaries[summary.index()].call_on_shared_slow_path
          {
            // The function contains a call and thus needs a frame.
            return;
          }
          // Shared slow paths build their frame around the call; more than
          // one is not worth the code size.
          calls_on_shared_slow_path += 1;
          if calls_on_shared_slow_path > 1 {
            return;
          }
        }

        // Write barriers call a leaf stub.  Targets that keep the return
        // address in a link register must spill it around the stub, and
        // the barrier sequence supports that for at most one call site.
        if self.target.preserves_link_register
          && self.graph.instrs[instr.index()].has_write_barrier {
          if has_write_barrier_call {
            return;
          }
          has_write_barrier_call = true;
        }
      }
    }

    self.graph.frameless = true;

    // Parameters were addressed relative to FP; rebase them onto the entry
    // SP.
    let succs = self.graph[BlockId(0)].succs.clone();
    for succ in succs {
      if self.graph[succ].kind != BlockKind::FunctionEntry {
        continue;
      }
      let defs = self.graph[succ].initial_defs.clone();
      for def in defs {
        if let DefKind::Param { .. } = self.graph[def].kind {
          let vreg = self.graph[def].vreg;
          self.fix_parameter_location(def, vreg, 0);
          if let Some(second) = self.graph[def].second_vreg {
            self.fix_parameter_location(def, second, 1);
          }
        }
      }
    }
  }

  fn fix_parameter_location(&mut self, def: DefId, vreg: VReg,
                            pair_index: usize) {
    let mut location = match self.graph[def].kind {
      DefKind::Param { location, .. } => location,
      _ => unreachable!("fixing location of a non-parameter"),
    };
    if let Location::Pair(lo, hi) = location {
      location = self.graph.slots[if pair_index == 1 { hi } else { lo }];
    }
    if !location.has_stack_index() || location.base_reg() != BaseReg::Fp {
      return;
    }

    let fp_relative = location;
    let sp_relative = self.target.frame.to_entry_sp_relative(fp_relative);

    let mut current = self.live_ranges[vreg as usize];
    while let Some(range) = current {
      if self.assigned_loc(range) == fp_relative {
        self.set_assigned_loc(range, sp_relative);
        self.rs.range_mut(range).spill_slot = sp_relative;
        let mut use_id = self.rs.range(range).first_use;
        while let Some(u) = use_id {
          let slot = self.rs.use_pos(u).slot;
          debug_assert_eq!(self.graph.slots[slot], fp_relative);
          self.graph.slots[slot] = sp_relative;
          use_id = self.rs.use_pos(u).next;
        }
      }
      current = self.rs.range(range).next_sibling;
    }
  }

  /// Outgoing arguments are stored at the top of the stack in direct order
  /// (last argument on top); their slots sit past all spill slots.
  pub fn allocate_outgoing_arguments(&mut self) {
    let total_spill_slot_count = self.graph.spill_slot_count as i32;

    for i in 0..self.graph.arg_moves.len() {
      let arg = ArgMoveId(i as u32);
      if self.graph.is_register_arg_move(arg) {
        continue;
      }
      let spill_index =
        (total_spill_slot_count - 1) - self.graph[arg].sp_relative_index;
      let slot_index =
        self.target.frame.frame_slot_for_variable_index(-spill_index);
      let loc = if self.graph[arg].rep == Rep::UnboxedDouble {
        Location::double_stack_slot(slot_index, BaseReg::Fp)
      } else {
        Location::stack_slot(slot_index, BaseReg::Fp)
      };
      let slot = self.graph[arg].location;
      self.graph.slots[slot] = loc;
    }
  }

  /// Hand every emitted parallel move to the external resolver, in
  /// execution order.
  pub fn schedule_parallel_moves(&mut self, resolver: &mut dyn MoveResolver) {
    for bi in 0..self.graph.blocks.len() {
      let block = BlockId(bi as u32);
      if let Some(pm) = self.graph[block].entry_move {
        resolver.resolve(self.graph, pm);
      }
      let instrs = self.graph[block].instrs.clone();
      for instr in instrs {
        if let Some(pm) = self.graph[instr].move_before {
          resolver.resolve(self.graph, pm);
        }
        if let Some(pm) = self.graph[instr].move_after {
          resolver.resolve(self.graph, pm);
        }
        if let Some(pm) = self.graph[instr].edge_move {
          resolver.resolve(self.graph, pm);
        }
      }
    }
  }
}
