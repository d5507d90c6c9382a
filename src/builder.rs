/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Lifetime numbering and live-range construction.
//!
//! Blocks are numbered in code-generation order; every instruction owns an
//! even start and an odd end position.  Ranges are then built by walking
//! blocks in reverse order and instructions backwards within each block:
//! values live out of a block optimistically get an interval spanning the
//! whole block, which the definition later shrinks.
//!
//! When describing the shape of live ranges in comments we use the
//! notation of a position diagram:
//!
//! ```text
//!     i  i'   start and end of an instruction
//!     -       body of a use interval
//!     [       start of a use interval
//!     )       end of a use interval
//!     *       use
//! ```

use log::trace;

use crate::allocator::{Allocator, PosEntry, SafepointSource, ExtraLoopInfo};
use crate::ir::{
  BlockId, BlockKind, DefId, DefKind, EnvValue, InstrId, InstrKind, MatId,
  VReg,
};
use crate::location::{Location, Policy, RegKind, SlotId};
use crate::ranges::{is_instruction_start_position, RangeId};

fn register_kind_from_policy(policy: Policy) -> RegKind {
  if policy == Policy::RequiresFpuRegister {
    RegKind::Fpu
  } else {
    RegKind::Cpu
  }
}

impl<'g> Allocator<'g> {
  /// Visit blocks in code-generation order and assign each instruction a
  /// pair of lifetime positions: `2 * n` for its start and `2 * n + 1` for
  /// its end.  Uses at the start position ask for the value only at the
  /// beginning of the instruction; uses at the end keep it live through the
  /// instruction's body.  Also creates the empty phi-resolution moves on
  /// the predecessors of every join.
  pub fn number_instructions(&mut self) {
    let mut pos = 0;
    for bi in 0..self.graph.blocks.len() {
      let block = BlockId(bi as u32);
      self.positions.push(PosEntry::Block(block));
      self.block_at.push(block);
      self.graph[block].start_pos = pos;
      pos += 2;

      let instrs = self.graph[block].instrs.clone();
      for instr in instrs {
        self.positions.push(PosEntry::Instr(instr));
        self.block_at.push(block);
        self.graph[instr].pos = pos;
        pos += 2;
      }
      self.graph[block].end_pos = pos;
    }

    // Create phi resolution moves in join predecessors.  They are filled
    // by the register allocator.
    for bi in 0..self.graph.blocks.len() {
      let block = BlockId(bi as u32);
      if self.graph[block].kind != BlockKind::JoinEntry {
        continue;
      }
      let mut move_count = 0;
      for phi in &self.graph[block].phis {
        move_count +=
          if self.graph[phi.def].has_pair_representation() { 2 } else { 1 };
      }
      if move_count == 0 {
        continue;
      }
      let preds = self.graph[block].preds.clone();
      for pred in preds {
        let last = self.graph.terminator(pred).expect("empty predecessor");
        match self.graph[last].kind {
          InstrKind::Goto { .. } | InstrKind::TryEntry { .. } => {}
          _ => panic!("join predecessor must end in a goto"),
        }
        let pm = self.edge_parallel_move(last);
        for _ in 0..move_count {
          self.graph.add_move_to(pm, Location::Invalid, Location::Invalid);
        }
      }
    }

    // Extra loop information: positions covered by each loop.
    for li in 0..self.graph.loops.len() {
      let header = self.graph.loops[li].header;
      let start = self.graph[header].start_pos;
      let mut end = start;
      for &back_edge in &self.graph.loops[li].back_edges {
        end = end.max(self.graph[back_edge].end_pos);
      }
      self.extra_loops.push(ExtraLoopInfo {
        start,
        end,
        backedge_interference: None,
      });
    }
  }

  fn add_backedge_interference(&mut self, loop_id: usize, vreg: VReg) {
    if let Some(set) = &mut self.extra_loops[loop_id].backedge_interference {
      set.set(vreg as usize, true);
    }
  }

  /// Visit blocks in reverse order and build live ranges for all SSA
  /// values.
  pub fn build_live_ranges(&mut self) {
    let block_count = self.graph.blocks.len();
    debug_assert_eq!(self.graph.blocks[0].kind, BlockKind::GraphEntry);

    // Interference set of the loop whose back edge was seen most recently;
    // phi moves on the back edge conflict with everything live into the
    // loop header.
    let mut interference: Option<usize> = None;

    for bi in (1..block_count).rev() {
      let block = BlockId(bi as u32);
      debug_assert_eq!(self.block_entry_at(self.graph[block].start_pos),
                       block);
      let block_start = self.graph[block].start_pos;
      let block_end = self.graph[block].end_pos;

      // For every SSA value that is live out of this block, create an
      // interval that covers the whole block.  It will be shortened if we
      // encounter a definition of this value in this block.
      let live_out: Vec<usize> =
        self.liveness.live_out(block).iter_set_bits(..).collect();
      for vreg in live_out {
        let range = self.get_live_range(vreg as VReg);
        self.rs.add_use_interval(range, block_start, block_end);
      }

      if let Some(loop_id) = self.graph[block].loop_id {
        if self.graph[loop_id].is_back_edge(block) {
          let li = loop_id.index();
          if self.extra_loops[li].backedge_interference.is_some() {
            // Restore interference for a subsequent back edge of the loop
            // (an inner loop's header may have reset it in the meanwhile).
            interference = Some(li);
          } else {
            // All values flowing into the loop header are live at the
            // back edge and can interfere with phi moves.
            let header = self.graph[loop_id].header;
            let set = self.liveness.live_in(header).clone();
            self.extra_loops[li].backedge_interference = Some(set);
            interference = Some(li);
          }
        }
      }

      // Connect outgoing phi moves that were created in
      // number_instructions, then process the remaining instructions in
      // reverse order.
      let process_count = self.connect_outgoing_phi_moves(block,
                                                          interference);

      let mut surrounding_catch = if self.liveness.block_may_throw(block) {
        self.graph[block].try_index
          .map(|try_index| self.graph.catch_block_for_try(try_index))
      } else {
        None
      };

      let instrs = self.graph[block].instrs.clone();
      for &instr in instrs[..process_count].iter().rev() {
        if let Some(catch_block) = surrounding_catch {
          if self.graph[instr].may_throw {
            let current_pos = self.graph[instr].pos;
            // For every SSA value live into the catch, create an interval
            // covering this block up to the throwing instruction.  A value
            // live into the catch is live into this block as well, since
            // its definition dominates the catch.  One extension covering
            // the last throw point suffices.
            let live: Vec<usize> = self.liveness
              .live_in(catch_block).iter_set_bits(..).collect();
            for vreg in live {
              let range = self.get_live_range(vreg as VReg);
              self.rs.add_use_interval(range, block_start, current_pos + 1);
            }
            surrounding_catch = None;
          }
        }
        self.process_one_instruction(block, instr, interference);
      }

      // Check if any values live into the loop can be spilled for free.
      if let Some(loop_id) = self.graph.loop_headed_by(block) {
        interference = None;
        let loop_end = self.extra_loops[loop_id.index()].end;
        let live_in: Vec<usize> =
          self.liveness.live_in(block).iter_set_bits(..).collect();
        for vreg in live_in {
          let range = self.get_live_range(vreg as VReg);
          if self.rs.has_only_unconstrained_uses(range, &self.graph.slots,
                                                 Some(loop_end)) {
            self.rs.range_mut(range)
              .mark_has_only_unconstrained_uses_in_loop(loop_id.index());
          }
        }
      }

      match self.graph[block].kind {
        BlockKind::JoinEntry => self.connect_incoming_phi_moves(block),
        BlockKind::CatchEntry { .. } => {
          // Catch entries are briefly safepoints after the catch entry
          // moves execute and before execution jumps to the handler.
          let summary = self.graph[block].summary
            .expect("catch entry without location summary");
          self.safepoints.push(SafepointSource {
            pos: block_start,
            summary,
            instr: None,
            catch_block: Some(block),
          });

          let defs = self.graph[block].initial_defs.clone();
          for def in defs {
            let range = self.get_live_range(self.graph[def].vreg);
            self.rs.define_at(range, block_start);
            self.process_initial_definition(def, range, block, false);
          }
        }
        BlockKind::FunctionEntry | BlockKind::OsrEntry => {
          let defs = self.graph[block].initial_defs.clone();
          for def in defs {
            if self.graph[def].has_pair_representation() {
              // The lower half is pushed after the higher half.
              let second = self.graph[def].second_vreg.unwrap();
              let range = self.get_live_range(second);
              self.rs.add_use_interval(range, block_start, block_start + 2);
              self.rs.define_at(range, block_start);
              self.process_initial_definition(def, range, block, true);
            }
            let range = self.get_live_range(self.graph[def].vreg);
            self.rs.add_use_interval(range, block_start, block_start + 2);
            self.rs.define_at(range, block_start);
            self.process_initial_definition(def, range, block, false);
          }
        }
        _ => {}
      }
    }

    // Process incoming parameters and constants.  Do this after all other
    // instructions so that safepoints for all calls have already been
    // found.
    let entry = BlockId(0);
    let entry_start = self.graph[entry].start_pos;
    let entry_end = self.graph[entry].end_pos;
    let defs = self.graph[entry].initial_defs.clone();
    for def in defs {
      if self.graph[def].has_pair_representation() {
        let second = self.graph[def].second_vreg.unwrap();
        let range = self.get_live_range(second);
        self.rs.add_use_interval(range, entry_start, entry_end);
        self.rs.define_at(range, entry_start);
        self.process_initial_definition(def, range, entry, true);
      }
      let range = self.get_live_range(self.graph[def].vreg);
      self.rs.add_use_interval(range, entry_start, entry_end);
      self.rs.define_at(range, entry_start);
      self.process_initial_definition(def, range, entry, false);
    }
  }

  /// Record the phi input uses this block contributes through its goto's
  /// parallel move.  Returns how many body instructions remain for the
  /// backward walk (gotos carry no operands of their own).
  fn connect_outgoing_phi_moves(
    &mut self, block: BlockId, interference: Option<usize>,
  ) -> usize {
    let count = self.graph[block].instrs.len();
    let last = match self.graph.terminator(block) {
      Some(last) => last,
      None => return 0,
    };

    let target = match self.graph[last].kind {
      InstrKind::Goto { target } => target,
      _ => return count,
    };

    // A parallel move on the goto means the successor is a join with
    // phis; each phi input is used here, at the position of the move.
    let pm = match self.graph[last].edge_move {
      Some(pm) => pm,
      None => return count - 1,
    };
    let pos = self.graph[last].pos;
    let block_start = self.graph[block].start_pos;

    let pred_index = self.graph[target].preds.iter()
      .position(|&p| p == block).expect("goto target lost predecessor");

    let mut move_index = 0;
    for phi_index in 0..self.graph[target].phis.len() {
      let phi_def = self.graph[target].phis[phi_index].def;
      let input = self.graph[target].phis[phi_index].inputs[pred_index];
      let is_pair = self.graph[phi_def].has_pair_representation();

      if self.graph[input].kind == DefKind::Constant {
        let src = self.graph.move_src_slot(pm, move_index);
        self.graph.slots[src] = Location::constant(input);
        move_index += 1;
        if is_pair {
          let src = self.graph.move_src_slot(pm, move_index);
          self.graph.slots[src] = Location::constant_half(input, 1);
          move_index += 1;
        }
        continue;
      }

      // Expected shape of live ranges:
      //
      //                 g  g'
      //      value    --*
      //
      let vreg = self.graph[input].vreg;
      let range = self.get_live_range(vreg);
      if let Some(loop_id) = interference {
        self.add_backedge_interference(loop_id, vreg);
      }
      self.rs.add_use_interval(range, block_start, pos);
      let phi_range = self.get_live_range(self.graph[phi_def].vreg);
      let hint = self.rs.range(phi_range).assigned_slot;
      let src = self.graph.move_src_slot(pm, move_index);
      self.rs.add_hinted_use(range, pos, src, hint);
      self.graph.slots[src] = Location::prefers_register();
      move_index += 1;

      if is_pair {
        let vreg = self.graph[input].second_vreg.expect("pair phi input");
        let range = self.get_live_range(vreg);
        if let Some(loop_id) = interference {
          self.add_backedge_interference(loop_id, vreg);
        }
        self.rs.add_use_interval(range, block_start, pos);
        let phi_second = self.graph[phi_def].second_vreg.unwrap();
        let phi_range = self.get_live_range(phi_second);
        let hint = self.rs.range(phi_range).assigned_slot;
        let src = self.graph.move_src_slot(pm, move_index);
        self.rs.add_hinted_use(range, pos, src, hint);
        self.graph.slots[src] = Location::prefers_register();
        move_index += 1;
      }
    }

    count - 1
  }

  /// Add the destinations of the phi resolution moves to each phi's live
  /// range so the allocator fills them.
  fn connect_incoming_phi_moves(&mut self, join: BlockId) {
    // All uses are recorded at the start position of the block.
    let pos = self.graph[join].start_pos;
    let is_loop_header = self.graph.loop_headed_by(join).is_some();

    let mut move_index = 0;
    for phi_index in 0..self.graph[join].phis.len() {
      let phi_def = self.graph[join].phis[phi_index].def;
      let vreg = self.graph[phi_def].vreg;
      debug_assert!(vreg >= 0);
      let is_pair = self.graph[phi_def].has_pair_representation();

      // Expected shape of live range:
      //
      //                 B
      //      phi        [--------
      //
      let range = self.get_live_range(vreg);
      self.rs.define_at(range, pos);
      if is_loop_header {
        self.rs.range_mut(range).is_loop_phi = true;
      }
      let second_range = if is_pair {
        let second = self.graph[phi_def].second_vreg.unwrap();
        let second_range = self.get_live_range(second);
        self.rs.define_at(second_range, pos);
        if is_loop_header {
          self.rs.range_mut(second_range).is_loop_phi = true;
        }
        Some(second_range)
      } else {
        None
      };

      let preds = self.graph[join].preds.clone();
      for pred in preds {
        let last = self.graph.terminator(pred).expect("empty predecessor");
        debug_assert!(
          matches!(self.graph[last].kind, InstrKind::Goto { .. })
        );
        let pm = self.graph[last].edge_move
          .expect("missing phi resolution move");
        let dst = self.graph.move_dst_slot(pm, move_index);
        self.graph.slots[dst] = Location::prefers_register();
        self.rs.add_use(range, pos, dst);
        if let Some(second_range) = second_range {
          let dst = self.graph.move_dst_slot(pm, move_index + 1);
          self.graph.slots[dst] = Location::prefers_register();
          self.rs.add_use(second_range, pos, dst);
        }
      }

      // All phi resolution moves are connected; the live range is
      // complete.
      let kind = self.graph[phi_def].rep.register_kind();
      self.complete_definition(Some(phi_def), range);
      self.complete_range_kind(range, kind);
      if let Some(second_range) = second_range {
        self.complete_definition(Some(phi_def), second_range);
        self.complete_range_kind(second_range, kind);
      }

      move_index += if is_pair { 2 } else { 1 };
    }
  }

  /// Any value mentioned in the deoptimization environment should survive
  /// until the end of the instruction but does not need a register.
  ///
  /// Expected shape of live range:
  ///
  /// ```text
  ///                 i  i'
  ///      value    -----*
  /// ```
  fn process_environment_uses(&mut self, block: BlockId, instr: InstrId) {
    let block_start = self.graph[block].start_pos;
    let use_pos = self.graph[instr].pos + 1;

    let mut env = self.graph[instr].env;
    while let Some(env_id) = env {
      let values = self.graph[env_id].values.clone();
      if values.is_empty() {
        env = self.graph[env_id].outer;
        continue;
      }

      let mut locations = Vec::with_capacity(values.len());
      for value in values {
        match value {
          EnvValue::Mat(mat) => {
            // The materialization itself produces no value, but its uses
            // are part of the environment: the allocated locations feed
            // the deoptimization data.
            locations.push(self.graph.slots.alloc(Location::Invalid));
            self.process_materialization_uses(block_start, use_pos, mat);
          }
          EnvValue::Def(def) => {
            let info = self.graph[def];
            match info.kind {
              DefKind::ArgMove(_) => {
                // Frame size is unknown until after allocation.
                locations.push(self.graph.slots.alloc(Location::Invalid));
              }
              DefKind::Constant => {
                locations.push(
                  self.graph.slots.alloc(Location::constant(def)),
                );
              }
              _ => {
                if let Some(second) = info.second_vreg {
                  let lo = self.graph.slots.alloc(Location::any());
                  let hi = self.graph.slots.alloc(Location::any());
                  locations.push(
                    self.graph.slots.alloc(Location::Pair(lo, hi)),
                  );
                  let range = self.get_live_range(info.vreg);
                  self.rs.add_use_interval(range, block_start, use_pos);
                  self.rs.add_use(range, use_pos, lo);
                  let range = self.get_live_range(second);
                  self.rs.add_use_interval(range, block_start, use_pos);
                  self.rs.add_use(range, use_pos, hi);
                } else {
                  let slot = self.graph.slots.alloc(Location::any());
                  locations.push(slot);
                  let range = self.get_live_range(info.vreg);
                  self.rs.add_use_interval(range, block_start, use_pos);
                  self.rs.add_use(range, use_pos, slot);
                }
              }
            }
          }
        }
      }

      self.graph[env_id].locations = locations;
      env = self.graph[env_id].outer;
    }
  }

  /// A materialization can occur several times in a deoptimization chain;
  /// its inputs are processed only once.
  fn process_materialization_uses(
    &mut self, block_start: i32, use_pos: i32, mat: MatId,
  ) {
    if !self.graph[mat].locations.is_empty() {
      return;
    }

    let inputs = self.graph[mat].inputs.clone();
    let mut locations = Vec::with_capacity(inputs.len());
    for input in inputs {
      match input {
        EnvValue::Mat(inner) => {
          locations.push(self.graph.slots.alloc(Location::Invalid));
          self.process_materialization_uses(block_start, use_pos, inner);
        }
        EnvValue::Def(def) => {
          let info = self.graph[def];
          match info.kind {
            DefKind::Constant => {
              locations
                .push(self.graph.slots.alloc(Location::constant(def)));
            }
            _ => {
              if let Some(second) = info.second_vreg {
                let lo = self.graph.slots.alloc(Location::any());
                let hi = self.graph.slots.alloc(Location::any());
                locations
                  .push(self.graph.slots.alloc(Location::Pair(lo, hi)));
                let range = self.get_live_range(info.vreg);
                self.rs.add_use_interval(range, block_start, use_pos);
                self.rs.add_use(range, use_pos, lo);
                let range = self.get_live_range(second);
                self.rs.add_use_interval(range, block_start, use_pos);
                self.rs.add_use(range, use_pos, hi);
              } else {
                let slot = self.graph.slots.alloc(Location::any());
                locations.push(slot);
                let range = self.get_live_range(info.vreg);
                self.rs.add_use_interval(range, block_start, use_pos);
                self.rs.add_use(range, use_pos, slot);
              }
            }
          }
        }
      }
    }
    self.graph[mat].locations = locations;
  }

  fn process_one_input(
    &mut self, block: BlockId, pos: i32, in_slot: SlotId, vreg: VReg,
    live_registers_of: Option<crate::ir::SummaryId>,
  ) {
    let in_loc = self.graph.slots[in_slot];
    debug_assert!(!in_loc.is_pair());
    let block_start = self.graph[block].start_pos;
    let range = self.get_live_range(vreg);

    if in_loc.is_machine_register() {
      // Input is expected in a fixed register.  Expected shape of live
      // ranges:
      //
      //                 j' i  i'
      //      value    --*
      //      register   [-----)
      //
      if let Some(summary) = live_registers_of {
        let rep = self.rs.range(range).rep;
        self.graph[summary].live_registers.add(in_loc, rep);
      }
      debug_assert!(
        !in_loc.is_register()
          || (self.target.allocatable_cpu_registers
              & (1 << in_loc.register_code())) != 0
      );
      let (_, src) = self.add_move_at(pos - 1, in_loc, Location::any());
      self.block_location(in_loc, pos - 1, pos + 1);
      self.rs.add_use_interval(range, block_start, pos - 1);
      self.rs.add_hinted_use(range, pos - 1, src, in_slot);
    } else if in_loc.is_unallocated() {
      if in_loc.policy() == Policy::WritableRegister {
        // Writable unallocated input.  The value is copied into a fresh
        // temporary the instruction may clobber.  Expected shape of live
        // ranges:
        //
        //                 i  i'
        //      value    --*
        //      temp       [--)
        let (dst, src) = self.add_move_at(pos, Location::requires_register(),
                                          Location::prefers_register());

        self.rs.add_use_interval(range, block_start, pos);
        self.rs.add_use(range, pos, src);

        let temp = self.make_live_range_for_temporary();
        self.rs.add_use_interval(temp, pos, pos + 1);
        self.rs.add_hinted_use(temp, pos, in_slot, src);
        self.rs.add_use(temp, pos, dst);
        self.graph.slots[in_slot] = Location::requires_register();
        self.complete_range_kind(
          temp, register_kind_from_policy(Policy::RequiresRegister),
        );
      } else {
        if in_loc.policy() == Policy::RequiresStack {
          self.rs.range_mut(range).has_uses_which_require_stack = true;
        }

        // Normal unallocated input.  Expected shape of live ranges:
        //
        //                 i  i'
        //      value    -----*
        //
        self.rs.add_use_interval(range, block_start, pos + 1);
        self.rs.add_use(range, pos + 1, in_slot);
      }
    } else {
      debug_assert!(in_loc.is_constant());
    }
  }

  fn process_one_output(
    &mut self, block: BlockId, pos: i32, out_slot: SlotId, def: DefId,
    vreg: VReg, output_same_as_first_input: bool, in_slot: Option<SlotId>,
    input_vreg: VReg, interference: Option<usize>,
  ) {
    let out_loc = self.graph.slots[out_slot];
    debug_assert!(!out_loc.is_pair());
    let block_start = self.graph[block].start_pos;

    let range = if vreg >= 0 {
      self.get_live_range(vreg)
    } else {
      self.make_live_range_for_temporary()
    };

    if out_loc.is_machine_register() {
      // Fixed output location.  Expected shape of live range:
      //
      //                    i  i' j  j'
      //    register        [--)
      //    output             [-------
      //
      debug_assert!(
        !out_loc.is_register()
          || (self.target.allocatable_cpu_registers
              & (1 << out_loc.register_code())) != 0
      );
      self.block_location(out_loc, pos, pos + 1);

      if self.rs.range(range).vreg == crate::ranges::TEMP_VREG {
        return;
      }

      // If the value has no uses we don't need to allocate it.
      if self.rs.range(range).first_use.is_none() {
        return;
      }

      // Connect the fixed output to all inputs that immediately follow, to
      // avoid allocating an intermediary register.
      let mut use_id = self.rs.range(range).first_use;
      while let Some(u) = use_id {
        let use_pos = self.rs.use_pos(u).pos;
        if use_pos == pos + 1 {
          debug_assert!(
            self.graph.slots[self.rs.use_pos(u).slot].is_unallocated()
          );
          let slot = self.rs.use_pos(u).slot;
          self.graph.slots[slot] = out_loc;
          use_id = self.rs.use_pos(u).next;
          self.rs.set_first_use(range, use_id);
        } else {
          debug_assert!(use_pos > pos + 1); // sorted
          break;
        }
      }

      // Shorten the live range to the point of definition; this might make
      // the range empty if the only use immediately followed.  Otherwise
      // route the value from the fixed register to a location of the
      // allocator's choice.
      self.rs.define_at(range, pos + 1);
      if self.rs.start(range) == self.rs.end(range) {
        return;
      }

      let (dst, _) = self.add_move_at(pos + 1, Location::any(), out_loc);
      self.rs.add_hinted_use(range, pos + 1, dst, out_slot);
    } else if output_same_as_first_input {
      let in_slot = in_slot.expect("same-as-first-input without input");
      // The output register will contain the value of the first input at
      // the instruction's start.  Expected shape of live ranges:
      //
      //                 i  i'
      //    input #0   --*
      //    output       [----
      //
      debug_assert!(matches!(
        self.graph.slots[in_slot],
        Location::Unallocated(Policy::RequiresRegister)
          | Location::Unallocated(Policy::RequiresFpuRegister)
      ));
      self.graph.slots[out_slot] = self.graph.slots[in_slot];

      // Create the move copying the input into the output.  Inside loops
      // prefer a register for the moved value, but do not require one.
      let inside_loop = self.graph[block].loop_id.is_some();
      let (dst, src) = self.add_move_at(
        pos, Location::requires_register(),
        if inside_loop { Location::prefers_register() } else {
          Location::any()
        },
      );

      let input_range = self.get_live_range(input_vreg);
      self.rs.add_use_interval(input_range, block_start, pos);
      self.rs.add_use(input_range, pos, src);

      // Shorten the output live range to the point of definition and add
      // both input and output use slots to be filled by the allocator.
      self.rs.define_at(range, pos);
      self.rs.add_hinted_use(range, pos, out_slot, src);
      self.rs.add_use(range, pos, dst);
      self.rs.add_use(range, pos, in_slot);

      if let Some(loop_id) = interference {
        let out_vreg = self.rs.range(range).vreg;
        let interferes = out_vreg >= 0
          && self.extra_loops[loop_id].backedge_interference.as_ref()
            .map_or(false, |s| s.get(out_vreg as usize).unwrap_or(false));
        if interferes {
          self.add_backedge_interference(loop_id, input_vreg);
        }
      }
    } else {
      // Normal unallocated location requiring a register.  Expected shape
      // of live range:
      //
      //                    i  i'
      //    output          [-------
      //
      debug_assert!(matches!(
        out_loc,
        Location::Unallocated(Policy::RequiresRegister)
          | Location::Unallocated(Policy::RequiresFpuRegister)
      ));
      self.rs.define_at(range, pos);
      self.rs.add_use(range, pos, out_slot);
    }

    let kind = self.graph[def].rep.register_kind();
    self.complete_definition(Some(def), range);
    self.complete_range_kind(range, kind);
  }

  /// True when `def` has no uses after `instr`.  Only valid while building
  /// ranges: uses are prepended monotonically, so any use after the current
  /// instruction shows up as a first interval starting within this block.
  fn is_dead_after_current_instruction(
    &mut self, block: BlockId, _instr: InstrId, def: DefId,
  ) -> bool {
    if self.graph[def].has_pair_representation() {
      return false;
    }
    let block_end = self.graph[block].end_pos;
    let range = self.get_live_range(self.graph[def].vreg);
    match self.rs.range(range).first_interval {
      None => true,
      Some(first) => self.rs.interval(first).start >= block_end,
    }
  }

  /// Create and update live ranges for the instruction's inputs, temps and
  /// output.
  pub fn process_one_instruction(
    &mut self, block: BlockId, instr: InstrId, interference: Option<usize>,
  ) {
    let summary = self.graph[instr].summary;

    // Constants need no registers unless a constrained use demands one.
    if let Some(def) = self.graph[instr].defined {
      if self.graph[def].kind == DefKind::Constant {
        debug_assert!(!self.graph[def].has_pair_representation());
        let vreg = self.graph[def].vreg;
        let range =
          if vreg != -1 { Some(self.get_live_range(vreg)) } else { None };

        // Drop definitions of constants that have no uses.
        if range.map_or(true, |r| self.rs.range(r).first_use.is_none()) {
          let out = self.graph[summary].out;
          self.graph.slots[out] = Location::Invalid;
          return;
        }
        let range = range.unwrap();

        // If this constant has only unconstrained uses convert them all to
        // use the constant directly and drop the definition.
        if self.rs.has_only_unconstrained_uses(range, &self.graph.slots,
                                               None) {
          self.set_assigned_loc(range, Location::constant(def));
          self.rs.range_mut(range).spill_slot = Location::constant(def);
          self.rs.finger_initialize(range);
          self.convert_all_uses(range);
          let out = self.graph[summary].out;
          self.graph.slots[out] = Location::Invalid;
          return;
        }
      }
    }

    let pos = self.graph[instr].pos;
    debug_assert!(is_instruction_start_position(pos));
    debug_assert_eq!(self.graph[summary].inputs.len(),
                     self.graph[instr].inputs.len());

    let out_slot = self.graph[summary].out;

    // Normalize a same-as-first-input output when the input is a fixed
    // register (or a pair of them).
    if self.graph.slots[out_slot]
      == Location::Unallocated(Policy::SameAsFirstInput) {
      let in_slot = self.graph[summary].inputs[0];
      match self.graph.slots[in_slot] {
        Location::Pair(lo, hi) => {
          debug_assert_eq!(self.graph.slots[lo].is_machine_register(),
                           self.graph.slots[hi].is_machine_register());
          if self.graph.slots[lo].is_machine_register()
            && self.graph.slots[hi].is_machine_register() {
            let lo_loc = self.graph.slots[lo];
            let hi_loc = self.graph.slots[hi];
            let pair = self.graph.pair_location(lo_loc, hi_loc);
            self.graph.slots[out_slot] = pair;
          }
        }
        in_loc if in_loc.is_machine_register() => {
          self.graph.slots[out_slot] = in_loc;
        }
        _ => {}
      }
    }

    if self.graph.slots[out_slot]
      == Location::Unallocated(Policy::SameAsFirstOrSecondInput) {
      let in_left = self.graph.slots[self.graph[summary].inputs[0]];
      let in_right = self.graph.slots[self.graph[summary].inputs[1]];
      if in_left == in_right {
        // If the first input outlives this instruction but the second does
        // not, flip them to reduce register pressure and avoid a redundant
        // move.
        let left_def = self.graph[instr].inputs[0];
        let right_def = self.graph[instr].inputs[1];
        if !self.is_dead_after_current_instruction(block, instr, left_def)
          && self.is_dead_after_current_instruction(block, instr, right_def)
        {
          self.graph[instr].inputs.swap(0, 1);
        }
      }
      self.graph.slots[out_slot] = Location::same_as_first_input();
    }

    if self.graph.slots[out_slot]
      == Location::Unallocated(Policy::MayBeSameAsFirstInput) {
      let input_def = self.graph[instr].inputs[0];
      self.graph.slots[out_slot] = if self
        .is_dead_after_current_instruction(block, instr, input_def) {
        Location::same_as_first_input()
      } else {
        Location::requires_register()
      };
    }

    let output_same_as_first_input =
      self.graph.slots[out_slot] == Location::same_as_first_input();

    // The output of a pair-input instruction is a pair itself.
    if output_same_as_first_input
      && self.graph.slots[self.graph[summary].inputs[0]].is_pair() {
      let pair = self.graph.pair_location(Location::requires_register(),
                                          Location::requires_register());
      self.graph.slots[out_slot] = pair;
    }

    // Add uses from the deoptimization environment.
    if self.graph[instr].env.is_some() {
      self.process_environment_uses(block, instr);
    }

    // Process inputs.  The first input is skipped for same-as-first-input
    // outputs; it is processed together with the output at the very end.
    let live_registers_of = if self.graph[summary].has_call_on_slow_path() {
      Some(summary)
    } else {
      None
    };
    let first_input = if output_same_as_first_input { 1 } else { 0 };
    for j in first_input..self.graph[summary].inputs.len() {
      let in_slot = self.graph[summary].inputs[j];
      let input = self.graph[instr].inputs[j];
      match self.graph.slots[in_slot] {
        Location::Pair(lo, hi) => {
          // Each half of the pair has its own virtual register and gets
          // its own live range.
          debug_assert!(self.graph[input].has_pair_representation());
          let (vreg, second) =
            (self.graph[input].vreg, self.graph[input].second_vreg.unwrap());
          self.process_one_input(block, pos, lo, vreg, live_registers_of);
          self.process_one_input(block, pos, hi, second, live_registers_of);
        }
        _ => {
          let vreg = self.graph[input].vreg;
          self.process_one_input(block, pos, in_slot, vreg,
                                 live_registers_of);
        }
      }
    }

    // Outgoing arguments moved in registers are fixed register inputs.
    let move_args = self.graph[instr].move_args.clone();
    for arg in move_args {
      if !self.graph.is_register_arg_move(arg) {
        continue;
      }
      let value = self.graph[arg].value;
      let loc_slot = self.graph[arg].location;
      match self.graph.slots[loc_slot] {
        Location::Pair(lo, hi) => {
          assert!(self.graph.slots[lo].is_machine_register()
                  && self.graph.slots[hi].is_machine_register());
          let (vreg, second) =
            (self.graph[value].vreg, self.graph[value].second_vreg.unwrap());
          self.process_one_input(block, pos, lo, vreg, None);
          self.process_one_input(block, pos, hi, second, None);
        }
        loc => {
          assert!(loc.is_machine_register());
          let vreg = self.graph[value].vreg;
          self.process_one_input(block, pos, loc_slot, vreg, None);
        }
      }
    }

    // Process temps.  Expected shape of live range:
    //
    //              i  i'
    //              [--)
    //
    for j in 0..self.graph[summary].temps.len() {
      let temp_slot = self.graph[summary].temps[j];
      let temp_loc = self.graph.slots[temp_slot];
      debug_assert!(!temp_loc.is_pair());
      if temp_loc.is_machine_register() {
        debug_assert!(
          !temp_loc.is_register()
            || (self.target.allocatable_cpu_registers
                & (1 << temp_loc.register_code())) != 0
        );
        self.block_location(temp_loc, pos, pos + 1);
      } else if temp_loc.is_unallocated() {
        let range = self.make_live_range_for_temporary();
        self.rs.add_use_interval(range, pos, pos + 1);
        self.rs.add_use(range, pos, temp_slot);
        self.complete_range_kind(range,
                                 register_kind_from_policy(temp_loc.policy()));
      } else {
        unreachable!("unsupported temp location {:?}", temp_loc);
      }
    }

    // Block all volatile (not callee-save) registers for native leaf
    // calls.
    if self.graph[summary].native_leaf_call() {
      self.block_cpu_registers(self.target.volatile_cpu_registers, pos,
                               pos + 1);
      self.block_fpu_registers(self.target.volatile_fpu_registers, pos,
                               pos + 1);
    }

    // Block all allocatable registers for calls.  The stack bitmap
    // describes the start position of the instruction.
    if self.graph[summary].always_calls()
      && !self.graph[summary].callee_safe_call() {
      self.block_cpu_registers(self.target.all_cpu_mask(), pos, pos + 1);
      self.block_fpu_registers(self.target.all_fpu_mask(), pos, pos + 1);

      #[cfg(debug_assertions)]
      {
        // Every register is blocked, so temps, inputs and output must all
        // have been specified as fixed locations.
        for j in 0..self.graph[summary].temps.len() {
          let loc = self.graph.slots[self.graph[summary].temps[j]];
          debug_assert!(!loc.is_pair());
          debug_assert!(!loc.is_unallocated());
        }
        for j in 0..self.graph[summary].inputs.len() {
          match self.graph.slots[self.graph[summary].inputs[j]] {
            Location::Pair(lo, hi) => {
              for &half in &[lo, hi] {
                let loc = self.graph.slots[half];
                debug_assert!(
                  !loc.is_unallocated()
                    || loc.policy() == Policy::Any
                    || loc.policy() == Policy::RequiresStack
                );
              }
            }
            loc => debug_assert!(
              !loc.is_unallocated()
                || loc.policy() == Policy::Any
                || loc.policy() == Policy::RequiresStack
            ),
          }
        }
        match self.graph.slots[out_slot] {
          Location::Pair(lo, hi) => {
            debug_assert!(!self.graph.slots[lo].is_unallocated());
            debug_assert!(!self.graph.slots[hi].is_unallocated());
          }
          loc => debug_assert!(!loc.is_unallocated()),
        }
      }
    }

    if self.graph[summary].can_call()
      && !self.graph[summary].native_leaf_call() {
      self.safepoints.push(SafepointSource {
        pos,
        summary,
        instr: Some(instr),
        catch_block: None,
      });
    }

    // Process the output.
    let def = match self.graph[instr].defined {
      Some(def) => def,
      None => {
        debug_assert!(self.graph.slots[out_slot].is_invalid());
        return;
      }
    };
    if self.graph.slots[out_slot].is_invalid() {
      debug_assert!(self.graph[def].vreg < 0);
      return;
    }

    match self.graph.slots[out_slot] {
      Location::Pair(lo, hi) => {
        debug_assert!(self.graph[def].has_pair_representation());
        let (vreg, second) =
          (self.graph[def].vreg, self.graph[def].second_vreg.unwrap());
        if output_same_as_first_input {
          let in_pair = self.graph.slots[self.graph[summary].inputs[0]];
          let (in_lo, in_hi) = in_pair.pair();
          let input = self.graph[instr].inputs[0];
          debug_assert!(self.graph[input].has_pair_representation());
          let (in_vreg, in_second) =
            (self.graph[input].vreg, self.graph[input].second_vreg.unwrap());
          self.process_one_output(block, pos, lo, def, vreg, true,
                                  Some(in_lo), in_vreg, interference);
          self.process_one_output(block, pos, hi, def, second, true,
                                  Some(in_hi), in_second, interference);
        } else {
          self.process_one_output(block, pos, lo, def, vreg, false, None, -1,
                                  interference);
          self.process_one_output(block, pos, hi, def, second, false, None,
                                  -1, interference);
        }
      }
      _ => {
        let vreg = self.graph[def].vreg;
        if output_same_as_first_input {
          let in_slot = self.graph[summary].inputs[0];
          let input = self.graph[instr].inputs[0];
          debug_assert!(!self.graph.slots[in_slot].is_pair());
          let in_vreg = self.graph[input].vreg;
          self.process_one_output(block, pos, out_slot, def, vreg, true,
                                  Some(in_slot), in_vreg, interference);
        } else {
          self.process_one_output(block, pos, out_slot, def, vreg, false,
                                  None, -1, interference);
        }
      }
    }
  }

  fn split_initial_definition_at(
    &mut self, range: RangeId, pos: i32, kind: RegKind,
  ) {
    if self.rs.end(range) > pos {
      let tail = self.rs.split_at(&mut self.graph.slots, range, pos);
      self.complete_range_kind(tail, kind);
    }
  }

  /// Bind an initial definition (parameter, constant or catch pseudo
  /// parameter) to its ABI-given location.
  pub fn process_initial_definition(
    &mut self, def: DefId, range: RangeId, block: BlockId,
    second_location_for_definition: bool,
  ) {
    // The range end may change when the range is split below.
    let range_end = self.rs.end(range);
    let block_pos = self.graph[block].start_pos;

    match self.graph[def].kind {
      DefKind::Param { location, .. } => {
        let mut location = location;
        if let Location::Pair(lo, hi) = location {
          location = self.graph.slots[
            if second_location_for_definition { hi } else { lo }];
        }
        assert!(!location.is_invalid());
        self.set_assigned_loc(range, location);
        if location.is_machine_register() {
          self.complete_definition(Some(def), range);
          if self.rs.end(range) > block_pos + 1 {
            self.split_initial_definition_at(range, block_pos + 1,
                                             location.kind());
          }
          self.convert_all_uses(range);
          self.block_location(location, block_pos, block_pos + 1);
          return;
        }
        self.rs.range_mut(range).spill_slot = location;
      }
      DefKind::Constant => {
        let pair_index = second_location_for_definition as u8;
        let loc = Location::constant_half(def, pair_index);
        self.set_assigned_loc(range, loc);
        self.rs.range_mut(range).spill_slot = loc;
      }
      _ => unreachable!("initial definition with unexpected kind"),
    }

    self.complete_definition(Some(def), range);
    self.rs.finger_initialize(range);
    if let Some(use_id) = self.rs.first_register_beneficial_use(
      range, block_pos, &self.graph.slots) {
      let use_pos = self.rs.use_pos(use_id).pos;
      let tail = self.split_between(range, block_pos, use_pos);
      let kind = self.rs.range(tail).rep.register_kind();
      self.complete_range_kind(tail, kind);
    }
    self.convert_all_uses(range);

    // A parameter stored on the stack above the FP occupies the space also
    // used for spill slots.  Reserve its slot so it is not handed out
    // again, and let the GC know about it (incoming parameters are
    // tagged).
    let spill_slot = self.rs.range(range).spill_slot;
    let is_param = matches!(self.graph[def].kind, DefKind::Param { .. });
    if spill_slot.is_stack_slot()
      && spill_slot.base_reg() == crate::location::BaseReg::Fp
      && spill_slot.stack_index() <= self.target.frame.first_local_from_fp
      && is_param {
      let slot_index = -self.target.frame
        .variable_index_for_frame_slot(spill_slot.stack_index());
      assert!(slot_index >= 0);
      self.allocate_spill_slot_for_initial_definition(slot_index as usize,
                                                      range_end);
      self.mark_as_object_at_safepoints(range);
    }
  }

  /// Finish a definition's range: attach covered safepoints, and give
  /// ranges with stack-requiring uses their spill slot eagerly, rewriting
  /// those uses in place.
  pub fn complete_definition(&mut self, def: Option<DefId>, range: RangeId) {
    self.assign_safepoints(def, range);

    if !self.rs.range(range).has_uses_which_require_stack {
      return;
    }

    let spill_slot = self.rs.range(range).spill_slot;
    if spill_slot.is_invalid() || !spill_slot.has_stack_index() {
      self.rs.range_mut(range).spill_slot = Location::Invalid;
      self.allocate_spill_slot_for(range);
      trace!("allocated spill slot for v{} with stack-requiring uses",
             self.rs.range(range).vreg);
      if self.rs.range(range).rep == crate::ir::Rep::Tagged {
        self.mark_as_object_at_safepoints(range);
      }
    }

    // Eagerly allocate all uses which require the stack and unlink them
    // from the list.
    let spill_slot = self.rs.range(range).spill_slot;
    let mut prev: Option<crate::ranges::UseId> = None;
    let mut use_id = self.rs.range(range).first_use;
    while let Some(u) = use_id {
      let next = self.rs.use_pos(u).next;
      if self.graph.slots[self.rs.use_pos(u).slot]
        == Location::requires_stack() {
        self.convert_use_to(u, spill_slot);
        match prev {
          None => self.rs.set_first_use(range, next),
          Some(p) => self.rs.set_use_next(p, next),
        }
      } else {
        prev = Some(u);
      }
      use_id = next;
    }
  }
}
