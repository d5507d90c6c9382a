/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Allocator scenario tests.  These drive the allocator over small
//! hand-built graphs and check both the observable results (locations,
//! moves, spill slots, safepoint maps) and the internal range invariants.

use crate::allocator::{Allocator, AllocatorOptions};
use crate::ir::{
  BlockId, BlockKind, CallKind, DefId, DefKind, EnvValue, FlowGraph, Instr,
  InstrId, InstrKind, Rep, SpecialParam, VReg,
};
use crate::location::{BaseReg, Location, RegKind};
use crate::ranges::{to_instruction_start, MAX_POSITION};
use crate::target::Target;
use crate::{allocate_registers, AllocError, MoveResolver, NullMoveResolver};

fn target() -> Target {
  Target::make(8, 8)
}

fn new_function() -> (FlowGraph, BlockId) {
  let mut graph = FlowGraph::new();
  let entry = graph.add_block(BlockKind::GraphEntry);
  let body = graph.add_block(BlockKind::FunctionEntry);
  graph.add_edge(entry, body);
  (graph, body)
}

/// An instruction defining `vreg` with the given output constraint.
fn add_def_op(
  graph: &mut FlowGraph, block: BlockId, vreg: VReg, rep: Rep, out: Location,
  inputs: &[(DefId, Location)],
) -> (InstrId, DefId) {
  let in_locs: Vec<Location> = inputs.iter().map(|&(_, loc)| loc).collect();
  let summary = graph.new_summary(&in_locs, &[], out, CallKind::NoCall);
  let instr_id = graph.next_instr_id();
  let def = graph.new_def(vreg, None, rep, DefKind::Op(instr_id));
  let mut instr = Instr::new(InstrKind::Op, summary);
  instr.inputs = inputs.iter().map(|&(def, _)| def).collect();
  instr.defined = Some(def);
  let added = graph.add_instr(block, instr);
  assert_eq!(added, instr_id);
  (instr_id, def)
}

/// An instruction only consuming values.
fn add_use_op(
  graph: &mut FlowGraph, block: BlockId, inputs: &[(DefId, Location)],
) -> InstrId {
  let in_locs: Vec<Location> = inputs.iter().map(|&(_, loc)| loc).collect();
  let summary =
    graph.new_summary(&in_locs, &[], Location::Invalid, CallKind::NoCall);
  let mut instr = Instr::new(InstrKind::Op, summary);
  instr.inputs = inputs.iter().map(|&(def, _)| def).collect();
  graph.add_instr(block, instr)
}

fn add_call(graph: &mut FlowGraph, block: BlockId) -> InstrId {
  let summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::Call);
  graph.add_instr(block, Instr::new(InstrKind::Op, summary))
}

fn add_nop(graph: &mut FlowGraph, block: BlockId) -> InstrId {
  let summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
  graph.add_instr(block, Instr::new(InstrKind::Op, summary))
}

fn add_return(graph: &mut FlowGraph, block: BlockId) -> InstrId {
  let summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
  graph.add_instr(block, Instr::new(InstrKind::Return, summary))
}

fn add_goto(graph: &mut FlowGraph, block: BlockId, target: BlockId)
  -> InstrId {
  let summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
  graph.add_instr(block, Instr::new(InstrKind::Goto { target }, summary))
}

fn allocate<'g>(
  graph: &'g mut FlowGraph, target: &'g Target,
) -> Allocator<'g> {
  let opts = AllocatorOptions::default();
  let mut allocator = Allocator::new(graph, target, &opts);
  allocator.allocate(&mut NullMoveResolver).unwrap();
  allocator
}

/// Check the universal range invariants on a finished allocation:
/// siblings partition the lifetime, uses are concretely allocated and lie
/// within their sibling, safepoints sit inside intervals, and no register
/// is held by two overlapping ranges.
fn check_invariants(al: &Allocator) {
  let mut assigned: Vec<(Location, crate::ranges::RangeId)> = Vec::new();

  for vreg in 0..al.live_ranges.len() {
    let parent = match al.live_ranges[vreg] {
      Some(parent) => parent,
      None => continue,
    };
    let mut chain = Vec::new();
    let mut current = Some(parent);
    while let Some(range) = current {
      chain.push(range);
      current = al.rs.range(range).next_sibling;
    }

    for (i, &range) in chain.iter().enumerate() {
      // Sibling ranges of one vreg never overlap.
      for &other in &chain[i + 1..] {
        let pos = al.rs.first_intersection(
          al.rs.range(range).first_interval,
          al.rs.range(other).first_interval,
        );
        assert_eq!(pos, MAX_POSITION,
                   "siblings of v{} overlap at {}", vreg, pos);
      }

      let loc = al.assigned_loc(range);
      assert!(!loc.is_invalid(), "v{} has no assigned location", vreg);
      if loc.is_machine_register() {
        assigned.push((loc, range));
      }

      // Every use slot holds a concrete location, and every use lies
      // inside its sibling.
      let mut use_id = al.rs.range(range).first_use;
      while let Some(u) = use_id {
        let use_loc = al.graph.slots[al.rs.use_pos(u).slot];
        assert!(!use_loc.is_unallocated(),
                "use of v{} at {} left unallocated", vreg,
                al.rs.use_pos(u).pos);
        assert!(al.rs.use_pos(u).pos >= al.rs.start(range)
                && al.rs.use_pos(u).pos <= al.rs.end(range));
        use_id = al.rs.use_pos(u).next;
      }

      // Safepoints lie inside the covering interval chain.
      let mut sp_id = al.rs.range(range).first_safepoint;
      while let Some(sp) = sp_id {
        let pos = to_instruction_start(al.rs.safepoint(sp).pos);
        assert!(al.rs.contains(range, pos),
                "safepoint at {} outside its range of v{}", pos, vreg);
        sp_id = al.rs.safepoint(sp).next;
      }
    }
  }

  // At most one value occupies a register at any position.
  for i in 0..assigned.len() {
    for j in (i + 1)..assigned.len() {
      if assigned[i].0 != assigned[j].0 {
        continue;
      }
      let pos = al.rs.first_intersection(
        al.rs.range(assigned[i].1).first_interval,
        al.rs.range(assigned[j].1).first_interval,
      );
      assert_eq!(pos, MAX_POSITION,
                 "two ranges hold {} at {}", assigned[i].0, pos);
    }
  }
}

fn parallel_move_locations(graph: &FlowGraph, pm: crate::ir::MoveId)
  -> Vec<(Location, Location)> {
  graph[pm].moves.iter()
    .map(|mv| (graph.slots[mv.dst], graph.slots[mv.src]))
    .collect()
}

// ---------------------------------------------------------------------
// Scenarios.

#[test]
fn straight_line_no_pressure() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (add, _v2) = add_def_op(
    &mut graph, body, 2, Rep::Tagged, Location::requires_register(),
    &[(v0, Location::requires_register()),
      (v1, Location::requires_register())],
  );
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // Everything fits in registers.
  assert_eq!(al.graph.spill_slot_count, 0);
  let summary = al.graph[add].summary;
  for &slot in &al.graph[summary].inputs {
    assert!(al.graph.slots[slot].is_register());
  }
  assert!(al.graph.slots[al.graph[summary].out].is_register());
  // Three simultaneously live values in three distinct registers.
  let in0 = al.graph.slots[al.graph[summary].inputs[0]];
  let in1 = al.graph.slots[al.graph[summary].inputs[1]];
  let out = al.graph.slots[al.graph[summary].out];
  assert_ne!(in0, in1);
  assert_ne!(in0, out);
  assert_ne!(in1, out);
}

#[test]
fn output_same_as_first_input_reuses_register() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (add, _v2) = add_def_op(
    &mut graph, body, 2, Rep::Tagged, Location::same_as_first_input(),
    &[(v0, Location::requires_register()),
      (v1, Location::requires_register())],
  );
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  let summary = al.graph[add].summary;
  let in0 = al.graph.slots[al.graph[summary].inputs[0]];
  let out = al.graph.slots[al.graph[summary].out];
  assert!(in0.is_register());
  // The output reuses the first input's register; the connecting move is
  // redundant.
  assert_eq!(in0, out);
  let pm = al.graph[add].move_before.expect("no move before reusing op");
  for (dst, src) in parallel_move_locations(al.graph, pm) {
    assert_eq!(dst, src);
  }
}

#[test]
fn call_spills_and_reloads_across() {
  let target = target();
  let (mut graph, body) = new_function();
  // v0 is live across a call that clobbers every register, with a
  // register use afterwards.
  let (def, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                             Location::requires_register(), &[]);
  let call = add_call(&mut graph, body);
  let nop = add_nop(&mut graph, body);
  let use_instr =
    add_use_op(&mut graph, body, &[(v0, Location::requires_register())]);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  assert_eq!(al.graph.spill_slot_count, 1);
  let spill_slot = Location::stack_slot(
    target.frame.frame_slot_for_variable_index(0), BaseReg::Fp,
  );

  // v0 is in a register again at its use.
  let use_summary = al.graph[use_instr].summary;
  let use_loc = al.graph.slots[al.graph[use_summary].inputs[0]];
  assert!(use_loc.is_register());

  // The tagged spill slot is visible to the GC at the call.
  let call_summary = al.graph[call].summary;
  assert!(al.graph[call_summary].stack_bit(0));

  // Eager spill right after the definition.
  let pm = al.graph[def].move_after.expect("no eager spill move");
  assert!(parallel_move_locations(al.graph, pm).iter()
          .any(|&(dst, src)| dst == spill_slot && src.is_register()));

  // Reload right before the use.
  let pm = al.graph[nop].move_after.expect("no reload move");
  assert!(parallel_move_locations(al.graph, pm).iter()
          .any(|&(dst, src)| dst == use_loc && src == spill_slot));
}

#[test]
fn loop_phi_keeps_register_on_back_edge() {
  let target = target();
  let mut graph = FlowGraph::new();
  let b0 = graph.add_block(BlockKind::GraphEntry);
  let b1 = graph.add_block(BlockKind::FunctionEntry);
  let b2 = graph.add_block(BlockKind::JoinEntry);
  let b3 = graph.add_block(BlockKind::TargetEntry);
  let b4 = graph.add_block(BlockKind::TargetEntry);
  graph.add_edge(b0, b1);
  graph.add_edge(b1, b2);
  graph.add_edge(b3, b2);
  graph.add_edge(b2, b3);
  graph.add_edge(b2, b4);

  let lp = graph.add_loop(b2, None);
  graph[lp].back_edges.push(b3);
  graph[b2].loop_id = Some(lp);
  graph[b3].loop_id = Some(lp);

  let (_, v0) = add_def_op(&mut graph, b1, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_goto(&mut graph, b1, b2);

  // phi v1 = (v0 from b1, v2 from b3); v2 is computed from the phi in the
  // loop body.
  let phi = graph.new_def(1, None, Rep::Tagged,
                          DefKind::Phi { block: b2, index: 0 });
  let (_, v2) = add_def_op(&mut graph, b3, 2, Rep::Tagged,
                           Location::requires_register(),
                           &[(phi, Location::requires_register())]);
  graph.add_phi(b2, phi, vec![v0, v2]);

  let branch_summary = graph.new_summary(
    &[Location::requires_register()], &[], Location::Invalid,
    CallKind::NoCall,
  );
  let mut branch = Instr::new(
    InstrKind::Branch { true_target: b3, false_target: b4 }, branch_summary,
  );
  branch.inputs.push(phi);
  graph.add_instr(b2, branch);
  let back_goto = add_goto(&mut graph, b3, b2);
  add_return(&mut graph, b4);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  let phi_def = al.graph[b2].phis[0].def;
  let phi_range = al.live_ranges[1].expect("phi has no range");
  assert!(al.rs.range(phi_range).is_loop_phi);

  let phi_loc = al.assigned_loc(phi_range);
  assert!(phi_loc.is_register());

  // The body value feeding the back edge lands in the phi's register, so
  // the back-edge move is redundant.
  let v2_range = al.live_ranges[2].expect("body value has no range");
  assert_eq!(al.assigned_loc(v2_range), phi_loc);
  let pm = al.graph[back_goto].edge_move.expect("no phi move on back edge");
  for (dst, src) in parallel_move_locations(al.graph, pm) {
    assert_eq!(dst, src);
  }

  // Both loop inputs reach the phi.
  let mut al = al;
  let reaching = al.reaching_defs.get(&*al.graph, phi_def);
  assert!(reaching.get(0).unwrap());
  assert!(reaching.get(2).unwrap());
}

#[test]
fn pair_halves_allocated_independently() {
  let target = target();
  let (mut graph, body) = new_function();

  // A 64-bit value on a 32-bit target: two vregs, one definition.
  let out_pair = graph.pair_location(Location::requires_register(),
                                     Location::requires_register());
  let summary = graph.new_summary(&[], &[], out_pair, CallKind::NoCall);
  let instr_id = graph.next_instr_id();
  let pair_def = graph.new_def(0, Some(1), Rep::UnboxedInt64,
                               DefKind::Op(instr_id));
  let mut instr = Instr::new(InstrKind::Op, summary);
  instr.defined = Some(pair_def);
  graph.add_instr(body, instr);

  let in_pair = graph.pair_location(Location::requires_register(),
                                    Location::requires_register());
  let use_summary =
    graph.new_summary(&[in_pair], &[], Location::Invalid, CallKind::NoCall);
  let mut use_instr = Instr::new(InstrKind::Op, use_summary);
  use_instr.inputs.push(pair_def);
  let use_id = graph.add_instr(body, use_instr);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // Both halves are in (distinct) registers at the use.
  let summary = al.graph[use_id].summary;
  let (lo, hi) = al.graph.slots[al.graph[summary].inputs[0]].pair();
  let lo_loc = al.graph.slots[lo];
  let hi_loc = al.graph.slots[hi];
  assert!(lo_loc.is_register());
  assert!(hi_loc.is_register());
  assert_ne!(lo_loc, hi_loc);

  // Each half has its own live range.
  assert!(al.live_ranges[0].is_some());
  assert!(al.live_ranges[1].is_some());
}

#[test]
fn quad_spill_takes_two_adjacent_double_slots() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::UnboxedFloat32x4,
                           Location::requires_fpu_register(), &[]);
  add_call(&mut graph, body);
  let use_instr =
    add_use_op(&mut graph, body, &[(v0, Location::requires_fpu_register())]);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // Two adjacent double slots, both flagged quad.
  assert_eq!(al.quad_spill_slots, vec![true, true]);
  assert_eq!(al.graph.spill_slot_count, 2 * target.double_spill_factor);

  // The spill location is a quad slot reporting the higher index.
  let parent = al.live_ranges[0].unwrap();
  let spill = al.rs.range(parent).spill_slot;
  assert!(spill.is_quad_stack_slot());
  let expected_index = target.frame.frame_slot_for_variable_index(
    -((target.double_spill_factor * 2 - 1) as i32),
  );
  assert_eq!(spill.stack_index(), expected_index);

  let use_summary = al.graph[use_instr].summary;
  assert!(al.graph.slots[al.graph[use_summary].inputs[0]].is_fpu_register());
}

#[test]
fn try_catch_restores_live_in_from_spill_slot() {
  let target = target();
  let mut graph = FlowGraph::new();
  let b0 = graph.add_block(BlockKind::GraphEntry);
  let b1 = graph.add_block(BlockKind::FunctionEntry);
  let b2 = graph.add_block(BlockKind::TargetEntry);
  let b3 = graph.add_block(BlockKind::TargetEntry);
  let b4 = graph.add_block(BlockKind::CatchEntry { try_index: 0 });
  graph.add_edge(b0, b1);
  graph.add_edge(b1, b2);
  graph.add_edge(b1, b4);
  graph.add_edge(b2, b3);
  graph[b2].try_index = Some(0);

  let (_, v0) = add_def_op(&mut graph, b1, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let try_summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
  graph.add_instr(b1, Instr::new(
    InstrKind::TryEntry { try_body: b2, catch_block: b4 }, try_summary,
  ));

  let call = add_call(&mut graph, b2);
  graph[call].may_throw = true;
  add_goto(&mut graph, b2, b3);
  add_return(&mut graph, b3);

  // Catch entry: exception/stacktrace pseudo parameters in their ABI
  // registers, the handler reads v0.
  let catch_summary =
    graph.new_summary(&[], &[], Location::Invalid, CallKind::Call);
  graph[b4].summary = Some(catch_summary);
  let exc = graph.new_def(1, None, Rep::Tagged, DefKind::Param {
    block: b4,
    location: target.exception_location(),
    special: Some(SpecialParam::Exception),
  });
  let st = graph.new_def(2, None, Rep::Tagged, DefKind::Param {
    block: b4,
    location: target.stacktrace_location(),
    special: Some(SpecialParam::StackTrace),
  });
  graph.add_initial_def(b4, exc);
  graph.add_initial_def(b4, st);
  add_use_op(&mut graph, b4, &[(v0, Location::requires_register())]);
  add_return(&mut graph, b4);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // v0's range was extended through the throwing call.
  let call_pos = al.graph[call].pos;
  let parent = al.live_ranges[0].unwrap();
  let mut covered = false;
  let mut current = Some(parent);
  while let Some(range) = current {
    covered |= al.rs.contains(range, call_pos);
    current = al.rs.range(range).next_sibling;
  }
  assert!(covered, "live-in not live across the throwing instruction");

  // It was spilled, and the call's GC map knows about the slot.
  let spill = al.rs.range(parent).spill_slot;
  assert!(spill.is_stack_slot());
  let call_summary = al.graph[call].summary;
  let bit = -target.frame
    .variable_index_for_frame_slot(spill.stack_index());
  assert!(al.graph[call_summary].stack_bit(bit as usize));

  // The catch entry reloads the register from the spill slot.
  let cover = al.find_cover(parent, al.graph[b4].start_pos);
  let dst = al.assigned_loc(cover);
  assert!(dst.is_register());
  let pm = al.graph[b4].entry_move.expect("no catch entry move");
  assert!(parallel_move_locations(al.graph, pm).iter()
          .any(|&(mv_dst, mv_src)| mv_dst == dst && mv_src == spill));

  // The pseudo parameters sit in their fixed ABI registers.
  assert_eq!(al.assigned_loc(al.live_ranges[1].unwrap()),
             target.exception_location());
  assert_eq!(al.assigned_loc(al.live_ranges[2].unwrap()),
             target.stacktrace_location());
}

#[test]
fn environment_uses_keep_values_alive() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let deopt = add_nop(&mut graph, body);
  let env = graph.new_env(vec![EnvValue::Def(v0)], None);
  graph[deopt].env = Some(env);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // The environment location was allocated (the value stayed in its
  // register; environments never force anything).
  let slot = al.graph[env].locations[0];
  let loc = al.graph.slots[slot];
  assert!(loc.is_register());
  assert_eq!(loc, al.assigned_loc(al.live_ranges[0].unwrap()));
}

#[test]
fn materializations_expand_into_environment_uses() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let mat = graph.new_mat(vec![EnvValue::Def(v0)]);
  let deopt = add_nop(&mut graph, body);
  let env = graph.new_env(vec![EnvValue::Mat(mat)], None);
  graph[deopt].env = Some(env);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  let slot = al.graph[mat].locations[0];
  assert_eq!(al.graph.slots[slot],
             al.assigned_loc(al.live_ranges[0].unwrap()));
}

#[test]
fn unconstrained_constant_uses_fold_to_the_constant() {
  let target = target();
  let (mut graph, body) = new_function();
  let (const_instr, c) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                                    Location::requires_register(), &[]);
  graph[c].kind = DefKind::Constant;
  let deopt = add_nop(&mut graph, body);
  let env = graph.new_env(vec![EnvValue::Def(c)], None);
  graph[deopt].env = Some(env);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);

  // The definition was dropped and the environment references the
  // constant directly.
  let summary = al.graph[const_instr].summary;
  assert!(al.graph.slots[al.graph[summary].out].is_invalid());
  let slot = al.graph[env].locations[0];
  assert_eq!(al.graph.slots[slot], Location::constant(c));
}

#[test]
fn expired_spill_slots_are_reused() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_call(&mut graph, body);
  add_use_op(&mut graph, body, &[(v0, Location::requires_register())]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_call(&mut graph, body);
  add_use_op(&mut graph, body, &[(v1, Location::requires_register())]);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // The second value reuses the expired slot of the first.
  assert_eq!(al.graph.spill_slot_count, 1);
  assert_eq!(al.rs.range(al.live_ranges[0].unwrap()).spill_slot,
             al.rs.range(al.live_ranges[1].unwrap()).spill_slot);
}

#[test]
fn tagged_and_untagged_slots_stay_disjoint() {
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_call(&mut graph, body);
  add_use_op(&mut graph, body, &[(v0, Location::requires_register())]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Untagged,
                           Location::requires_register(), &[]);
  add_call(&mut graph, body);
  add_use_op(&mut graph, body, &[(v1, Location::requires_register())]);
  add_return(&mut graph, body);

  let al = allocate(&mut graph, &target);
  check_invariants(&al);

  // A raw pointer never shares a slot index with a tagged value, even
  // though their lifetimes do not overlap.
  assert_eq!(al.graph.spill_slot_count, 2);
  assert_eq!(al.untagged_spill_slots, vec![false, true]);
  assert_ne!(al.rs.range(al.live_ranges[0].unwrap()).spill_slot,
             al.rs.range(al.live_ranges[1].unwrap()).spill_slot);
}

#[test]
fn intrinsic_mode_fails_instead_of_spilling() {
  // Two allocatable registers, three simultaneously live values.
  let target = Target::make(3, 2);
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v2) = add_def_op(&mut graph, body, 2, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_use_op(&mut graph, body, &[
    (v0, Location::requires_register()),
    (v1, Location::requires_register()),
    (v2, Location::requires_register()),
  ]);
  add_return(&mut graph, body);

  let opts =
    AllocatorOptions { intrinsic_mode: true, allow_frameless: false };
  let result = allocate_registers(&mut graph, &target, &opts,
                                  &mut NullMoveResolver);
  assert_eq!(result, Err(AllocError::OutOfRegisters(RegKind::Cpu)));
}

#[test]
fn reallocation_is_rejected() {
  let target = target();
  let (mut graph, body) = new_function();
  add_def_op(&mut graph, body, 0, Rep::Tagged,
             Location::requires_register(), &[]);
  add_return(&mut graph, body);

  let opts = AllocatorOptions::default();
  allocate_registers(&mut graph, &target, &opts, &mut NullMoveResolver)
    .unwrap();
  let result = allocate_registers(&mut graph, &target, &opts,
                                  &mut NullMoveResolver);
  assert_eq!(result, Err(AllocError::AlreadyAllocated));
}

#[test]
fn resolver_sees_every_parallel_move() {
  struct CountingResolver {
    seen: usize,
  }
  impl MoveResolver for CountingResolver {
    fn resolve(&mut self, _graph: &mut FlowGraph, _pm: crate::ir::MoveId) {
      self.seen += 1;
    }
  }

  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  add_call(&mut graph, body);
  add_use_op(&mut graph, body, &[(v0, Location::requires_register())]);
  add_return(&mut graph, body);

  let opts = AllocatorOptions::default();
  let mut resolver = CountingResolver { seen: 0 };
  allocate_registers(&mut graph, &target, &opts, &mut resolver).unwrap();
  // At least the eager spill and the reload were emitted.
  assert!(resolver.seen >= 2);
}
