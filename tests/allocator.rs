/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! End-to-end tests driving the allocator through the public interface.

use lsra::{
  allocate_registers, AllocatorOptions, BaseReg, BlockId, BlockKind,
  CallKind, DefId, DefKind, FlowGraph, Instr, InstrId, InstrKind, Location,
  NullMoveResolver, Rep, Target, VReg,
};

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

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
  graph.add_instr(block, instr);
  (instr_id, def)
}

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

fn run(graph: &mut FlowGraph, target: &Target) {
  let opts = AllocatorOptions::default();
  allocate_registers(graph, target, &opts, &mut NullMoveResolver).unwrap();
}

/// After allocation no summary slot may still carry a policy.
fn assert_slots_concrete(graph: &FlowGraph) {
  for summary in &graph.summaries {
    for &slot in summary.inputs.iter().chain(summary.temps.iter()) {
      match graph.slots[slot] {
        Location::Pair(lo, hi) => {
          assert!(!graph.slots[lo].is_unallocated());
          assert!(!graph.slots[hi].is_unallocated());
        }
        loc => assert!(!loc.is_unallocated(), "input left as {:?}", loc),
      }
    }
    match graph.slots[summary.out] {
      Location::Pair(lo, hi) => {
        assert!(!graph.slots[lo].is_unallocated());
        assert!(!graph.slots[hi].is_unallocated());
      }
      loc => assert!(!loc.is_unallocated(), "output left as {:?}", loc),
    }
  }
  for pm in &graph.moves {
    for mv in &pm.moves {
      assert!(!graph.slots[mv.dst].is_unallocated());
      assert!(!graph.slots[mv.src].is_unallocated());
    }
  }
}

#[test]
fn straight_line_gets_registers_and_no_frame() {
  init_logging();
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (add, _) = add_def_op(
    &mut graph, body, 2, Rep::Tagged, Location::requires_register(),
    &[(v0, Location::requires_register()),
      (v1, Location::requires_register())],
  );
  add_return(&mut graph, body);

  let opts = AllocatorOptions { intrinsic_mode: false, allow_frameless: true };
  allocate_registers(&mut graph, &target, &opts, &mut NullMoveResolver)
    .unwrap();

  assert_slots_concrete(&graph);
  assert_eq!(graph.spill_slot_count, 0);
  // A leaf function without spills runs without a frame.
  assert!(graph.frameless);

  let summary = graph[add].summary;
  assert!(graph.slots[graph[summary].inputs[0]].is_register());
  assert!(graph.slots[graph[summary].inputs[1]].is_register());
  assert!(graph.slots[graph[summary].out].is_register());
}

#[test]
fn value_survives_call_through_stack() {
  init_logging();
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let call = add_call(&mut graph, body);
  let use_instr =
    add_use_op(&mut graph, body, &[(v0, Location::requires_register())]);
  add_return(&mut graph, body);

  run(&mut graph, &target);
  assert_slots_concrete(&graph);

  assert_eq!(graph.spill_slot_count, 1);

  // The GC sees the tagged slot at the call, and only there.
  let call_summary = graph[call].summary;
  assert!(!graph.summaries[0].stack_bit(0));
  assert!(graph[call_summary].stack_bit(0));

  // The later use got a register back, reloaded from the stack.
  let use_summary = graph[use_instr].summary;
  let use_loc = graph.slots[graph[use_summary].inputs[0]];
  assert!(use_loc.is_register());

  let spill_slot = Location::stack_slot(
    target.frame.frame_slot_for_variable_index(0), BaseReg::Fp,
  );
  let mut saw_spill = false;
  let mut saw_reload = false;
  for pm in &graph.moves {
    for mv in &pm.moves {
      let dst = graph.slots[mv.dst];
      let src = graph.slots[mv.src];
      if dst == spill_slot && src.is_register() {
        saw_spill = true;
      }
      if dst == use_loc && src == spill_slot {
        saw_reload = true;
      }
    }
  }
  assert!(saw_spill, "no spill move was emitted");
  assert!(saw_reload, "no reload move was emitted");
}

#[test]
fn diamond_phi_resolves_on_edges() {
  init_logging();
  let target = target();
  let mut graph = FlowGraph::new();
  let b0 = graph.add_block(BlockKind::GraphEntry);
  let b1 = graph.add_block(BlockKind::FunctionEntry);
  let b2 = graph.add_block(BlockKind::TargetEntry);
  let b3 = graph.add_block(BlockKind::TargetEntry);
  let b4 = graph.add_block(BlockKind::JoinEntry);
  graph.add_edge(b0, b1);
  graph.add_edge(b1, b2);
  graph.add_edge(b1, b3);
  graph.add_edge(b2, b4);
  graph.add_edge(b3, b4);

  let (_, v0) = add_def_op(&mut graph, b1, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let branch_summary = graph.new_summary(
    &[Location::requires_register()], &[], Location::Invalid,
    CallKind::NoCall,
  );
  let mut branch = Instr::new(
    InstrKind::Branch { true_target: b2, false_target: b3 }, branch_summary,
  );
  branch.inputs.push(v0);
  graph.add_instr(b1, branch);

  let (_, v1) = add_def_op(&mut graph, b2, 1, Rep::Tagged,
                           Location::requires_register(), &[]);
  let left_goto = add_goto(&mut graph, b2, b4);
  let (_, v2) = add_def_op(&mut graph, b3, 2, Rep::Tagged,
                           Location::requires_register(), &[]);
  let right_goto = add_goto(&mut graph, b3, b4);

  let phi = graph.new_def(3, None, Rep::Tagged,
                          DefKind::Phi { block: b4, index: 0 });
  graph.add_phi(b4, phi, vec![v1, v2]);
  let use_instr =
    add_use_op(&mut graph, b4, &[(phi, Location::requires_register())]);
  add_return(&mut graph, b4);

  run(&mut graph, &target);
  assert_slots_concrete(&graph);

  let use_summary = graph[use_instr].summary;
  let phi_loc = graph.slots[graph[use_summary].inputs[0]];
  assert!(phi_loc.is_register());

  // Every incoming edge materializes the phi's value at its location;
  // executing the edge move leaves the value exactly there.
  for &goto_instr in &[left_goto, right_goto] {
    let pm = graph[goto_instr].edge_move.expect("no phi move on edge");
    let moves = &graph[pm].moves;
    assert_eq!(moves.len(), 1);
    assert_eq!(graph.slots[moves[0].dst], phi_loc);
    assert!(graph.slots[moves[0].src].is_register());
  }
}

#[test]
fn outgoing_arguments_get_stack_slots() {
  init_logging();
  let target = target();
  let (mut graph, body) = new_function();
  let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                           Location::requires_register(), &[]);
  let (_, v1) = add_def_op(&mut graph, body, 1, Rep::UnboxedDouble,
                           Location::requires_fpu_register(), &[]);

  // Two pushed arguments: the last one on top of the stack.
  let arg0 = graph.new_arg_move(v0, Rep::Tagged, 1, Location::Invalid);
  let arg1 =
    graph.new_arg_move(v1, Rep::UnboxedDouble, 0, Location::Invalid);
  let call = add_call(&mut graph, body);
  graph[call].move_args = vec![arg0, arg1];
  add_return(&mut graph, body);

  graph.max_argument_slot_count = 2;
  run(&mut graph, &target);

  assert_eq!(graph.spill_slot_count, 2);
  let total = graph.spill_slot_count as i32;

  let loc0 = graph.slots[graph[arg0].location];
  assert_eq!(loc0, Location::stack_slot(
    target.frame.frame_slot_for_variable_index(-(total - 1 - 1)),
    BaseReg::Fp,
  ));
  // Unboxed doubles take a double-sized slot.
  let loc1 = graph.slots[graph[arg1].location];
  assert_eq!(loc1, Location::double_stack_slot(
    target.frame.frame_slot_for_variable_index(-(total - 1)), BaseReg::Fp,
  ));
}

#[test]
fn register_argument_moves_are_fixed_uses() {
  init_logging();
  let target = target();
  let (mut graph, body) = new_function();
  let (def, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                             Location::requires_register(), &[]);
  let arg = graph.new_arg_move(v0, Rep::Tagged, 0, Location::Register(3));
  let call = add_call(&mut graph, body);
  graph[call].move_args = vec![arg];
  add_return(&mut graph, body);

  run(&mut graph, &target);
  assert_slots_concrete(&graph);

  // The fixed location is untouched and a move feeding it was inserted
  // ahead of the call.
  assert_eq!(graph.slots[graph[arg].location], Location::Register(3));
  let pm = graph[def].move_after.expect("no move feeding the argument");
  assert!(graph[pm].moves.iter()
          .any(|mv| graph.slots[mv.dst] == Location::Register(3)));
}

#[test]
fn frameless_function_rebases_parameters() {
  init_logging();
  let target = target();
  let (mut graph, body) = new_function();

  // One tagged parameter in the caller's frame (variable index 1).
  let param_slot = Location::stack_slot(
    target.frame.frame_slot_for_variable_index(1), BaseReg::Fp,
  );
  let param = graph.new_def(0, None, Rep::Tagged, DefKind::Param {
    block: body,
    location: param_slot,
    special: None,
  });
  graph.add_initial_def(body, param);

  add_use_op(&mut graph, body, &[(param, Location::requires_register())]);
  add_return(&mut graph, body);

  let opts = AllocatorOptions { intrinsic_mode: false, allow_frameless: true };
  allocate_registers(&mut graph, &target, &opts, &mut NullMoveResolver)
    .unwrap();
  assert_slots_concrete(&graph);

  assert!(graph.frameless);

  // The reload of the parameter reads it relative to the entry SP.
  let sp_slot = target.frame.to_entry_sp_relative(param_slot);
  let pm = graph[body].entry_move.expect("no parameter reload");
  assert!(graph[pm].moves.iter().any(|mv| {
    graph.slots[mv.dst].is_register() && graph.slots[mv.src] == sp_slot
  }));
}

#[test]
fn allocation_is_deterministic() {
  init_logging();
  let target = target();

  let build = || {
    let (mut graph, body) = new_function();
    let (_, v0) = add_def_op(&mut graph, body, 0, Rep::Tagged,
                             Location::requires_register(), &[]);
    let (_, v1) = add_def_op(&mut graph, body, 1, Rep::Tagged,
                             Location::requires_register(), &[]);
    add_call(&mut graph, body);
    add_use_op(&mut graph, body, &[
      (v0, Location::requires_register()),
      (v1, Location::requires_register()),
    ]);
    add_return(&mut graph, body);
    graph
  };

  let snapshot = |graph: &FlowGraph| -> Vec<String> {
    let mut locations = Vec::new();
    for summary in &graph.summaries {
      for &slot in summary.inputs.iter() {
        locations.push(format!("{}", graph.slots[slot]));
      }
      locations.push(format!("{}", graph.slots[summary.out]));
    }
    for pm in &graph.moves {
      for mv in &pm.moves {
        locations.push(format!("{} <- {}", graph.slots[mv.dst],
                               graph.slots[mv.src]));
      }
    }
    locations
  };

  let mut first = build();
  let mut second = build();
  run(&mut first, &target);
  run(&mut second, &target);
  assert_eq!(snapshot(&first), snapshot(&second));
  assert_eq!(first.spill_slot_count, second.spill_slot_count);
}
