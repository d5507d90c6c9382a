/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The lowered flow graph the allocator works on.
//!
//! The front end builds a [`FlowGraph`]: blocks in code-generation order
//! (reverse postorder, graph entry first), instructions with a
//! [`LocationSummary`] each, SSA definitions, phis, deoptimization
//! environments and loop information.  The allocator annotates the graph in
//! place: it fills every location slot with a concrete location, attaches
//! parallel moves to blocks and instructions, and publishes the frame
//! facts (`spill_slot_count`, `frameless`).
//!
//! Everything is stored in flat arenas addressed by typed ids; nothing here
//! owns anything by pointer.

use std::ops::{Index, IndexMut};

use vob::Vob;

use crate::location::{Location, Policy, RegKind, SlotId, Slots};
use crate::target::RegisterSet;

/// Virtual register number of an SSA value.  Negative numbers denote
/// pseudo ranges inside the allocator.
pub type VReg = i32;

macro_rules! define_index {
  ($name:ident, $prefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct $name(pub(crate) u32);

    impl $name {
      pub(crate) fn index(self) -> usize {
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

define_index!(BlockId, "b");
define_index!(InstrId, "i");
define_index!(DefId, "d");
define_index!(SummaryId, "locs");
define_index!(EnvId, "env");
define_index!(MatId, "mat");
define_index!(ArgMoveId, "arg");
define_index!(MoveId, "pm");
define_index!(LoopId, "loop");

/// Representation of an SSA value; governs spill slot sizing and GC map
/// classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rep {
  None,
  Tagged,
  Untagged,
  PairOfTagged,
  UnboxedInt64,
  UnboxedUint32,
  UnboxedFloat,
  UnboxedDouble,
  UnboxedFloat32x4,
  UnboxedInt32x4,
  UnboxedFloat64x2,
}

impl Rep {
  /// Representation used for the value's live range.  Unboxed integers are
  /// allocated as raw (untagged) words; 64-bit values are split into two
  /// untagged halves on 32-bit targets.
  pub fn for_range(self) -> Rep {
    match self {
      Rep::UnboxedInt64 | Rep::UnboxedUint32 => Rep::Untagged,
      other => other,
    }
  }

  pub fn register_kind(self) -> RegKind {
    match self {
      Rep::UnboxedFloat
      | Rep::UnboxedDouble
      | Rep::UnboxedFloat32x4
      | Rep::UnboxedInt32x4
      | Rep::UnboxedFloat64x2 => RegKind::Fpu,
      _ => RegKind::Cpu,
    }
  }

  /// 128-bit representations needing a quad spill slot.
  pub fn is_quad(self) -> bool {
    match self {
      Rep::UnboxedFloat32x4 | Rep::UnboxedInt32x4 | Rep::UnboxedFloat64x2 => {
        true
      }
      _ => false,
    }
  }

  /// Representations spilled to word-sized (CPU) stack slots.
  pub fn fits_word_slot(self) -> bool {
    match self {
      Rep::Tagged | Rep::Untagged | Rep::PairOfTagged | Rep::UnboxedInt64
      | Rep::UnboxedUint32 => true,
      _ => false,
    }
  }
}

/// How an instruction interacts with calls; drives register blocking and
/// safepoint collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
  NoCall,
  /// Unconditional call: every allocatable register is clobbered.
  Call,
  /// Unconditional call that preserves all registers.
  CalleeSafeCall,
  /// Calls only on its slow path; registers stay live on the fast path.
  CallOnSlowPath,
  /// Leaf native call: clobbers only the volatile sets.
  NativeLeafCall,
}

/// Per-instruction operand constraints and safepoint state.
pub struct LocationSummary {
  pub inputs: Vec<SlotId>,
  pub temps: Vec<SlotId>,
  pub out: SlotId,
  pub call: CallKind,
  pub call_on_shared_slow_path: bool,
  /// Registers holding live values across a slow-path call.
  pub live_registers: RegisterSet,
  /// Bit per spill slot holding a live tagged value at this safepoint.
  pub stack_bitmap: Vob,
}

impl LocationSummary {
  pub fn always_calls(&self) -> bool {
    match self.call {
      CallKind::Call | CallKind::CalleeSafeCall => true,
      _ => false,
    }
  }
  pub fn can_call(&self) -> bool {
    self.call != CallKind::NoCall
  }
  pub fn callee_safe_call(&self) -> bool {
    self.call == CallKind::CalleeSafeCall
  }
  pub fn native_leaf_call(&self) -> bool {
    self.call == CallKind::NativeLeafCall
  }
  pub fn has_call_on_slow_path(&self) -> bool {
    self.can_call() && !self.always_calls()
  }

  pub fn set_stack_bit(&mut self, index: usize) {
    if self.stack_bitmap.len() <= index {
      self.stack_bitmap.resize(index + 1, false);
    }
    self.stack_bitmap.set(index, true);
  }

  pub fn stack_bit(&self, index: usize) -> bool {
    self.stack_bitmap.get(index).unwrap_or(false)
  }
}

/// What produced an SSA value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefKind {
  /// Result of an instruction in a block body.
  Op(InstrId),
  Phi { block: BlockId, index: u32 },
  /// Initial definition bound to an ABI location.
  Param { block: BlockId, location: Location, special: Option<SpecialParam> },
  Constant,
  /// Pushed outgoing argument; never allocated.
  ArgMove(ArgMoveId),
}

/// Catch-entry pseudo parameters with hard-coded ABI locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialParam {
  Exception,
  StackTrace,
}

#[derive(Clone, Copy, Debug)]
pub struct DefInfo {
  pub vreg: VReg,
  /// Second virtual register of a paired (64-bit on 32-bit) value.
  pub second_vreg: Option<VReg>,
  pub rep: Rep,
  pub kind: DefKind,
}

impl DefInfo {
  pub fn has_pair_representation(&self) -> bool {
    self.second_vreg.is_some()
  }
}

#[derive(Clone, Debug)]
pub struct Phi {
  pub def: DefId,
  /// One input per predecessor, in predecessor order.
  pub inputs: Vec<DefId>,
}

/// A value referenced by a deoptimization environment.
#[derive(Clone, Copy, Debug)]
pub enum EnvValue {
  Def(DefId),
  Mat(MatId),
}

/// Deoptimization environment: a flat value list plus an outer chain.
pub struct Env {
  pub values: Vec<EnvValue>,
  pub outer: Option<EnvId>,
  /// Filled by the allocator; parallel to `values`.
  pub locations: Vec<SlotId>,
}

/// Materialization pseudo instruction: not in the graph, but its inputs are
/// part of any environment mentioning it.
pub struct Materialization {
  pub inputs: Vec<EnvValue>,
  /// Filled by the allocator; non-empty means already processed.
  pub locations: Vec<SlotId>,
}

/// Outgoing argument move, detached from the instruction stream and owned
/// by the calling instruction.
pub struct ArgMove {
  pub value: DefId,
  pub rep: Rep,
  /// Position of the argument relative to SP at the call.
  pub sp_relative_index: i32,
  /// Fixed register (or register pair) for register-based conventions,
  /// invalid otherwise; the allocator assigns the stack location.
  pub location: SlotId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveOperands {
  pub dst: SlotId,
  pub src: SlotId,
}

/// A set of moves executed simultaneously; the external resolver
/// sequentializes them.
pub struct ParallelMove {
  pub pos: i32,
  pub moves: Vec<MoveOperands>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstrKind {
  Op,
  Goto { target: BlockId },
  Branch { true_target: BlockId, false_target: BlockId },
  /// Enters a try region; control may continue at the body or transfer to
  /// the catch handler.
  TryEntry { try_body: BlockId, catch_block: BlockId },
  Return,
}

pub struct Instr {
  pub kind: InstrKind,
  pub summary: SummaryId,
  /// Defining instruction of each input value; parallel to the summary's
  /// input slots.
  pub inputs: Vec<DefId>,
  pub defined: Option<DefId>,
  pub env: Option<EnvId>,
  pub move_args: Vec<ArgMoveId>,
  pub may_throw: bool,
  pub has_write_barrier: bool,
  /// Lifetime position; assigned by the allocator.
  pub pos: i32,
  /// Parallel moves attached by the allocator.
  pub move_before: Option<MoveId>,
  pub move_after: Option<MoveId>,
  /// Phi-resolution move on the outgoing edge (`Goto`/`TryEntry` only).
  pub edge_move: Option<MoveId>,
}

impl Instr {
  pub fn new(kind: InstrKind, summary: SummaryId) -> Instr {
    Instr {
      kind,
      summary,
      inputs: Vec::new(),
      defined: None,
      env: None,
      move_args: Vec::new(),
      may_throw: false,
      has_write_barrier: false,
      pos: -1,
      move_before: None,
      move_after: None,
      edge_move: None,
    }
  }

  pub fn successors(&self) -> Vec<BlockId> {
    match self.kind {
      InstrKind::Goto { target } => vec![target],
      InstrKind::Branch { true_target, false_target } => {
        vec![true_target, false_target]
      }
      InstrKind::TryEntry { try_body, catch_block } => {
        vec![try_body, catch_block]
      }
      _ => vec![],
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
  GraphEntry,
  FunctionEntry,
  OsrEntry,
  CatchEntry { try_index: u32 },
  JoinEntry,
  TargetEntry,
}

pub struct Block {
  pub kind: BlockKind,
  pub preds: Vec<BlockId>,
  pub succs: Vec<BlockId>,
  pub instrs: Vec<InstrId>,
  pub phis: Vec<Phi>,
  pub initial_defs: Vec<DefId>,
  /// Try region this block's instructions belong to, if any.
  pub try_index: Option<u32>,
  /// Innermost loop containing the block (the loop itself for headers).
  pub loop_id: Option<LoopId>,
  /// Safepoint state for catch entries.
  pub summary: Option<SummaryId>,
  /// Lifetime interval of the block; assigned by the allocator.
  pub start_pos: i32,
  pub end_pos: i32,
  /// Parallel move executed on entry; attached by the allocator.
  pub entry_move: Option<MoveId>,
}

impl Block {
  pub fn is_catch_entry(&self) -> bool {
    match self.kind {
      BlockKind::CatchEntry { .. } => true,
      _ => false,
    }
  }
}

#[derive(Clone, Debug)]
pub struct LoopInfo {
  pub header: BlockId,
  pub outer: Option<LoopId>,
  pub back_edges: Vec<BlockId>,
}

impl LoopInfo {
  pub fn is_back_edge(&self, block: BlockId) -> bool {
    self.back_edges.contains(&block)
  }
}

/// The flow graph: arenas for blocks, instructions, definitions,
/// environments and moves, plus the location-slot store.
pub struct FlowGraph {
  pub blocks: Vec<Block>,
  pub instrs: Vec<Instr>,
  pub defs: Vec<DefInfo>,
  pub summaries: Vec<LocationSummary>,
  pub envs: Vec<Env>,
  pub mats: Vec<Materialization>,
  pub arg_moves: Vec<ArgMove>,
  pub moves: Vec<ParallelMove>,
  pub slots: Slots,
  pub loops: Vec<LoopInfo>,
  /// One past the largest virtual register number in use.
  pub max_vreg: usize,
  /// Stack slots taken by outgoing arguments.
  pub max_argument_slot_count: usize,
  /// Spill slots reserved up front for values live into catch handlers.
  pub fixed_slot_count: usize,
  pub makes_copy_of_parameters: bool,
  /// Published by the allocator.
  pub spill_slot_count: usize,
  pub frameless: bool,
  pub allocated: bool,
}

impl FlowGraph {
  pub fn new() -> FlowGraph {
    FlowGraph {
      blocks: Vec::new(),
      instrs: Vec::new(),
      defs: Vec::new(),
      summaries: Vec::new(),
      envs: Vec::new(),
      mats: Vec::new(),
      arg_moves: Vec::new(),
      moves: Vec::new(),
      slots: Slots::new(),
      loops: Vec::new(),
      max_vreg: 0,
      max_argument_slot_count: 0,
      fixed_slot_count: 0,
      makes_copy_of_parameters: false,
      spill_slot_count: 0,
      frameless: false,
      allocated: false,
    }
  }

  pub fn add_block(&mut self, kind: BlockKind) -> BlockId {
    let id = BlockId(self.blocks.len() as u32);
    self.blocks.push(Block {
      kind,
      preds: Vec::new(),
      succs: Vec::new(),
      instrs: Vec::new(),
      phis: Vec::new(),
      initial_defs: Vec::new(),
      try_index: None,
      loop_id: None,
      summary: None,
      start_pos: -1,
      end_pos: -1,
      entry_move: None,
    });
    id
  }

  pub fn add_edge(&mut self, pred: BlockId, succ: BlockId) {
    self.blocks[pred.index()].succs.push(succ);
    self.blocks[succ.index()].preds.push(pred);
  }

  /// Id the next `add_instr` call will return; definitions need to name
  /// their instruction up front.
  pub fn next_instr_id(&self) -> InstrId {
    InstrId(self.instrs.len() as u32)
  }

  pub fn add_instr(&mut self, block: BlockId, instr: Instr) -> InstrId {
    let id = InstrId(self.instrs.len() as u32);
    self.instrs.push(instr);
    self.blocks[block.index()].instrs.push(id);
    id
  }

  pub fn new_def(
    &mut self, vreg: VReg, second_vreg: Option<VReg>, rep: Rep, kind: DefKind,
  ) -> DefId {
    let id = DefId(self.defs.len() as u32);
    if vreg >= 0 {
      self.max_vreg = self.max_vreg.max(vreg as usize + 1);
    }
    if let Some(second) = second_vreg {
      debug_assert!(second >= 0);
      self.max_vreg = self.max_vreg.max(second as usize + 1);
    }
    self.defs.push(DefInfo { vreg, second_vreg, rep, kind });
    id
  }

  pub fn add_phi(&mut self, block: BlockId, def: DefId, inputs: Vec<DefId>) {
    debug_assert_eq!(inputs.len(), self.blocks[block.index()].preds.len());
    let index = self.blocks[block.index()].phis.len() as u32;
    debug_assert_eq!(
      self.defs[def.index()].kind,
      DefKind::Phi { block, index }
    );
    self.blocks[block.index()].phis.push(Phi { def, inputs });
  }

  pub fn add_initial_def(&mut self, block: BlockId, def: DefId) {
    self.blocks[block.index()].initial_defs.push(def);
  }

  pub fn new_summary(
    &mut self, inputs: &[Location], temps: &[Location], out: Location,
    call: CallKind,
  ) -> SummaryId {
    let inputs = inputs.iter().map(|&loc| self.slots.alloc(loc)).collect();
    let temps = temps.iter().map(|&loc| self.slots.alloc(loc)).collect();
    let out = self.slots.alloc(out);
    let id = SummaryId(self.summaries.len() as u32);
    self.summaries.push(LocationSummary {
      inputs,
      temps,
      out,
      call,
      call_on_shared_slow_path: false,
      live_registers: RegisterSet::new(),
      stack_bitmap: Vob::new(),
    });
    id
  }

  /// Build a pair location out of two half locations, giving each half its
  /// own slot.
  pub fn pair_location(&mut self, lo: Location, hi: Location) -> Location {
    let lo = self.slots.alloc(lo);
    let hi = self.slots.alloc(hi);
    Location::Pair(lo, hi)
  }

  pub fn new_env(&mut self, values: Vec<EnvValue>, outer: Option<EnvId>)
    -> EnvId {
    let id = EnvId(self.envs.len() as u32);
    self.envs.push(Env { values, outer, locations: Vec::new() });
    id
  }

  pub fn new_mat(&mut self, inputs: Vec<EnvValue>) -> MatId {
    let id = MatId(self.mats.len() as u32);
    self.mats.push(Materialization { inputs, locations: Vec::new() });
    id
  }

  pub fn new_arg_move(
    &mut self, value: DefId, rep: Rep, sp_relative_index: i32,
    location: Location,
  ) -> ArgMoveId {
    let location = self.slots.alloc(location);
    let id = ArgMoveId(self.arg_moves.len() as u32);
    self.arg_moves.push(ArgMove { value, rep, sp_relative_index, location });
    id
  }

  pub fn is_register_arg_move(&self, id: ArgMoveId) -> bool {
    match self.slots[self.arg_moves[id.index()].location] {
      Location::Pair(lo, hi) => {
        self.slots[lo].is_machine_register()
          && self.slots[hi].is_machine_register()
      }
      loc => loc.is_machine_register(),
    }
  }

  pub fn new_parallel_move(&mut self, pos: i32) -> MoveId {
    let id = MoveId(self.moves.len() as u32);
    self.moves.push(ParallelMove { pos, moves: Vec::new() });
    id
  }

  /// Append a `dst <- src` move and return the slots of both operands.
  pub fn add_move_to(&mut self, pm: MoveId, dst: Location, src: Location)
    -> (SlotId, SlotId) {
    let dst = self.slots.alloc(dst);
    let src = self.slots.alloc(src);
    self.moves[pm.index()].moves.push(MoveOperands { dst, src });
    (dst, src)
  }

  pub fn move_dst_slot(&self, pm: MoveId, index: usize) -> SlotId {
    self.moves[pm.index()].moves[index].dst
  }

  pub fn move_src_slot(&self, pm: MoveId, index: usize) -> SlotId {
    self.moves[pm.index()].moves[index].src
  }

  /// A move is redundant when it moves nothing or a location onto itself.
  pub fn move_is_redundant(&self, mv: MoveOperands) -> bool {
    let dst = self.slots[mv.dst];
    let src = self.slots[mv.src];
    dst.is_invalid() || src.is_invalid() || dst == src
  }

  pub fn add_loop(&mut self, header: BlockId, outer: Option<LoopId>)
    -> LoopId {
    let id = LoopId(self.loops.len() as u32);
    self.loops.push(LoopInfo { header, outer, back_edges: Vec::new() });
    id
  }

  pub fn catch_block_for_try(&self, try_index: u32) -> BlockId {
    for (n, block) in self.blocks.iter().enumerate() {
      if block.kind == (BlockKind::CatchEntry { try_index }) {
        return BlockId(n as u32);
      }
    }
    panic!("no catch entry for try index {}", try_index);
  }

  pub fn loop_headed_by(&self, block: BlockId) -> Option<LoopId> {
    match self.blocks[block.index()].loop_id {
      Some(id) if self.loops[id.index()].header == block => Some(id),
      _ => None,
    }
  }

  pub fn terminator(&self, block: BlockId) -> Option<InstrId> {
    self.blocks[block.index()].instrs.last().copied()
  }

  /// Policy of an input slot, looking through the slot store.
  pub fn input_policy(&self, summary: SummaryId, index: usize)
    -> Option<Policy> {
    match self.slots[self.summaries[summary.index()].inputs[index]] {
      Location::Unallocated(policy) => Some(policy),
      _ => None,
    }
  }
}

macro_rules! impl_graph_index {
  ($id:ty, $field:ident, $out:ty) => {
    impl Index<$id> for FlowGraph {
      type Output = $out;
      fn index(&self, id: $id) -> &$out {
        &self.$field[id.index()]
      }
    }
    impl IndexMut<$id> for FlowGraph {
      fn index_mut(&mut self, id: $id) -> &mut $out {
        &mut self.$field[id.index()]
      }
    }
  };
}

impl_graph_index!(BlockId, blocks, Block);
impl_graph_index!(InstrId, instrs, Instr);
impl_graph_index!(DefId, defs, DefInfo);
impl_graph_index!(SummaryId, summaries, LocationSummary);
impl_graph_index!(EnvId, envs, Env);
impl_graph_index!(MatId, mats, Materialization);
impl_graph_index!(ArgMoveId, arg_moves, ArgMove);
impl_graph_index!(MoveId, moves, ParallelMove);
impl_graph_index!(LoopId, loops, LoopInfo);

#[cfg(test)]
mod tests {
  use super::*;
  use crate::location::Location;

  #[test]
  fn summary_call_predicates() {
    let mut graph = FlowGraph::new();
    let id = graph.new_summary(&[], &[], Location::Invalid, CallKind::Call);
    assert!(graph[id].always_calls());
    assert!(graph[id].can_call());
    assert!(!graph[id].callee_safe_call());
    let id = graph.new_summary(
      &[], &[], Location::Invalid, CallKind::CallOnSlowPath,
    );
    assert!(graph[id].has_call_on_slow_path());
    assert!(!graph[id].always_calls());
    let id = graph.new_summary(
      &[], &[], Location::Invalid, CallKind::NativeLeafCall,
    );
    assert!(graph[id].native_leaf_call());
    assert!(!graph[id].always_calls());
  }

  #[test]
  fn stack_bitmap_grows() {
    let mut graph = FlowGraph::new();
    let id = graph.new_summary(&[], &[], Location::Invalid, CallKind::Call);
    graph[id].set_stack_bit(5);
    assert!(graph[id].stack_bit(5));
    assert!(!graph[id].stack_bit(4));
    assert!(!graph[id].stack_bit(17));
  }

  #[test]
  fn rep_classification() {
    assert_eq!(Rep::UnboxedInt64.for_range(), Rep::Untagged);
    assert_eq!(Rep::UnboxedUint32.for_range(), Rep::Untagged);
    assert_eq!(Rep::Tagged.for_range(), Rep::Tagged);
    assert_eq!(Rep::UnboxedDouble.register_kind(), RegKind::Fpu);
    assert_eq!(Rep::Tagged.register_kind(), RegKind::Cpu);
    assert!(Rep::UnboxedFloat32x4.is_quad());
    assert!(!Rep::UnboxedDouble.is_quad());
    assert!(Rep::PairOfTagged.fits_word_slot());
    assert!(!Rep::UnboxedFloat.fits_word_slot());
  }

  #[test]
  fn graph_arenas() {
    let mut graph = FlowGraph::new();
    let entry = graph.add_block(BlockKind::GraphEntry);
    let body = graph.add_block(BlockKind::FunctionEntry);
    graph.add_edge(entry, body);
    assert_eq!(graph[body].preds, vec![entry]);
    assert_eq!(graph[entry].succs, vec![body]);

    let def =
      graph.new_def(0, None, Rep::Tagged, DefKind::Constant);
    assert_eq!(graph.max_vreg, 1);
    assert!(!graph[def].has_pair_representation());

    let pm = graph.new_parallel_move(2);
    let (dst, src) =
      graph.add_move_to(pm, Location::any(), Location::constant(def));
    assert_eq!(graph.move_dst_slot(pm, 0), dst);
    assert_eq!(graph.move_src_slot(pm, 0), src);
    assert!(!graph.move_is_redundant(graph[pm].moves[0]));
  }
}
