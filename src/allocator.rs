/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Allocator state and the phase driver.
//!
//! The entry point is [`crate::allocate_registers`]; it builds an
//! [`Allocator`] around a flow graph and runs the phases in order: collect
//! representations, liveness, lifetime numbering, live-range construction,
//! one allocation pass per register class, then frame fixups, control-flow
//! resolution and parallel-move scheduling.  The phase implementations
//! live in `builder`, `allocate` and `resolve`; everything they share is
//! here.

use std::fmt;

use log::{info, trace};
use vob::Vob;

use crate::ir::{
  BlockId, DefId, DefKind, FlowGraph, InstrId, MoveId, Rep, SummaryId, VReg,
};
use crate::liveness::{Liveness, ReachingDefs};
use crate::location::{Location, RegKind, SlotId};
use crate::ranges::{
  is_instruction_start_position, RangeId, Ranges, NORMAL_ENTRY_POS, NO_VREG,
  TEMP_VREG,
};
use crate::target::Target;

/// Knobs of one allocation run.
#[derive(Clone, Debug, Default)]
pub struct AllocatorOptions {
  /// Intrinsic code must fit in the available registers; spilling is a
  /// fatal error.
  pub intrinsic_mode: bool,
  /// Allow dropping the frame of functions that do not need one.
  pub allow_frameless: bool,
}

/// Allocation can fail; malformed graphs panic instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// The graph has already been through the allocator.
  AlreadyAllocated,
  /// Intrinsic mode ran out of registers.
  OutOfRegisters(RegKind),
}

impl fmt::Display for AllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AllocError::AlreadyAllocated => {
        write!(fmt, "flow graph is already allocated")
      }
      AllocError::OutOfRegisters(kind) => {
        write!(fmt, "out of {:?} registers in intrinsic mode", kind)
      }
    }
  }
}

impl std::error::Error for AllocError {}

/// Expands parallel moves into sequential machine moves.  The allocator
/// hands every populated move over and never looks inside.
pub trait MoveResolver {
  fn resolve(&mut self, graph: &mut FlowGraph, pm: MoveId);
}

/// What a lifetime position maps back to.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PosEntry {
  Block(BlockId),
  Instr(InstrId),
}

/// An instruction (or catch entry) that is a safepoint, in discovery
/// order: blocks are walked backwards, so positions descend.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SafepointSource {
  pub pos: i32,
  pub summary: SummaryId,
  pub instr: Option<InstrId>,
  pub catch_block: Option<BlockId>,
}

/// Positions of a loop plus the interference set shared by its back edges.
pub(crate) struct ExtraLoopInfo {
  pub start: i32,
  pub end: i32,
  pub backedge_interference: Option<Vob>,
}

pub(crate) struct Allocator<'g> {
  pub graph: &'g mut FlowGraph,
  pub target: &'g Target,
  pub intrinsic_mode: bool,
  pub allow_frameless: bool,

  pub liveness: Liveness,
  pub reaching_defs: ReachingDefs,

  /// Representation per vreg.
  pub value_reps: Vec<Rep>,

  /// Lifetime position (divided by two) to instruction / enclosing block.
  pub positions: Vec<PosEntry>,
  pub block_at: Vec<BlockId>,

  pub extra_loops: Vec<ExtraLoopInfo>,

  pub rs: Ranges,
  /// Parent live range per vreg.
  pub live_ranges: Vec<Option<RangeId>>,

  pub unallocated_cpu: Vec<RangeId>,
  pub unallocated_fpu: Vec<RangeId>,

  /// Pseudo ranges blocking individual registers.
  pub cpu_blocking: Vec<Option<RangeId>>,
  pub fpu_blocking: Vec<Option<RangeId>>,
  pub blocked_cpu: Vec<bool>,
  pub blocked_fpu: Vec<bool>,

  pub spilled: Vec<RangeId>,
  pub safepoints: Vec<SafepointSource>,

  // State of the in-progress register-class pass.
  pub register_kind: Option<RegKind>,
  pub number_of_registers: usize,
  /// Per register: allocated ranges still able to affect decisions.
  /// Evicted entries become `None` until compaction.
  pub registers: Vec<Vec<Option<RangeId>>>,
  pub blocked_registers: Vec<bool>,
  /// Worklist sorted by descending start so the next range pops off the
  /// back.
  pub unallocated: Vec<RangeId>,

  /// Spill slot bookkeeping: expiration position, quad-ness and
  /// untagged-ness per slot index.
  pub spill_slots: Vec<i32>,
  pub quad_spill_slots: Vec<bool>,
  pub untagged_spill_slots: Vec<bool>,
  pub cpu_spill_slot_count: usize,
}

impl<'g> Allocator<'g> {
  pub fn new(
    graph: &'g mut FlowGraph, target: &'g Target, opts: &AllocatorOptions,
  ) -> Allocator<'g> {
    let num_vregs = graph.max_vreg;
    let liveness = Liveness::compute(graph);

    let mut blocked_cpu = vec![false; target.num_cpu_registers];
    for reg in 0..target.num_cpu_registers {
      if (target.allocatable_cpu_registers & (1 << reg)) == 0 {
        blocked_cpu[reg] = true;
      }
      if opts.intrinsic_mode
        && (target.intrinsic_blocked_cpu_registers & (1 << reg)) != 0 {
        blocked_cpu[reg] = true;
      }
    }

    // The FPU scratch is reserved for the parallel move resolver.
    let mut blocked_fpu = vec![false; target.num_fpu_registers];
    blocked_fpu[target.fpu_scratch as usize] = true;

    Allocator {
      graph,
      target,
      intrinsic_mode: opts.intrinsic_mode,
      allow_frameless: opts.allow_frameless,
      liveness,
      reaching_defs: ReachingDefs::new(),
      value_reps: vec![Rep::None; num_vregs],
      positions: Vec::new(),
      block_at: Vec::new(),
      extra_loops: Vec::new(),
      rs: Ranges::new(),
      live_ranges: vec![None; num_vregs],
      unallocated_cpu: Vec::new(),
      unallocated_fpu: Vec::new(),
      cpu_blocking: vec![None; target.num_cpu_registers],
      fpu_blocking: vec![None; target.num_fpu_registers],
      blocked_cpu,
      blocked_fpu,
      spilled: Vec::new(),
      safepoints: Vec::new(),
      register_kind: None,
      number_of_registers: 0,
      registers: Vec::new(),
      blocked_registers: Vec::new(),
      unallocated: Vec::new(),
      spill_slots: Vec::new(),
      quad_spill_slots: Vec::new(),
      untagged_spill_slots: Vec::new(),
      cpu_spill_slot_count: 0,
    }
  }

  pub fn allocate(&mut self, resolver: &mut dyn MoveResolver)
    -> Result<(), AllocError> {
    self.collect_representations();
    self.number_instructions();
    self.build_live_ranges();
    self.trace_live_ranges("before allocation");

    info!("allocating cpu registers");
    self.prepare_for_allocation(RegKind::Cpu);
    self.allocate_unallocated_ranges()?;
    // Catch entries keep their reserved slots even when nothing else
    // spills.
    self.cpu_spill_slot_count =
      self.spill_slots.len().max(self.graph.fixed_slot_count);
    self.spill_slots.clear();
    self.quad_spill_slots.clear();
    self.untagged_spill_slots.clear();

    info!("allocating fpu registers");
    self.prepare_for_allocation(RegKind::Fpu);
    self.allocate_unallocated_ranges()?;

    let double_spill_slot_count =
      self.spill_slots.len() * self.target.double_spill_factor;
    self.graph.spill_slot_count = self.cpu_spill_slot_count
      + double_spill_slot_count + self.graph.max_argument_slot_count;

    self.remove_frame_if_not_needed();
    self.allocate_outgoing_arguments();
    self.resolve_control_flow();
    self.schedule_parallel_moves(resolver);
    self.trace_live_ranges("after allocation");

    self.graph.allocated = true;
    Ok(())
  }

  // --- live range table -----------------------------------------------

  pub fn get_live_range(&mut self, vreg: VReg) -> RangeId {
    debug_assert!(vreg >= 0);
    let index = vreg as usize;
    match self.live_ranges[index] {
      Some(range) => range,
      None => {
        let rep = self.value_reps[index];
        debug_assert!(rep != Rep::None);
        let range = self.rs.new_range(&mut self.graph.slots, vreg, rep);
        self.live_ranges[index] = Some(range);
        range
      }
    }
  }

  pub fn make_live_range_for_temporary(&mut self) -> RangeId {
    // Representation does not matter for temps.
    self.rs.new_range(&mut self.graph.slots, TEMP_VREG, Rep::None)
  }

  pub fn assigned_loc(&self, range: RangeId) -> Location {
    self.graph.slots[self.rs.range(range).assigned_slot]
  }

  pub fn set_assigned_loc(&mut self, range: RangeId, loc: Location) {
    self.graph.slots[self.rs.range(range).assigned_slot] = loc;
  }

  pub fn make_register_location(&self, reg: usize) -> Location {
    Location::machine(self.register_kind.expect("no active register kind"),
                      reg)
  }

  // --- register blocking ----------------------------------------------

  /// Make `loc` unavailable over `[from, to)` by extending the register's
  /// blocking pseudo range.
  pub fn block_location(&mut self, loc: Location, from: i32, to: i32) {
    let code = loc.register_code();
    match loc.kind() {
      RegKind::Cpu => {
        if self.blocked_cpu[code] {
          return;
        }
        if self.cpu_blocking[code].is_none() {
          let range =
            self.rs.new_range(&mut self.graph.slots, NO_VREG, Rep::None);
          self.set_assigned_loc(range, loc);
          self.cpu_blocking[code] = Some(range);
        }
        let range = self.cpu_blocking[code].unwrap();
        self.rs.add_use_interval(range, from, to);
      }
      RegKind::Fpu => {
        if self.blocked_fpu[code] {
          return;
        }
        if self.fpu_blocking[code].is_none() {
          let range =
            self.rs.new_range(&mut self.graph.slots, NO_VREG, Rep::None);
          self.set_assigned_loc(range, loc);
          self.fpu_blocking[code] = Some(range);
        }
        let range = self.fpu_blocking[code].unwrap();
        self.rs.add_use_interval(range, from, to);
      }
    }
  }

  pub fn block_cpu_registers(&mut self, registers: u32, from: i32, to: i32) {
    for reg in 0..self.target.num_cpu_registers {
      if (registers & (1 << reg)) != 0 {
        self.block_location(Location::Register(reg as u8), from, to);
      }
    }
  }

  pub fn block_fpu_registers(&mut self, registers: u32, from: i32, to: i32) {
    for reg in 0..self.target.num_fpu_registers {
      if (registers & (1 << reg)) != 0 {
        self.block_location(Location::FpuRegister(reg as u8), from, to);
      }
    }
  }

  // --- positions ------------------------------------------------------

  pub fn instruction_at(&self, pos: i32) -> PosEntry {
    self.positions[(pos / 2) as usize]
  }

  pub fn block_entry_at(&self, pos: i32) -> BlockId {
    self.block_at[(pos / 2) as usize]
  }

  pub fn is_block_entry(&self, pos: i32) -> bool {
    if !is_instruction_start_position(pos) {
      return false;
    }
    match self.instruction_at(pos) {
      PosEntry::Block(_) => true,
      PosEntry::Instr(_) => false,
    }
  }

  pub fn is_catch_block_entry(&self, pos: i32) -> bool {
    if !is_instruction_start_position(pos) {
      return false;
    }
    match self.instruction_at(pos) {
      PosEntry::Block(block) => self.graph[block].is_catch_entry(),
      PosEntry::Instr(_) => false,
    }
  }

  // --- parallel moves -------------------------------------------------

  pub(crate) fn block_entry_parallel_move(&mut self, block: BlockId, pos: i32)
    -> MoveId {
    match self.graph[block].entry_move {
      Some(pm) => pm,
      None => {
        let pm = self.graph.new_parallel_move(pos);
        self.graph[block].entry_move = Some(pm);
        pm
      }
    }
  }

  pub(crate) fn instr_parallel_move_before(&mut self, instr: InstrId, pos: i32)
    -> MoveId {
    match self.graph[instr].move_before {
      Some(pm) => pm,
      None => {
        let pm = self.graph.new_parallel_move(pos);
        self.graph[instr].move_before = Some(pm);
        pm
      }
    }
  }

  pub(crate) fn instr_parallel_move_after(&mut self, instr: InstrId, pos: i32)
    -> MoveId {
    match self.graph[instr].move_after {
      Some(pm) => pm,
      None => {
        let pm = self.graph.new_parallel_move(pos);
        self.graph[instr].move_after = Some(pm);
        pm
      }
    }
  }

  pub fn edge_parallel_move(&mut self, instr: InstrId) -> MoveId {
    match self.graph[instr].edge_move {
      Some(pm) => pm,
      None => {
        let pos = self.graph[instr].pos;
        let pm = self.graph.new_parallel_move(pos);
        self.graph[instr].edge_move = Some(pm);
        pm
      }
    }
  }

  /// Insert a `to <- from` move executing at `pos` and return the operand
  /// slots.
  pub fn add_move_at(&mut self, pos: i32, to: Location, from: Location)
    -> (SlotId, SlotId) {
    debug_assert!(!self.is_block_entry(pos) || self.is_catch_block_entry(pos));
    // The graph entry carries no parallel moves.
    debug_assert!(pos >= NORMAL_ENTRY_POS);

    let pm = match self.instruction_at(pos) {
      // Moves at a block entry execute right after it (function entries
      // at their start position, catch entries at start + 1).
      PosEntry::Block(block) => self.block_entry_parallel_move(block, pos),
      PosEntry::Instr(instr) => {
        if is_instruction_start_position(pos) {
          self.instr_parallel_move_before(instr, pos)
        } else {
          self.instr_parallel_move_after(instr, pos)
        }
      }
    };
    self.graph.add_move_to(pm, to, from)
  }

  // --- use conversion -------------------------------------------------

  pub fn convert_use_to(&mut self, use_id: crate::ranges::UseId,
                        loc: Location) {
    debug_assert!(!loc.is_pair());
    let slot = self.rs.use_pos(use_id).slot;
    trace!("  use at {} converted to {}", self.rs.use_pos(use_id).pos, loc);
    self.graph.slots[slot] = loc;
  }

  pub fn convert_all_uses(&mut self, range: RangeId) {
    if self.rs.range(range).vreg == NO_VREG {
      return;
    }

    let loc = self.assigned_loc(range);
    assert!(!loc.is_invalid());
    trace!("range [{}, {}) for v{} has been allocated to {}:",
           self.rs.start(range), self.rs.end(range),
           self.rs.range(range).vreg, loc);

    let mut use_id = self.rs.range(range).first_use;
    while let Some(u) = use_id {
      self.convert_use_to(u, loc);
      use_id = self.rs.use_pos(u).next;
    }

    // Values allocated to a register stay live across slow-path calls;
    // the safepoints there must know about them.
    if loc.is_machine_register() {
      let rep = self.rs.range(range).rep;
      let mut sp_id = self.rs.range(range).first_safepoint;
      while let Some(sp) = sp_id {
        let summary = self.rs.safepoint(sp).summary;
        if !self.graph[summary].always_calls() {
          debug_assert!(self.graph[summary].can_call());
          self.graph[summary].live_registers.add(loc, rep);
        }
        sp_id = self.rs.safepoint(sp).next;
      }
    }
  }

  // --- safepoints -----------------------------------------------------

  /// Attach every safepoint covered by `range` to it.  `defn` is the
  /// definition the range belongs to: a call does not belong to the
  /// safepoint of its own result, and exception/stacktrace pseudo
  /// parameters are live only after their catch entry.
  pub fn assign_safepoints(&mut self, defn: Option<DefId>, range: RangeId) {
    for i in (0..self.safepoints.len()).rev() {
      let source = self.safepoints[i];

      if let Some(def) = defn {
        match self.graph[def].kind {
          DefKind::Op(instr) if source.instr == Some(instr) => continue,
          DefKind::Param { block, special: Some(_), .. }
            if source.catch_block == Some(block) => continue,
          _ => {}
        }
      }

      if self.rs.end(range) <= source.pos {
        break;
      }
      if self.rs.contains(range, source.pos) {
        let always_calls = self.graph[source.summary].always_calls()
          && !self.graph[source.summary].callee_safe_call();
        self.rs.add_safepoint(range, source.pos, source.summary,
                              always_calls);
      }
    }
  }

  /// Set the range's spill-slot bit in the stack bitmap of every safepoint
  /// covered by any sibling.
  pub fn mark_as_object_at_safepoints(&mut self, range: RangeId) {
    let spill_slot = self.rs.range(range).spill_slot;
    let mut stack_index = spill_slot.stack_index();
    if spill_slot.base_reg() == crate::location::BaseReg::Fp {
      stack_index =
        -self.target.frame.variable_index_for_frame_slot(stack_index);
    }
    assert!(stack_index >= 0);

    let mut current = Some(range);
    while let Some(r) = current {
      let mut sp_id = self.rs.range(r).first_safepoint;
      while let Some(sp) = sp_id {
        let summary = self.rs.safepoint(sp).summary;
        self.graph[summary].set_stack_bit(stack_index as usize);
        sp_id = self.rs.safepoint(sp).next;
      }
      current = self.rs.range(r).next_sibling;
    }
  }

  // --- worklists ------------------------------------------------------

  pub fn should_be_allocated_before(&self, a: RangeId, b: RangeId) -> bool {
    self.rs.start(a) <= self.rs.start(b)
  }

  fn add_to_sorted_list(&mut self, range: RangeId, kind: SortedList) {
    self.rs.finger_initialize(range);

    let len = match kind {
      SortedList::Unallocated => self.unallocated.len(),
      SortedList::Cpu => self.unallocated_cpu.len(),
      SortedList::Fpu => self.unallocated_fpu.len(),
    };
    let mut insert_at = 0;
    for i in (0..len).rev() {
      let other = match kind {
        SortedList::Unallocated => self.unallocated[i],
        SortedList::Cpu => self.unallocated_cpu[i],
        SortedList::Fpu => self.unallocated_fpu[i],
      };
      if self.should_be_allocated_before(range, other) {
        insert_at = i + 1;
        break;
      }
    }
    match kind {
      SortedList::Unallocated => self.unallocated.insert(insert_at, range),
      SortedList::Cpu => self.unallocated_cpu.insert(insert_at, range),
      SortedList::Fpu => self.unallocated_fpu.insert(insert_at, range),
    }
  }

  pub fn add_to_unallocated(&mut self, range: RangeId) {
    self.add_to_sorted_list(range, SortedList::Unallocated);
  }

  /// Queue a finished range for the pass handling its register kind.
  pub fn complete_range_kind(&mut self, range: RangeId, kind: RegKind) {
    match kind {
      RegKind::Cpu => self.add_to_sorted_list(range, SortedList::Cpu),
      RegKind::Fpu => self.add_to_sorted_list(range, SortedList::Fpu),
    }
  }

  #[cfg(debug_assertions)]
  pub fn unallocated_is_sorted(&self) -> bool {
    for i in (1..self.unallocated.len()).rev() {
      let a = self.unallocated[i];
      let b = self.unallocated[i - 1];
      if !self.should_be_allocated_before(a, b) {
        return false;
      }
    }
    true
  }

  // --- representations ------------------------------------------------

  /// Record the (range) representation of every SSA value.
  fn collect_representations(&mut self) {
    for def in &self.graph.defs {
      if def.vreg >= 0 {
        self.value_reps[def.vreg as usize] = def.rep.for_range();
        if let Some(second) = def.second_vreg {
          self.value_reps[second as usize] = def.rep.for_range();
        }
      }
    }
  }

  // --- tracing --------------------------------------------------------

  pub fn trace_live_ranges(&self, when: &str) {
    if !log::log_enabled!(log::Level::Trace) {
      return;
    }
    trace!("-- live ranges [{}] --", when);
    for vreg in 0..self.live_ranges.len() {
      let mut current = self.live_ranges[vreg];
      while let Some(range) = current {
        if self.rs.range(range).first_interval.is_some() {
          trace!("  v{} [{}, {}) in {} spill {}", vreg,
                 self.rs.start(range), self.rs.end(range),
                 self.assigned_loc(range), self.rs.range(range).spill_slot);
          let mut use_id = self.rs.range(range).first_use;
          while let Some(u) = use_id {
            trace!("    use at {} as {}", self.rs.use_pos(u).pos,
                   self.graph.slots[self.rs.use_pos(u).slot]);
            use_id = self.rs.use_pos(u).next;
          }
        }
        current = self.rs.range(range).next_sibling;
      }
    }
  }
}

#[derive(Clone, Copy)]
enum SortedList {
  Unallocated,
  Cpu,
  Fpu,
}
