/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Linear-scan register allocator for SSA-form flow graphs.
//!
//! The allocator consumes a lowered [`FlowGraph`] whose instruction
//! operands carry allocation policies ("requires register", "same as first
//! input", "fixed register") and rewrites every operand in place with a
//! concrete machine location, inserting parallel moves on block edges and
//! between split live ranges.  It understands deoptimization environments,
//! GC safepoints (tagged values are tracked in stack bitmaps and register
//! sets), paired 64-bit values on 32-bit targets, and try/catch control
//! flow.
//!
//! ```text
//!   numbering -> liveness -> range building -> allocation (cpu, fpu)
//!             -> resolution -> frame fixups -> parallel move scheduling
//! ```
//!
//! The caller provides a [`Target`] describing the register file and a
//! [`MoveResolver`] that lowers the emitted parallel moves.

mod allocate;
mod allocator;
mod builder;
mod ir;
mod liveness;
mod location;
mod ranges;
mod resolve;
mod target;

#[cfg(test)]
mod tests;

pub use crate::allocator::{
  AllocError, AllocatorOptions, MoveResolver,
};
pub use crate::ir::{
  ArgMoveId, Block, BlockId, BlockKind, CallKind, DefId, DefInfo, DefKind,
  Env, EnvId, EnvValue, FlowGraph, Instr, InstrId, InstrKind,
  LocationSummary, LoopId, LoopInfo, MatId, Materialization, MoveId,
  MoveOperands, ParallelMove, Phi, Rep, SpecialParam, SummaryId, VReg,
};
pub use crate::location::{
  BaseReg, Location, Policy, RegKind, SlotId, Slots,
};
pub use crate::target::{FrameLayout, RegisterSet, Target};

use crate::allocator::Allocator;

/// Allocate every operand of `graph` to a concrete location.
///
/// On success the graph's location slots are all filled, parallel moves
/// hang off blocks and instructions, and `graph.spill_slot_count` (and
/// possibly `graph.frameless`) is published.  Allocating an
/// already-allocated graph is rejected.
pub fn allocate_registers(
  graph: &mut FlowGraph, target: &Target, opts: &AllocatorOptions,
  resolver: &mut dyn MoveResolver,
) -> Result<(), AllocError> {
  if graph.allocated {
    return Err(AllocError::AlreadyAllocated);
  }
  Allocator::new(graph, target, opts).allocate(resolver)
}

/// A resolver that leaves parallel moves in their simultaneous form; for
/// clients (and tests) that schedule moves themselves.
pub struct NullMoveResolver;

impl MoveResolver for NullMoveResolver {
  fn resolve(&mut self, _graph: &mut FlowGraph, _pm: MoveId) {}
}
