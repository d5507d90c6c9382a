/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Description of the machine the allocator targets: how many registers of
//! each class exist, which of them may be allocated, the calling-convention
//! volatile sets, and the frame layout helpers mapping variable indices to
//! frame slots.

use crate::ir::Rep;
use crate::location::{BaseReg, Location, RegKind};

/// Maps between variable indices and frame-pointer-relative slot indices.
///
/// Variable indices are `[1, 2, ..., M]` for the M parameters and
/// `[0, -1, -2, ..., -(N-1)]` for the N locals/spill slots.
#[derive(Clone, Copy, Debug)]
pub struct FrameLayout {
  /// Frame slot of variable index 0 (the first local).
  pub first_local_from_fp: i32,
  /// Frame slot just below the first parameter.
  pub param_end_from_fp: i32,
}

impl FrameLayout {
  pub fn frame_slot_for_variable_index(&self, index: i32) -> i32 {
    if index <= 0 {
      index + self.first_local_from_fp
    } else {
      index + self.param_end_from_fp
    }
  }

  pub fn variable_index_for_frame_slot(&self, slot: i32) -> i32 {
    if slot <= self.first_local_from_fp {
      slot - self.first_local_from_fp
    } else {
      slot - self.param_end_from_fp
    }
  }

  /// Rebase an FP-relative parameter slot to be relative to the entry SP of
  /// a frameless function.  On entry SP addresses the return address, which
  /// sits one word below the first parameter slot.
  pub fn to_entry_sp_relative(&self, loc: Location) -> Location {
    let index = loc.stack_index() - (self.param_end_from_fp + 1);
    match loc {
      Location::StackSlot { .. } => Location::stack_slot(index, BaseReg::Sp),
      Location::DoubleStackSlot { .. } => {
        Location::double_stack_slot(index, BaseReg::Sp)
      }
      Location::QuadStackSlot { .. } => {
        Location::quad_stack_slot(index, BaseReg::Sp)
      }
      _ => panic!("cannot rebase {:?}", loc),
    }
  }
}

/// Target register file and ABI description.
#[derive(Clone, Debug)]
pub struct Target {
  pub num_cpu_registers: usize,
  pub num_fpu_registers: usize,
  /// Bitmask of CPU registers the allocator may hand out.
  pub allocatable_cpu_registers: u32,
  /// Additional CPU registers that must stay untouched in intrinsic mode.
  pub intrinsic_blocked_cpu_registers: u32,
  /// Caller-saved sets, blocked across native leaf calls.
  pub volatile_cpu_registers: u32,
  pub volatile_fpu_registers: u32,
  /// FPU register reserved as scratch for the parallel move resolver.
  pub fpu_scratch: u8,
  /// Rotation applied to register iteration so that ties prefer the ABI's
  /// favourite register.
  pub allocation_bias: usize,
  /// Word slots occupied by one FPU spill slot (2 on 32-bit targets).
  pub double_spill_factor: usize,
  /// ABI registers carrying the exception and stack trace into a catch
  /// handler.
  pub exception_reg: u8,
  pub stacktrace_reg: u8,
  /// Targets keeping the return address in a link register need it spilled
  /// around write barriers, which limits frame elision.
  pub preserves_link_register: bool,
  pub frame: FrameLayout,
}

impl Target {
  /// A generic 64-bit configuration with `num_cpu` CPU and `num_fpu` FPU
  /// registers, everything allocatable except the last CPU register and the
  /// FPU scratch.
  pub fn make(num_cpu: usize, num_fpu: usize) -> Target {
    assert!(num_cpu >= 2 && num_cpu <= 32);
    assert!(num_fpu >= 2 && num_fpu <= 32);
    let all_cpu = ((1u64 << num_cpu) - 1) as u32;
    Target {
      num_cpu_registers: num_cpu,
      num_fpu_registers: num_fpu,
      allocatable_cpu_registers: all_cpu & !(1 << (num_cpu - 1)),
      intrinsic_blocked_cpu_registers: 0,
      volatile_cpu_registers: all_cpu & 0xff,
      volatile_fpu_registers: ((1u64 << num_fpu) - 1) as u32 & 0xff,
      fpu_scratch: (num_fpu - 1) as u8,
      allocation_bias: 0,
      double_spill_factor: 1,
      exception_reg: 0,
      stacktrace_reg: 1,
      preserves_link_register: false,
      frame: FrameLayout { first_local_from_fp: -2, param_end_from_fp: 1 },
    }
  }

  pub fn number_of_registers(&self, kind: RegKind) -> usize {
    match kind {
      RegKind::Cpu => self.num_cpu_registers,
      RegKind::Fpu => self.num_fpu_registers,
    }
  }

  pub fn all_cpu_mask(&self) -> u32 {
    ((1u64 << self.num_cpu_registers) - 1) as u32
  }

  pub fn all_fpu_mask(&self) -> u32 {
    ((1u64 << self.num_fpu_registers) - 1) as u32
  }

  pub fn exception_location(&self) -> Location {
    Location::Register(self.exception_reg)
  }

  pub fn stacktrace_location(&self) -> Location {
    Location::Register(self.stacktrace_reg)
  }
}

/// Set of registers live at a safepoint, with tagged-ness tracked per CPU
/// register so the GC can visit them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
  pub cpu_regs: u32,
  pub fpu_regs: u32,
  untagged_cpu_regs: u32,
}

impl RegisterSet {
  pub fn new() -> RegisterSet {
    RegisterSet::default()
  }

  pub fn add(&mut self, loc: Location, rep: Rep) {
    match loc {
      Location::Register(code) => {
        self.cpu_regs |= 1 << code;
        if rep != Rep::Tagged {
          self.untagged_cpu_regs |= 1 << code;
        }
      }
      Location::FpuRegister(code) => {
        self.fpu_regs |= 1 << code;
      }
      _ => panic!("cannot add {:?} to register set", loc),
    }
  }

  pub fn contains(&self, loc: Location) -> bool {
    match loc {
      Location::Register(code) => (self.cpu_regs & (1 << code)) != 0,
      Location::FpuRegister(code) => (self.fpu_regs & (1 << code)) != 0,
      _ => false,
    }
  }

  pub fn contains_tagged(&self, loc: Location) -> bool {
    match loc {
      Location::Register(code) => {
        (self.cpu_regs & !self.untagged_cpu_regs & (1 << code)) != 0
      }
      _ => false,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.cpu_regs == 0 && self.fpu_regs == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_layout_round_trip() {
    let frame = FrameLayout { first_local_from_fp: -2, param_end_from_fp: 1 };
    for index in -5..6 {
      let slot = frame.frame_slot_for_variable_index(index);
      assert_eq!(frame.variable_index_for_frame_slot(slot), index);
    }
    // Locals grow down from the first local slot.
    assert_eq!(frame.frame_slot_for_variable_index(0), -2);
    assert_eq!(frame.frame_slot_for_variable_index(-1), -3);
    // Parameters sit above the frame pointer.
    assert_eq!(frame.frame_slot_for_variable_index(1), 2);
  }

  #[test]
  fn register_set_taggedness() {
    let mut set = RegisterSet::new();
    set.add(Location::Register(2), Rep::Tagged);
    set.add(Location::Register(3), Rep::Untagged);
    set.add(Location::FpuRegister(1), Rep::UnboxedDouble);
    assert!(set.contains(Location::Register(2)));
    assert!(set.contains_tagged(Location::Register(2)));
    assert!(!set.contains_tagged(Location::Register(3)));
    assert!(set.contains(Location::FpuRegister(1)));
    assert!(!set.contains(Location::Register(5)));
  }
}
