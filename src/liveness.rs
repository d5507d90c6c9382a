/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! SSA liveness analysis.
//!
//! Standard backward iterative dataflow over virtual registers.  Phi inputs
//! are propagated to the matching predecessor, deoptimization environments
//! contribute uses, and materialization pseudo instructions recurse into
//! their inputs (memoized, so shared materializations in a deoptimization
//! chain do not blow up).

use log::info;
use rustc_hash::FxHashMap;
use vob::Vob;

use crate::ir::{
  BlockId, BlockKind, DefId, DefKind, EnvValue, FlowGraph, MatId,
};

pub struct Liveness {
  live_in: Vec<Vob>,
  live_out: Vec<Vob>,
  kill: Vec<Vob>,
  /// Blocks containing at least one may-throw instruction.
  may_throw_blocks: Vob,
}

impl Liveness {
  pub fn compute(graph: &FlowGraph) -> Liveness {
    info!("liveness: begin ({} blocks)", graph.blocks.len());
    let num_blocks = graph.blocks.len();
    let num_vregs = graph.max_vreg.max(1);
    let mut liveness = Liveness {
      live_in: vec![Vob::from_elem(false, num_vregs); num_blocks],
      live_out: vec![Vob::from_elem(false, num_vregs); num_blocks],
      kill: vec![Vob::from_elem(false, num_vregs); num_blocks],
      may_throw_blocks: Vob::from_elem(false, num_blocks),
    };
    liveness.compute_initial_sets(graph);
    liveness.solve(graph);
    info!("liveness: end");
    liveness
  }

  pub fn live_in(&self, block: BlockId) -> &Vob {
    &self.live_in[block.index()]
  }

  pub fn live_out(&self, block: BlockId) -> &Vob {
    &self.live_out[block.index()]
  }

  pub fn kill(&self, block: BlockId) -> &Vob {
    &self.kill[block.index()]
  }

  pub fn block_may_throw(&self, block: BlockId) -> bool {
    self.may_throw_blocks.get(block.index()).unwrap_or(false)
  }

  fn add_vregs(set: &mut Vob, graph: &FlowGraph, def: DefId) {
    let info = graph[def];
    set.set(info.vreg as usize, true);
    if let Some(second) = info.second_vreg {
      set.set(second as usize, true);
    }
  }

  fn remove_vregs(set: &mut Vob, graph: &FlowGraph, def: DefId) {
    let info = graph[def];
    set.set(info.vreg as usize, false);
    if let Some(second) = info.second_vreg {
      set.set(second as usize, false);
    }
  }

  fn compute_initial_sets(&mut self, graph: &FlowGraph) {
    let mut mat_visited = Vob::from_elem(false, graph.mats.len());

    for bi in 0..graph.blocks.len() {
      let block = &graph.blocks[bi];

      // Iterate backwards starting at the last instruction.
      for &instr_id in block.instrs.iter().rev() {
        let instr = &graph[instr_id];

        if instr.may_throw {
          self.may_throw_blocks.set(bi, true);
        }

        // Definitions.
        if let Some(def) = instr.defined {
          if graph[def].vreg >= 0 {
            Self::add_vregs(&mut self.kill[bi], graph, def);
            Self::remove_vregs(&mut self.live_in[bi], graph, def);
          }
        }

        // Uses.  Constant inputs are never live.
        let summary = &graph[instr.summary];
        debug_assert_eq!(summary.inputs.len(), instr.inputs.len());
        for (j, &def) in instr.inputs.iter().enumerate() {
          let loc = graph.slots[summary.inputs[j]];
          debug_assert!(
            !loc.is_constant() || graph[def].kind == DefKind::Constant
          );
          if loc.is_constant() {
            continue;
          }
          Self::add_vregs(&mut self.live_in[bi], graph, def);
        }

        // Outgoing arguments moved in registers are uses too.
        for &arg in &instr.move_args {
          if graph.is_register_arg_move(arg) {
            Self::add_vregs(&mut self.live_in[bi], graph, graph[arg].value);
          }
        }

        // Non-argument uses from the deoptimization environment (pushed
        // arguments are not allocated by the register allocator).
        let mut env = instr.env;
        while let Some(env_id) = env {
          for &value in &graph[env_id].values {
            match value {
              EnvValue::Mat(mat) => {
                deep_liveness(graph, mat, &mut self.live_in[bi],
                              &mut mat_visited);
              }
              EnvValue::Def(def) => match graph[def].kind {
                DefKind::ArgMove(_) | DefKind::Constant => {}
                _ => Self::add_vregs(&mut self.live_in[bi], graph, def),
              },
            }
          }
          env = graph[env_id].outer;
        }
      }

      // Phis kill their vreg here; a phi input not defined by the
      // corresponding predecessor must be live-in for that predecessor.
      if block.kind == BlockKind::JoinEntry {
        for phi in &block.phis {
          Self::add_vregs(&mut self.kill[bi], graph, phi.def);
          Self::remove_vregs(&mut self.live_in[bi], graph, phi.def);

          debug_assert_eq!(phi.inputs.len(), block.preds.len());
          for (k, &input) in phi.inputs.iter().enumerate() {
            let info = graph[input];
            if info.kind == DefKind::Constant {
              continue;
            }
            let pred = block.preds[k].index();
            let use_vreg = info.vreg as usize;
            if !self.kill[pred].get(use_vreg).unwrap_or(false) {
              self.live_in[pred].set(use_vreg, true);
            }
            if graph[phi.def].has_pair_representation() {
              let second = info.second_vreg.expect("pair phi input") as usize;
              if !self.kill[pred].get(second).unwrap_or(false) {
                self.live_in[pred].set(second, true);
              }
            }
          }
        }
      } else if !block.initial_defs.is_empty() {
        // Parameters, constants and catch pseudo parameters.
        for &def in &block.initial_defs {
          Self::add_vregs(&mut self.kill[bi], graph, def);
          Self::remove_vregs(&mut self.live_in[bi], graph, def);
        }
      }
    }
  }

  /// Iterate to a fixed point over the postorder.
  fn solve(&mut self, graph: &FlowGraph) {
    let num_vregs = graph.max_vreg.max(1);
    loop {
      let mut changed = false;
      for bi in (0..graph.blocks.len()).rev() {
        // live_out = union of successors' live_in.
        let mut live_out = Vob::from_elem(false, num_vregs);
        for &succ in &graph.blocks[bi].succs {
          live_out.or(&self.live_in[succ.index()]);
        }
        self.live_out[bi] = live_out;

        // live_in |= live_out - kill.
        let mut flow = self.live_out[bi].clone();
        for v in self.kill[bi].iter_set_bits(..) {
          flow.set(v, false);
        }
        if self.live_in[bi].or(&flow) {
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }
  }
}

/// Add every value transitively flowing into a materialization.
fn deep_liveness(
  graph: &FlowGraph, mat: MatId, live_in: &mut Vob, visited: &mut Vob,
) {
  if visited.get(mat.index()).unwrap_or(false) {
    return;
  }
  visited.set(mat.index(), true);

  for &input in &graph[mat].inputs {
    match input {
      EnvValue::Mat(inner) => deep_liveness(graph, inner, live_in, visited),
      EnvValue::Def(def) => {
        let info = graph[def];
        if info.kind != DefKind::Constant {
          live_in.set(info.vreg as usize, true);
          if let Some(second) = info.second_vreg {
            live_in.set(second as usize, true);
          }
        }
      }
    }
  }
}

/// For each phi, the set of virtual registers transitively contributing to
/// it.  Used to steer loop-phi register choice away from back-edge
/// interference.  Computed lazily with a fixed point over phi-dependent
/// phis.
pub struct ReachingDefs {
  sets: FxHashMap<DefId, Vob>,
  pending: Vec<DefId>,
}

impl ReachingDefs {
  pub fn new() -> ReachingDefs {
    ReachingDefs { sets: FxHashMap::default(), pending: Vec::new() }
  }

  pub fn get(&mut self, graph: &FlowGraph, phi: DefId) -> &Vob {
    if !self.sets.contains_key(&phi) {
      debug_assert!(self.pending.is_empty());
      self.add_phi(graph, phi);
      self.compute(graph);
    }
    &self.sets[&phi]
  }

  fn phi_inputs<'g>(graph: &'g FlowGraph, phi: DefId) -> &'g [DefId] {
    match graph[phi].kind {
      DefKind::Phi { block, index } => {
        &graph[block].phis[index as usize].inputs
      }
      _ => panic!("reaching defs of non-phi {:?}", phi),
    }
  }

  fn add_phi(&mut self, graph: &FlowGraph, phi: DefId) {
    if self.sets.contains_key(&phi) {
      return;
    }
    let mut set = Vob::from_elem(false, graph.max_vreg.max(1));
    let mut depends_on_phi = false;
    for &input in Self::phi_inputs(graph, phi) {
      let info = graph[input];
      if let DefKind::Phi { .. } = info.kind {
        depends_on_phi = true;
      }
      set.set(info.vreg as usize, true);
      if graph[phi].has_pair_representation() {
        set.set(info.second_vreg.expect("pair phi input") as usize, true);
      }
    }
    self.sets.insert(phi, set);
    if depends_on_phi {
      self.pending.push(phi);
    }
  }

  fn compute(&mut self, graph: &FlowGraph) {
    // Transitively collect all phis feeding the pending ones.
    let mut i = 0;
    while i < self.pending.len() {
      let phi = self.pending[i];
      let inputs: Vec<DefId> = Self::phi_inputs(graph, phi).to_vec();
      for input in inputs {
        if let DefKind::Phi { .. } = graph[input].kind {
          self.add_phi(graph, input);
        }
      }
      i += 1;
    }

    // Propagate until a fixed point is reached.
    let mut changed = true;
    while changed {
      changed = false;
      for i in 0..self.pending.len() {
        let phi = self.pending[i];
        let inputs: Vec<DefId> = Self::phi_inputs(graph, phi).to_vec();
        for input in inputs {
          if let DefKind::Phi { .. } = graph[input].kind {
            let src = self.sets[&input].clone();
            let dst = self.sets.get_mut(&phi).unwrap();
            if dst.or(&src) {
              changed = true;
            }
          }
        }
      }
    }
    self.pending.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{CallKind, Instr, InstrKind, Rep};
  use crate::location::Location;
  use crate::InstrId;

  // entry(b0) -> fe(b1) -> join(b2) <-> body(b3), exit through b4.
  // v0 defined in b1, v1 = phi(v0, v2) in b2, v2 defined in b3.
  fn loop_graph() -> (FlowGraph, BlockId, BlockId, BlockId, BlockId) {
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

    let v0 = graph.new_def(0, None, Rep::Tagged, DefKind::Op(InstrId(0)));
    let v1 = graph.new_def(
      1, None, Rep::Tagged, DefKind::Phi { block: b2, index: 0 },
    );
    let v2 = graph.new_def(2, None, Rep::Tagged, DefKind::Op(InstrId(1)));

    let def_locs = graph.new_summary(
      &[], &[], Location::requires_register(), CallKind::NoCall,
    );
    let mut def_v0 = Instr::new(InstrKind::Op, def_locs);
    def_v0.defined = Some(v0);
    graph.add_instr(b1, def_v0);
    let goto_locs =
      graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
    graph.add_instr(b1, Instr::new(InstrKind::Goto { target: b2 }, goto_locs));

    graph.add_phi(b2, v1, vec![v0, v2]);
    let branch_locs = graph.new_summary(
      &[Location::requires_register()], &[], Location::Invalid,
      CallKind::NoCall,
    );
    let mut branch = Instr::new(
      InstrKind::Branch { true_target: b3, false_target: b4 }, branch_locs,
    );
    branch.inputs.push(v1);
    graph.add_instr(b2, branch);

    let use_locs = graph.new_summary(
      &[Location::requires_register()], &[], Location::requires_register(),
      CallKind::NoCall,
    );
    let mut def_v2 = Instr::new(InstrKind::Op, use_locs);
    def_v2.inputs.push(v1);
    def_v2.defined = Some(v2);
    graph.add_instr(b3, def_v2);
    let goto_locs =
      graph.new_summary(&[], &[], Location::Invalid, CallKind::NoCall);
    graph.add_instr(b3, Instr::new(InstrKind::Goto { target: b2 }, goto_locs));

    let ret_locs = graph.new_summary(
      &[Location::any()], &[], Location::Invalid, CallKind::NoCall,
    );
    let mut ret = Instr::new(InstrKind::Return, ret_locs);
    ret.inputs.push(v0);
    graph.add_instr(b4, ret);
    (graph, b1, b2, b3, b4)
  }

  #[test]
  fn loop_liveness() {
    let (graph, b1, b2, b3, b4) = loop_graph();
    let liveness = Liveness::compute(&graph);

    // v0 is defined in b1 and used in b4, so it is live through the loop
    // but not into b1.
    assert!(!liveness.live_in(b1).get(0).unwrap());
    assert!(liveness.live_out(b1).get(0).unwrap());
    assert!(liveness.live_in(b2).get(0).unwrap());
    assert!(liveness.live_in(b3).get(0).unwrap());
    assert!(liveness.live_in(b4).get(0).unwrap());
    // The phi kills v1 in the join; v1 is live through the body.
    assert!(liveness.kill(b2).get(1).unwrap());
    assert!(liveness.live_in(b3).get(1).unwrap());
    // Phi inputs defined by the matching predecessor stay out of the
    // dataflow sets; the range builder connects them on the edge.
    assert!(!liveness.live_in(b2).get(2).unwrap());
    assert!(!liveness.live_in(b3).get(2).unwrap());
    // Nothing is live out of the exit.
    assert!(liveness.live_out(b4).iter_set_bits(..).next().is_none());
  }

  #[test]
  fn reaching_defs_include_phi_cycle() {
    let (graph, _b1, b2, _b3, _b4) = loop_graph();
    let phi = graph[b2].phis[0].def;
    let mut reaching = ReachingDefs::new();
    let set = reaching.get(&graph, phi);
    // Both direct inputs reach the phi; the phi itself does not (it is not
    // an input of itself here).
    assert!(set.get(0).unwrap());
    assert!(set.get(2).unwrap());
    assert!(!set.get(1).unwrap());
  }
}
