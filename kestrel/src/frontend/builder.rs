use anyhow::{bail, Result};
use hashbrown::HashMap;
use itertools::Itertools;
use kestrel_util::BitMap;

use crate::bytecode::{Bytecode, BytecodeTranslationInfo, PcIndex, VRegId};
use crate::frontend::args::{install_args, ArgumentAccessor};
use crate::ir::builder::CircuitBuilder;
use crate::ir::circuit::Circuit;
use crate::ir::gate::GateRef;
use crate::ir::gate_type::GateType;
use crate::ir::machine::{js_machine_type, MachineType};
use crate::ir::opcode::OpCode;
use crate::ir::tagged;
use crate::ir::visualizer;

/// Where a scan event splits the pc stream.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
enum SplitKind {
    Start,
    End,
}

/// One block-discovery event produced while scanning the pc array.
#[derive(Clone, Debug)]
struct CfgInfo {
    pc: PcIndex,
    split_kind: SplitKind,
    succs: Vec<PcIndex>,
}

/// A register (or the accumulator) being renamed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Reg {
    VReg(VRegId),
    Acc,
}

/// One expanded state predecessor of a block: which block the edge leaves,
/// the exclusive pc bound for renaming across it, its slot index within the
/// forward or loop-back group, and the exception object when the edge is a
/// try→catch dispatch.
#[derive(Copy, Clone, Debug)]
struct ExpandedPred {
    block: usize,
    end_pc: PcIndex,
    index: usize,
    is_loop_back: bool,
    exception: GateRef,
}

/// The selector gates giving a phi register its value at a block head. For
/// loop heads the outer selector sits on the LOOP_BEGIN and the forward and
/// back operands may themselves be selectors over the edge-group merges.
#[derive(Copy, Clone, Debug)]
struct PhiGates {
    outer: GateRef,
    forward: GateRef,
    back: GateRef,
}

impl PhiGates {
    const NONE: PhiGates = PhiGates {
        outer: GateRef::NULL,
        forward: GateRef::NULL,
        back: GateRef::NULL,
    };
}

/// A bytecode basic block while the circuit is under construction.
#[derive(Clone, Debug)]
struct BytecodeRegion {
    id: usize,
    start: PcIndex,
    end: PcIndex,
    preds: Vec<usize>,
    succs: Vec<usize>,
    /// For a catch head: the protected blocks dispatching here.
    try_blocks: Vec<usize>,
    /// For a protected block: its catch heads, innermost first.
    catch_targets: Vec<usize>,
    idom: usize,
    dom_frontiers: Vec<usize>,
    loop_back_preds: Vec<usize>,
    is_dead: bool,
    phi: Vec<VRegId>,
    phi_acc: bool,
    num_state_preds: usize,
    num_loop_backs: usize,
    forward_index: usize,
    loop_back_index: usize,
    expanded_preds: Vec<ExpandedPred>,
    state_start: GateRef,
    depend_start: GateRef,
    merge_forward: GateRef,
    merge_loop_back: GateRef,
    dep_forward: GateRef,
    dep_loop_back: GateRef,
    vreg_phis: HashMap<VRegId, PhiGates>,
    acc_phi: PhiGates,
    /// GET_EXCEPTION defining the accumulator at a single-pred catch head.
    catch_acc: GateRef,
}

impl BytecodeRegion {
    fn new(id: usize, start: PcIndex, end: PcIndex) -> Self {
        BytecodeRegion {
            id,
            start,
            end,
            preds: Vec::new(),
            succs: Vec::new(),
            try_blocks: Vec::new(),
            catch_targets: Vec::new(),
            idom: 0,
            dom_frontiers: Vec::new(),
            loop_back_preds: Vec::new(),
            is_dead: false,
            phi: Vec::new(),
            phi_acc: false,
            num_state_preds: 0,
            num_loop_backs: 0,
            forward_index: 0,
            loop_back_index: 0,
            expanded_preds: Vec::new(),
            state_start: GateRef::NULL,
            depend_start: GateRef::NULL,
            merge_forward: GateRef::NULL,
            merge_loop_back: GateRef::NULL,
            dep_forward: GateRef::NULL,
            dep_loop_back: GateRef::NULL,
            vreg_phis: HashMap::new(),
            acc_phi: PhiGates::NONE,
            catch_acc: GateRef::NULL,
        }
    }
}

/// Side tables produced by the frontend for the passes that follow.
#[derive(Debug)]
pub struct FrontendInfo {
    pub translation: BytecodeTranslationInfo,
    pub gate_to_pc: HashMap<GateRef, PcIndex>,
    pub pc_to_gate: HashMap<PcIndex, GateRef>,
    /// Suspend and resume gates, in emission order.
    pub async_related: Vec<GateRef>,
}

impl FrontendInfo {
    pub fn bytecode_of(&self, gate: GateRef) -> Option<&Bytecode> {
        self.gate_to_pc
            .get(&gate)
            .map(|pc| &self.translation.bytecodes[*pc])
    }

    pub fn is_async_related(&self) -> bool {
        !self.async_related.is_empty()
    }
}

/// Translates one method's bytecode into a circuit.
#[derive(Debug)]
pub struct BytecodeCircuitBuilder {
    translation: BytecodeTranslationInfo,
    circuit: Circuit,
    graph: Vec<BytecodeRegion>,
    rpo: Vec<usize>,
    gate_to_pc: HashMap<GateRef, PcIndex>,
    pc_to_gate: HashMap<PcIndex, GateRef>,
    /// Per resume pc, the RESTORE_REGISTER gate of each vreg.
    resume_regs: HashMap<PcIndex, HashMap<VRegId, GateRef>>,
    async_related: Vec<GateRef>,
    enable_log: bool,
}

impl BytecodeCircuitBuilder {
    /// Runs the whole construction pipeline and returns the circuit plus the
    /// side tables the passes need.
    pub fn build(
        translation: BytecodeTranslationInfo,
        enable_log: bool,
    ) -> Result<(Circuit, FrontendInfo)> {
        let mut builder = BytecodeCircuitBuilder {
            translation,
            circuit: Circuit::new(),
            graph: Vec::new(),
            rpo: Vec::new(),
            gate_to_pc: HashMap::new(),
            pc_to_gate: HashMap::new(),
            resume_regs: HashMap::new(),
            async_related: Vec::new(),
            enable_log,
        };
        builder.bytecode_to_circuit()?;
        if builder.enable_log {
            visualizer::print_circuit(&builder.circuit, "bytecode to circuit");
        }
        let BytecodeCircuitBuilder {
            translation,
            circuit,
            gate_to_pc,
            pc_to_gate,
            async_related,
            ..
        } = builder;
        let info = FrontendInfo {
            translation,
            gate_to_pc,
            pc_to_gate,
            async_related,
        };
        Ok((circuit, info))
    }

    fn bytecode_to_circuit(&mut self) -> Result<()> {
        if self.translation.bytecodes.is_empty() {
            bail!("cannot translate an empty method");
        }
        let infos = self.collect_block_info();
        self.build_basic_blocks(&infos);
        self.compute_dominator_tree()?;
        self.insert_phis();
        self.collect_preds_info();
        install_args(&mut self.circuit, &self.translation.method)?;
        self.build_block_heads()?;
        self.build_sub_circuit()?;
        self.fill_phis()?;
        Ok(())
    }

    // ---- step 1: block discovery ----

    fn collect_block_info(&self) -> Vec<CfgInfo> {
        let mut infos = vec![CfgInfo {
            pc: 0,
            split_kind: SplitKind::Start,
            succs: Vec::new(),
        }];
        let len = self.translation.bytecodes.len();
        for (pc, bc) in self.translation.bytecodes.iter().enumerate() {
            if bc.is_jump() {
                let target = bc.jump_target(pc).expect("jump without target");
                let mut succs = vec![target];
                if bc.is_cond_jump() {
                    succs.push(pc + 1);
                }
                infos.push(CfgInfo {
                    pc,
                    split_kind: SplitKind::End,
                    succs,
                });
                infos.push(CfgInfo {
                    pc: target,
                    split_kind: SplitKind::Start,
                    succs: Vec::new(),
                });
                if pc + 1 < len {
                    infos.push(CfgInfo {
                        pc: pc + 1,
                        split_kind: SplitKind::Start,
                        succs: Vec::new(),
                    });
                }
            } else if bc.is_return() || bc.is_throw() {
                infos.push(CfgInfo {
                    pc,
                    split_kind: SplitKind::End,
                    succs: Vec::new(),
                });
                if pc + 1 < len {
                    infos.push(CfgInfo {
                        pc: pc + 1,
                        split_kind: SplitKind::Start,
                        succs: Vec::new(),
                    });
                }
            }
        }
        for range in &self.translation.try_catch {
            for pc in [range.try_start, range.try_end, range.catch_start] {
                if pc < len {
                    infos.push(CfgInfo {
                        pc,
                        split_kind: SplitKind::Start,
                        succs: Vec::new(),
                    });
                }
            }
        }
        infos.sort_by_key(|info| (info.pc, info.split_kind));
        infos.dedup_by_key(|info| (info.pc, info.split_kind));
        infos
    }

    // ---- step 2: CFG construction ----

    fn build_basic_blocks(&mut self, infos: &[CfgInfo]) {
        let len = self.translation.bytecodes.len();
        let mut starts: Vec<PcIndex> = infos
            .iter()
            .filter(|info| info.split_kind == SplitKind::Start)
            .map(|info| info.pc)
            .collect();
        starts.sort_unstable();
        starts.dedup();

        self.graph = starts
            .iter()
            .enumerate()
            .map(|(id, &start)| {
                let end = starts.get(id + 1).copied().unwrap_or(len);
                BytecodeRegion::new(id, start, end)
            })
            .collect();

        // Successors: an end event at the block's last pc carries the jump
        // targets; without one, a non-terminating block falls through.
        let end_events: HashMap<PcIndex, &[PcIndex]> = infos
            .iter()
            .filter(|info| info.split_kind == SplitKind::End)
            .map(|info| (info.pc, info.succs.as_slice()))
            .collect();
        for id in 0..self.graph.len() {
            let last_pc = self.graph[id].end - 1;
            let succs: Vec<usize> = match end_events.get(&last_pc) {
                Some(targets) => targets.iter().map(|pc| self.block_at(*pc)).collect(),
                None if self.graph[id].end < len => vec![self.block_at(self.graph[id].end)],
                None => Vec::new(),
            };
            self.graph[id].succs = succs.clone();
            for succ in succs {
                self.graph[succ].preds.push(id);
            }
        }

        // Exception edges from try regions to their catch heads.
        for range in self.translation.try_catch.clone() {
            let catch_block = self.block_at(range.catch_start);
            for id in 0..self.graph.len() {
                let (start, end) = (self.graph[id].start, self.graph[id].end);
                if start < range.try_end && end > range.try_start && id != catch_block {
                    self.graph[id].catch_targets.push(catch_block);
                    self.graph[catch_block].try_blocks.push(id);
                }
            }
        }
    }

    fn block_at(&self, pc: PcIndex) -> usize {
        match self.graph.binary_search_by_key(&pc, |region| region.start) {
            Ok(id) => id,
            Err(id) => id - 1,
        }
    }

    /// Predecessors across both normal and exception edges.
    fn all_preds(&self, id: usize) -> Vec<usize> {
        let mut preds = self.graph[id].preds.clone();
        preds.extend_from_slice(&self.graph[id].try_blocks);
        preds
    }

    // ---- steps 3 & 4: dominators and dead-region removal ----

    fn compute_dominator_tree(&mut self) -> Result<()> {
        let num_blocks = self.graph.len();
        // Depth-first reachability; unreached blocks are dead.
        let mut visited = BitMap::with_capacity(num_blocks);
        let mut postorder = Vec::new();
        // (block, next successor cursor)
        let mut stack = vec![(0usize, 0usize)];
        visited.set(0);
        while let Some(&(block, cursor)) = stack.last() {
            let mut succs = self.graph[block].succs.clone();
            succs.extend_from_slice(&self.graph[block].catch_targets);
            if cursor < succs.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = succs[cursor];
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        for region in &mut self.graph {
            region.is_dead = !visited.get(region.id);
        }
        self.rpo = postorder.iter().rev().copied().collect();

        // Iterative idom computation over reverse postorder.
        let mut order_of = vec![usize::MAX; num_blocks];
        for (order, &block) in self.rpo.iter().enumerate() {
            order_of[block] = order;
        }
        let mut idom = vec![usize::MAX; num_blocks];
        idom[0] = 0;
        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let preds = self.all_preds(block);
                let mut new_idom = usize::MAX;
                for &pred in &preds {
                    if self.graph[pred].is_dead || idom[pred] == usize::MAX {
                        continue;
                    }
                    new_idom = if new_idom == usize::MAX {
                        pred
                    } else {
                        Self::intersect(&idom, &order_of, pred, new_idom)
                    };
                }
                if new_idom == usize::MAX {
                    bail!("reachable block {block} has no processed predecessor");
                }
                if idom[block] != new_idom {
                    idom[block] = new_idom;
                    changed = true;
                }
            }
        }
        for &block in &self.rpo {
            self.graph[block].idom = idom[block];
        }

        // Dominance frontiers.
        for &block in &self.rpo {
            let preds = self.all_preds(block);
            if preds.len() < 2 {
                continue;
            }
            for pred in preds {
                if self.graph[pred].is_dead {
                    continue;
                }
                let mut runner = pred;
                while runner != idom[block] {
                    if !self.graph[runner].dom_frontiers.contains(&block) {
                        self.graph[runner].dom_frontiers.push(block);
                    }
                    runner = idom[runner];
                }
            }
        }

        // A retreating edge to a dominator is a loop back edge; any other
        // retreating edge makes the flow irreducible.
        for &block in &self.rpo {
            for pred_idx in 0..self.graph[block].preds.len() {
                let pred = self.graph[block].preds[pred_idx];
                if self.graph[pred].is_dead {
                    continue;
                }
                if order_of[pred] >= order_of[block] {
                    if !self.dominates(block, pred) {
                        bail!(
                            "irreducible control flow: retreating edge {pred} -> {block} whose target is not a dominator"
                        );
                    }
                    self.graph[block].loop_back_preds.push(pred);
                }
            }
        }
        Ok(())
    }

    fn intersect(idom: &[usize], order_of: &[usize], mut a: usize, mut b: usize) -> usize {
        while a != b {
            while order_of[a] > order_of[b] {
                a = idom[a];
            }
            while order_of[b] > order_of[a] {
                b = idom[b];
            }
        }
        a
    }

    fn dominates(&self, dominator: usize, mut block: usize) -> bool {
        loop {
            if block == dominator {
                return true;
            }
            if block == 0 {
                return false;
            }
            block = self.graph[block].idom;
        }
    }

    // ---- step 5: phi placement ----

    fn defined_regs(&self, block: usize) -> (Vec<VRegId>, bool) {
        let mut vregs = Vec::new();
        let mut acc = false;
        for pc in self.graph[block].start..self.graph[block].end {
            let bc = &self.translation.bytecodes[pc];
            let info = bc.info();
            for v in info.vreg_out {
                if !vregs.contains(&v) {
                    vregs.push(v);
                }
            }
            acc |= info.acc_out;
            if bc.is_resume() {
                // A resume point reloads every local register.
                for v in 0..self.translation.method.num_vregs {
                    if !vregs.contains(&v) {
                        vregs.push(v);
                    }
                }
            }
        }
        // A catch head defines the accumulator with the caught exception.
        acc |= !self.graph[block].try_blocks.is_empty();
        (vregs, acc)
    }

    fn insert_phis(&mut self) {
        let num_blocks = self.graph.len();
        let mut vreg_defs: HashMap<VRegId, Vec<usize>> = HashMap::new();
        let mut acc_defs: Vec<usize> = Vec::new();
        for block in 0..num_blocks {
            if self.graph[block].is_dead {
                continue;
            }
            let (vregs, acc) = self.defined_regs(block);
            for v in vregs {
                vreg_defs.entry(v).or_default().push(block);
            }
            if acc {
                acc_defs.push(block);
            }
        }

        let mut place = |defs: &[usize], mark: &mut dyn FnMut(&mut BytecodeRegion) -> bool| {
            let mut worklist: Vec<usize> = defs.to_vec();
            let mut placed = BitMap::with_capacity(num_blocks);
            let mut on_list = BitMap::with_capacity(num_blocks);
            for &block in defs {
                on_list.set(block);
            }
            while let Some(block) = worklist.pop() {
                for frontier_idx in 0..self.graph[block].dom_frontiers.len() {
                    let frontier = self.graph[block].dom_frontiers[frontier_idx];
                    if self.graph[frontier].is_dead || !placed.insert(frontier) {
                        continue;
                    }
                    mark(&mut self.graph[frontier]);
                    if on_list.insert(frontier) {
                        worklist.push(frontier);
                    }
                }
            }
        };

        let mut sorted: Vec<_> = vreg_defs.into_iter().collect();
        sorted.sort_by_key(|(v, _)| *v);
        for (vreg, defs) in sorted {
            place(&defs, &mut |region| {
                if region.phi.contains(&vreg) {
                    false
                } else {
                    region.phi.push(vreg);
                    true
                }
            });
        }
        place(&acc_defs.clone(), &mut |region| {
            // The exception object, not a merge of predecessor values,
            // defines the accumulator at a catch head.
            if region.phi_acc || !region.try_blocks.is_empty() {
                false
            } else {
                region.phi_acc = true;
                true
            }
        });
    }

    // ---- step 6: CFG edge numbering ----

    fn collect_preds_info(&mut self) {
        for block in 0..self.graph.len() {
            if self.graph[block].is_dead {
                continue;
            }
            let mut count = self.graph[block]
                .preds
                .iter()
                .filter(|p| !self.graph[**p].is_dead)
                .count();
            // Each general bytecode of a protected block contributes one
            // exception edge into the catch head.
            for try_idx in 0..self.graph[block].try_blocks.len() {
                let try_block = self.graph[block].try_blocks[try_idx];
                if self.graph[try_block].is_dead {
                    continue;
                }
                count += (self.graph[try_block].start..self.graph[try_block].end)
                    .filter(|&pc| self.translation.bytecodes[pc].is_general())
                    .count();
            }
            if block == 0 {
                count += 1; // the implicit edge from the state entry
            }
            self.graph[block].num_state_preds = count;
            self.graph[block].num_loop_backs = self.graph[block].loop_back_preds.len();
        }
    }

    // ---- step 7: block heads and per-pc emission ----

    fn build_block_heads(&mut self) -> Result<()> {
        let state_entry = Circuit::get_circuit_root(OpCode::StateEntry);
        let depend_entry = Circuit::get_circuit_root(OpCode::DependEntry);
        for idx in 0..self.rpo.len() {
            let block = self.rpo[idx];
            let (num_preds, num_backs) = (
                self.graph[block].num_state_preds,
                self.graph[block].num_loop_backs,
            );
            let forward = num_preds - num_backs;
            let mut builder = CircuitBuilder::new(&mut self.circuit);
            if num_backs == 0 {
                if block == 0 {
                    self.graph[block].state_start = state_entry;
                    self.graph[block].depend_start = depend_entry;
                } else if forward > 1 {
                    let merge = builder.pending_merge(forward)?;
                    let depends = builder.pending_selector(
                        MachineType::NoValue,
                        merge,
                        forward,
                        GateType::empty(),
                    )?;
                    self.graph[block].state_start = merge;
                    self.graph[block].depend_start = depends;
                }
                // A single forward predecessor threads its state directly.
                continue;
            }

            // Loop head: merge the forward and loop-back edge groups
            // separately, then tie them with LOOP_BEGIN/LOOP_BACK.
            let mut forward_state = GateRef::NULL;
            if forward > 1 {
                let merge = builder.pending_merge(forward)?;
                let depends = builder.pending_selector(
                    MachineType::NoValue,
                    merge,
                    forward,
                    GateType::empty(),
                )?;
                self.graph[block].merge_forward = merge;
                self.graph[block].dep_forward = depends;
                forward_state = merge;
            } else if block == 0 {
                forward_state = state_entry;
            }
            let mut back_state = GateRef::NULL;
            if num_backs > 1 {
                let merge = builder.pending_merge(num_backs)?;
                let depends = builder.pending_selector(
                    MachineType::NoValue,
                    merge,
                    num_backs,
                    GateType::empty(),
                )?;
                self.graph[block].merge_loop_back = merge;
                self.graph[block].dep_loop_back = depends;
                back_state = builder.loop_end(merge)?;
            }
            let loop_begin = builder.circuit().new_gate(
                OpCode::LoopBegin,
                MachineType::NoValue,
                0,
                &[forward_state, back_state],
                GateType::empty(),
            )?;
            let mut builder = CircuitBuilder::new(&mut self.circuit);
            let head_depend = builder.pending_selector(
                MachineType::NoValue,
                loop_begin,
                2,
                GateType::empty(),
            )?;
            let dep_forward = self.graph[block].dep_forward;
            if !dep_forward.is_null() {
                self.circuit.new_in(head_depend, 1, dep_forward);
            } else if block == 0 {
                self.circuit.new_in(head_depend, 1, depend_entry);
            }
            let dep_loop_back = self.graph[block].dep_loop_back;
            if !dep_loop_back.is_null() {
                self.circuit.new_in(head_depend, 2, dep_loop_back);
            }
            self.graph[block].state_start = loop_begin;
            self.graph[block].depend_start = head_depend;
        }

        // Selectors for every phi register, operands filled after emission.
        for idx in 0..self.rpo.len() {
            let block = self.rpo[idx];
            let phis: Vec<VRegId> = self.graph[block].phi.clone();
            for vreg in phis {
                let gates = self.new_phi(block)?;
                self.graph[block].vreg_phis.insert(vreg, gates);
            }
            // A catch head with several exception edges merges the caught
            // exceptions; a single edge binds the accumulator directly.
            let needs_acc_phi = self.graph[block].phi_acc
                || (!self.graph[block].try_blocks.is_empty()
                    && self.graph[block].num_state_preds > 1);
            if needs_acc_phi {
                self.graph[block].phi_acc = true;
                self.graph[block].acc_phi = self.new_phi(block)?;
            }
        }
        Ok(())
    }

    fn new_phi(&mut self, block: usize) -> Result<PhiGates> {
        let tagged = js_machine_type();
        let region = &self.graph[block];
        let (num_preds, num_backs) = (region.num_state_preds, region.num_loop_backs);
        let forward = num_preds - num_backs;
        let state_start = region.state_start;
        let (merge_forward, merge_loop_back) = (region.merge_forward, region.merge_loop_back);
        let mut builder = CircuitBuilder::new(&mut self.circuit);
        if num_backs == 0 {
            let outer =
                builder.pending_selector(tagged, state_start, num_preds, GateType::any())?;
            return Ok(PhiGates {
                outer,
                forward: GateRef::NULL,
                back: GateRef::NULL,
            });
        }
        let outer = builder.pending_selector(tagged, state_start, 2, GateType::any())?;
        let mut gates = PhiGates {
            outer,
            forward: GateRef::NULL,
            back: GateRef::NULL,
        };
        if forward > 1 {
            let inner =
                CircuitBuilder::new(&mut self.circuit).pending_selector(tagged, merge_forward, forward, GateType::any())?;
            self.circuit.new_in(outer, 1, inner);
            gates.forward = inner;
        }
        if num_backs > 1 {
            let inner = CircuitBuilder::new(&mut self.circuit).pending_selector(
                tagged,
                merge_loop_back,
                num_backs,
                GateType::any(),
            )?;
            self.circuit.new_in(outer, 2, inner);
            gates.back = inner;
        }
        Ok(gates)
    }

    /// Registers one incoming state/depend edge of `target`.
    fn set_block_pred(
        &mut self,
        target: usize,
        state: GateRef,
        depend: GateRef,
        is_loop_back: bool,
        pred_block: usize,
        end_pc: PcIndex,
        exception: GateRef,
    ) -> Result<()> {
        let region = &self.graph[target];
        let (num_preds, num_backs) = (region.num_state_preds, region.num_loop_backs);
        let forward = num_preds - num_backs;
        let state_start = region.state_start;
        let index;
        if num_backs == 0 {
            if num_preds == 1 {
                index = 0;
                self.graph[target].state_start = state;
                self.graph[target].depend_start = depend;
            } else {
                index = self.graph[target].forward_index;
                self.graph[target].forward_index += 1;
                let depends = self.graph[target].depend_start;
                self.circuit.new_in(state_start, index, state);
                self.circuit.new_in(depends, index + 1, depend);
            }
        } else if is_loop_back {
            if num_backs == 1 {
                index = 0;
                let back = CircuitBuilder::new(&mut self.circuit).loop_end(state)?;
                self.circuit.new_in(state_start, 1, back);
                let head_depend = self.graph[target].depend_start;
                self.circuit.new_in(head_depend, 2, depend);
            } else {
                index = self.graph[target].loop_back_index;
                self.graph[target].loop_back_index += 1;
                let merge = self.graph[target].merge_loop_back;
                let depends = self.graph[target].dep_loop_back;
                self.circuit.new_in(merge, index, state);
                self.circuit.new_in(depends, index + 1, depend);
            }
        } else {
            // Forward edge into a loop head. The implicit entry edge of
            // block 0 was wired when the head was built.
            if forward == 1 {
                index = 0;
                self.circuit.new_in(state_start, 0, state);
                let head_depend = self.graph[target].depend_start;
                self.circuit.new_in(head_depend, 1, depend);
            } else {
                index = self.graph[target].forward_index;
                self.graph[target].forward_index += 1;
                let merge = self.graph[target].merge_forward;
                let depends = self.graph[target].dep_forward;
                self.circuit.new_in(merge, index, state);
                self.circuit.new_in(depends, index + 1, depend);
            }
        }
        if !exception.is_null() && num_preds == 1 {
            self.graph[target].catch_acc = exception;
        }
        self.graph[target].expanded_preds.push(ExpandedPred {
            block: pred_block,
            end_pc,
            index,
            is_loop_back,
            exception,
        });
        Ok(())
    }

    fn build_sub_circuit(&mut self) -> Result<()> {
        for idx in 0..self.rpo.len() {
            let block = self.rpo[idx];
            self.emit_block(block)?;
        }
        Ok(())
    }

    fn emit_block(&mut self, block: usize) -> Result<()> {
        let (start, end) = (self.graph[block].start, self.graph[block].end);
        let mut state = self.graph[block].state_start;
        let mut depend = self.graph[block].depend_start;
        debug_assert!(
            !state.is_null() && !depend.is_null(),
            "block {block} emitted before its predecessors"
        );
        let mut terminated = false;
        for pc in start..end {
            let bc = self.translation.bytecodes[pc];
            if bc.is_discarded() || bc.is_mov() {
                continue;
            }
            if bc.is_set_constant() {
                let gate = self.emit_constant(&bc)?;
                self.pc_to_gate.insert(pc, gate);
                self.gate_to_pc.insert(gate, pc);
                continue;
            }
            if bc.is_jump() {
                self.emit_jump(block, pc, &bc, state, depend)?;
                terminated = true;
                break;
            }
            if bc.is_return() || bc.is_throw() {
                self.emit_terminal(block, pc, &bc, state, depend)?;
                terminated = true;
                break;
            }
            let (next_state, next_depend) = self.emit_general(block, pc, &bc, state, depend)?;
            state = next_state;
            depend = next_depend;
        }
        if !terminated {
            if end >= self.translation.bytecodes.len() {
                bail!("method falls off the end of the bytecode stream");
            }
            // Fall through into the next block.
            let next = self.block_at(end);
            self.set_block_pred(next, state, depend, false, block, end, GateRef::NULL)?;
        }
        Ok(())
    }

    fn emit_constant(&mut self, bc: &Bytecode) -> Result<GateRef> {
        let tagged_type = js_machine_type();
        let (bits, gate_type) = match *bc {
            Bytecode::LdaiInt { imm } => (tagged::tag_int(imm), GateType::number()),
            Bytecode::FldaiDouble { imm } => (tagged::tag_double(imm), GateType::number()),
            Bytecode::LdNan => (tagged::tag_double(f64::NAN), GateType::number()),
            Bytecode::LdInfinity => (tagged::tag_double(f64::INFINITY), GateType::number()),
            Bytecode::LdUndefined => (tagged::VALUE_UNDEFINED, GateType::undefined()),
            Bytecode::LdNull => (tagged::VALUE_NULL, GateType::null_type()),
            Bytecode::LdTrue => (tagged::VALUE_TRUE, GateType::boolean()),
            Bytecode::LdFalse => (tagged::VALUE_FALSE, GateType::boolean()),
            Bytecode::LdHole => (tagged::VALUE_HOLE, GateType::any()),
            _ => unreachable!("not a constant bytecode"),
        };
        self.circuit.get_constant_gate(tagged_type, bits, gate_type)
    }

    fn emit_jump(
        &mut self,
        block: usize,
        pc: PcIndex,
        bc: &Bytecode,
        state: GateRef,
        depend: GateRef,
    ) -> Result<()> {
        let end = self.graph[block].end;
        let target = self.block_at(bc.jump_target(pc).expect("jump without target"));
        let target_is_back = self.graph[target].loop_back_preds.contains(&block);
        if !bc.is_cond_jump() {
            return self.set_block_pred(target, state, depend, target_is_back, block, end, GateRef::NULL);
        }
        let acc = self.rename_variable(block, pc, Reg::Acc)?;
        let mut builder = CircuitBuilder::new(&mut self.circuit);
        let false_value = builder.tagged_constant(tagged::VALUE_FALSE, GateType::boolean())?;
        let condition = match bc {
            Bytecode::Jeqz { .. } => builder.binary_logic(OpCode::Eq, acc, false_value)?,
            _ => builder.binary_logic(OpCode::Ne, acc, false_value)?,
        };
        let branch = builder.branch(state, condition)?;
        let if_true = builder.if_true(branch)?;
        let if_false = builder.if_false(branch)?;
        self.set_block_pred(target, if_true, depend, target_is_back, block, end, GateRef::NULL)?;
        let fall = self.block_at(end);
        let fall_is_back = self.graph[fall].loop_back_preds.contains(&block);
        self.set_block_pred(fall, if_false, depend, fall_is_back, block, end, GateRef::NULL)?;
        Ok(())
    }

    fn emit_terminal(
        &mut self,
        block: usize,
        pc: PcIndex,
        bc: &Bytecode,
        state: GateRef,
        depend: GateRef,
    ) -> Result<()> {
        match bc {
            Bytecode::ReturnAcc => {
                let value = self.rename_variable(block, pc, Reg::Acc)?;
                let gate =
                    CircuitBuilder::new(&mut self.circuit).return_value(state, depend, value)?;
                self.gate_to_pc.insert(gate, pc);
                self.pc_to_gate.insert(pc, gate);
            }
            Bytecode::ReturnUndefined => {
                let mut builder = CircuitBuilder::new(&mut self.circuit);
                let value = builder.undefined_constant(GateType::undefined())?;
                let gate = builder.return_value(state, depend, value)?;
                self.gate_to_pc.insert(gate, pc);
                self.pc_to_gate.insert(pc, gate);
            }
            Bytecode::ThrowAcc => {
                let value = self.rename_variable(block, pc, Reg::Acc)?;
                let gate =
                    CircuitBuilder::new(&mut self.circuit).throw_value(state, depend, value)?;
                self.gate_to_pc.insert(gate, pc);
                self.pc_to_gate.insert(pc, gate);
            }
            _ => unreachable!("not a terminal bytecode"),
        }
        Ok(())
    }

    /// Emits a general bytecode as a `JS_BYTECODE` gate with its success and
    /// exception continuations, returning the new (state, depend) pair.
    fn emit_general(
        &mut self,
        block: usize,
        pc: PcIndex,
        bc: &Bytecode,
        state: GateRef,
        mut depend: GateRef,
    ) -> Result<(GateRef, GateRef)> {
        let info = bc.info();
        let mut values = Vec::new();
        if bc.is_suspend() {
            // The resume offset is dispatched on when the generator re-enters.
            let offset =
                CircuitBuilder::new(&mut self.circuit).int64_constant(pc as i64)?;
            values.push(offset);
            for vreg in 0..self.translation.method.num_vregs {
                let value = self.rename_variable(block, pc, Reg::VReg(vreg))?;
                depend =
                    CircuitBuilder::new(&mut self.circuit).save_register(depend, value, vreg as u64)?;
            }
        }
        if bc.is_resume() {
            let mut restored = HashMap::new();
            for vreg in 0..self.translation.method.num_vregs {
                let gate =
                    CircuitBuilder::new(&mut self.circuit).restore_register(depend, vreg as u64)?;
                restored.insert(vreg, gate);
                depend = gate;
            }
            self.resume_regs.insert(pc, restored);
        }
        for vreg in info.vreg_reads() {
            values.push(self.rename_variable(block, pc, Reg::VReg(vreg))?);
        }
        if info.acc_in {
            values.push(self.rename_variable(block, pc, Reg::Acc)?);
        }

        let mut ins = vec![state, depend];
        ins.extend_from_slice(&values);
        let gate = self.circuit.new_gate(
            OpCode::JsBytecode,
            js_machine_type(),
            values.len() as u64,
            &ins,
            GateType::any(),
        )?;
        self.gate_to_pc.insert(gate, pc);
        self.pc_to_gate.insert(pc, gate);
        if bc.is_suspend() || bc.is_resume() {
            self.async_related.push(gate);
        }

        let mut builder = CircuitBuilder::new(&mut self.circuit);
        let success = builder.if_success(gate)?;
        let exception = builder.if_exception(gate)?;
        let relay = builder.depend_relay(exception, gate)?;
        let exception_object = builder.circuit().new_gate(
            OpCode::GetException,
            MachineType::I64,
            0,
            &[relay],
            GateType::any(),
        )?;
        if let Some(&catch_block) = self.graph[block].catch_targets.first() {
            self.set_block_pred(
                catch_block,
                exception,
                exception_object,
                false,
                block,
                pc,
                exception_object,
            )?;
        } else {
            // No handler in this method: rethrow out of the frame.
            CircuitBuilder::new(&mut self.circuit).throw_value(
                exception,
                exception_object,
                exception_object,
            )?;
        }
        Ok((success, gate))
    }

    // ---- variable renaming ----

    /// Walks defs backwards from `end_pc` (exclusive) through the dominator
    /// tree, reading phi selectors at block heads, down to arguments or an
    /// undefined constant at the entry.
    fn rename_variable(
        &mut self,
        mut block: usize,
        mut end_pc: PcIndex,
        mut reg: Reg,
    ) -> Result<GateRef> {
        'blocks: loop {
            let (start, end) = (self.graph[block].start, self.graph[block].end);
            let scan_end = end.min(end_pc);
            for pc in (start..scan_end).rev() {
                let bc = self.translation.bytecodes[pc];
                if !self.defines(&bc, reg) {
                    continue;
                }
                match (bc, reg) {
                    (Bytecode::Mov { src, .. }, _) => {
                        reg = Reg::VReg(src);
                    }
                    (Bytecode::Lda { src }, _) => {
                        reg = Reg::VReg(src);
                    }
                    (Bytecode::Sta { .. }, _) => {
                        reg = Reg::Acc;
                    }
                    (_, Reg::VReg(v)) if bc.is_resume() => {
                        return Ok(self.resume_regs[&pc][&v]);
                    }
                    _ => return Ok(self.pc_to_gate[&pc]),
                }
                end_pc = pc;
                continue 'blocks;
            }
            // Entry of the block: phi selectors, then the caught exception.
            match reg {
                Reg::VReg(v) => {
                    if let Some(gates) = self.graph[block].vreg_phis.get(&v) {
                        return Ok(gates.outer);
                    }
                }
                Reg::Acc => {
                    if self.graph[block].phi_acc {
                        return Ok(self.graph[block].acc_phi.outer);
                    }
                    if !self.graph[block].catch_acc.is_null() {
                        return Ok(self.graph[block].catch_acc);
                    }
                }
            }
            if block == 0 {
                return self.entry_fallback(reg);
            }
            block = self.graph[block].idom;
            end_pc = usize::MAX;
        }
    }

    fn defines(&self, bc: &Bytecode, reg: Reg) -> bool {
        let info = bc.info();
        match reg {
            Reg::Acc => info.acc_out,
            Reg::VReg(v) => {
                info.vreg_out.contains(&v)
                    || (bc.is_resume() && v < self.translation.method.num_vregs)
            }
        }
    }

    fn entry_fallback(&mut self, reg: Reg) -> Result<GateRef> {
        if let Reg::VReg(v) = reg {
            if self.translation.method.is_arg_vreg(v) {
                let accessor = ArgumentAccessor::new(&self.circuit);
                return Ok(accessor.arg_gate(&self.translation.method, v));
            }
        }
        // Uninitialized local or accumulator.
        CircuitBuilder::new(&mut self.circuit).undefined_constant(GateType::undefined())
    }

    // ---- phi operand filling ----

    fn fill_phis(&mut self) -> Result<()> {
        for idx in 0..self.rpo.len() {
            let block = self.rpo[idx];
            let vreg_phis: Vec<(VRegId, PhiGates)> = self.graph[block]
                .vreg_phis
                .iter()
                .map(|(v, g)| (*v, *g))
                .sorted_by_key(|(v, _)| *v)
                .collect();
            for (vreg, gates) in vreg_phis {
                self.fill_phi(block, Reg::VReg(vreg), gates)?;
            }
            if self.graph[block].phi_acc {
                let gates = self.graph[block].acc_phi;
                self.fill_phi(block, Reg::Acc, gates)?;
            }
        }
        Ok(())
    }

    fn fill_phi(&mut self, block: usize, reg: Reg, gates: PhiGates) -> Result<()> {
        let preds = self.graph[block].expanded_preds.clone();
        let has_backs = self.graph[block].num_loop_backs > 0;
        let implicit_entry = block == 0;
        for pred in preds {
            let value = match (reg, pred.exception) {
                (Reg::Acc, exception) if !exception.is_null() => exception,
                _ => self.rename_variable(pred.block, pred.end_pc, reg)?,
            };
            if !has_backs {
                self.circuit.new_in(gates.outer, pred.index + 1, value);
            } else if pred.is_loop_back {
                if gates.back.is_null() {
                    self.circuit.new_in(gates.outer, 2, value);
                } else {
                    self.circuit.new_in(gates.back, pred.index + 1, value);
                }
            } else if gates.forward.is_null() {
                self.circuit.new_in(gates.outer, 1, value);
            } else {
                self.circuit.new_in(gates.forward, pred.index + 1, value);
            }
        }
        if has_backs && implicit_entry && gates.forward.is_null() {
            // Entry loop head: the forward value comes from before the
            // method starts.
            let value = self.entry_fallback(reg)?;
            self.circuit.new_in(gates.outer, 1, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{MethodInfo, TryCatchRange};
    use crate::ir::verifier::Verifier;

    fn method(num_vregs: u16) -> MethodInfo {
        MethodInfo {
            num_vregs,
            num_args: 0,
            have_func: false,
            have_new_target: false,
            have_this: false,
        }
    }

    fn construct(translation: BytecodeTranslationInfo) -> BytecodeCircuitBuilder {
        let mut builder = BytecodeCircuitBuilder {
            translation,
            circuit: Circuit::new(),
            graph: Vec::new(),
            rpo: Vec::new(),
            gate_to_pc: HashMap::new(),
            pc_to_gate: HashMap::new(),
            resume_regs: HashMap::new(),
            async_related: Vec::new(),
            enable_log: false,
        };
        builder.bytecode_to_circuit().unwrap();
        builder
    }

    fn count_opcodes(circuit: &Circuit, opcode: OpCode) -> usize {
        circuit
            .all_gates()
            .iter()
            .filter(|g| circuit.opcode(**g) == opcode)
            .count()
    }

    #[test]
    fn straight_line_method() {
        use Bytecode::*;
        let translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                LdaiInt { imm: 7 },
                Sta { dst: 0 },
                Add2 { lhs: 0 },
                ReturnAcc,
            ],
        );
        let builder = construct(translation);
        Verifier::run(&builder.circuit).unwrap();
        // One general bytecode survives as a JS_BYTECODE gate.
        assert_eq!(count_opcodes(&builder.circuit, OpCode::JsBytecode), 1);
        let add = builder.pc_to_gate[&2];
        // Both value inputs resolve to the pooled constant 7.
        let seven = builder.pc_to_gate[&0];
        assert_eq!(builder.circuit.get_in(add, 2), seven);
        assert_eq!(builder.circuit.get_in(add, 3), seven);
        // Uncaught exception path: the circuit has a synthesized THROW.
        assert_eq!(count_opcodes(&builder.circuit, OpCode::Throw), 1);
        // The return consumes the add's result.
        let ret = builder.pc_to_gate[&3];
        assert_eq!(builder.circuit.opcode(ret), OpCode::Return);
        assert_eq!(builder.circuit.get_in(ret, 2), add);
    }

    #[test]
    fn diamond_join_gets_phis_for_single_arm_defs() {
        use Bytecode::*;
        // v2 is written before the branch, v0 in one arm, v1 in both arms;
        // the accumulator differs per arm as well.
        let translation = BytecodeTranslationInfo::new(
            method(3),
            vec![
                /* 0 */ LdaiInt { imm: 9 },
                /* 1 */ Sta { dst: 2 },
                /* 2 */ Jeqz { offset: 6 },
                /* 3 */ LdaiInt { imm: 2 },
                /* 4 */ Sta { dst: 0 },
                /* 5 */ LdaiInt { imm: 4 },
                /* 6 */ Sta { dst: 1 },
                /* 7 */ Jmp { offset: 4 },
                /* 8 */ LdaiInt { imm: 5 },
                /* 9 */ Sta { dst: 1 },
                /* 10 */ LdaiInt { imm: 6 },
                /* 11 */ Lda { src: 0 },
                /* 12 */ Add2 { lhs: 1 },
                /* 13 */ ReturnAcc,
            ],
        );
        let builder = construct(translation);
        Verifier::run(&builder.circuit).unwrap();
        let join = builder.block_at(11);
        let region = &builder.graph[join];
        assert_eq!(region.num_state_preds, 2);
        assert!(region.vreg_phis.contains_key(&0), "v0 written in one arm");
        assert!(region.vreg_phis.contains_key(&1), "v1 written in both arms");
        assert!(
            !region.vreg_phis.contains_key(&2),
            "v2 dominates the join and needs no phi"
        );
        assert!(region.phi_acc);
        assert_eq!(builder.circuit.opcode(region.state_start), OpCode::Merge);
        // The add reads the v1 phi and, through the move at pc 11, the v0
        // phi.
        let add = builder.pc_to_gate[&12];
        assert_eq!(builder.circuit.get_in(add, 2), region.vreg_phis[&1].outer);
        assert_eq!(builder.circuit.get_in(add, 3), region.vreg_phis[&0].outer);
    }

    #[test]
    fn countdown_loop_builds_a_loop_head() {
        use Bytecode::*;
        let translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                /* 0 */ LdaiInt { imm: 3 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ Lda { src: 0 },
                /* 3 */ Jeqz { offset: 5 },
                /* 4 */ LdaiInt { imm: 1 },
                /* 5 */ Sub2 { lhs: 0 },
                /* 6 */ Sta { dst: 0 },
                /* 7 */ Jmp { offset: -5 },
                /* 8 */ ReturnUndefined,
            ],
        );
        let builder = construct(translation);
        Verifier::run(&builder.circuit).unwrap();
        let head = builder.block_at(2);
        let region = &builder.graph[head];
        assert_eq!(region.num_state_preds, 2);
        assert_eq!(region.num_loop_backs, 1);
        assert_eq!(builder.circuit.opcode(region.state_start), OpCode::LoopBegin);
        // The loop-carried v0 merges the entry constant and the subtraction.
        let phi = region.vreg_phis[&0].outer;
        assert_eq!(builder.circuit.opcode(phi), OpCode::ValueSelector);
        assert_eq!(builder.circuit.get_in(phi, 0), region.state_start);
        let entry_value = builder.circuit.get_in(phi, 1);
        assert_eq!(builder.circuit.opcode(entry_value), OpCode::Constant);
        let back_value = builder.circuit.get_in(phi, 2);
        assert_eq!(builder.circuit.opcode(back_value), OpCode::JsBytecode);
        assert_eq!(count_opcodes(&builder.circuit, OpCode::LoopBack), 1);
    }

    #[test]
    fn try_catch_routes_the_exception_into_the_handler() {
        use Bytecode::*;
        let mut translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                /* 0 */ LdaiInt { imm: 7 },
                /* 1 */ Sta { dst: 0 },
                /* 2 */ Add2 { lhs: 0 },
                /* 3 */ ReturnAcc,
                /* 4 */ LdUndefined,
                /* 5 */ ReturnAcc,
            ],
        );
        translation.try_catch.push(TryCatchRange {
            try_start: 0,
            try_end: 3,
            catch_start: 5,
        });
        let builder = construct(translation);
        Verifier::run(&builder.circuit).unwrap();
        let catch_block = builder.block_at(5);
        let region = &builder.graph[catch_block];
        assert_eq!(region.num_state_preds, 1);
        assert_eq!(
            builder.circuit.opcode(region.state_start),
            OpCode::IfException
        );
        assert_eq!(builder.circuit.opcode(region.catch_acc), OpCode::GetException);
        // The handler returns the caught exception.
        let handler_return = builder.pc_to_gate[&5];
        assert_eq!(builder.circuit.get_in(handler_return, 2), region.catch_acc);
        // No synthesized rethrow: the only THROW-rooted gates are returns.
        assert_eq!(count_opcodes(&builder.circuit, OpCode::Throw), 0);
        // The block after the return is unreachable and emitted nothing.
        assert!(builder.graph[builder.block_at(4)].is_dead);
    }

    #[test]
    fn suspend_resume_records_async_sites() {
        use Bytecode::*;
        let translation = BytecodeTranslationInfo::new(
            method(1),
            vec![
                /* 0 */ LdUndefined,
                /* 1 */ Sta { dst: 0 },
                /* 2 */ SuspendGenerator { gen: 0, value: 0 },
                /* 3 */ ResumeGenerator { gen: 0 },
                /* 4 */ ReturnAcc,
            ],
        );
        let builder = construct(translation);
        Verifier::run(&builder.circuit).unwrap();
        assert_eq!(builder.async_related.len(), 2);
        let suspend = builder.pc_to_gate[&2];
        let resume = builder.pc_to_gate[&3];
        // The resume's state is the suspend's success continuation.
        let resume_state = builder.circuit.get_in(resume, 0);
        assert_eq!(builder.circuit.opcode(resume_state), OpCode::IfSuccess);
        assert_eq!(builder.circuit.get_in(resume_state, 0), suspend);
        // Registers are restored on the depend path before the resume.
        let resume_depend = builder.circuit.get_in(resume, 1);
        assert_eq!(
            builder.circuit.opcode(resume_depend),
            OpCode::RestoreRegister
        );
        // The suspend's first value input is its own bytecode offset.
        let offset = builder.circuit.get_in(suspend, 2);
        assert_eq!(builder.circuit.opcode(offset), OpCode::Constant);
        assert_eq!(builder.circuit.bit_field(offset), 2);
        assert_eq!(count_opcodes(&builder.circuit, OpCode::SaveRegister), 1);
    }
}
