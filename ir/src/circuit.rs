use anyhow::{bail, Result};
use hashbrown::HashMap;

use crate::gate::{
    gate_size, GateId, GateRef, MarkCode, HDR_BITFIELD, HDR_FIRST_OUT, HDR_GATE_TYPE, HDR_ID,
    HDR_MACHINE_TYPE, HDR_MARK, HDR_OPCODE, HDR_STAMP, HEADER_BYTES, IN_BYTES, NULL_OFFSET,
    OUT_BYTES, OUT_INDEX, OUT_NEXT, OUT_PREV,
};
use crate::gate_type::GateType;
use crate::machine::MachineType;
use crate::opcode::OpCode;

/// Initial arena size in bytes; grows by doubling.
pub const INITIAL_SPACE: usize = 1;
/// Default upper bound of the arena. Exceeding the bound aborts the
/// compilation of the current method.
pub const MAX_SPACE: usize = 1 << 24;
/// Growth factor of the arena.
pub const SCALE_RATE: usize = 2;

pub type TimeStamp = u8;

/// The opcodes of the fixed root prelude, in allocation order.
const ROOT_OPCODES: [OpCode; 9] = [
    OpCode::CircuitRoot,
    OpCode::StateEntry,
    OpCode::DependEntry,
    OpCode::FrameStateEntry,
    OpCode::ReturnList,
    OpCode::ThrowList,
    OpCode::ConstantList,
    OpCode::AllocaList,
    OpCode::ArgList,
];

/// A process-local arena exclusively owning all gates of one compilation.
///
/// Gates are addressed by [`GateRef`] byte offsets; any raw view into the
/// arena is invalidated by the next allocation, so nothing hands out
/// references that outlive a call. Distinct circuits never share gates.
///
/// The circuit is created with a fixed prelude of nine root sentinels
/// (`CIRCUIT_ROOT`, the state/depend/framestate entries and the
/// return/throw/constant/alloca/arg lists) at offsets derivable from the
/// record sizes alone; see [`Circuit::get_circuit_root`].
#[derive(Clone, Debug)]
pub struct Circuit {
    space: Vec<u8>,
    circuit_size: usize,
    gate_counter: GateId,
    time: TimeStamp,
    max_space: usize,
    gate_offsets: Vec<GateRef>,
    constant_pool: HashMap<(MachineType, u64, GateType), GateRef>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    pub fn new() -> Self {
        Self::with_max_size(MAX_SPACE)
    }

    /// Creates a circuit whose arena may not grow beyond `max_space` bytes.
    /// `max_space` should be a power of two and must fit the root prelude.
    pub fn with_max_size(max_space: usize) -> Self {
        let prelude: usize = gate_size(0) + 8 * gate_size(1);
        assert!(
            max_space >= prelude,
            "arena maximum {max_space} cannot hold the {prelude}-byte root prelude"
        );
        let mut circuit = Circuit {
            space: Vec::new(),
            circuit_size: 0,
            gate_counter: 0,
            time: 1,
            max_space,
            gate_offsets: Vec::new(),
            constant_pool: HashMap::new(),
        };
        let root = Self::get_circuit_root(OpCode::CircuitRoot);
        for (nth, opcode) in ROOT_OPCODES.iter().enumerate() {
            let ins: &[GateRef] = if nth == 0 { &[] } else { &[root] };
            let gate = circuit
                .new_gate(*opcode, MachineType::NoValue, 0, ins, GateType::empty())
                .expect("root prelude fits the asserted arena maximum");
            debug_assert_eq!(gate, Self::get_circuit_root(*opcode));
        }
        circuit
    }

    /// The "no gate" sentinel.
    pub const fn null_gate() -> GateRef {
        GateRef::NULL
    }

    /// Offset of one of the nine root sentinels. The prelude is installed at
    /// construction, so the offsets only depend on the record sizes: the
    /// n-th root is preceded by n headers, n out records and n - 1 in slots.
    pub fn get_circuit_root(opcode: OpCode) -> GateRef {
        let nth = |n: u32| {
            GateRef(HEADER_BYTES * n + OUT_BYTES * n + IN_BYTES * n.saturating_sub(1))
        };
        match opcode {
            OpCode::CircuitRoot => nth(0),
            OpCode::StateEntry => nth(1),
            OpCode::DependEntry => nth(2),
            OpCode::FrameStateEntry => nth(3),
            OpCode::ReturnList => nth(4),
            OpCode::ThrowList => nth(5),
            OpCode::ConstantList => nth(6),
            OpCode::AllocaList => nth(7),
            OpCode::ArgList => nth(8),
            _ => panic!("{opcode} is not a root opcode"),
        }
    }

    // ---- allocation ----

    fn allocate_space(&mut self, bytes: usize) -> Result<u32> {
        let start = self.circuit_size;
        self.circuit_size += bytes;
        if self.space.is_empty() {
            self.space.resize(INITIAL_SPACE, 0);
        }
        while self.space.len() < self.circuit_size {
            let grown = self.space.len() * SCALE_RATE;
            self.space.resize(grown, 0);
        }
        if self.space.len() > self.max_space {
            bail!(
                "circuit arena exhausted: {} bytes requested, maximum is {}",
                self.circuit_size,
                self.max_space
            );
        }
        Ok(start as u32)
    }

    /// Allocates and wires a new gate.
    ///
    /// `ins.len()` must equal the arity derived from `opcode` and
    /// `bitfield`; a null entry leaves the slot as a hole. The only runtime
    /// error is arena exhaustion, which aborts the compilation.
    pub fn new_gate(
        &mut self,
        opcode: OpCode,
        machine_type: MachineType,
        bitfield: u64,
        ins: &[GateRef],
        gate_type: GateType,
    ) -> Result<GateRef> {
        let num_ins = opcode.num_ins(bitfield);
        debug_assert_eq!(
            ins.len(),
            num_ins,
            "invalid in-list for {opcode} (bitfield={bitfield}): expected {num_ins} inputs, got {}",
            ins.len()
        );
        debug_assert!(
            opcode.machine_type() == MachineType::Flex || opcode.machine_type() == machine_type,
            "{opcode} produces {} but was given {machine_type}",
            opcode.machine_type()
        );
        let alloc = self.allocate_space(gate_size(num_ins))?;
        let gate = GateRef(alloc + OUT_BYTES * num_ins as u32);

        self.write_u32(gate.0 + HDR_ID, self.gate_counter);
        self.write_u8(gate.0 + HDR_OPCODE, opcode.to_u8());
        self.write_u8(gate.0 + HDR_MACHINE_TYPE, machine_type.to_u8());
        self.write_u8(gate.0 + HDR_STAMP, self.time);
        self.write_u8(gate.0 + HDR_MARK, MarkCode::Empty as u8);
        self.write_u32(gate.0 + HDR_GATE_TYPE, gate_type.to_u32());
        self.write_u32(gate.0 + HDR_FIRST_OUT, NULL_OFFSET);
        self.write_u64(gate.0 + HDR_BITFIELD, bitfield);

        for idx in 0..num_ins {
            let out = Self::out_offset(gate, idx);
            self.write_u32(out + OUT_INDEX, idx as u32);
            self.write_u32(out + OUT_NEXT, NULL_OFFSET);
            self.write_u32(out + OUT_PREV, NULL_OFFSET);
            self.write_u32(Self::in_offset(gate, idx), NULL_OFFSET);
        }
        for (idx, &input) in ins.iter().enumerate() {
            if !input.is_null() {
                self.link_in(gate, idx, input);
            }
        }

        self.gate_counter += 1;
        self.gate_offsets.push(gate);
        Ok(gate)
    }

    /// Returns the pooled constant gate for `(machine_type, bitfield,
    /// gate_type)`, allocating it on first use.
    pub fn get_constant_gate(
        &mut self,
        machine_type: MachineType,
        bitfield: u64,
        gate_type: GateType,
    ) -> Result<GateRef> {
        if let Some(&gate) = self.constant_pool.get(&(machine_type, bitfield, gate_type)) {
            return Ok(gate);
        }
        let constant_list = Self::get_circuit_root(OpCode::ConstantList);
        let gate = self.new_gate(
            OpCode::Constant,
            machine_type,
            bitfield,
            &[constant_list],
            gate_type,
        )?;
        self.constant_pool
            .insert((machine_type, bitfield, gate_type), gate);
        Ok(gate)
    }

    // ---- structural queries ----

    pub fn opcode(&self, gate: GateRef) -> OpCode {
        OpCode::from_u8(self.read_u8(gate.0 + HDR_OPCODE))
    }

    pub fn set_opcode(&mut self, gate: GateRef, opcode: OpCode) {
        self.write_u8(gate.0 + HDR_OPCODE, opcode.to_u8());
    }

    pub fn machine_type(&self, gate: GateRef) -> MachineType {
        MachineType::from_u8(self.read_u8(gate.0 + HDR_MACHINE_TYPE))
    }

    pub fn set_machine_type(&mut self, gate: GateRef, machine_type: MachineType) {
        self.write_u8(gate.0 + HDR_MACHINE_TYPE, machine_type.to_u8());
    }

    pub fn gate_type(&self, gate: GateRef) -> GateType {
        GateType::from_u32(self.read_u32(gate.0 + HDR_GATE_TYPE))
    }

    pub fn set_gate_type(&mut self, gate: GateRef, gate_type: GateType) {
        self.write_u32(gate.0 + HDR_GATE_TYPE, gate_type.to_u32());
    }

    pub fn bit_field(&self, gate: GateRef) -> u64 {
        self.read_u64(gate.0 + HDR_BITFIELD)
    }

    pub fn set_bit_field(&mut self, gate: GateRef, bitfield: u64) {
        self.write_u64(gate.0 + HDR_BITFIELD, bitfield);
    }

    pub fn id(&self, gate: GateRef) -> GateId {
        self.read_u32(gate.0 + HDR_ID)
    }

    pub fn num_ins(&self, gate: GateRef) -> usize {
        self.opcode(gate).num_ins(self.bit_field(gate))
    }

    pub fn state_count(&self, gate: GateRef) -> usize {
        self.opcode(gate).state_count(self.bit_field(gate))
    }

    pub fn depend_count(&self, gate: GateRef) -> usize {
        self.opcode(gate).depend_count(self.bit_field(gate))
    }

    pub fn value_count(&self, gate: GateRef) -> usize {
        self.opcode(gate).value_count(self.bit_field(gate))
    }

    /// The gate in slot `idx`, which may be [`GateRef::NULL`] for a hole.
    pub fn get_in(&self, gate: GateRef, idx: usize) -> GateRef {
        debug_assert!(idx < self.num_ins(gate), "in-slot {idx} out of bounds");
        GateRef(self.read_u32(Self::in_offset(gate, idx)))
    }

    pub fn is_in_null(&self, gate: GateRef, idx: usize) -> bool {
        self.get_in(gate, idx).is_null()
    }

    /// The full in-list, holes included.
    pub fn ins(&self, gate: GateRef) -> Vec<GateRef> {
        (0..self.num_ins(gate)).map(|i| self.get_in(gate, i)).collect()
    }

    pub fn has_uses(&self, gate: GateRef) -> bool {
        self.read_u32(gate.0 + HDR_FIRST_OUT) != NULL_OFFSET
    }

    /// All users of `gate`, most recently wired first. A gate using `gate`
    /// in k slots appears k times.
    pub fn outs(&self, gate: GateRef) -> Vec<GateRef> {
        let mut result = Vec::new();
        let mut out = self.read_u32(gate.0 + HDR_FIRST_OUT);
        while out != NULL_OFFSET {
            result.push(self.user_of_out(out));
            out = self.read_u32(out + OUT_NEXT);
        }
        result
    }

    /// First use edge of `gate` as `(user, in_index)`, if any.
    pub fn first_use(&self, gate: GateRef) -> Option<(GateRef, usize)> {
        let out = self.read_u32(gate.0 + HDR_FIRST_OUT);
        (out != NULL_OFFSET)
            .then(|| (self.user_of_out(out), self.read_u32(out + OUT_INDEX) as usize))
    }

    /// Every gate ever allocated, in allocation order. Deleted gates remain
    /// in the list as `NOP`s.
    pub fn all_gates(&self) -> Vec<GateRef> {
        self.gate_offsets.clone()
    }

    pub fn gate_count(&self) -> u32 {
        self.gate_counter
    }

    pub fn circuit_size(&self) -> usize {
        self.circuit_size
    }

    // ---- mutation ----

    /// Fills the currently-null slot `idx` with `input`.
    pub fn new_in(&mut self, gate: GateRef, idx: usize, input: GateRef) {
        debug_assert!(idx < self.num_ins(gate));
        debug_assert!(
            self.is_in_null(gate, idx),
            "new_in into occupied slot {idx} of gate {}",
            self.id(gate)
        );
        self.link_in(gate, idx, input);
    }

    /// Retargets the currently-occupied slot `idx` to `input`.
    pub fn modify_in(&mut self, gate: GateRef, idx: usize, input: GateRef) {
        debug_assert!(idx < self.num_ins(gate));
        debug_assert!(
            !self.is_in_null(gate, idx),
            "modify_in into empty slot {idx} of gate {}",
            self.id(gate)
        );
        self.unlink_in(gate, idx);
        self.link_in(gate, idx, input);
    }

    /// Detaches slot `idx`, leaving a hole.
    pub fn delete_in(&mut self, gate: GateRef, idx: usize) {
        debug_assert!(idx < self.num_ins(gate));
        debug_assert!(
            !self.is_in_null(gate, idx),
            "delete_in on empty slot {idx} of gate {}",
            self.id(gate)
        );
        self.unlink_in(gate, idx);
    }

    /// Retires a gate: detaches every in-edge and turns the opcode into
    /// `NOP`. The storage stays in the arena; reclamation is arena-wide.
    pub fn delete_gate(&mut self, gate: GateRef) {
        for idx in 0..self.num_ins(gate) {
            if !self.is_in_null(gate, idx) {
                self.unlink_in(gate, idx);
            }
        }
        self.set_opcode(gate, OpCode::Nop);
    }

    // ---- marks ----

    /// Invalidates every gate's stored mark in O(1) by advancing the
    /// circuit's timestamp.
    pub fn advance_time(&mut self) {
        self.time = self.time.wrapping_add(1);
        if self.time == 0 {
            // Stamp wrap-around: physically reset so stale marks from 255
            // timestamps ago cannot alias.
            self.time = 1;
            for gate in self.gate_offsets.clone() {
                self.write_u8(gate.0 + HDR_STAMP, 0);
                self.write_u8(gate.0 + HDR_MARK, MarkCode::Empty as u8);
            }
        }
    }

    pub fn time(&self) -> TimeStamp {
        self.time
    }

    pub fn mark(&self, gate: GateRef) -> MarkCode {
        if self.read_u8(gate.0 + HDR_STAMP) == self.time {
            MarkCode::from_u8(self.read_u8(gate.0 + HDR_MARK))
        } else {
            MarkCode::Empty
        }
    }

    pub fn set_mark(&mut self, gate: GateRef, mark: MarkCode) {
        self.write_u8(gate.0 + HDR_STAMP, self.time);
        self.write_u8(gate.0 + HDR_MARK, mark as u8);
    }

    // ---- convenience predicates over nullable refs ----

    pub fn is_loop_head(&self, gate: GateRef) -> bool {
        !gate.is_null() && self.opcode(gate).is_loop_head()
    }

    pub fn is_selector(&self, gate: GateRef) -> bool {
        !gate.is_null()
            && matches!(
                self.opcode(gate),
                OpCode::ValueSelector | OpCode::DependSelector
            )
    }

    pub fn is_control_case(&self, gate: GateRef) -> bool {
        !gate.is_null() && self.opcode(gate).is_control_case()
    }

    // ---- intrusive edge bookkeeping ----

    pub(crate) const fn out_offset(gate: GateRef, idx: usize) -> u32 {
        gate.0 - OUT_BYTES * (idx as u32 + 1)
    }

    pub(crate) const fn in_offset(gate: GateRef, idx: usize) -> u32 {
        gate.0 + HEADER_BYTES + IN_BYTES * idx as u32
    }

    /// The gate whose in-list owns the out record at `out`: record i sits
    /// i + 1 records before its owner's header.
    pub(crate) fn user_of_out(&self, out: u32) -> GateRef {
        let idx = self.read_u32(out + OUT_INDEX);
        GateRef(out + OUT_BYTES * (idx + 1))
    }

    pub(crate) fn next_out(&self, out: u32) -> u32 {
        self.read_u32(out + OUT_NEXT)
    }

    pub(crate) fn first_out(&self, gate: GateRef) -> u32 {
        self.read_u32(gate.0 + HDR_FIRST_OUT)
    }

    fn link_in(&mut self, gate: GateRef, idx: usize, input: GateRef) {
        self.write_u32(Self::in_offset(gate, idx), input.0);
        let record = Self::out_offset(gate, idx);
        let head = self.first_out(input);
        if head == NULL_OFFSET {
            self.write_u32(record + OUT_NEXT, NULL_OFFSET);
        } else {
            self.write_u32(record + OUT_NEXT, head);
            self.write_u32(head + OUT_PREV, record);
        }
        self.write_u32(record + OUT_PREV, NULL_OFFSET);
        self.write_u32(input.0 + HDR_FIRST_OUT, record);
    }

    fn unlink_in(&mut self, gate: GateRef, idx: usize) {
        let record = Self::out_offset(gate, idx);
        let next = self.read_u32(record + OUT_NEXT);
        let prev = self.read_u32(record + OUT_PREV);
        let producer = GateRef(self.read_u32(Self::in_offset(gate, idx)));
        match (prev != NULL_OFFSET, next != NULL_OFFSET) {
            (true, true) => {
                self.write_u32(prev + OUT_NEXT, next);
                self.write_u32(next + OUT_PREV, prev);
            }
            (true, false) => self.write_u32(prev + OUT_NEXT, NULL_OFFSET),
            (false, true) => {
                self.write_u32(producer.0 + HDR_FIRST_OUT, next);
                self.write_u32(next + OUT_PREV, NULL_OFFSET);
            }
            (false, false) => self.write_u32(producer.0 + HDR_FIRST_OUT, NULL_OFFSET),
        }
        self.write_u32(Self::in_offset(gate, idx), NULL_OFFSET);
        self.write_u32(record + OUT_NEXT, NULL_OFFSET);
        self.write_u32(record + OUT_PREV, NULL_OFFSET);
    }

    // ---- raw arena access ----

    fn read_u8(&self, offset: u32) -> u8 {
        self.space[offset as usize]
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        self.space[offset as usize] = value;
    }

    pub(crate) fn read_u32(&self, offset: u32) -> u32 {
        let offset = offset as usize;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.space[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub(crate) fn write_u32(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        self.space[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: u32) -> u64 {
        let offset = offset as usize;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.space[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, offset: u32, value: u64) {
        let offset = offset as usize;
        self.space[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}
