// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The per-function compiler: walks a validated opcode stream, simulates the
//! operand stack, lowers structured control flow to labels and branches, and
//! appends IR operations to the function's result. Dead code behind
//! stack-polymorphic instructions is suppressed rather than translated.

use crate::frame::{ControlFrame, ControlFrameKind, ControlFrames};
use crate::module::{FuncType, LEB128Reader, Module, ReferenceType};
use crate::op::{
    BranchTarget, Float, InclusiveRange, Label, LabelKind, MemArg, Operation, SignedInt,
    SignedType, UnsignedInt,
};
use crate::opcode::{MiscOpCode, OpCode, VecOpCode};
use crate::sig::{self, OpSignature};
use crate::stack::ValueStack;
use crate::{Features, ValueKind};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A byte that decodes to no opcode, or a feature-gated opcode with the
    /// feature disabled. Prefixed opcodes are encoded `prefix << 16 | sub`.
    UnsupportedOpcode(u32, String),
    ImmediateDecode(String),
    /// An index immediate exceeds the module's declared counts; the first
    /// field names the index space.
    IndexOutOfRange(&'static str, u32),
    /// A popped operand disagrees with the opcode's declared input. `None`
    /// means the stack was empty. Unreachable for validated modules.
    SignatureMismatch(ValueKind, Option<ValueKind>),
    /// A polymorphic type parameter could not be resolved against the stack.
    UnknownTypeInference(String),
    InternalInvariantViolation(String),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsupportedOpcode(opcode, reason) => {
                write!(f, "Unsupported opcode {opcode:#x}: {reason}")
            }
            CompileError::ImmediateDecode(reason) => {
                write!(f, "Failed to decode immediate: {reason}")
            }
            CompileError::IndexOutOfRange(space, index) => {
                write!(f, "{space} index {index} out of range")
            }
            CompileError::SignatureMismatch(expected, actual) => match actual {
                Some(actual) => write!(f, "Expected {expected} on the stack, found {actual}"),
                None => write!(f, "Expected {expected} on the stack, found it empty"),
            },
            CompileError::UnknownTypeInference(reason) => {
                write!(f, "Cannot infer polymorphic type: {reason}")
            }
            CompileError::InternalInvariantViolation(reason) => {
                write!(f, "Internal invariant violation: {reason}")
            }
        }
    }
}

impl Error for CompileError {}

/// A `CompileError` tagged with the function it occurred in and the byte
/// offset into that function's body.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCompileError {
    pub function_index: u32,
    pub offset: usize,
    pub error: CompileError,
}

impl Display for ModuleCompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "function {} at body offset {}: {}",
            self.function_index, self.offset, self.error
        )
    }
}

impl Error for ModuleCompileError {}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Instrument every loop back-edge with an engine-owned poll point so a
    /// runaway function can be cancelled.
    pub ensure_termination: bool,
    /// Width, in 64-bit slots, of the call-frame save area the execution
    /// engine keeps between a frame's parameters and its declared locals.
    /// Only the local-index-to-slot mapping depends on it.
    pub call_frame_slots: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            ensure_termination: false,
            call_frame_slots: 0,
        }
    }
}

/// Everything the execution engine needs to run one function: the lowered
/// operation stream, the caller count of every branch-target label, and the
/// module-level context the body references.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationResult {
    pub operations: Vec<Operation>,
    pub label_callers: HashMap<Label, u32>,
    pub signature: FuncType,
    pub types: Vec<FuncType>,
    pub functions: Vec<u32>,
    pub table_types: Vec<ReferenceType>,
    pub has_memory: bool,
    pub uses_memory: bool,
    pub has_table: bool,
    pub has_data_instances: bool,
}

/// Compile every defined function of the module, in code-section order.
pub fn compile_module(
    module: &Module,
    options: &CompileOptions,
) -> Result<Vec<CompilationResult>, ModuleCompileError> {
    (0..module.code.len())
        .map(|code_index| compile_code_entry(module, code_index, options))
        .collect()
}

/// Compile a single function, addressed in the combined function index
/// space. Imported functions have no body and cannot be compiled.
pub fn compile_function(
    module: &Module,
    function_index: u32,
    options: &CompileOptions,
) -> Result<CompilationResult, ModuleCompileError> {
    let code_index = (function_index as usize)
        .checked_sub(module.imported_function_count as usize)
        .filter(|index| *index < module.code.len())
        .ok_or(ModuleCompileError {
            function_index,
            offset: 0,
            error: CompileError::IndexOutOfRange("code", function_index),
        })?;
    compile_code_entry(module, code_index, options)
}

fn compile_code_entry(
    module: &Module,
    code_index: usize,
    options: &CompileOptions,
) -> Result<CompilationResult, ModuleCompileError> {
    let function_index = module.imported_function_count + code_index as u32;
    let mut compiler =
        FunctionCompiler::new(module, code_index, options).map_err(|error| ModuleCompileError {
            function_index,
            offset: 0,
            error,
        })?;
    match compiler.run() {
        Ok(()) => Ok(compiler.finish()),
        Err(error) => Err(ModuleCompileError {
            function_index,
            offset: compiler.op_offset,
            error,
        }),
    }
}

pub(crate) struct FunctionCompiler<'a> {
    pub(crate) module: &'a Module,
    options: &'a CompileOptions,
    pub(crate) reader: LEB128Reader<'a>,
    pub(crate) stack: ValueStack,
    frames: ControlFrames,
    operations: Vec<Operation>,
    label_callers: HashMap<Label, u32>,
    signature: FuncType,
    pub(crate) local_kinds: Vec<ValueKind>,
    /// Low-slot offset of each local in the runtime frame layout.
    local_offsets: Vec<u32>,
    current_frame_id: u32,
    pub(crate) unreachable: bool,
    unreachable_depth: u32,
    pub(crate) uses_memory: bool,
    /// Body offset of the opcode currently being translated, for error
    /// reporting.
    op_offset: usize,
}

impl<'a> FunctionCompiler<'a> {
    fn new(
        module: &'a Module,
        code_index: usize,
        options: &'a CompileOptions,
    ) -> Result<Self, CompileError> {
        let function_index = module.imported_function_count + code_index as u32;
        let signature = module
            .type_of_function(function_index)
            .ok_or(CompileError::IndexOutOfRange("function", function_index))?
            .clone();
        let code = &module.code[code_index];

        let mut local_kinds = signature.params.clone();
        local_kinds.extend_from_slice(&code.local_kinds);

        // Parameters sit at the bottom of the frame; declared locals start
        // past the call-frame save area.
        let mut local_offsets = Vec::with_capacity(local_kinds.len());
        let mut offset = 0u32;
        for kind in &signature.params {
            local_offsets.push(offset);
            offset += kind.slot_width() as u32;
        }
        offset += options.call_frame_slots;
        for kind in &code.local_kinds {
            local_offsets.push(offset);
            offset += kind.slot_width() as u32;
        }

        let mut compiler = FunctionCompiler {
            module,
            options,
            reader: LEB128Reader::new(module.code_body(code_index), 0),
            stack: ValueStack::new(),
            frames: ControlFrames::new(),
            operations: vec![],
            label_callers: HashMap::new(),
            signature,
            local_kinds,
            local_offsets,
            current_frame_id: 0,
            unreachable: false,
            unreachable_depth: 0,
            uses_memory: false,
            op_offset: 0,
        };

        for kind in compiler.signature.params.clone() {
            compiler.stack.push(kind);
        }
        // Declared locals start life as zero; a v128 local is one constant
        // but two slots.
        for kind in compiler.module.code[code_index].local_kinds.clone() {
            let zero = match kind {
                ValueKind::I32 => Operation::ConstI32(0),
                ValueKind::I64 => Operation::ConstI64(0),
                ValueKind::F32 => Operation::ConstF32(0.0),
                ValueKind::F64 => Operation::ConstF64(0.0),
                ValueKind::V128 => Operation::ConstV128 { lo: 0, hi: 0 },
                ValueKind::Unknown => {
                    return Err(CompileError::InternalInvariantViolation(
                        "local declared with unknown kind".to_string(),
                    ))
                }
            };
            compiler.emit(zero);
            compiler.stack.push(kind);
        }

        let frame_id = compiler.next_frame_id();
        compiler.frames.push(ControlFrame {
            frame_id,
            entry_len: compiler.signature.params.len(),
            entry_slots: compiler.signature.param_slots as usize,
            params: compiler.signature.params.clone(),
            results: compiler.signature.results.clone(),
            kind: ControlFrameKind::Function,
        });

        Ok(compiler)
    }

    fn run(&mut self) -> Result<(), CompileError> {
        while !self.frames.is_empty() {
            if self.reader.remaining() <= 0 {
                return Err(CompileError::ImmediateDecode(
                    "body ended with open control frames".to_string(),
                ));
            }
            self.op_offset = self.reader.position();
            let byte = self.reader.load_imm_u8()?;
            let op = OpCode::from_repr(byte).ok_or_else(|| {
                CompileError::UnsupportedOpcode(byte as u32, "unknown opcode".to_string())
            })?;
            match op {
                OpCode::MiscPrefix => {
                    let sub = self.reader.load_imm_varuint32()?;
                    let misc = MiscOpCode::from_repr(sub).ok_or_else(|| {
                        CompileError::UnsupportedOpcode(
                            0xFC_0000 | sub,
                            "unknown 0xFC sub-opcode".to_string(),
                        )
                    })?;
                    self.op_misc(misc)?;
                }
                OpCode::VecPrefix => {
                    let sub = self.reader.load_imm_varuint32()?;
                    let vec = VecOpCode::from_repr(sub).ok_or_else(|| {
                        CompileError::UnsupportedOpcode(
                            0xFD_0000 | sub,
                            "unknown 0xFD sub-opcode".to_string(),
                        )
                    })?;
                    self.op_vec(vec)?;
                }
                _ => {
                    if self.unreachable {
                        self.skip_core(op)?;
                    } else {
                        self.op_core(op)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> CompilationResult {
        CompilationResult {
            operations: self.operations,
            label_callers: self.label_callers,
            signature: self.signature,
            types: self.module.types.clone(),
            functions: self.module.functions.clone(),
            table_types: self.module.tables.iter().map(|t| t.element).collect(),
            has_memory: self.module.memory.is_some(),
            uses_memory: self.uses_memory,
            has_table: !self.module.tables.is_empty(),
            has_data_instances: self.module.data_instance_count() > 0,
        }
    }

    fn next_frame_id(&mut self) -> u32 {
        self.current_frame_id += 1;
        self.current_frame_id
    }

    /// Append an operation, unless emission is suppressed. Branch targets
    /// are counted into `label_callers` as they are emitted; the return
    /// label is engine-owned and never counted.
    pub(crate) fn emit(&mut self, op: Operation) {
        if self.unreachable {
            return;
        }
        match &op {
            Operation::Br(label) => self.bump_label_callers(*label),
            Operation::BrIf {
                then_target,
                else_target,
            } => {
                self.bump_label_callers(then_target.label);
                self.bump_label_callers(else_target.label);
            }
            Operation::BrTable { targets, default } => {
                for label in targets
                    .iter()
                    .chain(std::iter::once(default))
                    .map(|target| target.label)
                    .collect::<Vec<_>>()
                {
                    self.bump_label_callers(label);
                }
            }
            _ => {}
        }
        self.operations.push(op);
    }

    fn bump_label_callers(&mut self, label: Label) {
        if label.kind() == LabelKind::Return {
            return;
        }
        *self.label_callers.entry(label).or_insert(0) += 1;
    }

    /// A drop with no range is nothing to do and is elided.
    fn emit_drop(&mut self, range: Option<InclusiveRange>) {
        if let Some(range) = range {
            self.emit(Operation::Drop(range));
        }
    }

    /// Run an opcode's signature against the abstract stack, unifying
    /// `Unknown` entries with what the stack holds. Returns the popped
    /// kinds, top first.
    pub(crate) fn apply(&mut self, sig: &OpSignature) -> Result<Vec<ValueKind>, CompileError> {
        if self.unreachable {
            return Ok(vec![]);
        }
        let mut resolved: Option<ValueKind> = None;
        let mut popped = Vec::with_capacity(sig.inputs.len());
        for want in sig.inputs.iter().rev() {
            let actual = match self.stack.pop() {
                Some(kind) => kind,
                None => {
                    return Err(match want {
                        ValueKind::Unknown => CompileError::UnknownTypeInference(
                            "empty stack while resolving a polymorphic operand".to_string(),
                        ),
                        concrete => CompileError::SignatureMismatch(*concrete, None),
                    })
                }
            };
            match want {
                ValueKind::Unknown => {
                    if resolved.is_none() && actual != ValueKind::Unknown {
                        resolved = Some(actual);
                    }
                }
                concrete => {
                    if actual != *concrete && actual != ValueKind::Unknown {
                        return Err(CompileError::SignatureMismatch(*concrete, Some(actual)));
                    }
                }
            }
            popped.push(actual);
        }
        for output in sig.outputs.iter() {
            let kind = match output {
                ValueKind::Unknown => resolved.ok_or_else(|| {
                    CompileError::UnknownTypeInference(
                        "no concrete kind available for a polymorphic result".to_string(),
                    )
                })?,
                concrete => *concrete,
            };
            self.stack.push(kind);
        }
        Ok(popped)
    }

    fn set_unreachable(&mut self) {
        self.unreachable = true;
        self.unreachable_depth = 0;
    }

    pub(crate) fn require_feature(
        &self,
        feature: Features,
        name: &str,
        opcode: u32,
    ) -> Result<(), CompileError> {
        if self.module.features.contains(feature) {
            return Ok(());
        }
        Err(CompileError::UnsupportedOpcode(
            opcode,
            format!("requires the {name} feature"),
        ))
    }

    /// Decode a block-type immediate: a negative s33 encodes an inline
    /// (possibly empty) result, a non-negative one references the type
    /// section and needs the multi-value feature.
    fn read_block_type(&mut self) -> Result<FuncType, CompileError> {
        let encoded = self.reader.load_imm_varint33()?;
        if encoded < 0 {
            let results = match encoded {
                -64 => vec![],
                -1 => vec![ValueKind::I32],
                -2 => vec![ValueKind::I64],
                -3 => vec![ValueKind::F32],
                -4 => vec![ValueKind::F64],
                -5 => vec![ValueKind::V128],
                -16 | -17 => vec![ValueKind::I64],
                other => {
                    return Err(CompileError::ImmediateDecode(format!(
                        "invalid block type {other}"
                    )))
                }
            };
            return Ok(FuncType::new(vec![], results));
        }
        self.require_feature(
            Features::MULTI_VALUE,
            "multi-value",
            OpCode::Block as u32,
        )?;
        self.module
            .types
            .get(encoded as usize)
            .cloned()
            .ok_or(CompileError::IndexOutOfRange("type", encoded as u32))
    }

    pub(crate) fn mem_arg(&mut self) -> Result<MemArg, CompileError> {
        let align = self.reader.load_imm_varuint32()?;
        let offset = self.reader.load_imm_varuint32()?;
        Ok(MemArg { align, offset })
    }

    fn core_signature(&self, op: OpCode, index: u32) -> Result<OpSignature, CompileError> {
        sig::signature_of(self.module, &self.local_kinds, op, index)
    }

    /// Static-signature opcode with a 1:1 operation mapping.
    fn simple(&mut self, op: OpCode, out: Operation) -> Result<(), CompileError> {
        let sig = self.core_signature(op, 0)?;
        self.apply(&sig)?;
        self.emit(out);
        Ok(())
    }

    fn local_info(&self, index: u32) -> Result<(u32, ValueKind), CompileError> {
        let kind = self
            .local_kinds
            .get(index as usize)
            .copied()
            .ok_or(CompileError::IndexOutOfRange("local", index))?;
        Ok((self.local_offsets[index as usize], kind))
    }

    /// Slot distance from the top of the runtime stack to the low slot of a
    /// local, for a stack whose abstract height (before the current
    /// opcode's effect) is `slots_before`.
    fn local_depth(&self, slots_before: usize, offset: u32) -> Result<u32, CompileError> {
        (slots_before as u32 + self.options.call_frame_slots)
            .checked_sub(1 + offset)
            .ok_or_else(|| {
                CompileError::InternalInvariantViolation(
                    "operand stack shrank below the frame's locals".to_string(),
                )
            })
    }

    fn push_control_frame(
        &mut self,
        block_type: FuncType,
        kind: ControlFrameKind,
    ) -> Result<u32, CompileError> {
        let entry_len = self
            .stack
            .len()
            .checked_sub(block_type.params.len())
            .ok_or_else(|| {
                CompileError::SignatureMismatch(
                    *block_type.params.first().unwrap_or(&ValueKind::Unknown),
                    None,
                )
            })?;
        let entry_slots = self
            .stack
            .slot_height()
            .checked_sub(block_type.param_slots as usize)
            .ok_or_else(|| {
                CompileError::SignatureMismatch(
                    *block_type.params.first().unwrap_or(&ValueKind::Unknown),
                    None,
                )
            })?;
        let frame_id = self.next_frame_id();
        self.frames.push(ControlFrame {
            frame_id,
            entry_len,
            entry_slots,
            params: block_type.params,
            results: block_type.results,
            kind,
        });
        Ok(frame_id)
    }

    /// Branch-target resolution: latches the target block's continuation
    /// label and yields the target with the drop range a transfer needs.
    fn branch_target(&mut self, depth: u32) -> Result<BranchTarget, CompileError> {
        let current_slots = self.stack.slot_height();
        let frame = self
            .frames
            .get_mut(depth as usize)
            .ok_or(CompileError::IndexOutOfRange("label", depth))?;
        ControlFrames::ensure_continuation(frame);
        Ok(BranchTarget::new(
            frame.branch_target_label(),
            frame.drop_range(current_slots, false),
        ))
    }

    fn op_core(&mut self, op: OpCode) -> Result<(), CompileError> {
        match op {
            OpCode::Unreachable => {
                self.emit(Operation::Unreachable);
                self.set_unreachable();
            }
            OpCode::Nop => {}

            OpCode::Block => {
                let block_type = self.read_block_type()?;
                self.push_control_frame(
                    block_type,
                    ControlFrameKind::Block {
                        needs_continuation: false,
                    },
                )?;
            }
            OpCode::Loop => {
                let block_type = self.read_block_type()?;
                let frame_id = self.push_control_frame(block_type, ControlFrameKind::Loop)?;
                let header = Label::new(LabelKind::Header, frame_id);
                self.emit(Operation::Br(header));
                self.emit(Operation::Label(header));
                if self.options.ensure_termination {
                    self.emit(Operation::BuiltinFunctionCheckExitCode);
                }
            }
            OpCode::If => {
                let block_type = self.read_block_type()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                let frame_id = self
                    .push_control_frame(block_type, ControlFrameKind::If { has_else: false })?;
                let header = Label::new(LabelKind::Header, frame_id);
                let else_label = Label::new(LabelKind::Else, frame_id);
                self.emit(Operation::BrIf {
                    then_target: BranchTarget::new(header, None),
                    else_target: BranchTarget::new(else_label, None),
                });
                self.emit(Operation::Label(header));
            }
            OpCode::Else => self.handle_else()?,
            OpCode::End => self.handle_end()?,

            OpCode::Br => {
                let depth = self.reader.load_imm_varuint32()?;
                let target = self.branch_target(depth)?;
                self.emit_drop(target.drop_range);
                self.emit(Operation::Br(target.label));
                self.set_unreachable();
            }
            OpCode::BrIf => {
                let depth = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                let then_target = self.branch_target(depth)?;
                // The fallthrough is reachable; it continues at a fresh
                // header labelling the next instruction.
                let fallthrough = Label::new(LabelKind::Header, self.next_frame_id());
                self.emit(Operation::BrIf {
                    then_target,
                    else_target: BranchTarget::new(fallthrough, None),
                });
                self.emit(Operation::Label(fallthrough));
            }
            OpCode::BrTable => {
                let depths = self.reader.load_array_varu32()?;
                let default_depth = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                let mut targets = Vec::with_capacity(depths.len());
                for depth in depths {
                    targets.push(self.branch_target(depth)?);
                }
                let default = self.branch_target(default_depth)?;
                self.emit(Operation::BrTable { targets, default });
                self.set_unreachable();
            }
            OpCode::Return => {
                let bottom = self.frames.bottom().ok_or_else(|| {
                    CompileError::InternalInvariantViolation(
                        "return outside a function frame".to_string(),
                    )
                })?;
                let drop_range = bottom.drop_range(self.stack.slot_height(), false);
                self.emit_drop(drop_range);
                self.emit(Operation::Br(Label::ret()));
                self.set_unreachable();
            }

            OpCode::Call => {
                let index = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, index)?;
                self.apply(&sig)?;
                self.emit(Operation::Call(index));
            }
            OpCode::CallIndirect => {
                let type_index = self.reader.load_imm_varuint32()?;
                let table_index = self.reader.load_imm_varuint32()?;
                if table_index as usize >= self.module.tables.len() {
                    return Err(CompileError::IndexOutOfRange("table", table_index));
                }
                let sig = self.core_signature(op, type_index)?;
                self.apply(&sig)?;
                self.emit(Operation::CallIndirect {
                    type_index,
                    table_index,
                });
            }

            OpCode::Drop => {
                let sig = self.core_signature(op, 0)?;
                let popped = self.apply(&sig)?;
                let width = popped[0].slot_width() as i32;
                self.emit(Operation::Drop(InclusiveRange::new(0, width - 1)));
            }
            OpCode::Select => {
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                let is_v128 = self.stack.peek() == Some(ValueKind::V128);
                self.emit(Operation::Select { is_v128 });
            }
            OpCode::SelectT => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", op as u32)?;
                let count = self.reader.load_imm_varuint32()?;
                if count != 1 {
                    return Err(CompileError::ImmediateDecode(format!(
                        "select type vector of length {count}"
                    )));
                }
                let byte = self.reader.load_imm_u8()?;
                let kind = ValueKind::from_byte(byte).ok_or_else(|| {
                    CompileError::ImmediateDecode(format!("invalid select type {byte:#x}"))
                })?;
                let sig = sig::typed_select_signature(kind);
                self.apply(&sig)?;
                self.emit(Operation::Select {
                    is_v128: kind == ValueKind::V128,
                });
            }

            OpCode::LocalGet => {
                let index = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, index)?;
                let slots_before = self.stack.slot_height();
                self.apply(&sig)?;
                let (offset, kind) = self.local_info(index)?;
                let depth = self.local_depth(slots_before, offset)?;
                self.emit(Operation::Pick {
                    depth,
                    is_v128: kind == ValueKind::V128,
                });
            }
            OpCode::LocalSet => {
                let index = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, index)?;
                let slots_before = self.stack.slot_height();
                self.apply(&sig)?;
                let (offset, kind) = self.local_info(index)?;
                let is_v128 = kind == ValueKind::V128;
                let depth = self.local_depth(slots_before, offset)?;
                self.emit(Operation::Set { depth, is_v128 });
                self.emit(Operation::Drop(InclusiveRange::new(
                    0,
                    kind.slot_width() as i32 - 1,
                )));
            }
            OpCode::LocalTee => {
                let index = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, index)?;
                let slots_before = self.stack.slot_height();
                self.apply(&sig)?;
                let (offset, kind) = self.local_info(index)?;
                let is_v128 = kind == ValueKind::V128;
                let width = kind.slot_width() as u32;
                let depth = self.local_depth(slots_before, offset)? + width;
                self.emit(Operation::Pick { depth: 0, is_v128 });
                self.emit(Operation::Set { depth, is_v128 });
                self.emit(Operation::Drop(InclusiveRange::new(0, width as i32 - 1)));
            }

            OpCode::GlobalGet | OpCode::GlobalSet => {
                let index = self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, index)?;
                self.apply(&sig)?;
                self.emit(match op {
                    OpCode::GlobalGet => Operation::GlobalGet(index),
                    _ => Operation::GlobalSet(index),
                });
            }

            OpCode::TableGet | OpCode::TableSet => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", op as u32)?;
                let index = self.reader.load_imm_varuint32()?;
                if index as usize >= self.module.tables.len() {
                    return Err(CompileError::IndexOutOfRange("table", index));
                }
                let sig = self.core_signature(op, index)?;
                self.apply(&sig)?;
                self.emit(match op {
                    OpCode::TableGet => Operation::TableGet(index),
                    _ => Operation::TableSet(index),
                });
            }
            OpCode::RefNull => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", op as u32)?;
                // The heap type byte; both null representations are the
                // zero opaque pointer downstream.
                self.reader.load_imm_u8()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::ConstI64(0));
            }
            OpCode::RefIsNull => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", op as u32)?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::Eqz(UnsignedInt::I64));
            }
            OpCode::RefFunc => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", op as u32)?;
                let index = self.reader.load_imm_varuint32()?;
                if index as usize >= self.module.functions.len() {
                    return Err(CompileError::IndexOutOfRange("function", index));
                }
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::RefFunc(index));
            }

            OpCode::LoadI32 => self.load_op(op, ValueKind::I32)?,
            OpCode::LoadI64 => self.load_op(op, ValueKind::I64)?,
            OpCode::LoadF32 => self.load_op(op, ValueKind::F32)?,
            OpCode::LoadF64 => self.load_op(op, ValueKind::F64)?,
            OpCode::Load8S32 => self.load_narrow_op(op, 8, SignedInt::S32)?,
            OpCode::Load8U32 => self.load_narrow_op(op, 8, SignedInt::U32)?,
            OpCode::Load16S32 => self.load_narrow_op(op, 16, SignedInt::S32)?,
            OpCode::Load16U32 => self.load_narrow_op(op, 16, SignedInt::U32)?,
            OpCode::Load8S64 => self.load_narrow_op(op, 8, SignedInt::S64)?,
            OpCode::Load8U64 => self.load_narrow_op(op, 8, SignedInt::U64)?,
            OpCode::Load16S64 => self.load_narrow_op(op, 16, SignedInt::S64)?,
            OpCode::Load16U64 => self.load_narrow_op(op, 16, SignedInt::U64)?,
            OpCode::Load32S64 => self.load_narrow_op(op, 32, SignedInt::S64)?,
            OpCode::Load32U64 => self.load_narrow_op(op, 32, SignedInt::U64)?,

            OpCode::StoreI32 => self.store_op(op, ValueKind::I32)?,
            OpCode::StoreI64 => self.store_op(op, ValueKind::I64)?,
            OpCode::StoreF32 => self.store_op(op, ValueKind::F32)?,
            OpCode::StoreF64 => self.store_op(op, ValueKind::F64)?,
            OpCode::Store8_32 | OpCode::Store8_64 => self.store_narrow_op(op, 8)?,
            OpCode::Store16_32 | OpCode::Store16_64 => self.store_narrow_op(op, 16)?,
            OpCode::Store32_64 => self.store_narrow_op(op, 32)?,

            OpCode::MemorySize | OpCode::MemoryGrow => {
                // The reserved memory index.
                self.reader.load_imm_varuint32()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.uses_memory = true;
                self.emit(match op {
                    OpCode::MemorySize => Operation::MemorySize,
                    _ => Operation::MemoryGrow,
                });
            }

            OpCode::I32Const => {
                let value = self.reader.load_imm_varint32()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::ConstI32(value));
            }
            OpCode::I64Const => {
                let value = self.reader.load_imm_varint64()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::ConstI64(value));
            }
            OpCode::F32Const => {
                let value = self.reader.load_imm_f32()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::ConstF32(value));
            }
            OpCode::F64Const => {
                let value = self.reader.load_imm_f64()?;
                let sig = self.core_signature(op, 0)?;
                self.apply(&sig)?;
                self.emit(Operation::ConstF64(value));
            }

            OpCode::I32Eqz => self.simple(op, Operation::Eqz(UnsignedInt::I32))?,
            OpCode::I32Eq => self.simple(op, Operation::Eq(ValueKind::I32))?,
            OpCode::I32Ne => self.simple(op, Operation::Ne(ValueKind::I32))?,
            OpCode::I32LtS => self.simple(op, Operation::Lt(SignedType::S32))?,
            OpCode::I32LtU => self.simple(op, Operation::Lt(SignedType::U32))?,
            OpCode::I32GtS => self.simple(op, Operation::Gt(SignedType::S32))?,
            OpCode::I32GtU => self.simple(op, Operation::Gt(SignedType::U32))?,
            OpCode::I32LeS => self.simple(op, Operation::Le(SignedType::S32))?,
            OpCode::I32LeU => self.simple(op, Operation::Le(SignedType::U32))?,
            OpCode::I32GeS => self.simple(op, Operation::Ge(SignedType::S32))?,
            OpCode::I32GeU => self.simple(op, Operation::Ge(SignedType::U32))?,

            OpCode::I64Eqz => self.simple(op, Operation::Eqz(UnsignedInt::I64))?,
            OpCode::I64Eq => self.simple(op, Operation::Eq(ValueKind::I64))?,
            OpCode::I64Ne => self.simple(op, Operation::Ne(ValueKind::I64))?,
            OpCode::I64LtS => self.simple(op, Operation::Lt(SignedType::S64))?,
            OpCode::I64LtU => self.simple(op, Operation::Lt(SignedType::U64))?,
            OpCode::I64GtS => self.simple(op, Operation::Gt(SignedType::S64))?,
            OpCode::I64GtU => self.simple(op, Operation::Gt(SignedType::U64))?,
            OpCode::I64LeS => self.simple(op, Operation::Le(SignedType::S64))?,
            OpCode::I64LeU => self.simple(op, Operation::Le(SignedType::U64))?,
            OpCode::I64GeS => self.simple(op, Operation::Ge(SignedType::S64))?,
            OpCode::I64GeU => self.simple(op, Operation::Ge(SignedType::U64))?,

            OpCode::F32Eq => self.simple(op, Operation::Eq(ValueKind::F32))?,
            OpCode::F32Ne => self.simple(op, Operation::Ne(ValueKind::F32))?,
            OpCode::F32Lt => self.simple(op, Operation::Lt(SignedType::F32))?,
            OpCode::F32Gt => self.simple(op, Operation::Gt(SignedType::F32))?,
            OpCode::F32Le => self.simple(op, Operation::Le(SignedType::F32))?,
            OpCode::F32Ge => self.simple(op, Operation::Ge(SignedType::F32))?,

            OpCode::F64Eq => self.simple(op, Operation::Eq(ValueKind::F64))?,
            OpCode::F64Ne => self.simple(op, Operation::Ne(ValueKind::F64))?,
            OpCode::F64Lt => self.simple(op, Operation::Lt(SignedType::F64))?,
            OpCode::F64Gt => self.simple(op, Operation::Gt(SignedType::F64))?,
            OpCode::F64Le => self.simple(op, Operation::Le(SignedType::F64))?,
            OpCode::F64Ge => self.simple(op, Operation::Ge(SignedType::F64))?,

            OpCode::I32Clz => self.simple(op, Operation::Clz(UnsignedInt::I32))?,
            OpCode::I32Ctz => self.simple(op, Operation::Ctz(UnsignedInt::I32))?,
            OpCode::I32Popcnt => self.simple(op, Operation::Popcnt(UnsignedInt::I32))?,
            OpCode::I32Add => self.simple(op, Operation::Add(ValueKind::I32))?,
            OpCode::I32Sub => self.simple(op, Operation::Sub(ValueKind::I32))?,
            OpCode::I32Mul => self.simple(op, Operation::Mul(ValueKind::I32))?,
            OpCode::I32DivS => self.simple(op, Operation::Div(SignedType::S32))?,
            OpCode::I32DivU => self.simple(op, Operation::Div(SignedType::U32))?,
            OpCode::I32RemS => self.simple(op, Operation::Rem(SignedInt::S32))?,
            OpCode::I32RemU => self.simple(op, Operation::Rem(SignedInt::U32))?,
            OpCode::I32And => self.simple(op, Operation::And(UnsignedInt::I32))?,
            OpCode::I32Or => self.simple(op, Operation::Or(UnsignedInt::I32))?,
            OpCode::I32Xor => self.simple(op, Operation::Xor(UnsignedInt::I32))?,
            OpCode::I32Shl => self.simple(op, Operation::Shl(UnsignedInt::I32))?,
            OpCode::I32ShrS => self.simple(op, Operation::Shr(SignedInt::S32))?,
            OpCode::I32ShrU => self.simple(op, Operation::Shr(SignedInt::U32))?,
            OpCode::I32Rotl => self.simple(op, Operation::Rotl(UnsignedInt::I32))?,
            OpCode::I32Rotr => self.simple(op, Operation::Rotr(UnsignedInt::I32))?,

            OpCode::I64Clz => self.simple(op, Operation::Clz(UnsignedInt::I64))?,
            OpCode::I64Ctz => self.simple(op, Operation::Ctz(UnsignedInt::I64))?,
            OpCode::I64Popcnt => self.simple(op, Operation::Popcnt(UnsignedInt::I64))?,
            OpCode::I64Add => self.simple(op, Operation::Add(ValueKind::I64))?,
            OpCode::I64Sub => self.simple(op, Operation::Sub(ValueKind::I64))?,
            OpCode::I64Mul => self.simple(op, Operation::Mul(ValueKind::I64))?,
            OpCode::I64DivS => self.simple(op, Operation::Div(SignedType::S64))?,
            OpCode::I64DivU => self.simple(op, Operation::Div(SignedType::U64))?,
            OpCode::I64RemS => self.simple(op, Operation::Rem(SignedInt::S64))?,
            OpCode::I64RemU => self.simple(op, Operation::Rem(SignedInt::U64))?,
            OpCode::I64And => self.simple(op, Operation::And(UnsignedInt::I64))?,
            OpCode::I64Or => self.simple(op, Operation::Or(UnsignedInt::I64))?,
            OpCode::I64Xor => self.simple(op, Operation::Xor(UnsignedInt::I64))?,
            OpCode::I64Shl => self.simple(op, Operation::Shl(UnsignedInt::I64))?,
            OpCode::I64ShrS => self.simple(op, Operation::Shr(SignedInt::S64))?,
            OpCode::I64ShrU => self.simple(op, Operation::Shr(SignedInt::U64))?,
            OpCode::I64Rotl => self.simple(op, Operation::Rotl(UnsignedInt::I64))?,
            OpCode::I64Rotr => self.simple(op, Operation::Rotr(UnsignedInt::I64))?,

            OpCode::F32Abs => self.simple(op, Operation::Abs(Float::F32))?,
            OpCode::F32Neg => self.simple(op, Operation::Neg(Float::F32))?,
            OpCode::F32Ceil => self.simple(op, Operation::Ceil(Float::F32))?,
            OpCode::F32Floor => self.simple(op, Operation::Floor(Float::F32))?,
            OpCode::F32Trunc => self.simple(op, Operation::Trunc(Float::F32))?,
            OpCode::F32Nearest => self.simple(op, Operation::Nearest(Float::F32))?,
            OpCode::F32Sqrt => self.simple(op, Operation::Sqrt(Float::F32))?,
            OpCode::F32Add => self.simple(op, Operation::Add(ValueKind::F32))?,
            OpCode::F32Sub => self.simple(op, Operation::Sub(ValueKind::F32))?,
            OpCode::F32Mul => self.simple(op, Operation::Mul(ValueKind::F32))?,
            OpCode::F32Div => self.simple(op, Operation::Div(SignedType::F32))?,
            OpCode::F32Min => self.simple(op, Operation::Min(Float::F32))?,
            OpCode::F32Max => self.simple(op, Operation::Max(Float::F32))?,
            OpCode::F32Copysign => self.simple(op, Operation::Copysign(Float::F32))?,

            OpCode::F64Abs => self.simple(op, Operation::Abs(Float::F64))?,
            OpCode::F64Neg => self.simple(op, Operation::Neg(Float::F64))?,
            OpCode::F64Ceil => self.simple(op, Operation::Ceil(Float::F64))?,
            OpCode::F64Floor => self.simple(op, Operation::Floor(Float::F64))?,
            OpCode::F64Trunc => self.simple(op, Operation::Trunc(Float::F64))?,
            OpCode::F64Nearest => self.simple(op, Operation::Nearest(Float::F64))?,
            OpCode::F64Sqrt => self.simple(op, Operation::Sqrt(Float::F64))?,
            OpCode::F64Add => self.simple(op, Operation::Add(ValueKind::F64))?,
            OpCode::F64Sub => self.simple(op, Operation::Sub(ValueKind::F64))?,
            OpCode::F64Mul => self.simple(op, Operation::Mul(ValueKind::F64))?,
            OpCode::F64Div => self.simple(op, Operation::Div(SignedType::F64))?,
            OpCode::F64Min => self.simple(op, Operation::Min(Float::F64))?,
            OpCode::F64Max => self.simple(op, Operation::Max(Float::F64))?,
            OpCode::F64Copysign => self.simple(op, Operation::Copysign(Float::F64))?,

            OpCode::I32WrapI64 => self.simple(op, Operation::I32WrapFromI64)?,
            OpCode::I32TruncF32S => self.trunc_op(op, Float::F32, SignedInt::S32)?,
            OpCode::I32TruncF32U => self.trunc_op(op, Float::F32, SignedInt::U32)?,
            OpCode::I32TruncF64S => self.trunc_op(op, Float::F64, SignedInt::S32)?,
            OpCode::I32TruncF64U => self.trunc_op(op, Float::F64, SignedInt::U32)?,
            OpCode::I64ExtendI32S => self.simple(op, Operation::Extend { signed: true })?,
            OpCode::I64ExtendI32U => self.simple(op, Operation::Extend { signed: false })?,
            OpCode::I64TruncF32S => self.trunc_op(op, Float::F32, SignedInt::S64)?,
            OpCode::I64TruncF32U => self.trunc_op(op, Float::F32, SignedInt::U64)?,
            OpCode::I64TruncF64S => self.trunc_op(op, Float::F64, SignedInt::S64)?,
            OpCode::I64TruncF64U => self.trunc_op(op, Float::F64, SignedInt::U64)?,

            OpCode::F32ConvertI32S => self.convert_op(op, SignedInt::S32, Float::F32)?,
            OpCode::F32ConvertI32U => self.convert_op(op, SignedInt::U32, Float::F32)?,
            OpCode::F32ConvertI64S => self.convert_op(op, SignedInt::S64, Float::F32)?,
            OpCode::F32ConvertI64U => self.convert_op(op, SignedInt::U64, Float::F32)?,
            OpCode::F32DemoteF64 => self.simple(op, Operation::F32DemoteFromF64)?,
            OpCode::F64ConvertI32S => self.convert_op(op, SignedInt::S32, Float::F64)?,
            OpCode::F64ConvertI32U => self.convert_op(op, SignedInt::U32, Float::F64)?,
            OpCode::F64ConvertI64S => self.convert_op(op, SignedInt::S64, Float::F64)?,
            OpCode::F64ConvertI64U => self.convert_op(op, SignedInt::U64, Float::F64)?,
            OpCode::F64PromoteF32 => self.simple(op, Operation::F64PromoteFromF32)?,

            OpCode::I32ReinterpretF32 => self.simple(op, Operation::I32ReinterpretFromF32)?,
            OpCode::I64ReinterpretF64 => self.simple(op, Operation::I64ReinterpretFromF64)?,
            OpCode::F32ReinterpretI32 => self.simple(op, Operation::F32ReinterpretFromI32)?,
            OpCode::F64ReinterpretI64 => self.simple(op, Operation::F64ReinterpretFromI64)?,

            OpCode::I32Extend8S
            | OpCode::I32Extend16S
            | OpCode::I64Extend8S
            | OpCode::I64Extend16S
            | OpCode::I64Extend32S => {
                self.require_feature(Features::SIGN_EXTENSION, "sign-extension-ops", op as u32)?;
                let out = match op {
                    OpCode::I32Extend8S => Operation::SignExtend32From8,
                    OpCode::I32Extend16S => Operation::SignExtend32From16,
                    OpCode::I64Extend8S => Operation::SignExtend64From8,
                    OpCode::I64Extend16S => Operation::SignExtend64From16,
                    _ => Operation::SignExtend64From32,
                };
                self.simple(op, out)?;
            }

            OpCode::MiscPrefix | OpCode::VecPrefix => {
                return Err(CompileError::InternalInvariantViolation(
                    "prefix byte dispatched as a core opcode".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn load_op(&mut self, op: OpCode, kind: ValueKind) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let sig = self.core_signature(op, 0)?;
        self.apply(&sig)?;
        self.uses_memory = true;
        self.emit(Operation::Load { kind, arg });
        Ok(())
    }

    fn load_narrow_op(
        &mut self,
        op: OpCode,
        width_bits: u8,
        kind: SignedInt,
    ) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let sig = self.core_signature(op, 0)?;
        self.apply(&sig)?;
        self.uses_memory = true;
        self.emit(match width_bits {
            8 => Operation::Load8 { kind, arg },
            16 => Operation::Load16 { kind, arg },
            _ => Operation::Load32 {
                signed: kind == SignedInt::S64,
                arg,
            },
        });
        Ok(())
    }

    fn store_op(&mut self, op: OpCode, kind: ValueKind) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let sig = self.core_signature(op, 0)?;
        self.apply(&sig)?;
        self.uses_memory = true;
        self.emit(Operation::Store { kind, arg });
        Ok(())
    }

    fn store_narrow_op(&mut self, op: OpCode, width_bits: u8) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let sig = self.core_signature(op, 0)?;
        self.apply(&sig)?;
        self.uses_memory = true;
        self.emit(match width_bits {
            8 => Operation::Store8 { arg },
            16 => Operation::Store16 { arg },
            _ => Operation::Store32 { arg },
        });
        Ok(())
    }

    fn trunc_op(&mut self, op: OpCode, input: Float, output: SignedInt) -> Result<(), CompileError> {
        self.simple(
            op,
            Operation::ITruncFromF {
                input,
                output,
                non_trapping: false,
            },
        )
    }

    fn convert_op(
        &mut self,
        op: OpCode,
        input: SignedInt,
        output: Float,
    ) -> Result<(), CompileError> {
        self.simple(op, Operation::FConvertFromI { input, output })
    }

    /// `else` seen while translating normally: close out the then-branch
    /// (drop residue, branch to the continuation), rewind the stack to the
    /// block entry state and open the else-arm.
    fn handle_else(&mut self) -> Result<(), CompileError> {
        let current_slots = self.stack.slot_height();
        let frame = self.frames.top_mut().ok_or_else(|| {
            CompileError::InternalInvariantViolation("else with no open frame".to_string())
        })?;
        let frame_id = frame.frame_id;
        let entry_len = frame.entry_len;
        let params = frame.params.clone();
        let drop_range = frame.drop_range(current_slots, true);
        match &mut frame.kind {
            ControlFrameKind::If { has_else } => *has_else = true,
            _ => {
                return Err(CompileError::InternalInvariantViolation(
                    "else outside an if frame".to_string(),
                ))
            }
        }

        self.stack.truncate(entry_len);
        for param in params {
            self.stack.push(param);
        }

        let continuation = Label::new(LabelKind::Continuation, frame_id);
        self.emit_drop(drop_range);
        self.emit(Operation::Br(continuation));
        self.emit(Operation::Label(Label::new(LabelKind::Else, frame_id)));
        Ok(())
    }

    /// `else` reached with the then-branch fully unreachable: the else-arm
    /// is still a live branch target, so emission resumes at its label with
    /// the stack rewound to the block entry state.
    fn resume_at_else(&mut self) -> Result<(), CompileError> {
        let frame = self.frames.top_mut().ok_or_else(|| {
            CompileError::InternalInvariantViolation("else with no open frame".to_string())
        })?;
        let frame_id = frame.frame_id;
        let entry_len = frame.entry_len;
        let params = frame.params.clone();
        match &mut frame.kind {
            ControlFrameKind::If { has_else } => *has_else = true,
            _ => {
                return Err(CompileError::InternalInvariantViolation(
                    "else outside an if frame".to_string(),
                ))
            }
        }

        self.stack.truncate(entry_len);
        for param in params {
            self.stack.push(param);
        }

        self.unreachable = false;
        self.unreachable_depth = 0;
        self.emit(Operation::Label(Label::new(LabelKind::Else, frame_id)));
        Ok(())
    }

    /// `end` seen while translating normally: pop the frame, drop the
    /// residue above its results, and emit whatever labels the construct
    /// still owes.
    fn handle_end(&mut self) -> Result<(), CompileError> {
        let frame = self.frames.pop().ok_or_else(|| {
            CompileError::InternalInvariantViolation("end with no open frame".to_string())
        })?;
        let drop_range = frame.drop_range(self.stack.slot_height(), true);

        self.stack.truncate(frame.entry_len);
        for result in &frame.results {
            self.stack.push(*result);
        }

        match frame.kind {
            ControlFrameKind::Function => {
                self.emit_drop(drop_range);
                self.emit(Operation::Br(Label::ret()));
            }
            ControlFrameKind::Loop
            | ControlFrameKind::Block {
                needs_continuation: false,
            } => {
                self.emit_drop(drop_range);
            }
            ControlFrameKind::Block {
                needs_continuation: true,
            }
            | ControlFrameKind::If { has_else: true } => {
                let continuation = Label::new(LabelKind::Continuation, frame.frame_id);
                self.emit_drop(drop_range);
                self.emit(Operation::Br(continuation));
                self.emit(Operation::Label(continuation));
            }
            ControlFrameKind::If { has_else: false } => {
                // Synthesize the trivial else-arm so the label the if's
                // branch references exists.
                let continuation = Label::new(LabelKind::Continuation, frame.frame_id);
                let else_label = Label::new(LabelKind::Else, frame.frame_id);
                self.emit_drop(drop_range);
                self.emit(Operation::Br(continuation));
                self.emit(Operation::Label(else_label));
                self.emit(Operation::Br(continuation));
                self.emit(Operation::Label(continuation));
            }
        }
        Ok(())
    }

    /// `end` reached in suppressed mode at depth zero: close the frame and
    /// resume emission. Only labels are owed; the branches into them were
    /// either emitted before the suppression window opened or never will be.
    fn end_unreachable_frame(&mut self) -> Result<(), CompileError> {
        self.unreachable = false;
        self.unreachable_depth = 0;

        let frame = self.frames.pop().ok_or_else(|| {
            CompileError::InternalInvariantViolation("end with no open frame".to_string())
        })?;
        if self.frames.is_empty() {
            // Function frame: the return branch was already emitted by
            // whatever made the tail unreachable.
            return Ok(());
        }

        self.stack.truncate(frame.entry_len);
        for result in &frame.results {
            self.stack.push(*result);
        }

        match frame.kind {
            ControlFrameKind::If { has_else: false } => {
                let continuation = Label::new(LabelKind::Continuation, frame.frame_id);
                let else_label = Label::new(LabelKind::Else, frame.frame_id);
                self.emit(Operation::Label(else_label));
                self.emit(Operation::Br(continuation));
                self.emit(Operation::Label(continuation));
            }
            ControlFrameKind::If { has_else: true }
            | ControlFrameKind::Block {
                needs_continuation: true,
            } => {
                self.emit(Operation::Label(Label::new(
                    LabelKind::Continuation,
                    frame.frame_id,
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Dead-code walk: immediates still have to be decoded so the program
    /// counter stays aligned, but nothing is simulated or emitted.
    fn skip_core(&mut self, op: OpCode) -> Result<(), CompileError> {
        match op {
            OpCode::Block | OpCode::Loop | OpCode::If => {
                self.read_block_type()?;
                self.unreachable_depth += 1;
            }
            OpCode::Else => {
                if self.unreachable_depth == 0 {
                    self.resume_at_else()?;
                }
            }
            OpCode::End => {
                if self.unreachable_depth > 0 {
                    self.unreachable_depth -= 1;
                } else {
                    self.end_unreachable_frame()?;
                }
            }
            _ => self.skip_core_immediates(op)?,
        }
        Ok(())
    }

    fn skip_core_immediates(&mut self, op: OpCode) -> Result<(), CompileError> {
        match op {
            OpCode::Br
            | OpCode::BrIf
            | OpCode::Call
            | OpCode::LocalGet
            | OpCode::LocalSet
            | OpCode::LocalTee
            | OpCode::GlobalGet
            | OpCode::GlobalSet
            | OpCode::TableGet
            | OpCode::TableSet
            | OpCode::RefFunc
            | OpCode::MemorySize
            | OpCode::MemoryGrow => {
                self.reader.load_imm_varuint32()?;
            }
            OpCode::BrTable => {
                self.reader.load_array_varu32()?;
                self.reader.load_imm_varuint32()?;
            }
            OpCode::CallIndirect => {
                self.reader.load_imm_varuint32()?;
                self.reader.load_imm_varuint32()?;
            }
            OpCode::RefNull => {
                self.reader.load_imm_u8()?;
            }
            OpCode::SelectT => {
                let count = self.reader.load_imm_varuint32()?;
                for _ in 0..count {
                    self.reader.load_imm_u8()?;
                }
            }
            OpCode::LoadI32
            | OpCode::LoadI64
            | OpCode::LoadF32
            | OpCode::LoadF64
            | OpCode::Load8S32
            | OpCode::Load8U32
            | OpCode::Load16S32
            | OpCode::Load16U32
            | OpCode::Load8S64
            | OpCode::Load8U64
            | OpCode::Load16S64
            | OpCode::Load16U64
            | OpCode::Load32S64
            | OpCode::Load32U64
            | OpCode::StoreI32
            | OpCode::StoreI64
            | OpCode::StoreF32
            | OpCode::StoreF64
            | OpCode::Store8_32
            | OpCode::Store16_32
            | OpCode::Store8_64
            | OpCode::Store16_64
            | OpCode::Store32_64 => {
                self.mem_arg()?;
            }
            OpCode::I32Const => {
                self.reader.load_imm_varint32()?;
            }
            OpCode::I64Const => {
                self.reader.load_imm_varint64()?;
            }
            OpCode::F32Const => {
                self.reader.load_imm_f32()?;
            }
            OpCode::F64Const => {
                self.reader.load_imm_f64()?;
            }
            _ => {}
        }
        Ok(())
    }

    /// The `0xFC` space: trunc-sat conversions and bulk memory/table ops.
    fn op_misc(&mut self, op: MiscOpCode) -> Result<(), CompileError> {
        use MiscOpCode::*;
        let opcode_id = 0xFC_0000 | op as u32;
        match op {
            I32TruncSatF32S | I32TruncSatF32U | I32TruncSatF64S | I32TruncSatF64U
            | I64TruncSatF32S | I64TruncSatF32U | I64TruncSatF64S | I64TruncSatF64U => {
                self.require_feature(
                    Features::NON_TRAPPING_FLOAT_TO_INT,
                    "non-trapping-float-to-int",
                    opcode_id,
                )?;
                if self.unreachable {
                    return Ok(());
                }
                let (input, output) = match op {
                    I32TruncSatF32S => (Float::F32, SignedInt::S32),
                    I32TruncSatF32U => (Float::F32, SignedInt::U32),
                    I32TruncSatF64S => (Float::F64, SignedInt::S32),
                    I32TruncSatF64U => (Float::F64, SignedInt::U32),
                    I64TruncSatF32S => (Float::F32, SignedInt::S64),
                    I64TruncSatF32U => (Float::F32, SignedInt::U64),
                    I64TruncSatF64S => (Float::F64, SignedInt::S64),
                    _ => (Float::F64, SignedInt::U64),
                };
                self.apply(sig::misc_signature(op))?;
                self.emit(Operation::ITruncFromF {
                    input,
                    output,
                    non_trapping: true,
                });
            }

            MemoryInit => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                let data_index = self.reader.load_imm_varuint32()?;
                // Reserved memory index.
                self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                if data_index >= self.module.data_instance_count() {
                    return Err(CompileError::IndexOutOfRange("data", data_index));
                }
                self.apply(sig::misc_signature(op))?;
                self.uses_memory = true;
                self.emit(Operation::MemoryInit(data_index));
            }
            DataDrop => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                let data_index = self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                if data_index >= self.module.data_instance_count() {
                    return Err(CompileError::IndexOutOfRange("data", data_index));
                }
                self.apply(sig::misc_signature(op))?;
                self.emit(Operation::DataDrop(data_index));
            }
            MemoryCopy => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                // Reserved destination and source memory indices.
                self.reader.load_imm_varuint32()?;
                self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                self.apply(sig::misc_signature(op))?;
                self.uses_memory = true;
                self.emit(Operation::MemoryCopy);
            }
            MemoryFill => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                self.apply(sig::misc_signature(op))?;
                self.uses_memory = true;
                self.emit(Operation::MemoryFill);
            }

            TableInit => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                let elem_index = self.reader.load_imm_varuint32()?;
                let table_index = self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                if elem_index as usize >= self.module.element_segments.len() {
                    return Err(CompileError::IndexOutOfRange("element", elem_index));
                }
                self.check_table(table_index)?;
                self.apply(sig::misc_signature(op))?;
                self.emit(Operation::TableInit {
                    elem_index,
                    table_index,
                });
            }
            ElemDrop => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                let elem_index = self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                if elem_index as usize >= self.module.element_segments.len() {
                    return Err(CompileError::IndexOutOfRange("element", elem_index));
                }
                self.apply(sig::misc_signature(op))?;
                self.emit(Operation::ElemDrop(elem_index));
            }
            TableCopy => {
                self.require_feature(Features::BULK_MEMORY, "bulk-memory", opcode_id)?;
                let dst_table_index = self.reader.load_imm_varuint32()?;
                let src_table_index = self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                self.check_table(dst_table_index)?;
                self.check_table(src_table_index)?;
                self.apply(sig::misc_signature(op))?;
                self.emit(Operation::TableCopy {
                    dst_table_index,
                    src_table_index,
                });
            }
            TableGrow | TableSize | TableFill => {
                self.require_feature(Features::REFERENCE_TYPES, "reference-types", opcode_id)?;
                let table_index = self.reader.load_imm_varuint32()?;
                if self.unreachable {
                    return Ok(());
                }
                self.check_table(table_index)?;
                self.apply(sig::misc_signature(op))?;
                self.emit(match op {
                    TableGrow => Operation::TableGrow(table_index),
                    TableSize => Operation::TableSize(table_index),
                    _ => Operation::TableFill(table_index),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_table(&self, table_index: u32) -> Result<(), CompileError> {
        if table_index as usize >= self.module.tables.len() {
            return Err(CompileError::IndexOutOfRange("table", table_index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Features;

    fn compile(wat: &str) -> Vec<CompilationResult> {
        let binary = wat::parse_str(wat).unwrap();
        let module = Module::load(&binary, Features::default()).unwrap();
        compile_module(&module, &CompileOptions::default()).unwrap()
    }

    #[test]
    fn empty_function_is_a_bare_return() {
        let results = compile("(module (func))");
        assert_eq!(results[0].operations, vec![Operation::Br(Label::ret())]);
        assert!(results[0].label_callers.is_empty());
    }

    #[test]
    fn compilation_is_deterministic() {
        let wat = r#"(module (func (param i32) (result i32)
            (local i64)
            local.get 0
            i32.const 3
            i32.add))"#;
        let first = compile(wat);
        let second = compile(wat);
        assert_eq!(first, second);
    }

    #[test]
    fn function_order_does_not_matter() {
        let wat = r#"(module
            (func $a (result i32) i32.const 1)
            (func $b (result i64) i64.const 2))"#;
        let binary = wat::parse_str(wat).unwrap();
        let module = Module::load(&binary, Features::default()).unwrap();
        let options = CompileOptions::default();
        let batch = compile_module(&module, &options).unwrap();
        let a = compile_function(&module, 0, &options).unwrap();
        let b = compile_function(&module, 1, &options).unwrap();
        assert_eq!(batch, vec![a, b]);
    }

    #[test]
    fn imported_functions_cannot_be_compiled() {
        let binary = wat::parse_str(
            r#"(module (import "env" "f" (func)) (func))"#,
        )
        .unwrap();
        let module = Module::load(&binary, Features::default()).unwrap();
        let err = compile_function(&module, 0, &CompileOptions::default()).unwrap_err();
        assert_eq!(
            err.error,
            CompileError::IndexOutOfRange("code", 0)
        );
        assert!(compile_function(&module, 1, &CompileOptions::default()).is_ok());
    }

    #[test]
    fn feature_gate_rejects_sign_extension() {
        let binary = wat::parse_str(
            "(module (func (param i32) (result i32) local.get 0 i32.extend8_s))",
        )
        .unwrap();
        let module = Module::load(&binary, Features::MVP).unwrap();
        let err = compile_module(&module, &CompileOptions::default()).unwrap_err();
        assert!(matches!(
            err.error,
            CompileError::UnsupportedOpcode(0xC0, _)
        ));
    }
}
