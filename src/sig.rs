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

//! The opcode signature table: what every opcode pops and pushes, in terms
//! of abstract value kinds. Most rows are static; `call`, `call_indirect`,
//! the local and global accessors and typed `select` derive theirs from the
//! module context. `Unknown` rows (`drop`, untyped `select`) are resolved
//! against the live stack when applied.

use crate::compile::CompileError;
use crate::module::Module;
use crate::opcode::{MiscOpCode, OpCode, VecOpCode};
use crate::ValueKind::{self, F32, F64, I32, I64, Unknown, V128};
use std::borrow::Cow;

/// Inputs are listed bottom-up: the last entry is the top of the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct OpSignature {
    pub inputs: Cow<'static, [ValueKind]>,
    pub outputs: Cow<'static, [ValueKind]>,
}

impl OpSignature {
    pub fn owned(inputs: Vec<ValueKind>, outputs: Vec<ValueKind>) -> Self {
        OpSignature {
            inputs: Cow::Owned(inputs),
            outputs: Cow::Owned(outputs),
        }
    }
}

const fn stat(inputs: &'static [ValueKind], outputs: &'static [ValueKind]) -> OpSignature {
    OpSignature {
        inputs: Cow::Borrowed(inputs),
        outputs: Cow::Borrowed(outputs),
    }
}

// Row naming is inputs_outputs; NONE for an empty side.
static SIG_NONE_NONE: OpSignature = stat(&[], &[]);
static SIG_I32_NONE: OpSignature = stat(&[I32], &[]);
static SIG_NONE_I32: OpSignature = stat(&[], &[I32]);
static SIG_NONE_I64: OpSignature = stat(&[], &[I64]);
static SIG_NONE_F32: OpSignature = stat(&[], &[F32]);
static SIG_NONE_F64: OpSignature = stat(&[], &[F64]);
static SIG_NONE_V128: OpSignature = stat(&[], &[V128]);

static SIG_I32_I32: OpSignature = stat(&[I32], &[I32]);
static SIG_I32_I64: OpSignature = stat(&[I32], &[I64]);
static SIG_I32_F32: OpSignature = stat(&[I32], &[F32]);
static SIG_I32_F64: OpSignature = stat(&[I32], &[F64]);
static SIG_I64_I32: OpSignature = stat(&[I64], &[I32]);
static SIG_I64_I64: OpSignature = stat(&[I64], &[I64]);
static SIG_I64_F32: OpSignature = stat(&[I64], &[F32]);
static SIG_I64_F64: OpSignature = stat(&[I64], &[F64]);
static SIG_F32_I32: OpSignature = stat(&[F32], &[I32]);
static SIG_F32_I64: OpSignature = stat(&[F32], &[I64]);
static SIG_F32_F32: OpSignature = stat(&[F32], &[F32]);
static SIG_F32_F64: OpSignature = stat(&[F32], &[F64]);
static SIG_F64_I32: OpSignature = stat(&[F64], &[I32]);
static SIG_F64_I64: OpSignature = stat(&[F64], &[I64]);
static SIG_F64_F32: OpSignature = stat(&[F64], &[F32]);
static SIG_F64_F64: OpSignature = stat(&[F64], &[F64]);

static SIG_I32I32_I32: OpSignature = stat(&[I32, I32], &[I32]);
static SIG_I64I64_I64: OpSignature = stat(&[I64, I64], &[I64]);
static SIG_I64I64_I32: OpSignature = stat(&[I64, I64], &[I32]);
static SIG_F32F32_F32: OpSignature = stat(&[F32, F32], &[F32]);
static SIG_F32F32_I32: OpSignature = stat(&[F32, F32], &[I32]);
static SIG_F64F64_F64: OpSignature = stat(&[F64, F64], &[F64]);
static SIG_F64F64_I32: OpSignature = stat(&[F64, F64], &[I32]);

static SIG_I32I32_NONE: OpSignature = stat(&[I32, I32], &[]);
static SIG_I32I64_NONE: OpSignature = stat(&[I32, I64], &[]);
static SIG_I32F32_NONE: OpSignature = stat(&[I32, F32], &[]);
static SIG_I32F64_NONE: OpSignature = stat(&[I32, F64], &[]);
static SIG_I32I32I32_NONE: OpSignature = stat(&[I32, I32, I32], &[]);
static SIG_I32I64I32_NONE: OpSignature = stat(&[I32, I64, I32], &[]);
static SIG_I64I32_I32: OpSignature = stat(&[I64, I32], &[I32]);

static SIG_UNKNOWN_NONE: OpSignature = stat(&[Unknown], &[]);
static SIG_SELECT: OpSignature = stat(&[Unknown, Unknown, I32], &[Unknown]);

static SIG_I32_V128: OpSignature = stat(&[I32], &[V128]);
static SIG_I64_V128: OpSignature = stat(&[I64], &[V128]);
static SIG_F32_V128: OpSignature = stat(&[F32], &[V128]);
static SIG_F64_V128: OpSignature = stat(&[F64], &[V128]);
static SIG_V128_I32: OpSignature = stat(&[V128], &[I32]);
static SIG_V128_I64: OpSignature = stat(&[V128], &[I64]);
static SIG_V128_F32: OpSignature = stat(&[V128], &[F32]);
static SIG_V128_F64: OpSignature = stat(&[V128], &[F64]);
static SIG_V128_V128: OpSignature = stat(&[V128], &[V128]);
static SIG_V128I32_V128: OpSignature = stat(&[V128, I32], &[V128]);
static SIG_V128I64_V128: OpSignature = stat(&[V128, I64], &[V128]);
static SIG_V128F32_V128: OpSignature = stat(&[V128, F32], &[V128]);
static SIG_V128F64_V128: OpSignature = stat(&[V128, F64], &[V128]);
static SIG_V128V128_V128: OpSignature = stat(&[V128, V128], &[V128]);
static SIG_V128V128V128_V128: OpSignature = stat(&[V128, V128, V128], &[V128]);
static SIG_I32V128_V128: OpSignature = stat(&[I32, V128], &[V128]);
static SIG_I32V128_NONE: OpSignature = stat(&[I32, V128], &[]);

/// Signature of a core-space opcode. `index` is the opcode's decoded index
/// immediate where it has one (calls, locals, globals); it is ignored for
/// constant rows. Index range errors surface here.
pub fn signature_of(
    module: &Module,
    local_kinds: &[ValueKind],
    op: OpCode,
    index: u32,
) -> Result<OpSignature, CompileError> {
    use OpCode::*;
    let sig = match op {
        Unreachable | Nop | Block | Loop | Else | End | Br | Return => SIG_NONE_NONE.clone(),
        If | BrIf | BrTable => SIG_I32_NONE.clone(),

        Call => {
            let ft = module
                .type_of_function(index)
                .ok_or(CompileError::IndexOutOfRange("function", index))?;
            OpSignature::owned(ft.params.clone(), ft.results.clone())
        }
        CallIndirect => {
            let ft = module
                .types
                .get(index as usize)
                .ok_or(CompileError::IndexOutOfRange("type", index))?;
            let mut inputs = ft.params.clone();
            inputs.push(I32);
            OpSignature::owned(inputs, ft.results.clone())
        }

        Drop => SIG_UNKNOWN_NONE.clone(),
        Select => SIG_SELECT.clone(),
        // The typed form's row is built by the dispatcher once the type
        // vector immediate is read.
        SelectT => SIG_SELECT.clone(),

        LocalGet => {
            let kind = local_kind(local_kinds, index)?;
            OpSignature::owned(vec![], vec![kind])
        }
        LocalSet => {
            let kind = local_kind(local_kinds, index)?;
            OpSignature::owned(vec![kind], vec![])
        }
        LocalTee => {
            let kind = local_kind(local_kinds, index)?;
            OpSignature::owned(vec![kind], vec![kind])
        }
        GlobalGet => {
            let global = module
                .globals
                .get(index as usize)
                .ok_or(CompileError::IndexOutOfRange("global", index))?;
            OpSignature::owned(vec![], vec![global.kind])
        }
        GlobalSet => {
            let global = module
                .globals
                .get(index as usize)
                .ok_or(CompileError::IndexOutOfRange("global", index))?;
            OpSignature::owned(vec![global.kind], vec![])
        }

        TableGet => SIG_I32_I64.clone(),
        TableSet => SIG_I32I64_NONE.clone(),
        RefNull => SIG_NONE_I64.clone(),
        RefIsNull => SIG_I64_I32.clone(),
        RefFunc => SIG_NONE_I64.clone(),

        LoadI32 | Load8S32 | Load8U32 | Load16S32 | Load16U32 => SIG_I32_I32.clone(),
        LoadI64 | Load8S64 | Load8U64 | Load16S64 | Load16U64 | Load32S64 | Load32U64 => {
            SIG_I32_I64.clone()
        }
        LoadF32 => SIG_I32_F32.clone(),
        LoadF64 => SIG_I32_F64.clone(),
        StoreI32 | Store8_32 | Store16_32 => SIG_I32I32_NONE.clone(),
        StoreI64 | Store8_64 | Store16_64 | Store32_64 => SIG_I32I64_NONE.clone(),
        StoreF32 => SIG_I32F32_NONE.clone(),
        StoreF64 => SIG_I32F64_NONE.clone(),
        MemorySize => SIG_NONE_I32.clone(),
        MemoryGrow => SIG_I32_I32.clone(),

        I32Const => SIG_NONE_I32.clone(),
        I64Const => SIG_NONE_I64.clone(),
        F32Const => SIG_NONE_F32.clone(),
        F64Const => SIG_NONE_F64.clone(),

        I32Eqz => SIG_I32_I32.clone(),
        I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS | I32GeU => {
            SIG_I32I32_I32.clone()
        }
        I64Eqz => SIG_I64_I32.clone(),
        I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS | I64GeU => {
            SIG_I64I64_I32.clone()
        }
        F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => SIG_F32F32_I32.clone(),
        F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => SIG_F64F64_I32.clone(),

        I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => SIG_I32_I32.clone(),
        I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
        | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => SIG_I32I32_I32.clone(),
        I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => {
            SIG_I64_I64.clone()
        }
        I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
        | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => SIG_I64I64_I64.clone(),

        F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
            SIG_F32_F32.clone()
        }
        F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
            SIG_F32F32_F32.clone()
        }
        F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
            SIG_F64_F64.clone()
        }
        F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
            SIG_F64F64_F64.clone()
        }

        I32WrapI64 => SIG_I64_I32.clone(),
        I32TruncF32S | I32TruncF32U | I32ReinterpretF32 => SIG_F32_I32.clone(),
        I32TruncF64S | I32TruncF64U => SIG_F64_I32.clone(),
        I64ExtendI32S | I64ExtendI32U => SIG_I32_I64.clone(),
        I64TruncF32S | I64TruncF32U => SIG_F32_I64.clone(),
        I64TruncF64S | I64TruncF64U | I64ReinterpretF64 => SIG_F64_I64.clone(),
        F32ConvertI32S | F32ConvertI32U | F32ReinterpretI32 => SIG_I32_F32.clone(),
        F32ConvertI64S | F32ConvertI64U => SIG_I64_F32.clone(),
        F32DemoteF64 => SIG_F64_F32.clone(),
        F64ConvertI32S | F64ConvertI32U => SIG_I32_F64.clone(),
        F64ConvertI64S | F64ConvertI64U | F64ReinterpretI64 => SIG_I64_F64.clone(),
        F64PromoteF32 => SIG_F32_F64.clone(),

        MiscPrefix | VecPrefix => {
            return Err(CompileError::InternalInvariantViolation(
                "prefix bytes have no signature of their own".to_string(),
            ))
        }
    };
    Ok(sig)
}

fn local_kind(local_kinds: &[ValueKind], index: u32) -> Result<ValueKind, CompileError> {
    local_kinds
        .get(index as usize)
        .copied()
        .ok_or(CompileError::IndexOutOfRange("local", index))
}

/// Row for `select` with an explicit type annotation.
pub fn typed_select_signature(kind: ValueKind) -> OpSignature {
    OpSignature::owned(vec![kind, kind, I32], vec![kind])
}

/// Signature of a `0xFC`-space opcode. All rows are static.
pub fn misc_signature(op: MiscOpCode) -> &'static OpSignature {
    use MiscOpCode::*;
    match op {
        I32TruncSatF32S | I32TruncSatF32U => &SIG_F32_I32,
        I32TruncSatF64S | I32TruncSatF64U => &SIG_F64_I32,
        I64TruncSatF32S | I64TruncSatF32U => &SIG_F32_I64,
        I64TruncSatF64S | I64TruncSatF64U => &SIG_F64_I64,
        MemoryInit | MemoryCopy | MemoryFill | TableInit | TableCopy => &SIG_I32I32I32_NONE,
        DataDrop | ElemDrop => &SIG_NONE_NONE,
        TableGrow => &SIG_I64I32_I32,
        TableSize => &SIG_NONE_I32,
        TableFill => &SIG_I32I64I32_NONE,
    }
}

/// Signature of a `0xFD`-space (SIMD) opcode. All rows are static.
pub fn vec_signature(op: VecOpCode) -> &'static OpSignature {
    use VecOpCode::*;
    match op {
        V128Const => &SIG_NONE_V128,
        V128Load | V128Load8x8S | V128Load8x8U | V128Load16x4S | V128Load16x4U | V128Load32x2S
        | V128Load32x2U | V128Load8Splat | V128Load16Splat | V128Load32Splat | V128Load64Splat
        | V128Load32Zero | V128Load64Zero => &SIG_I32_V128,
        V128Load8Lane | V128Load16Lane | V128Load32Lane | V128Load64Lane => &SIG_I32V128_V128,
        V128Store | V128Store8Lane | V128Store16Lane | V128Store32Lane | V128Store64Lane => {
            &SIG_I32V128_NONE
        }

        I8x16Splat | I16x8Splat | I32x4Splat => &SIG_I32_V128,
        I64x2Splat => &SIG_I64_V128,
        F32x4Splat => &SIG_F32_V128,
        F64x2Splat => &SIG_F64_V128,

        I8x16ExtractLaneS | I8x16ExtractLaneU | I16x8ExtractLaneS | I16x8ExtractLaneU
        | I32x4ExtractLane => &SIG_V128_I32,
        I64x2ExtractLane => &SIG_V128_I64,
        F32x4ExtractLane => &SIG_V128_F32,
        F64x2ExtractLane => &SIG_V128_F64,
        I8x16ReplaceLane | I16x8ReplaceLane | I32x4ReplaceLane => &SIG_V128I32_V128,
        I64x2ReplaceLane => &SIG_V128I64_V128,
        F32x4ReplaceLane => &SIG_V128F32_V128,
        F64x2ReplaceLane => &SIG_V128F64_V128,

        I8x16Shuffle | I8x16Swizzle => &SIG_V128V128_V128,

        I8x16Eq | I8x16Ne | I8x16LtS | I8x16LtU | I8x16GtS | I8x16GtU | I8x16LeS | I8x16LeU
        | I8x16GeS | I8x16GeU | I16x8Eq | I16x8Ne | I16x8LtS | I16x8LtU | I16x8GtS | I16x8GtU
        | I16x8LeS | I16x8LeU | I16x8GeS | I16x8GeU | I32x4Eq | I32x4Ne | I32x4LtS | I32x4LtU
        | I32x4GtS | I32x4GtU | I32x4LeS | I32x4LeU | I32x4GeS | I32x4GeU | I64x2Eq | I64x2Ne
        | I64x2LtS | I64x2GtS | I64x2LeS | I64x2GeS | F32x4Eq | F32x4Ne | F32x4Lt | F32x4Gt
        | F32x4Le | F32x4Ge | F64x2Eq | F64x2Ne | F64x2Lt | F64x2Gt | F64x2Le | F64x2Ge => {
            &SIG_V128V128_V128
        }

        V128Not => &SIG_V128_V128,
        V128And | V128AndNot | V128Or | V128Xor => &SIG_V128V128_V128,
        V128Bitselect => &SIG_V128V128V128_V128,
        V128AnyTrue => &SIG_V128_I32,

        F32x4DemoteF64x2Zero | F64x2PromoteLowF32x4 => &SIG_V128_V128,

        I8x16Abs | I8x16Neg | I8x16Popcnt => &SIG_V128_V128,
        I8x16AllTrue | I8x16Bitmask => &SIG_V128_I32,
        I8x16NarrowI16x8S | I8x16NarrowI16x8U => &SIG_V128V128_V128,
        F32x4Ceil | F32x4Floor | F32x4Trunc | F32x4Nearest => &SIG_V128_V128,
        I8x16Shl | I8x16ShrS | I8x16ShrU => &SIG_V128I32_V128,
        I8x16Add | I8x16AddSatS | I8x16AddSatU | I8x16Sub | I8x16SubSatS | I8x16SubSatU => {
            &SIG_V128V128_V128
        }
        F64x2Ceil | F64x2Floor | F64x2Trunc | F64x2Nearest => &SIG_V128_V128,
        I8x16MinS | I8x16MinU | I8x16MaxS | I8x16MaxU | I8x16AvgrU => &SIG_V128V128_V128,

        I16x8ExtAddPairwiseI8x16S | I16x8ExtAddPairwiseI8x16U | I32x4ExtAddPairwiseI16x8S
        | I32x4ExtAddPairwiseI16x8U => &SIG_V128_V128,

        I16x8Abs | I16x8Neg => &SIG_V128_V128,
        I16x8Q15MulrSatS => &SIG_V128V128_V128,
        I16x8AllTrue | I16x8Bitmask => &SIG_V128_I32,
        I16x8NarrowI32x4S | I16x8NarrowI32x4U => &SIG_V128V128_V128,
        I16x8ExtendLowI8x16S | I16x8ExtendHighI8x16S | I16x8ExtendLowI8x16U
        | I16x8ExtendHighI8x16U => &SIG_V128_V128,
        I16x8Shl | I16x8ShrS | I16x8ShrU => &SIG_V128I32_V128,
        I16x8Add | I16x8AddSatS | I16x8AddSatU | I16x8Sub | I16x8SubSatS | I16x8SubSatU
        | I16x8Mul | I16x8MinS | I16x8MinU | I16x8MaxS | I16x8MaxU | I16x8AvgrU
        | I16x8ExtMulLowI8x16S | I16x8ExtMulHighI8x16S | I16x8ExtMulLowI8x16U
        | I16x8ExtMulHighI8x16U => &SIG_V128V128_V128,

        I32x4Abs | I32x4Neg => &SIG_V128_V128,
        I32x4AllTrue | I32x4Bitmask => &SIG_V128_I32,
        I32x4ExtendLowI16x8S | I32x4ExtendHighI16x8S | I32x4ExtendLowI16x8U
        | I32x4ExtendHighI16x8U => &SIG_V128_V128,
        I32x4Shl | I32x4ShrS | I32x4ShrU => &SIG_V128I32_V128,
        I32x4Add | I32x4Sub | I32x4Mul | I32x4MinS | I32x4MinU | I32x4MaxS | I32x4MaxU
        | I32x4DotI16x8S | I32x4ExtMulLowI16x8S | I32x4ExtMulHighI16x8S | I32x4ExtMulLowI16x8U
        | I32x4ExtMulHighI16x8U => &SIG_V128V128_V128,

        I64x2Abs | I64x2Neg => &SIG_V128_V128,
        I64x2AllTrue | I64x2Bitmask => &SIG_V128_I32,
        I64x2ExtendLowI32x4S | I64x2ExtendHighI32x4S | I64x2ExtendLowI32x4U
        | I64x2ExtendHighI32x4U => &SIG_V128_V128,
        I64x2Shl | I64x2ShrS | I64x2ShrU => &SIG_V128I32_V128,
        I64x2Add | I64x2Sub | I64x2Mul | I64x2ExtMulLowI32x4S | I64x2ExtMulHighI32x4S
        | I64x2ExtMulLowI32x4U | I64x2ExtMulHighI32x4U => &SIG_V128V128_V128,

        F32x4Abs | F32x4Neg | F32x4Sqrt | F64x2Abs | F64x2Neg | F64x2Sqrt => &SIG_V128_V128,
        F32x4Add | F32x4Sub | F32x4Mul | F32x4Div | F32x4Min | F32x4Max | F32x4Pmin | F32x4Pmax
        | F64x2Add | F64x2Sub | F64x2Mul | F64x2Div | F64x2Min | F64x2Max | F64x2Pmin
        | F64x2Pmax => &SIG_V128V128_V128,

        I32x4TruncSatF32x4S | I32x4TruncSatF32x4U | F32x4ConvertI32x4S | F32x4ConvertI32x4U
        | I32x4TruncSatF64x2SZero | I32x4TruncSatF64x2UZero | F64x2ConvertLowI32x4S
        | F64x2ConvertLowI32x4U => &SIG_V128_V128,
    }
}
