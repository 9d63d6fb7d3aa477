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

//! Translation of the `0xFD` (SIMD) sub-opcode space. A v128 value is one
//! abstract stack entry occupying two 64-bit slots; everything else follows
//! the same walk as the core space.

use crate::compile::{CompileError, FunctionCompiler};
use crate::op::{Operation, Shape, V128CmpKind, V128LoadKind};
use crate::opcode::VecOpCode;
use crate::sig;
use crate::Features;

impl FunctionCompiler<'_> {
    pub(crate) fn op_vec(&mut self, op: VecOpCode) -> Result<(), CompileError> {
        use VecOpCode::*;
        self.require_feature(Features::SIMD, "simd", 0xFD_0000 | op as u32)?;
        if self.unreachable {
            return self.skip_vec_immediates(op);
        }
        match op {
            V128Const => {
                let bytes = self.reader.load_imm_bytes16()?;
                let mut lo = [0u8; 8];
                let mut hi = [0u8; 8];
                lo.copy_from_slice(&bytes[0..8]);
                hi.copy_from_slice(&bytes[8..16]);
                self.apply(sig::vec_signature(op))?;
                self.emit(Operation::ConstV128 {
                    lo: u64::from_le_bytes(lo),
                    hi: u64::from_le_bytes(hi),
                });
            }

            V128Load => self.vec_load(op, V128LoadKind::K128)?,
            V128Load8x8S => self.vec_load(op, V128LoadKind::K8x8S)?,
            V128Load8x8U => self.vec_load(op, V128LoadKind::K8x8U)?,
            V128Load16x4S => self.vec_load(op, V128LoadKind::K16x4S)?,
            V128Load16x4U => self.vec_load(op, V128LoadKind::K16x4U)?,
            V128Load32x2S => self.vec_load(op, V128LoadKind::K32x2S)?,
            V128Load32x2U => self.vec_load(op, V128LoadKind::K32x2U)?,
            V128Load8Splat => self.vec_load(op, V128LoadKind::K8Splat)?,
            V128Load16Splat => self.vec_load(op, V128LoadKind::K16Splat)?,
            V128Load32Splat => self.vec_load(op, V128LoadKind::K32Splat)?,
            V128Load64Splat => self.vec_load(op, V128LoadKind::K64Splat)?,
            V128Load32Zero => self.vec_load(op, V128LoadKind::K32Zero)?,
            V128Load64Zero => self.vec_load(op, V128LoadKind::K64Zero)?,
            V128Store => {
                let arg = self.mem_arg()?;
                self.apply(sig::vec_signature(op))?;
                self.uses_memory = true;
                self.emit(Operation::V128Store { arg });
            }
            V128Load8Lane => self.vec_load_lane(op, 8)?,
            V128Load16Lane => self.vec_load_lane(op, 16)?,
            V128Load32Lane => self.vec_load_lane(op, 32)?,
            V128Load64Lane => self.vec_load_lane(op, 64)?,
            V128Store8Lane => self.vec_store_lane(op, 8)?,
            V128Store16Lane => self.vec_store_lane(op, 16)?,
            V128Store32Lane => self.vec_store_lane(op, 32)?,
            V128Store64Lane => self.vec_store_lane(op, 64)?,

            I8x16Shuffle => {
                let lanes = self.reader.load_imm_bytes16()?;
                self.apply(sig::vec_signature(op))?;
                self.emit(Operation::V128Shuffle(lanes));
            }
            I8x16Swizzle => self.vec_simple(op, Operation::V128Swizzle)?,

            I8x16Splat => self.vec_simple(op, Operation::V128Splat(Shape::I8x16))?,
            I16x8Splat => self.vec_simple(op, Operation::V128Splat(Shape::I16x8))?,
            I32x4Splat => self.vec_simple(op, Operation::V128Splat(Shape::I32x4))?,
            I64x2Splat => self.vec_simple(op, Operation::V128Splat(Shape::I64x2))?,
            F32x4Splat => self.vec_simple(op, Operation::V128Splat(Shape::F32x4))?,
            F64x2Splat => self.vec_simple(op, Operation::V128Splat(Shape::F64x2))?,

            I8x16ExtractLaneS => self.vec_extract(op, Shape::I8x16, true)?,
            I8x16ExtractLaneU => self.vec_extract(op, Shape::I8x16, false)?,
            I8x16ReplaceLane => self.vec_replace(op, Shape::I8x16)?,
            I16x8ExtractLaneS => self.vec_extract(op, Shape::I16x8, true)?,
            I16x8ExtractLaneU => self.vec_extract(op, Shape::I16x8, false)?,
            I16x8ReplaceLane => self.vec_replace(op, Shape::I16x8)?,
            I32x4ExtractLane => self.vec_extract(op, Shape::I32x4, false)?,
            I32x4ReplaceLane => self.vec_replace(op, Shape::I32x4)?,
            I64x2ExtractLane => self.vec_extract(op, Shape::I64x2, false)?,
            I64x2ReplaceLane => self.vec_replace(op, Shape::I64x2)?,
            F32x4ExtractLane => self.vec_extract(op, Shape::F32x4, false)?,
            F32x4ReplaceLane => self.vec_replace(op, Shape::F32x4)?,
            F64x2ExtractLane => self.vec_extract(op, Shape::F64x2, false)?,
            F64x2ReplaceLane => self.vec_replace(op, Shape::F64x2)?,

            I8x16Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16Eq))?,
            I8x16Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16Ne))?,
            I8x16LtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16LtS))?,
            I8x16LtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16LtU))?,
            I8x16GtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16GtS))?,
            I8x16GtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16GtU))?,
            I8x16LeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16LeS))?,
            I8x16LeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16LeU))?,
            I8x16GeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16GeS))?,
            I8x16GeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I8x16GeU))?,
            I16x8Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8Eq))?,
            I16x8Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8Ne))?,
            I16x8LtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8LtS))?,
            I16x8LtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8LtU))?,
            I16x8GtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8GtS))?,
            I16x8GtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8GtU))?,
            I16x8LeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8LeS))?,
            I16x8LeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8LeU))?,
            I16x8GeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8GeS))?,
            I16x8GeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I16x8GeU))?,
            I32x4Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4Eq))?,
            I32x4Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4Ne))?,
            I32x4LtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4LtS))?,
            I32x4LtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4LtU))?,
            I32x4GtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4GtS))?,
            I32x4GtU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4GtU))?,
            I32x4LeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4LeS))?,
            I32x4LeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4LeU))?,
            I32x4GeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4GeS))?,
            I32x4GeU => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I32x4GeU))?,
            I64x2Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2Eq))?,
            I64x2Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2Ne))?,
            I64x2LtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2LtS))?,
            I64x2GtS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2GtS))?,
            I64x2LeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2LeS))?,
            I64x2GeS => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::I64x2GeS))?,
            F32x4Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Eq))?,
            F32x4Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Ne))?,
            F32x4Lt => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Lt))?,
            F32x4Gt => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Gt))?,
            F32x4Le => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Le))?,
            F32x4Ge => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F32x4Ge))?,
            F64x2Eq => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Eq))?,
            F64x2Ne => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Ne))?,
            F64x2Lt => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Lt))?,
            F64x2Gt => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Gt))?,
            F64x2Le => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Le))?,
            F64x2Ge => self.vec_simple(op, Operation::V128Cmp(V128CmpKind::F64x2Ge))?,

            V128Not => self.vec_simple(op, Operation::V128Not)?,
            V128And => self.vec_simple(op, Operation::V128And)?,
            V128AndNot => self.vec_simple(op, Operation::V128AndNot)?,
            V128Or => self.vec_simple(op, Operation::V128Or)?,
            V128Xor => self.vec_simple(op, Operation::V128Xor)?,
            V128Bitselect => self.vec_simple(op, Operation::V128Bitselect)?,
            V128AnyTrue => self.vec_simple(op, Operation::V128AnyTrue)?,

            F32x4DemoteF64x2Zero => self.vec_simple(op, Operation::V128FloatDemote)?,
            F64x2PromoteLowF32x4 => self.vec_simple(op, Operation::V128FloatPromote)?,

            I8x16Abs => self.vec_simple(op, Operation::V128Abs(Shape::I8x16))?,
            I8x16Neg => self.vec_simple(op, Operation::V128Neg(Shape::I8x16))?,
            I8x16Popcnt => self.vec_simple(op, Operation::V128Popcnt)?,
            I8x16AllTrue => self.vec_simple(op, Operation::V128AllTrue(Shape::I8x16))?,
            I8x16Bitmask => self.vec_simple(op, Operation::V128BitMask(Shape::I8x16))?,
            I8x16NarrowI16x8S => self.vec_narrow(op, Shape::I16x8, true)?,
            I8x16NarrowI16x8U => self.vec_narrow(op, Shape::I16x8, false)?,
            I8x16Shl => self.vec_simple(op, Operation::V128Shl(Shape::I8x16))?,
            I8x16ShrS => self.vec_shr(op, Shape::I8x16, true)?,
            I8x16ShrU => self.vec_shr(op, Shape::I8x16, false)?,
            I8x16Add => self.vec_simple(op, Operation::V128Add(Shape::I8x16))?,
            I8x16AddSatS => self.vec_add_sat(op, Shape::I8x16, true)?,
            I8x16AddSatU => self.vec_add_sat(op, Shape::I8x16, false)?,
            I8x16Sub => self.vec_simple(op, Operation::V128Sub(Shape::I8x16))?,
            I8x16SubSatS => self.vec_sub_sat(op, Shape::I8x16, true)?,
            I8x16SubSatU => self.vec_sub_sat(op, Shape::I8x16, false)?,
            I8x16MinS => self.vec_min(op, Shape::I8x16, true)?,
            I8x16MinU => self.vec_min(op, Shape::I8x16, false)?,
            I8x16MaxS => self.vec_max(op, Shape::I8x16, true)?,
            I8x16MaxU => self.vec_max(op, Shape::I8x16, false)?,
            I8x16AvgrU => self.vec_simple(op, Operation::V128AvgrU(Shape::I8x16))?,

            F32x4Ceil => self.vec_simple(op, Operation::V128Ceil(Shape::F32x4))?,
            F32x4Floor => self.vec_simple(op, Operation::V128Floor(Shape::F32x4))?,
            F32x4Trunc => self.vec_simple(op, Operation::V128Trunc(Shape::F32x4))?,
            F32x4Nearest => self.vec_simple(op, Operation::V128Nearest(Shape::F32x4))?,
            F64x2Ceil => self.vec_simple(op, Operation::V128Ceil(Shape::F64x2))?,
            F64x2Floor => self.vec_simple(op, Operation::V128Floor(Shape::F64x2))?,
            F64x2Trunc => self.vec_simple(op, Operation::V128Trunc(Shape::F64x2))?,
            F64x2Nearest => self.vec_simple(op, Operation::V128Nearest(Shape::F64x2))?,

            I16x8ExtAddPairwiseI8x16S => self.vec_extadd_pairwise(op, Shape::I8x16, true)?,
            I16x8ExtAddPairwiseI8x16U => self.vec_extadd_pairwise(op, Shape::I8x16, false)?,
            I32x4ExtAddPairwiseI16x8S => self.vec_extadd_pairwise(op, Shape::I16x8, true)?,
            I32x4ExtAddPairwiseI16x8U => self.vec_extadd_pairwise(op, Shape::I16x8, false)?,

            I16x8Abs => self.vec_simple(op, Operation::V128Abs(Shape::I16x8))?,
            I16x8Neg => self.vec_simple(op, Operation::V128Neg(Shape::I16x8))?,
            I16x8Q15MulrSatS => self.vec_simple(op, Operation::V128Q15MulrSatS)?,
            I16x8AllTrue => self.vec_simple(op, Operation::V128AllTrue(Shape::I16x8))?,
            I16x8Bitmask => self.vec_simple(op, Operation::V128BitMask(Shape::I16x8))?,
            I16x8NarrowI32x4S => self.vec_narrow(op, Shape::I32x4, true)?,
            I16x8NarrowI32x4U => self.vec_narrow(op, Shape::I32x4, false)?,
            I16x8ExtendLowI8x16S => self.vec_extend(op, Shape::I8x16, true, true)?,
            I16x8ExtendHighI8x16S => self.vec_extend(op, Shape::I8x16, true, false)?,
            I16x8ExtendLowI8x16U => self.vec_extend(op, Shape::I8x16, false, true)?,
            I16x8ExtendHighI8x16U => self.vec_extend(op, Shape::I8x16, false, false)?,
            I16x8Shl => self.vec_simple(op, Operation::V128Shl(Shape::I16x8))?,
            I16x8ShrS => self.vec_shr(op, Shape::I16x8, true)?,
            I16x8ShrU => self.vec_shr(op, Shape::I16x8, false)?,
            I16x8Add => self.vec_simple(op, Operation::V128Add(Shape::I16x8))?,
            I16x8AddSatS => self.vec_add_sat(op, Shape::I16x8, true)?,
            I16x8AddSatU => self.vec_add_sat(op, Shape::I16x8, false)?,
            I16x8Sub => self.vec_simple(op, Operation::V128Sub(Shape::I16x8))?,
            I16x8SubSatS => self.vec_sub_sat(op, Shape::I16x8, true)?,
            I16x8SubSatU => self.vec_sub_sat(op, Shape::I16x8, false)?,
            I16x8Mul => self.vec_simple(op, Operation::V128Mul(Shape::I16x8))?,
            I16x8MinS => self.vec_min(op, Shape::I16x8, true)?,
            I16x8MinU => self.vec_min(op, Shape::I16x8, false)?,
            I16x8MaxS => self.vec_max(op, Shape::I16x8, true)?,
            I16x8MaxU => self.vec_max(op, Shape::I16x8, false)?,
            I16x8AvgrU => self.vec_simple(op, Operation::V128AvgrU(Shape::I16x8))?,
            I16x8ExtMulLowI8x16S => self.vec_extmul(op, Shape::I8x16, true, true)?,
            I16x8ExtMulHighI8x16S => self.vec_extmul(op, Shape::I8x16, true, false)?,
            I16x8ExtMulLowI8x16U => self.vec_extmul(op, Shape::I8x16, false, true)?,
            I16x8ExtMulHighI8x16U => self.vec_extmul(op, Shape::I8x16, false, false)?,

            I32x4Abs => self.vec_simple(op, Operation::V128Abs(Shape::I32x4))?,
            I32x4Neg => self.vec_simple(op, Operation::V128Neg(Shape::I32x4))?,
            I32x4AllTrue => self.vec_simple(op, Operation::V128AllTrue(Shape::I32x4))?,
            I32x4Bitmask => self.vec_simple(op, Operation::V128BitMask(Shape::I32x4))?,
            I32x4ExtendLowI16x8S => self.vec_extend(op, Shape::I16x8, true, true)?,
            I32x4ExtendHighI16x8S => self.vec_extend(op, Shape::I16x8, true, false)?,
            I32x4ExtendLowI16x8U => self.vec_extend(op, Shape::I16x8, false, true)?,
            I32x4ExtendHighI16x8U => self.vec_extend(op, Shape::I16x8, false, false)?,
            I32x4Shl => self.vec_simple(op, Operation::V128Shl(Shape::I32x4))?,
            I32x4ShrS => self.vec_shr(op, Shape::I32x4, true)?,
            I32x4ShrU => self.vec_shr(op, Shape::I32x4, false)?,
            I32x4Add => self.vec_simple(op, Operation::V128Add(Shape::I32x4))?,
            I32x4Sub => self.vec_simple(op, Operation::V128Sub(Shape::I32x4))?,
            I32x4Mul => self.vec_simple(op, Operation::V128Mul(Shape::I32x4))?,
            I32x4MinS => self.vec_min(op, Shape::I32x4, true)?,
            I32x4MinU => self.vec_min(op, Shape::I32x4, false)?,
            I32x4MaxS => self.vec_max(op, Shape::I32x4, true)?,
            I32x4MaxU => self.vec_max(op, Shape::I32x4, false)?,
            I32x4DotI16x8S => self.vec_simple(op, Operation::V128Dot)?,
            I32x4ExtMulLowI16x8S => self.vec_extmul(op, Shape::I16x8, true, true)?,
            I32x4ExtMulHighI16x8S => self.vec_extmul(op, Shape::I16x8, true, false)?,
            I32x4ExtMulLowI16x8U => self.vec_extmul(op, Shape::I16x8, false, true)?,
            I32x4ExtMulHighI16x8U => self.vec_extmul(op, Shape::I16x8, false, false)?,

            I64x2Abs => self.vec_simple(op, Operation::V128Abs(Shape::I64x2))?,
            I64x2Neg => self.vec_simple(op, Operation::V128Neg(Shape::I64x2))?,
            I64x2AllTrue => self.vec_simple(op, Operation::V128AllTrue(Shape::I64x2))?,
            I64x2Bitmask => self.vec_simple(op, Operation::V128BitMask(Shape::I64x2))?,
            I64x2ExtendLowI32x4S => self.vec_extend(op, Shape::I32x4, true, true)?,
            I64x2ExtendHighI32x4S => self.vec_extend(op, Shape::I32x4, true, false)?,
            I64x2ExtendLowI32x4U => self.vec_extend(op, Shape::I32x4, false, true)?,
            I64x2ExtendHighI32x4U => self.vec_extend(op, Shape::I32x4, false, false)?,
            I64x2Shl => self.vec_simple(op, Operation::V128Shl(Shape::I64x2))?,
            I64x2ShrS => self.vec_shr(op, Shape::I64x2, true)?,
            I64x2ShrU => self.vec_shr(op, Shape::I64x2, false)?,
            I64x2Add => self.vec_simple(op, Operation::V128Add(Shape::I64x2))?,
            I64x2Sub => self.vec_simple(op, Operation::V128Sub(Shape::I64x2))?,
            I64x2Mul => self.vec_simple(op, Operation::V128Mul(Shape::I64x2))?,
            I64x2ExtMulLowI32x4S => self.vec_extmul(op, Shape::I32x4, true, true)?,
            I64x2ExtMulHighI32x4S => self.vec_extmul(op, Shape::I32x4, true, false)?,
            I64x2ExtMulLowI32x4U => self.vec_extmul(op, Shape::I32x4, false, true)?,
            I64x2ExtMulHighI32x4U => self.vec_extmul(op, Shape::I32x4, false, false)?,

            F32x4Abs => self.vec_simple(op, Operation::V128Abs(Shape::F32x4))?,
            F32x4Neg => self.vec_simple(op, Operation::V128Neg(Shape::F32x4))?,
            F32x4Sqrt => self.vec_simple(op, Operation::V128Sqrt(Shape::F32x4))?,
            F32x4Add => self.vec_simple(op, Operation::V128Add(Shape::F32x4))?,
            F32x4Sub => self.vec_simple(op, Operation::V128Sub(Shape::F32x4))?,
            F32x4Mul => self.vec_simple(op, Operation::V128Mul(Shape::F32x4))?,
            F32x4Div => self.vec_simple(op, Operation::V128Div(Shape::F32x4))?,
            F32x4Min => self.vec_min(op, Shape::F32x4, false)?,
            F32x4Max => self.vec_max(op, Shape::F32x4, false)?,
            F32x4Pmin => self.vec_simple(op, Operation::V128Pmin(Shape::F32x4))?,
            F32x4Pmax => self.vec_simple(op, Operation::V128Pmax(Shape::F32x4))?,
            F64x2Abs => self.vec_simple(op, Operation::V128Abs(Shape::F64x2))?,
            F64x2Neg => self.vec_simple(op, Operation::V128Neg(Shape::F64x2))?,
            F64x2Sqrt => self.vec_simple(op, Operation::V128Sqrt(Shape::F64x2))?,
            F64x2Add => self.vec_simple(op, Operation::V128Add(Shape::F64x2))?,
            F64x2Sub => self.vec_simple(op, Operation::V128Sub(Shape::F64x2))?,
            F64x2Mul => self.vec_simple(op, Operation::V128Mul(Shape::F64x2))?,
            F64x2Div => self.vec_simple(op, Operation::V128Div(Shape::F64x2))?,
            F64x2Min => self.vec_min(op, Shape::F64x2, false)?,
            F64x2Max => self.vec_max(op, Shape::F64x2, false)?,
            F64x2Pmin => self.vec_simple(op, Operation::V128Pmin(Shape::F64x2))?,
            F64x2Pmax => self.vec_simple(op, Operation::V128Pmax(Shape::F64x2))?,

            I32x4TruncSatF32x4S => self.vec_trunc_sat(op, Shape::F32x4, true)?,
            I32x4TruncSatF32x4U => self.vec_trunc_sat(op, Shape::F32x4, false)?,
            F32x4ConvertI32x4S => self.vec_convert(op, Shape::F32x4, true)?,
            F32x4ConvertI32x4U => self.vec_convert(op, Shape::F32x4, false)?,
            I32x4TruncSatF64x2SZero => self.vec_trunc_sat(op, Shape::F64x2, true)?,
            I32x4TruncSatF64x2UZero => self.vec_trunc_sat(op, Shape::F64x2, false)?,
            F64x2ConvertLowI32x4S => self.vec_convert(op, Shape::F64x2, true)?,
            F64x2ConvertLowI32x4U => self.vec_convert(op, Shape::F64x2, false)?,
        }
        Ok(())
    }

    fn vec_simple(&mut self, op: VecOpCode, out: Operation) -> Result<(), CompileError> {
        self.apply(sig::vec_signature(op))?;
        self.emit(out);
        Ok(())
    }

    fn vec_load(&mut self, op: VecOpCode, kind: V128LoadKind) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        self.apply(sig::vec_signature(op))?;
        self.uses_memory = true;
        self.emit(Operation::V128Load { kind, arg });
        Ok(())
    }

    fn vec_load_lane(&mut self, op: VecOpCode, lane_size_bits: u8) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let lane = self.reader.load_imm_u8()?;
        self.apply(sig::vec_signature(op))?;
        self.uses_memory = true;
        self.emit(Operation::V128LoadLane {
            lane,
            lane_size_bits,
            arg,
        });
        Ok(())
    }

    fn vec_store_lane(&mut self, op: VecOpCode, lane_size_bits: u8) -> Result<(), CompileError> {
        let arg = self.mem_arg()?;
        let lane = self.reader.load_imm_u8()?;
        self.apply(sig::vec_signature(op))?;
        self.uses_memory = true;
        self.emit(Operation::V128StoreLane {
            lane,
            lane_size_bits,
            arg,
        });
        Ok(())
    }

    fn vec_extract(
        &mut self,
        op: VecOpCode,
        shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        let lane = self.reader.load_imm_u8()?;
        self.apply(sig::vec_signature(op))?;
        self.emit(Operation::V128ExtractLane {
            lane,
            signed,
            shape,
        });
        Ok(())
    }

    fn vec_replace(&mut self, op: VecOpCode, shape: Shape) -> Result<(), CompileError> {
        let lane = self.reader.load_imm_u8()?;
        self.apply(sig::vec_signature(op))?;
        self.emit(Operation::V128ReplaceLane { lane, shape });
        Ok(())
    }

    fn vec_shr(&mut self, op: VecOpCode, shape: Shape, signed: bool) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128Shr { shape, signed })
    }

    fn vec_add_sat(
        &mut self,
        op: VecOpCode,
        shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128AddSat { shape, signed })
    }

    fn vec_sub_sat(
        &mut self,
        op: VecOpCode,
        shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128SubSat { shape, signed })
    }

    fn vec_min(&mut self, op: VecOpCode, shape: Shape, signed: bool) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128Min { shape, signed })
    }

    fn vec_max(&mut self, op: VecOpCode, shape: Shape, signed: bool) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128Max { shape, signed })
    }

    fn vec_narrow(
        &mut self,
        op: VecOpCode,
        origin_shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(
            op,
            Operation::V128Narrow {
                origin_shape,
                signed,
            },
        )
    }

    fn vec_extend(
        &mut self,
        op: VecOpCode,
        origin_shape: Shape,
        signed: bool,
        use_low: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(
            op,
            Operation::V128Extend {
                origin_shape,
                signed,
                use_low,
            },
        )
    }

    fn vec_extmul(
        &mut self,
        op: VecOpCode,
        origin_shape: Shape,
        signed: bool,
        use_low: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(
            op,
            Operation::V128ExtMul {
                origin_shape,
                signed,
                use_low,
            },
        )
    }

    fn vec_extadd_pairwise(
        &mut self,
        op: VecOpCode,
        origin_shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(
            op,
            Operation::V128ExtAddPairwise {
                origin_shape,
                signed,
            },
        )
    }

    fn vec_trunc_sat(
        &mut self,
        op: VecOpCode,
        origin_shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(
            op,
            Operation::V128ITruncSatFromF {
                origin_shape,
                signed,
            },
        )
    }

    fn vec_convert(
        &mut self,
        op: VecOpCode,
        dst_shape: Shape,
        signed: bool,
    ) -> Result<(), CompileError> {
        self.vec_simple(op, Operation::V128FConvertFromI { dst_shape, signed })
    }

    fn skip_vec_immediates(&mut self, op: VecOpCode) -> Result<(), CompileError> {
        use VecOpCode::*;
        match op {
            V128Load | V128Load8x8S | V128Load8x8U | V128Load16x4S | V128Load16x4U
            | V128Load32x2S | V128Load32x2U | V128Load8Splat | V128Load16Splat
            | V128Load32Splat | V128Load64Splat | V128Load32Zero | V128Load64Zero | V128Store => {
                self.mem_arg()?;
            }
            V128Load8Lane | V128Load16Lane | V128Load32Lane | V128Load64Lane | V128Store8Lane
            | V128Store16Lane | V128Store32Lane | V128Store64Lane => {
                self.mem_arg()?;
                self.reader.load_imm_u8()?;
            }
            V128Const | I8x16Shuffle => {
                self.reader.load_imm_bytes16()?;
            }
            I8x16ExtractLaneS | I8x16ExtractLaneU | I8x16ReplaceLane | I16x8ExtractLaneS
            | I16x8ExtractLaneU | I16x8ReplaceLane | I32x4ExtractLane | I32x4ReplaceLane
            | I64x2ExtractLane | I64x2ReplaceLane | F32x4ExtractLane | F32x4ReplaceLane
            | F64x2ExtractLane | F64x2ReplaceLane => {
                self.reader.load_imm_u8()?;
            }
            _ => {}
        }
        Ok(())
    }
}
