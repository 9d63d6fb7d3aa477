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

use strum_macros::FromRepr;

/// The single-byte core opcode space. Bytes that don't appear here (tail
/// calls, exceptions, GC, threads, ...) fail `from_repr` and surface as
/// unsupported opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum OpCode {
    Unreachable = 0x00,
    Nop = 0x01,
    Block = 0x02,
    Loop = 0x03,
    If = 0x04,
    Else = 0x05,
    End = 0x0B,
    Br = 0x0C,
    BrIf = 0x0D,
    BrTable = 0x0E,
    Return = 0x0F,
    Call = 0x10,
    CallIndirect = 0x11,

    Drop = 0x1A,
    Select = 0x1B,
    /// `select` with an explicit type vector (reference-types proposal).
    SelectT = 0x1C,

    LocalGet = 0x20,
    LocalSet = 0x21,
    LocalTee = 0x22,
    GlobalGet = 0x23,
    GlobalSet = 0x24,

    // Reference types proposal.
    TableGet = 0x25,
    TableSet = 0x26,
    RefNull = 0xD0,
    RefIsNull = 0xD1,
    RefFunc = 0xD2,

    LoadI32 = 0x28,
    LoadI64 = 0x29,
    LoadF32 = 0x2A,
    LoadF64 = 0x2B,

    /// Load byte, sign extend to i32.
    Load8S32 = 0x2C,
    /// Load byte, zero extend to i32.
    Load8U32 = 0x2D,
    /// Load short, sign extend to i32.
    Load16S32 = 0x2E,
    /// Load short, zero extend to i32.
    Load16U32 = 0x2F,
    /// Load byte, sign extend to i64.
    Load8S64 = 0x30,
    /// Load byte, zero extend to i64.
    Load8U64 = 0x31,
    /// Load short, sign extend to i64.
    Load16S64 = 0x32,
    /// Load short, zero extend to i64.
    Load16U64 = 0x33,
    /// Load word, sign extend to i64.
    Load32S64 = 0x34,
    /// Load word, zero extend to i64.
    Load32U64 = 0x35,

    StoreI32 = 0x36,
    StoreI64 = 0x37,
    StoreF32 = 0x38,
    StoreF64 = 0x39,
    Store8_32 = 0x3A,
    Store16_32 = 0x3B,
    Store8_64 = 0x3C,
    Store16_64 = 0x3D,
    Store32_64 = 0x3E,

    MemorySize = 0x3F,
    MemoryGrow = 0x40,

    I32Const = 0x41,
    I64Const = 0x42,
    F32Const = 0x43,
    F64Const = 0x44,

    I32Eqz = 0x45,
    I32Eq = 0x46,
    I32Ne = 0x47,
    I32LtS = 0x48,
    I32LtU = 0x49,
    I32GtS = 0x4A,
    I32GtU = 0x4B,
    I32LeS = 0x4C,
    I32LeU = 0x4D,
    I32GeS = 0x4E,
    I32GeU = 0x4F,

    I64Eqz = 0x50,
    I64Eq = 0x51,
    I64Ne = 0x52,
    I64LtS = 0x53,
    I64LtU = 0x54,
    I64GtS = 0x55,
    I64GtU = 0x56,
    I64LeS = 0x57,
    I64LeU = 0x58,
    I64GeS = 0x59,
    I64GeU = 0x5A,

    F32Eq = 0x5B,
    F32Ne = 0x5C,
    F32Lt = 0x5D,
    F32Gt = 0x5E,
    F32Le = 0x5F,
    F32Ge = 0x60,

    F64Eq = 0x61,
    F64Ne = 0x62,
    F64Lt = 0x63,
    F64Gt = 0x64,
    F64Le = 0x65,
    F64Ge = 0x66,

    I32Clz = 0x67,
    I32Ctz = 0x68,
    I32Popcnt = 0x69,
    I32Add = 0x6A,
    I32Sub = 0x6B,
    I32Mul = 0x6C,
    I32DivS = 0x6D,
    I32DivU = 0x6E,
    I32RemS = 0x6F,
    I32RemU = 0x70,
    I32And = 0x71,
    I32Or = 0x72,
    I32Xor = 0x73,
    I32Shl = 0x74,
    I32ShrS = 0x75,
    I32ShrU = 0x76,
    I32Rotl = 0x77,
    I32Rotr = 0x78,

    I64Clz = 0x79,
    I64Ctz = 0x7A,
    I64Popcnt = 0x7B,
    I64Add = 0x7C,
    I64Sub = 0x7D,
    I64Mul = 0x7E,
    I64DivS = 0x7F,
    I64DivU = 0x80,
    I64RemS = 0x81,
    I64RemU = 0x82,
    I64And = 0x83,
    I64Or = 0x84,
    I64Xor = 0x85,
    I64Shl = 0x86,
    I64ShrS = 0x87,
    I64ShrU = 0x88,
    I64Rotl = 0x89,
    I64Rotr = 0x8A,

    F32Abs = 0x8B,
    F32Neg = 0x8C,
    F32Ceil = 0x8D,
    F32Floor = 0x8E,
    F32Trunc = 0x8F,
    F32Nearest = 0x90,
    F32Sqrt = 0x91,
    F32Add = 0x92,
    F32Sub = 0x93,
    F32Mul = 0x94,
    F32Div = 0x95,
    F32Min = 0x96,
    F32Max = 0x97,
    F32Copysign = 0x98,

    F64Abs = 0x99,
    F64Neg = 0x9A,
    F64Ceil = 0x9B,
    F64Floor = 0x9C,
    F64Trunc = 0x9D,
    F64Nearest = 0x9E,
    F64Sqrt = 0x9F,
    F64Add = 0xA0,
    F64Sub = 0xA1,
    F64Mul = 0xA2,
    F64Div = 0xA3,
    F64Min = 0xA4,
    F64Max = 0xA5,
    F64Copysign = 0xA6,

    I32WrapI64 = 0xA7,
    I32TruncF32S = 0xA8,
    I32TruncF32U = 0xA9,
    I32TruncF64S = 0xAA,
    I32TruncF64U = 0xAB,
    I64ExtendI32S = 0xAC,
    I64ExtendI32U = 0xAD,
    I64TruncF32S = 0xAE,
    I64TruncF32U = 0xAF,
    I64TruncF64S = 0xB0,
    I64TruncF64U = 0xB1,

    F32ConvertI32S = 0xB2,
    F32ConvertI32U = 0xB3,
    F32ConvertI64S = 0xB4,
    F32ConvertI64U = 0xB5,
    F32DemoteF64 = 0xB6,
    F64ConvertI32S = 0xB7,
    F64ConvertI32U = 0xB8,
    F64ConvertI64S = 0xB9,
    F64ConvertI64U = 0xBA,
    F64PromoteF32 = 0xBB,

    I32ReinterpretF32 = 0xBC,
    I64ReinterpretF64 = 0xBD,
    F32ReinterpretI32 = 0xBE,
    F64ReinterpretI64 = 0xBF,

    // Sign-extension operators proposal.
    I32Extend8S = 0xC0,
    I32Extend16S = 0xC1,
    I64Extend8S = 0xC2,
    I64Extend16S = 0xC3,
    I64Extend32S = 0xC4,

    /// Prefix for the `0xFC` sub-opcode space (trunc-sat, bulk memory/table).
    MiscPrefix = 0xFC,
    /// Prefix for the `0xFD` sub-opcode space (SIMD).
    VecPrefix = 0xFD,
}

/// The `0xFC` sub-opcode space: non-trapping float-to-int conversions and
/// the bulk memory/table operations. The sub-opcode is a LEB128 u32.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum MiscOpCode {
    I32TruncSatF32S = 0x00,
    I32TruncSatF32U = 0x01,
    I32TruncSatF64S = 0x02,
    I32TruncSatF64U = 0x03,
    I64TruncSatF32S = 0x04,
    I64TruncSatF32U = 0x05,
    I64TruncSatF64S = 0x06,
    I64TruncSatF64U = 0x07,
    MemoryInit = 0x08,
    DataDrop = 0x09,
    MemoryCopy = 0x0A,
    MemoryFill = 0x0B,
    TableInit = 0x0C,
    ElemDrop = 0x0D,
    TableCopy = 0x0E,
    TableGrow = 0x0F,
    TableSize = 0x10,
    TableFill = 0x11,
}

/// The `0xFD` sub-opcode space: the full fixed-width SIMD proposal. The
/// sub-opcode is a LEB128 u32 (several values need two bytes on the wire).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum VecOpCode {
    V128Load = 0x00,
    V128Load8x8S = 0x01,
    V128Load8x8U = 0x02,
    V128Load16x4S = 0x03,
    V128Load16x4U = 0x04,
    V128Load32x2S = 0x05,
    V128Load32x2U = 0x06,
    V128Load8Splat = 0x07,
    V128Load16Splat = 0x08,
    V128Load32Splat = 0x09,
    V128Load64Splat = 0x0A,
    V128Store = 0x0B,
    V128Const = 0x0C,
    I8x16Shuffle = 0x0D,
    I8x16Swizzle = 0x0E,
    I8x16Splat = 0x0F,
    I16x8Splat = 0x10,
    I32x4Splat = 0x11,
    I64x2Splat = 0x12,
    F32x4Splat = 0x13,
    F64x2Splat = 0x14,
    I8x16ExtractLaneS = 0x15,
    I8x16ExtractLaneU = 0x16,
    I8x16ReplaceLane = 0x17,
    I16x8ExtractLaneS = 0x18,
    I16x8ExtractLaneU = 0x19,
    I16x8ReplaceLane = 0x1A,
    I32x4ExtractLane = 0x1B,
    I32x4ReplaceLane = 0x1C,
    I64x2ExtractLane = 0x1D,
    I64x2ReplaceLane = 0x1E,
    F32x4ExtractLane = 0x1F,
    F32x4ReplaceLane = 0x20,
    F64x2ExtractLane = 0x21,
    F64x2ReplaceLane = 0x22,
    I8x16Eq = 0x23,
    I8x16Ne = 0x24,
    I8x16LtS = 0x25,
    I8x16LtU = 0x26,
    I8x16GtS = 0x27,
    I8x16GtU = 0x28,
    I8x16LeS = 0x29,
    I8x16LeU = 0x2A,
    I8x16GeS = 0x2B,
    I8x16GeU = 0x2C,
    I16x8Eq = 0x2D,
    I16x8Ne = 0x2E,
    I16x8LtS = 0x2F,
    I16x8LtU = 0x30,
    I16x8GtS = 0x31,
    I16x8GtU = 0x32,
    I16x8LeS = 0x33,
    I16x8LeU = 0x34,
    I16x8GeS = 0x35,
    I16x8GeU = 0x36,
    I32x4Eq = 0x37,
    I32x4Ne = 0x38,
    I32x4LtS = 0x39,
    I32x4LtU = 0x3A,
    I32x4GtS = 0x3B,
    I32x4GtU = 0x3C,
    I32x4LeS = 0x3D,
    I32x4LeU = 0x3E,
    I32x4GeS = 0x3F,
    I32x4GeU = 0x40,
    F32x4Eq = 0x41,
    F32x4Ne = 0x42,
    F32x4Lt = 0x43,
    F32x4Gt = 0x44,
    F32x4Le = 0x45,
    F32x4Ge = 0x46,
    F64x2Eq = 0x47,
    F64x2Ne = 0x48,
    F64x2Lt = 0x49,
    F64x2Gt = 0x4A,
    F64x2Le = 0x4B,
    F64x2Ge = 0x4C,
    V128Not = 0x4D,
    V128And = 0x4E,
    V128AndNot = 0x4F,
    V128Or = 0x50,
    V128Xor = 0x51,
    V128Bitselect = 0x52,
    V128AnyTrue = 0x53,
    V128Load8Lane = 0x54,
    V128Load16Lane = 0x55,
    V128Load32Lane = 0x56,
    V128Load64Lane = 0x57,
    V128Store8Lane = 0x58,
    V128Store16Lane = 0x59,
    V128Store32Lane = 0x5A,
    V128Store64Lane = 0x5B,
    V128Load32Zero = 0x5C,
    V128Load64Zero = 0x5D,
    F32x4DemoteF64x2Zero = 0x5E,
    F64x2PromoteLowF32x4 = 0x5F,
    I8x16Abs = 0x60,
    I8x16Neg = 0x61,
    I8x16Popcnt = 0x62,
    I8x16AllTrue = 0x63,
    I8x16Bitmask = 0x64,
    I8x16NarrowI16x8S = 0x65,
    I8x16NarrowI16x8U = 0x66,
    F32x4Ceil = 0x67,
    F32x4Floor = 0x68,
    F32x4Trunc = 0x69,
    F32x4Nearest = 0x6A,
    I8x16Shl = 0x6B,
    I8x16ShrS = 0x6C,
    I8x16ShrU = 0x6D,
    I8x16Add = 0x6E,
    I8x16AddSatS = 0x6F,
    I8x16AddSatU = 0x70,
    I8x16Sub = 0x71,
    I8x16SubSatS = 0x72,
    I8x16SubSatU = 0x73,
    F64x2Ceil = 0x74,
    F64x2Floor = 0x75,
    I8x16MinS = 0x76,
    I8x16MinU = 0x77,
    I8x16MaxS = 0x78,
    I8x16MaxU = 0x79,
    F64x2Trunc = 0x7A,
    I8x16AvgrU = 0x7B,
    I16x8ExtAddPairwiseI8x16S = 0x7C,
    I16x8ExtAddPairwiseI8x16U = 0x7D,
    I32x4ExtAddPairwiseI16x8S = 0x7E,
    I32x4ExtAddPairwiseI16x8U = 0x7F,
    I16x8Abs = 0x80,
    I16x8Neg = 0x81,
    I16x8Q15MulrSatS = 0x82,
    I16x8AllTrue = 0x83,
    I16x8Bitmask = 0x84,
    I16x8NarrowI32x4S = 0x85,
    I16x8NarrowI32x4U = 0x86,
    I16x8ExtendLowI8x16S = 0x87,
    I16x8ExtendHighI8x16S = 0x88,
    I16x8ExtendLowI8x16U = 0x89,
    I16x8ExtendHighI8x16U = 0x8A,
    I16x8Shl = 0x8B,
    I16x8ShrS = 0x8C,
    I16x8ShrU = 0x8D,
    I16x8Add = 0x8E,
    I16x8AddSatS = 0x8F,
    I16x8AddSatU = 0x90,
    I16x8Sub = 0x91,
    I16x8SubSatS = 0x92,
    I16x8SubSatU = 0x93,
    F64x2Nearest = 0x94,
    I16x8Mul = 0x95,
    I16x8MinS = 0x96,
    I16x8MinU = 0x97,
    I16x8MaxS = 0x98,
    I16x8MaxU = 0x99,
    I16x8AvgrU = 0x9B,
    I16x8ExtMulLowI8x16S = 0x9C,
    I16x8ExtMulHighI8x16S = 0x9D,
    I16x8ExtMulLowI8x16U = 0x9E,
    I16x8ExtMulHighI8x16U = 0x9F,
    I32x4Abs = 0xA0,
    I32x4Neg = 0xA1,
    I32x4AllTrue = 0xA3,
    I32x4Bitmask = 0xA4,
    I32x4ExtendLowI16x8S = 0xA7,
    I32x4ExtendHighI16x8S = 0xA8,
    I32x4ExtendLowI16x8U = 0xA9,
    I32x4ExtendHighI16x8U = 0xAA,
    I32x4Shl = 0xAB,
    I32x4ShrS = 0xAC,
    I32x4ShrU = 0xAD,
    I32x4Add = 0xAE,
    I32x4Sub = 0xB1,
    I32x4Mul = 0xB5,
    I32x4MinS = 0xB6,
    I32x4MinU = 0xB7,
    I32x4MaxS = 0xB8,
    I32x4MaxU = 0xB9,
    I32x4DotI16x8S = 0xBA,
    I32x4ExtMulLowI16x8S = 0xBC,
    I32x4ExtMulHighI16x8S = 0xBD,
    I32x4ExtMulLowI16x8U = 0xBE,
    I32x4ExtMulHighI16x8U = 0xBF,
    I64x2Abs = 0xC0,
    I64x2Neg = 0xC1,
    I64x2AllTrue = 0xC3,
    I64x2Bitmask = 0xC4,
    I64x2ExtendLowI32x4S = 0xC7,
    I64x2ExtendHighI32x4S = 0xC8,
    I64x2ExtendLowI32x4U = 0xC9,
    I64x2ExtendHighI32x4U = 0xCA,
    I64x2Shl = 0xCB,
    I64x2ShrS = 0xCC,
    I64x2ShrU = 0xCD,
    I64x2Add = 0xCE,
    I64x2Sub = 0xD1,
    I64x2Mul = 0xD5,
    I64x2Eq = 0xD6,
    I64x2Ne = 0xD7,
    I64x2LtS = 0xD8,
    I64x2GtS = 0xD9,
    I64x2LeS = 0xDA,
    I64x2GeS = 0xDB,
    I64x2ExtMulLowI32x4S = 0xDC,
    I64x2ExtMulHighI32x4S = 0xDD,
    I64x2ExtMulLowI32x4U = 0xDE,
    I64x2ExtMulHighI32x4U = 0xDF,
    F32x4Abs = 0xE0,
    F32x4Neg = 0xE1,
    F32x4Sqrt = 0xE3,
    F32x4Add = 0xE4,
    F32x4Sub = 0xE5,
    F32x4Mul = 0xE6,
    F32x4Div = 0xE7,
    F32x4Min = 0xE8,
    F32x4Max = 0xE9,
    F32x4Pmin = 0xEA,
    F32x4Pmax = 0xEB,
    F64x2Abs = 0xEC,
    F64x2Neg = 0xED,
    F64x2Sqrt = 0xEF,
    F64x2Add = 0xF0,
    F64x2Sub = 0xF1,
    F64x2Mul = 0xF2,
    F64x2Div = 0xF3,
    F64x2Min = 0xF4,
    F64x2Max = 0xF5,
    F64x2Pmin = 0xF6,
    F64x2Pmax = 0xF7,
    I32x4TruncSatF32x4S = 0xF8,
    I32x4TruncSatF32x4U = 0xF9,
    F32x4ConvertI32x4S = 0xFA,
    F32x4ConvertI32x4U = 0xFB,
    I32x4TruncSatF64x2SZero = 0xFC,
    I32x4TruncSatF64x2UZero = 0xFD,
    F64x2ConvertLowI32x4S = 0xFE,
    F64x2ConvertLowI32x4U = 0xFF,
}
