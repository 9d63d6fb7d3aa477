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

#[cfg(test)]
mod tests {
    use wasir::{
        compile_module, CompilationResult, CompileOptions, Features, InclusiveRange, Label,
        MemArg, Module, Operation, Shape, V128CmpKind, V128LoadKind,
    };

    fn compile(wat: &str) -> Vec<CompilationResult> {
        let binary = wat::parse_str(wat).unwrap();
        let module = Module::load(&binary, Features::default()).unwrap();
        compile_module(&module, &CompileOptions::default()).unwrap()
    }

    fn first(wat: &str) -> CompilationResult {
        compile(wat).remove(0)
    }

    /// Compile `(param v128) (result v128) local.get 0 <text>` and return
    /// the one translated operation.
    fn unary_v128(text: &str) -> Operation {
        let result = first(&format!(
            "(module (func (param v128) (result v128) local.get 0 {text}))"
        ));
        assert_eq!(result.operations.len(), 4, "{text}: {:?}", result.operations);
        assert_eq!(
            result.operations[2],
            Operation::Drop(InclusiveRange::new(2, 3))
        );
        result.operations[1].clone()
    }

    /// Compile a two-v128-operand body and return the translated operation.
    fn binary_v128(text: &str) -> Operation {
        let result = first(&format!(
            "(module (func (param v128 v128) (result v128) local.get 0 local.get 1 {text}))"
        ));
        assert_eq!(result.operations.len(), 5, "{text}: {:?}", result.operations);
        result.operations[2].clone()
    }

    /// Compile a v128-to-i32 body and return the translated operation.
    fn scalarizing_v128(text: &str) -> Operation {
        let result = first(&format!(
            "(module (func (param v128) (result i32) local.get 0 {text}))"
        ));
        assert_eq!(result.operations.len(), 4, "{text}: {:?}", result.operations);
        result.operations[1].clone()
    }

    /// Compile a v128-by-i32 shift body and return the translated
    /// operation.
    fn shift_v128(text: &str) -> Operation {
        let result = first(&format!(
            "(module (func (param v128 i32) (result v128) local.get 0 local.get 1 {text}))"
        ));
        assert_eq!(result.operations.len(), 5, "{text}: {:?}", result.operations);
        result.operations[2].clone()
    }

    #[test]
    fn v128_const_packs_little_endian_words() {
        let result = first(
            r#"(module (func (result v128)
                v128.const i32x4 1 0 2 0))"#,
        );
        assert_eq!(
            result.operations,
            vec![
                Operation::ConstV128 { lo: 1, hi: 2 },
                Operation::Br(Label::ret()),
            ]
        );
    }

    #[test]
    fn v128_loads_and_stores() {
        let result = first(
            r#"(module (memory 1)
                (func (param i32)
                    local.get 0
                    local.get 0
                    v128.load
                    v128.load64_lane align=1 1
                    drop
                    local.get 0
                    local.get 0
                    v128.load8_splat
                    local.get 0
                    v128.load32_zero
                    i8x16.add
                    v128.store offset=8))"#,
        );
        assert!(result.uses_memory);
        assert_eq!(
            result.operations[2],
            Operation::V128Load {
                kind: V128LoadKind::K128,
                arg: MemArg { align: 4, offset: 0 },
            }
        );
        assert_eq!(
            result.operations[3],
            Operation::V128LoadLane {
                lane: 1,
                lane_size_bits: 64,
                arg: MemArg { align: 0, offset: 0 },
            }
        );
        assert!(result.operations.contains(&Operation::V128Load {
            kind: V128LoadKind::K8Splat,
            arg: MemArg { align: 0, offset: 0 },
        }));
        assert!(result.operations.contains(&Operation::V128Load {
            kind: V128LoadKind::K32Zero,
            arg: MemArg { align: 2, offset: 0 },
        }));
        assert!(result.operations.iter().any(|op| matches!(
            op,
            Operation::V128Store {
                arg: MemArg { offset: 8, .. }
            }
        )));
    }

    #[test]
    fn lane_extract_and_replace() {
        let result = first(
            r#"(module (func (param v128) (result i32)
                local.get 0
                i8x16.extract_lane_s 3))"#,
        );
        assert_eq!(
            result.operations,
            vec![
                Operation::Pick {
                    depth: 1,
                    is_v128: true
                },
                Operation::V128ExtractLane {
                    lane: 3,
                    signed: true,
                    shape: Shape::I8x16,
                },
                Operation::Drop(InclusiveRange::new(1, 2)),
                Operation::Br(Label::ret()),
            ]
        );

        let result = first(
            r#"(module (func (param v128 i32) (result v128)
                local.get 0
                local.get 1
                i32x4.replace_lane 2))"#,
        );
        assert_eq!(
            result.operations,
            vec![
                Operation::Pick {
                    depth: 2,
                    is_v128: true
                },
                Operation::Pick {
                    depth: 2,
                    is_v128: false
                },
                Operation::V128ReplaceLane {
                    lane: 2,
                    shape: Shape::I32x4,
                },
                Operation::Drop(InclusiveRange::new(2, 4)),
                Operation::Br(Label::ret()),
            ]
        );
    }

    #[test]
    fn shuffle_carries_its_lane_map() {
        let result = first(
            r#"(module (func (param v128 v128) (result v128)
                local.get 0
                local.get 1
                i8x16.shuffle 0 1 2 3 4 5 6 7 24 25 26 27 28 29 30 31))"#,
        );
        assert_eq!(
            result.operations[2],
            Operation::V128Shuffle([
                0, 1, 2, 3, 4, 5, 6, 7, 24, 25, 26, 27, 28, 29, 30, 31
            ])
        );
    }

    #[test]
    fn lane_wise_arithmetic() {
        assert_eq!(binary_v128("i8x16.add"), Operation::V128Add(Shape::I8x16));
        assert_eq!(
            binary_v128("i16x8.add_sat_s"),
            Operation::V128AddSat {
                shape: Shape::I16x8,
                signed: true
            }
        );
        assert_eq!(
            binary_v128("i8x16.sub_sat_u"),
            Operation::V128SubSat {
                shape: Shape::I8x16,
                signed: false
            }
        );
        assert_eq!(binary_v128("i64x2.mul"), Operation::V128Mul(Shape::I64x2));
        assert_eq!(binary_v128("f32x4.div"), Operation::V128Div(Shape::F32x4));
        assert_eq!(
            binary_v128("i16x8.min_u"),
            Operation::V128Min {
                shape: Shape::I16x8,
                signed: false
            }
        );
        assert_eq!(
            binary_v128("f64x2.max"),
            Operation::V128Max {
                shape: Shape::F64x2,
                signed: false
            }
        );
        assert_eq!(binary_v128("f32x4.pmin"), Operation::V128Pmin(Shape::F32x4));
        assert_eq!(
            binary_v128("i16x8.avgr_u"),
            Operation::V128AvgrU(Shape::I16x8)
        );
        assert_eq!(
            binary_v128("i16x8.q15mulr_sat_s"),
            Operation::V128Q15MulrSatS
        );
        assert_eq!(binary_v128("i32x4.dot_i16x8_s"), Operation::V128Dot);
        assert_eq!(binary_v128("i8x16.swizzle"), Operation::V128Swizzle);
        assert_eq!(binary_v128("v128.andnot"), Operation::V128AndNot);
    }

    #[test]
    fn lane_wise_comparisons() {
        assert_eq!(
            binary_v128("i8x16.lt_u"),
            Operation::V128Cmp(V128CmpKind::I8x16LtU)
        );
        assert_eq!(
            binary_v128("i32x4.ge_s"),
            Operation::V128Cmp(V128CmpKind::I32x4GeS)
        );
        assert_eq!(
            binary_v128("i64x2.eq"),
            Operation::V128Cmp(V128CmpKind::I64x2Eq)
        );
        assert_eq!(
            binary_v128("f64x2.le"),
            Operation::V128Cmp(V128CmpKind::F64x2Le)
        );
    }

    #[test]
    fn unary_and_widening_shapes() {
        assert_eq!(unary_v128("v128.not"), Operation::V128Not);
        assert_eq!(unary_v128("i8x16.abs"), Operation::V128Abs(Shape::I8x16));
        assert_eq!(unary_v128("i8x16.popcnt"), Operation::V128Popcnt);
        assert_eq!(unary_v128("f64x2.sqrt"), Operation::V128Sqrt(Shape::F64x2));
        assert_eq!(unary_v128("f32x4.ceil"), Operation::V128Ceil(Shape::F32x4));
        assert_eq!(
            unary_v128("f64x2.nearest"),
            Operation::V128Nearest(Shape::F64x2)
        );
        assert_eq!(
            unary_v128("i16x8.extend_low_i8x16_s"),
            Operation::V128Extend {
                origin_shape: Shape::I8x16,
                signed: true,
                use_low: true,
            }
        );
        assert_eq!(
            unary_v128("i64x2.extend_high_i32x4_u"),
            Operation::V128Extend {
                origin_shape: Shape::I32x4,
                signed: false,
                use_low: false,
            }
        );
        assert_eq!(
            unary_v128("i32x4.extadd_pairwise_i16x8_s"),
            Operation::V128ExtAddPairwise {
                origin_shape: Shape::I16x8,
                signed: true,
            }
        );
        assert_eq!(
            unary_v128("f32x4.demote_f64x2_zero"),
            Operation::V128FloatDemote
        );
        assert_eq!(
            unary_v128("f64x2.promote_low_f32x4"),
            Operation::V128FloatPromote
        );
        assert_eq!(
            unary_v128("i32x4.trunc_sat_f32x4_s"),
            Operation::V128ITruncSatFromF {
                origin_shape: Shape::F32x4,
                signed: true,
            }
        );
        assert_eq!(
            unary_v128("i32x4.trunc_sat_f64x2_u_zero"),
            Operation::V128ITruncSatFromF {
                origin_shape: Shape::F64x2,
                signed: false,
            }
        );
        assert_eq!(
            unary_v128("f64x2.convert_low_i32x4_s"),
            Operation::V128FConvertFromI {
                dst_shape: Shape::F64x2,
                signed: true,
            }
        );
    }

    #[test]
    fn narrowing_and_widening_multiplies() {
        assert_eq!(
            binary_v128("i8x16.narrow_i16x8_s"),
            Operation::V128Narrow {
                origin_shape: Shape::I16x8,
                signed: true,
            }
        );
        assert_eq!(
            binary_v128("i16x8.narrow_i32x4_u"),
            Operation::V128Narrow {
                origin_shape: Shape::I32x4,
                signed: false,
            }
        );
        assert_eq!(
            binary_v128("i32x4.extmul_low_i16x8_s"),
            Operation::V128ExtMul {
                origin_shape: Shape::I16x8,
                signed: true,
                use_low: true,
            }
        );
        assert_eq!(
            binary_v128("i64x2.extmul_high_i32x4_u"),
            Operation::V128ExtMul {
                origin_shape: Shape::I32x4,
                signed: false,
                use_low: false,
            }
        );
    }

    #[test]
    fn shifts_and_masks() {
        assert_eq!(shift_v128("i8x16.shl"), Operation::V128Shl(Shape::I8x16));
        assert_eq!(
            shift_v128("i32x4.shr_s"),
            Operation::V128Shr {
                shape: Shape::I32x4,
                signed: true
            }
        );
        assert_eq!(
            shift_v128("i64x2.shr_u"),
            Operation::V128Shr {
                shape: Shape::I64x2,
                signed: false
            }
        );
        assert_eq!(
            scalarizing_v128("v128.any_true"),
            Operation::V128AnyTrue
        );
        assert_eq!(
            scalarizing_v128("i16x8.all_true"),
            Operation::V128AllTrue(Shape::I16x8)
        );
        assert_eq!(
            scalarizing_v128("i32x4.bitmask"),
            Operation::V128BitMask(Shape::I32x4)
        );
    }

    #[test]
    fn bitselect_takes_three_operands() {
        let result = first(
            r#"(module (func (param v128 v128 v128) (result v128)
                local.get 0
                local.get 1
                local.get 2
                v128.bitselect))"#,
        );
        assert_eq!(result.operations[3], Operation::V128Bitselect);
        // Three v128 params and one result: drop slots 2..=7.
        assert_eq!(
            result.operations[4],
            Operation::Drop(InclusiveRange::new(2, 7))
        );
    }

    #[test]
    fn splats_from_every_scalar_kind() {
        let result = first(
            r#"(module (func (param i32 i64 f32 f64)
                local.get 0
                i8x16.splat
                drop
                local.get 1
                i64x2.splat
                drop
                local.get 2
                f32x4.splat
                drop
                local.get 3
                f64x2.splat
                drop))"#,
        );
        let splats: Vec<&Operation> = result
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::V128Splat(_)))
            .collect();
        assert_eq!(
            splats,
            vec![
                &Operation::V128Splat(Shape::I8x16),
                &Operation::V128Splat(Shape::I64x2),
                &Operation::V128Splat(Shape::F32x4),
                &Operation::V128Splat(Shape::F64x2),
            ]
        );
    }

    #[test]
    fn table_bulk_operations() {
        let results = compile(
            r#"(module
                (table 4 funcref)
                (elem func $f)
                (func $f)
                (func (param i32) (result i32)
                    ref.null func
                    local.get 0
                    table.grow 0)
                (func (result i32)
                    table.size 0)
                (func (param i32)
                    i32.const 0
                    ref.null func
                    local.get 0
                    table.fill 0)
                (func
                    i32.const 0
                    i32.const 0
                    i32.const 1
                    table.init 0
                    i32.const 0
                    i32.const 0
                    i32.const 1
                    table.copy
                    elem.drop 0))"#,
        );
        assert_eq!(
            results[1].operations,
            vec![
                Operation::ConstI64(0),
                Operation::Pick {
                    depth: 1,
                    is_v128: false
                },
                Operation::TableGrow(0),
                Operation::Drop(InclusiveRange::new(1, 1)),
                Operation::Br(Label::ret()),
            ]
        );
        assert_eq!(
            results[2].operations,
            vec![Operation::TableSize(0), Operation::Br(Label::ret())]
        );
        assert_eq!(
            results[3].operations,
            vec![
                Operation::ConstI32(0),
                Operation::ConstI64(0),
                Operation::Pick {
                    depth: 2,
                    is_v128: false
                },
                Operation::TableFill(0),
                Operation::Drop(InclusiveRange::new(0, 0)),
                Operation::Br(Label::ret()),
            ]
        );
        let ops = &results[4].operations;
        assert!(ops.contains(&Operation::TableInit {
            elem_index: 0,
            table_index: 0
        }));
        assert!(ops.contains(&Operation::TableCopy {
            dst_table_index: 0,
            src_table_index: 0
        }));
        assert!(ops.contains(&Operation::ElemDrop(0)));
    }

    #[test]
    fn memory_bulk_operations() {
        let result = first(
            r#"(module
                (memory 1)
                (func (param i32)
                    local.get 0
                    i32.const 0
                    i32.const 64
                    memory.copy
                    local.get 0
                    i32.const 0xAB
                    i32.const 64
                    memory.fill))"#,
        );
        assert!(result.operations.contains(&Operation::MemoryCopy));
        assert!(result.operations.contains(&Operation::MemoryFill));
        assert!(result.uses_memory);
        assert!(!result.has_data_instances);
    }

    #[test]
    fn dead_simd_code_is_skipped_but_decoded() {
        let result = first(
            r#"(module (memory 1) (func (param i32) (result v128)
                local.get 0
                v128.load
                return
                v128.const i64x2 9 9
                i8x16.shuffle 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0
                drop))"#,
        );
        // Nothing after the return survives, including the 16-byte
        // immediates that still had to be walked over.
        assert_eq!(
            result.operations.iter().filter(|op| matches!(op, Operation::ConstV128 { .. })).count(),
            0
        );
        assert_eq!(result.operations.last(), Some(&Operation::Br(Label::ret())));
    }
}
