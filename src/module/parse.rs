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

use crate::module::leb128::LEB128Reader;
use crate::module::{
    Code, Data, ElementMode, ElementSegment, Elements, ExportEntry, FuncType, GlobalType,
    ImportExportKind, LoaderError, MemoryType, Module, ReferenceType, Region, TableType,
};
use crate::module::LoaderError::DecoderError;
use crate::{Features, ValueKind};

const SECTION_ID_CUSTOM: u8 = 0;
const SECTION_ID_TYPE: u8 = 1;
const SECTION_ID_IMPORT: u8 = 2;
const SECTION_ID_FUNCTION: u8 = 3;
const SECTION_ID_TABLE: u8 = 4;
const SECTION_ID_MEMORY: u8 = 5;
const SECTION_ID_GLOBAL: u8 = 6;
const SECTION_ID_EXPORT: u8 = 7;
const SECTION_ID_START: u8 = 8;
const SECTION_ID_ELEMENT: u8 = 9;
const SECTION_ID_CODE: u8 = 10;
const SECTION_ID_DATA: u8 = 11;
const SECTION_ID_DATA_COUNT: u8 = 12;

const MAX_MEMORY_SIZE_PAGES: u32 = 0x10000;

fn read_limits(reader: &mut LEB128Reader) -> Result<(u32, Option<u32>), LoaderError> {
    let has_maximum = reader.load_imm_u8().map_err(DecoderError)?;
    let initial = reader.load_imm_varuint32().map_err(DecoderError)?;
    let maximum = if has_maximum == 1 {
        Some(reader.load_imm_varuint32().map_err(DecoderError)?)
    } else {
        None
    };

    if initial > MAX_MEMORY_SIZE_PAGES {
        return Err(LoaderError::MalformedSection(
            "limits minimum is too large".to_string(),
        ));
    }
    if let Some(max) = maximum {
        if max > MAX_MEMORY_SIZE_PAGES {
            return Err(LoaderError::MalformedSection(
                "limits maximum is too large".to_string(),
            ));
        }
        if max < initial {
            return Err(LoaderError::MalformedSection(
                "limits maximum is less than minimum".to_string(),
            ));
        }
    }

    Ok((initial, maximum))
}

fn read_table(reader: &mut LEB128Reader) -> Result<TableType, LoaderError> {
    let ty = reader.load_imm_u8().map_err(DecoderError)?;
    let element = ReferenceType::from_u8(ty)?;
    let limits = read_limits(reader)?;
    Ok(TableType { element, limits })
}

/// Skip over a constant expression (global/element/data initializers),
/// returning its region. Only the constant opcodes validation admits there
/// are accepted.
fn scan_const_expr(reader: &mut LEB128Reader) -> Result<Region, LoaderError> {
    let start = reader.position();
    loop {
        let op = reader.load_imm_u8().map_err(DecoderError)?;
        match op {
            0x0B => return Ok((start, reader.position() - 1)),
            // i32.const / i64.const
            0x41 => {
                reader.load_imm_varint32().map_err(DecoderError)?;
            }
            0x42 => {
                reader.load_imm_varint64().map_err(DecoderError)?;
            }
            // f32.const / f64.const
            0x43 => {
                reader.load_imm_f32().map_err(DecoderError)?;
            }
            0x44 => {
                reader.load_imm_f64().map_err(DecoderError)?;
            }
            // global.get / ref.func
            0x23 | 0xD2 => {
                reader.load_imm_varuint32().map_err(DecoderError)?;
            }
            // ref.null <heaptype>
            0xD0 => {
                reader.load_imm_u8().map_err(DecoderError)?;
            }
            // v128.const
            0xFD => {
                let sub = reader.load_imm_varuint32().map_err(DecoderError)?;
                if sub != 0x0C {
                    return Err(LoaderError::InvalidConstExpression(op));
                }
                reader.load_imm_bytes16().map_err(DecoderError)?;
            }
            other => return Err(LoaderError::InvalidConstExpression(other)),
        }
    }
}

fn read_element_segment(reader: &mut LEB128Reader) -> Result<ElementSegment, LoaderError> {
    let flags = reader.load_imm_u8().map_err(DecoderError)?;

    // Bit 0: passive/declarative vs active-table-0; bit 1: explicit table
    // index (active) or declarative (non-active); bit 2: expression-encoded
    // elements.
    match flags {
        0x00 => {
            let expr = scan_const_expr(reader)?;
            let funcs = reader.load_array_varu32().map_err(DecoderError)?;
            Ok(ElementSegment {
                reftype: ReferenceType::FuncRef,
                elements: Elements::Function(funcs),
                mode: ElementMode::Active {
                    table_index: 0,
                    expr,
                },
            })
        }
        0x01 | 0x03 => {
            let elemkind = reader.load_imm_u8().map_err(DecoderError)?;
            if elemkind != 0x00 {
                return Err(LoaderError::UnsupportedElementSegment(elemkind));
            }
            let funcs = reader.load_array_varu32().map_err(DecoderError)?;
            Ok(ElementSegment {
                reftype: ReferenceType::FuncRef,
                elements: Elements::Function(funcs),
                mode: if flags == 0x01 {
                    ElementMode::Passive
                } else {
                    ElementMode::Declarative
                },
            })
        }
        0x02 => {
            let table_index = reader.load_imm_varuint32().map_err(DecoderError)?;
            let expr = scan_const_expr(reader)?;
            let elemkind = reader.load_imm_u8().map_err(DecoderError)?;
            if elemkind != 0x00 {
                return Err(LoaderError::UnsupportedElementSegment(elemkind));
            }
            let funcs = reader.load_array_varu32().map_err(DecoderError)?;
            Ok(ElementSegment {
                reftype: ReferenceType::FuncRef,
                elements: Elements::Function(funcs),
                mode: ElementMode::Active { table_index, expr },
            })
        }
        0x04 => {
            let expr = scan_const_expr(reader)?;
            let exprs = read_element_exprs(reader)?;
            Ok(ElementSegment {
                reftype: ReferenceType::FuncRef,
                elements: Elements::Expression(exprs),
                mode: ElementMode::Active {
                    table_index: 0,
                    expr,
                },
            })
        }
        0x05 | 0x07 => {
            let reftype = reader.load_imm_u8().map_err(DecoderError)?;
            let reftype = ReferenceType::from_u8(reftype)?;
            let exprs = read_element_exprs(reader)?;
            Ok(ElementSegment {
                reftype,
                elements: Elements::Expression(exprs),
                mode: if flags == 0x05 {
                    ElementMode::Passive
                } else {
                    ElementMode::Declarative
                },
            })
        }
        0x06 => {
            let table_index = reader.load_imm_varuint32().map_err(DecoderError)?;
            let expr = scan_const_expr(reader)?;
            let reftype = reader.load_imm_u8().map_err(DecoderError)?;
            let reftype = ReferenceType::from_u8(reftype)?;
            let exprs = read_element_exprs(reader)?;
            Ok(ElementSegment {
                reftype,
                elements: Elements::Expression(exprs),
                mode: ElementMode::Active { table_index, expr },
            })
        }
        other => Err(LoaderError::UnsupportedElementSegment(other)),
    }
}

fn read_element_exprs(reader: &mut LEB128Reader) -> Result<Vec<Region>, LoaderError> {
    let count = reader.load_imm_varuint32().map_err(DecoderError)? as usize;
    let mut exprs = Vec::with_capacity(count);
    for _ in 0..count {
        exprs.push(scan_const_expr(reader)?);
    }
    Ok(exprs)
}

impl Module {
    pub fn load(module_data: &[u8], features: Features) -> Result<Self, LoaderError> {
        if module_data.len() < 4 || &module_data[0..4] != b"\0asm" {
            return Err(LoaderError::InvalidMagicNumber);
        }
        if module_data.len() < 8 {
            return Err(LoaderError::InvalidVersion);
        }
        let version = u32::from_le_bytes(
            module_data[4..8]
                .try_into()
                .map_err(|_| LoaderError::InvalidVersion)?,
        );
        if version != 1 {
            return Err(LoaderError::InvalidVersion);
        }

        let mut reader = LEB128Reader::new(module_data, 8);
        let mut types = vec![];
        let mut functions = vec![];
        let mut imported_function_count = 0u32;
        let mut globals = vec![];
        let mut tables = vec![];
        let mut memory: Option<MemoryType> = None;
        let mut data = vec![];
        let mut data_count = None;
        let mut element_segments = vec![];
        let mut exports = vec![];
        let mut start_function = None;
        let mut code = vec![];

        while reader.remaining() > 0 {
            let section_type = reader.load_imm_u8().map_err(DecoderError)?;
            let section_length = reader.load_imm_varuint32().map_err(DecoderError)? as usize;
            let section_offset = reader.position();

            match section_type {
                SECTION_ID_CUSTOM => {
                    reader.advance(section_length);
                }
                SECTION_ID_TYPE => {
                    let func_types = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..func_types {
                        let marker = reader.load_imm_u8().map_err(DecoderError)?;
                        if marker != 0x60 {
                            return Err(LoaderError::InvalidFunctionType(marker));
                        }
                        let num_params = reader.load_imm_varuint32().map_err(DecoderError)?;
                        let mut params = Vec::with_capacity(num_params as usize);
                        for _ in 0..num_params {
                            params.push(ValueKind::read(&mut reader)?);
                        }
                        let num_results = reader.load_imm_varuint32().map_err(DecoderError)?;
                        let mut results = Vec::with_capacity(num_results as usize);
                        for _ in 0..num_results {
                            results.push(ValueKind::read(&mut reader)?);
                        }
                        types.push(FuncType::new(params, results));
                    }
                }
                SECTION_ID_IMPORT => {
                    let num_imports = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_imports {
                        // Module and field names are irrelevant to this
                        // pass; only the index-space effects matter.
                        reader.load_string().map_err(DecoderError)?;
                        reader.load_string().map_err(DecoderError)?;
                        let kind = reader.load_imm_u8().map_err(DecoderError)?;
                        match ImportExportKind::from_u8(kind)? {
                            ImportExportKind::Function => {
                                let type_index =
                                    reader.load_imm_varuint32().map_err(DecoderError)?;
                                functions.push(type_index);
                                imported_function_count += 1;
                            }
                            ImportExportKind::Table => {
                                tables.push(read_table(&mut reader)?);
                            }
                            ImportExportKind::Memory => {
                                let limits = read_limits(&mut reader)?;
                                if memory.is_some() {
                                    return Err(LoaderError::MalformedSection(
                                        "multiple memories".to_string(),
                                    ));
                                }
                                memory = Some(MemoryType {
                                    min_pages: limits.0,
                                    max_pages: limits.1,
                                });
                            }
                            ImportExportKind::Global => {
                                let kind = ValueKind::read(&mut reader)?;
                                let mutable =
                                    reader.load_imm_u8().map_err(DecoderError)? == 1;
                                globals.push(GlobalType {
                                    kind,
                                    mutable,
                                    init: None,
                                });
                            }
                        }
                    }
                }
                SECTION_ID_FUNCTION => {
                    let num_functions = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_functions {
                        functions.push(reader.load_imm_varuint32().map_err(DecoderError)?);
                    }
                }
                SECTION_ID_TABLE => {
                    let num_tables = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_tables {
                        tables.push(read_table(&mut reader)?);
                    }
                }
                SECTION_ID_MEMORY => {
                    let num_memories = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_memories {
                        let limits = read_limits(&mut reader)?;
                        if memory.is_some() {
                            return Err(LoaderError::MalformedSection(
                                "multiple memories".to_string(),
                            ));
                        }
                        memory = Some(MemoryType {
                            min_pages: limits.0,
                            max_pages: limits.1,
                        });
                    }
                }
                SECTION_ID_GLOBAL => {
                    let num_globals = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_globals {
                        let kind = ValueKind::read(&mut reader)?;
                        let mutable = reader.load_imm_u8().map_err(DecoderError)? == 1;
                        let init = scan_const_expr(&mut reader)?;
                        globals.push(GlobalType {
                            kind,
                            mutable,
                            init: Some(init),
                        });
                    }
                }
                SECTION_ID_EXPORT => {
                    let num_exports = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_exports {
                        let name = reader.load_string().map_err(DecoderError)?;
                        let kind = reader.load_imm_u8().map_err(DecoderError)?;
                        let kind = ImportExportKind::from_u8(kind)?;
                        let index = reader.load_imm_varuint32().map_err(DecoderError)?;
                        exports.push(ExportEntry { name, kind, index });
                    }
                }
                SECTION_ID_START => {
                    start_function = Some(reader.load_imm_varuint32().map_err(DecoderError)?);
                }
                SECTION_ID_ELEMENT => {
                    let num_segments = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_segments {
                        element_segments.push(read_element_segment(&mut reader)?);
                    }
                }
                SECTION_ID_CODE => {
                    let num_functions = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_functions {
                        let mut code_size =
                            reader.load_imm_varuint32().map_err(DecoderError)? as usize;
                        // The size covers the locals block; chop it off
                        // after reading them.
                        let before_locals = reader.position();
                        let num_decls = reader.load_imm_varuint32().map_err(DecoderError)?;
                        let mut local_kinds = vec![];
                        for _ in 0..num_decls {
                            let count = reader.load_imm_varuint32().map_err(DecoderError)?;
                            // Guard against absurd run-length counts in a
                            // malformed module.
                            if count >= 0x40000000 {
                                return Err(LoaderError::MalformedSection(
                                    "too many locals in a function".to_string(),
                                ));
                            }
                            let kind = ValueKind::read(&mut reader)?;
                            for _ in 0..count {
                                local_kinds.push(kind);
                            }
                        }
                        code_size -= reader.position() - before_locals;
                        let body = (reader.position(), reader.position() + code_size);
                        reader.advance(code_size);
                        code.push(Code { local_kinds, body });
                    }
                }
                SECTION_ID_DATA => {
                    let num_segments = reader.load_imm_varuint32().map_err(DecoderError)?;
                    for _ in 0..num_segments {
                        let segment_type = reader.load_imm_varuint32().map_err(DecoderError)?;
                        match segment_type {
                            0 => {
                                let expr = scan_const_expr(&mut reader)?;
                                let region = reader.load_data().map_err(DecoderError)?;
                                data.push(Data::Active { expr, data: region });
                            }
                            1 => {
                                let region = reader.load_data().map_err(DecoderError)?;
                                data.push(Data::Passive { data: region });
                            }
                            2 => {
                                let memidx = reader.load_imm_varuint32().map_err(DecoderError)?;
                                let expr = scan_const_expr(&mut reader)?;
                                let region = reader.load_data().map_err(DecoderError)?;
                                data.push(Data::ActiveMemIdx {
                                    memidx,
                                    expr,
                                    data: region,
                                });
                            }
                            other => {
                                return Err(LoaderError::MalformedSection(format!(
                                    "invalid data segment type {other}"
                                )))
                            }
                        }
                    }
                }
                SECTION_ID_DATA_COUNT => {
                    data_count = Some(reader.load_imm_varuint32().map_err(DecoderError)?);
                }
                other => return Err(LoaderError::InvalidSectionType(other)),
            }

            if reader.position() != section_offset + section_length
                && section_type != SECTION_ID_CUSTOM
            {
                return Err(LoaderError::MalformedSection(format!(
                    "section {section_type} declared {section_length} bytes, consumed {}",
                    reader.position() - section_offset
                )));
            }
        }

        Ok(Module {
            module_data: module_data.to_vec(),
            version,
            types,
            functions,
            imported_function_count,
            globals,
            tables,
            memory,
            data,
            data_count,
            element_segments,
            exports,
            start_function,
            code,
            features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(wat: &str) -> Module {
        let binary = wat::parse_str(wat).unwrap();
        Module::load(&binary, Features::default()).unwrap()
    }

    #[test]
    fn section_loading() {
        let module = load(
            r#"(module
                (import "env" "mul" (func (param i32) (result i32)))
                (table 32 funcref)
                (memory 1)
                (global i32 (i32.const 7))
                (func (export "times2") (param i32) (result i32)
                    local.get 0
                    i32.const 2
                    i32.mul)
                (data (i32.const 0) "ab"))"#,
        );

        assert_eq!(module.version, 1);
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.imported_function_count, 1);
        assert_eq!(module.code.len(), 1);
        assert_eq!(
            module.tables,
            vec![TableType {
                element: ReferenceType::FuncRef,
                limits: (32, None),
            }]
        );
        assert_eq!(
            module.memory,
            Some(MemoryType {
                min_pages: 1,
                max_pages: None,
            })
        );
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.globals[0].kind, ValueKind::I32);
        assert!(!module.globals[0].mutable);
        assert_eq!(module.data.len(), 1);
        assert_eq!(module.data_instance_count(), 1);
        assert_eq!(
            module.exports,
            vec![ExportEntry {
                name: "times2".to_string(),
                kind: ImportExportKind::Function,
                index: 1,
            }]
        );

        // Both functions share type 0 in the combined index space.
        let ft = module.type_of_function(1).unwrap();
        assert_eq!(ft.params, vec![ValueKind::I32]);
        assert_eq!(ft.results, vec![ValueKind::I32]);
        assert_eq!(ft.param_slots, 1);
    }

    #[test]
    fn locals_are_expanded_per_declaration() {
        let module = load(
            r#"(module
                (func (param i64) (local i32 i32) (local v128)
                    nop))"#,
        );
        assert_eq!(
            module.code[0].local_kinds,
            vec![ValueKind::I32, ValueKind::I32, ValueKind::V128]
        );
        // The body region must point at the opcodes, past the locals block.
        let body = module.code_body(0);
        assert_eq!(body.last(), Some(&0x0B));
    }

    #[test]
    fn data_count_section_is_surfaced() {
        let module = load(
            r#"(module
                (memory 1)
                (func
                    i32.const 0
                    i32.const 0
                    i32.const 1
                    memory.init 0
                    data.drop 0)
                (data "x"))"#,
        );
        assert_eq!(module.data_count, Some(1));
        assert_eq!(module.data_instance_count(), 1);
    }

    #[test]
    fn start_section_is_recorded() {
        let module = load(
            r#"(module
                (func)
                (func $main)
                (start $main))"#,
        );
        assert_eq!(module.start_function, Some(1));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = Module::load(b"\0msa\x01\0\0\0", Features::default());
        assert!(matches!(err, Err(LoaderError::InvalidMagicNumber)));
    }
}
