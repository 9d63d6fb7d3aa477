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

use crate::compile::CompileError;
use std::io::{BufRead, Cursor, Read};
use varint_rs::VarintReader;

/// Cursor over a byte slice with the readers the binary format needs:
/// unsigned LEB128 via `varint-rs`, hand-decoded signed LEB128 (the wasm
/// encoding is two's-complement LEB, not the zigzag form varint crates
/// implement), little-endian floats, and fixed 16-byte immediates.
pub struct LEB128Reader<'a> {
    cursor: Cursor<&'a [u8]>,
    len: usize,
}

impl<'a> LEB128Reader<'a> {
    pub fn new(slice: &'a [u8], start_position: usize) -> Self {
        let mut cursor = Cursor::new(slice);
        cursor.set_position(start_position as u64);
        Self {
            cursor,
            len: slice.len(),
        }
    }

    pub fn remaining(&self) -> isize {
        self.len as isize - self.cursor.position() as isize
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn advance(&mut self, offset: usize) {
        self.cursor.consume(offset);
    }
}

impl LEB128Reader<'_> {
    pub fn load_imm_u8(&mut self) -> Result<u8, CompileError> {
        VarintReader::read(&mut self.cursor).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "unexpected end of body at offset {}",
                self.cursor.position()
            ))
        })
    }

    pub fn load_imm_varuint32(&mut self) -> Result<u32, CompileError> {
        self.cursor.read_u32_varint().map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "bad varuint32 at offset {}",
                self.cursor.position()
            ))
        })
    }

    /// Two's-complement signed LEB128, `bits` wide (32, 33 or 64).
    fn load_signed(&mut self, bits: u32) -> Result<i64, CompileError> {
        let max_bytes = (bits + 6) / 7;
        let mut result = 0i64;
        let mut shift = 0u32;
        for _ in 0..max_bytes {
            let byte = self.load_imm_u8()?;
            result |= ((byte & 0x7F) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
        Err(CompileError::ImmediateDecode(format!(
            "varint{} over {} bytes at offset {}",
            bits,
            max_bytes,
            self.cursor.position()
        )))
    }

    pub fn load_imm_varint32(&mut self) -> Result<i32, CompileError> {
        Ok(self.load_signed(32)? as i32)
    }

    /// The s33 encoding used by block-type immediates.
    pub fn load_imm_varint33(&mut self) -> Result<i64, CompileError> {
        self.load_signed(33)
    }

    pub fn load_imm_varint64(&mut self) -> Result<i64, CompileError> {
        self.load_signed(64)
    }

    pub fn load_imm_f32(&mut self) -> Result<f32, CompileError> {
        let mut buffer = [0u8; 4];
        self.cursor.read_exact(&mut buffer).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "truncated f32 at offset {}",
                self.cursor.position()
            ))
        })?;
        Ok(f32::from_le_bytes(buffer))
    }

    pub fn load_imm_f64(&mut self) -> Result<f64, CompileError> {
        let mut buffer = [0u8; 8];
        self.cursor.read_exact(&mut buffer).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "truncated f64 at offset {}",
                self.cursor.position()
            ))
        })?;
        Ok(f64::from_le_bytes(buffer))
    }

    /// The 16-byte immediate of `v128.const` and `i8x16.shuffle`.
    pub fn load_imm_bytes16(&mut self) -> Result<[u8; 16], CompileError> {
        let mut buffer = [0u8; 16];
        self.cursor.read_exact(&mut buffer).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "truncated 16-byte immediate at offset {}",
                self.cursor.position()
            ))
        })?;
        Ok(buffer)
    }

    pub fn load_string(&mut self) -> Result<String, CompileError> {
        let length = self.load_imm_varuint32()? as usize;
        let mut buffer = vec![0u8; length];
        self.cursor.read_exact(&mut buffer).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "truncated string of length {} at offset {}",
                length,
                self.cursor.position()
            ))
        })?;
        String::from_utf8(buffer).map_err(|_| {
            CompileError::ImmediateDecode(format!(
                "invalid utf-8 string at offset {}",
                self.cursor.position()
            ))
        })
    }

    /// Length-prefixed raw byte region; returns its start and (exclusive)
    /// end offsets and skips over it.
    pub fn load_data(&mut self) -> Result<(usize, usize), CompileError> {
        let length = self.load_imm_varuint32()? as usize;
        let start = self.cursor.position() as usize;
        let end = start + length;
        self.cursor.consume(length);
        Ok((start, end))
    }

    pub fn load_array_varu32(&mut self) -> Result<Vec<u32>, CompileError> {
        let num_elements = self.load_imm_varuint32()? as usize;
        let mut values = Vec::with_capacity(num_elements);
        for _ in 0..num_elements {
            values.push(self.load_imm_varuint32()?);
        }
        Ok(values)
    }
}
