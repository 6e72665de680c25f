// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `toon` module implements TOON: a typed, length-prefixed, self-delimiting binary token
//! stream used by every stage's `serialize_toon`/`deserialize_toon`.
//!
//! A [`Serializer`] produces a self-delimited byte stream one token at a time. A [`Deserializer`]
//! consumes the same stream; [`Deserializer::peek_token`] inspects the next token's type without
//! consuming it (used to detect delimiters such as `OBJECT_END`), and [`Deserializer::consume_token`]
//! validates and advances past an expected delimiter. The typed `read_*`/`write_*` methods handle
//! primitives directly and perform their own tag validation.

use crate::error::{state_error, Result};

/// The type of the next token in a TOON stream, as returned by [`Deserializer::peek_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    Str,
    Bool,
    Int32,
    Float,
    Double,
    FloatArray,
}

impl Token {
    fn tag(self) -> u8 {
        match self {
            Token::ObjectStart => 0,
            Token::ObjectEnd => 1,
            Token::ArrayStart => 2,
            Token::ArrayEnd => 3,
            Token::Str => 4,
            Token::Bool => 5,
            Token::Int32 => 6,
            Token::Float => 7,
            Token::Double => 8,
            Token::FloatArray => 9,
        }
    }

    fn from_tag(tag: u8) -> Option<Token> {
        Some(match tag {
            0 => Token::ObjectStart,
            1 => Token::ObjectEnd,
            2 => Token::ArrayStart,
            3 => Token::ArrayEnd,
            4 => Token::Str,
            5 => Token::Bool,
            6 => Token::Int32,
            7 => Token::Float,
            8 => Token::Double,
            9 => Token::FloatArray,
            _ => return None,
        })
    }
}

/// A writer that produces a self-delimited TOON byte stream.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn object_start(&mut self) {
        self.buf.push(Token::ObjectStart.tag());
    }

    pub fn object_end(&mut self) {
        self.buf.push(Token::ObjectEnd.tag());
    }

    pub fn array_start(&mut self) {
        self.buf.push(Token::ArrayStart.tag());
    }

    pub fn array_end(&mut self) {
        self.buf.push(Token::ArrayEnd.tag());
    }

    pub fn write_string(&mut self, s: &str) {
        self.buf.push(Token::Str.tag());
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(Token::Bool.tag());
        self.buf.push(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.push(Token::Int32.tag());
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.push(Token::Float.tag());
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.push(Token::Double.tag());
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a contiguous block of `f32`s as a single length-prefixed token.
    pub fn write_float_array(&mut self, v: &[f32]) {
        self.buf.push(Token::FloatArray.tag());
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytemuck::cast_slice(v));
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A reader that consumes a TOON byte stream produced by [`Serializer`].
pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek_tag(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| {
            state_error::<()>("unexpected end of TOON stream").unwrap_err()
        })
    }

    /// Inspect the type of the next token without consuming it.
    pub fn peek_token(&self) -> Result<Token> {
        let tag = self.peek_tag()?;
        Token::from_tag(tag)
            .ok_or_else(|| state_error::<()>("invalid TOON token tag").unwrap_err())
    }

    /// Validate that the next token matches `expected` and advance past it. Only meaningful for
    /// zero-payload delimiter tokens (`OBJECT_START/END`, `ARRAY_START/END`).
    pub fn consume_token(&mut self, expected: Token) -> Result<()> {
        let actual = self.peek_token()?;
        if actual != expected {
            return state_error(format!("expected {:?} token, found {:?}", expected, actual));
        }
        self.pos += 1;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return state_error("unexpected end of TOON stream");
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.consume_token(Token::Str)?;
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| state_error::<()>("TOON string is not valid UTF-8").unwrap_err())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.consume_token(Token::Bool)?;
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.consume_token(Token::Int32)?;
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.consume_token(Token::Float)?;
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.consume_token(Token::Double)?;
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_float_array(&mut self) -> Result<Vec<f32>> {
        self.consume_token(Token::FloatArray)?;
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let bytes = self.take(len * 4)?;
        // `bytes` is a sub-slice of the backing byte stream and not guaranteed to be aligned for
        // `f32`, so reinterpret per-element via `from_le_bytes` rather than `bytemuck::cast_slice`.
        Ok(bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_primitive_roundtrip() {
        let mut ser = Serializer::new();
        ser.object_start();
        ser.write_string("moving");
        ser.write_f32(0.5);
        ser.write_bool(true);
        ser.write_i32(-7);
        ser.write_f64(1.25);
        ser.write_float_array(&[1.0, 2.0, 3.0]);
        ser.object_end();

        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);

        de.consume_token(Token::ObjectStart).unwrap();
        assert_eq!(de.read_string().unwrap(), "moving");
        assert_eq!(de.read_f32().unwrap(), 0.5);
        assert!(de.read_bool().unwrap());
        assert_eq!(de.read_i32().unwrap(), -7);
        assert_eq!(de.read_f64().unwrap(), 1.25);
        assert_eq!(de.read_float_array().unwrap(), vec![1.0, 2.0, 3.0]);
        de.consume_token(Token::ObjectEnd).unwrap();
    }

    #[test]
    fn peek_token_does_not_advance() {
        let mut ser = Serializer::new();
        ser.array_start();
        ser.array_end();
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);

        assert_eq!(de.peek_token().unwrap(), Token::ArrayStart);
        assert_eq!(de.peek_token().unwrap(), Token::ArrayStart);
        de.consume_token(Token::ArrayStart).unwrap();
        assert_eq!(de.peek_token().unwrap(), Token::ArrayEnd);
    }

    #[test]
    fn mismatched_token_fails() {
        let mut ser = Serializer::new();
        ser.write_i32(1);
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        assert!(de.read_f32().is_err());
    }
}
