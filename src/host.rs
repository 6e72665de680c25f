// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `host` module mirrors a stage's TOON state as an object/array/number/boolean/string tree.
//!
//! In the original system this is the JS-visible object state exchanged with a host language
//! binding. That binding layer is out of scope here; [`HostValue`] is the Rust-side shape of the
//! same schema, with identical validation semantics to [`crate::toon`].

use std::fmt;

use crate::error::{state_error, Result};

/// A host-mirrored value: the Rust shape of "the host's object/array/number/boolean/string
/// primitives" referenced by the specification, absent an actual host runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Object(Vec<(String, HostValue)>),
    Array(Vec<HostValue>),
    Number(f64),
    Bool(bool),
    Str(String),
}

impl HostValue {
    pub fn object() -> HostObjectBuilder {
        HostObjectBuilder { fields: Vec::new() }
    }

    pub fn array(items: Vec<HostValue>) -> HostValue {
        HostValue::Array(items)
    }

    pub fn num(v: impl Into<f64>) -> HostValue {
        HostValue::Number(v.into())
    }

    pub fn get(&self, key: &str) -> Result<&HostValue> {
        match self {
            HostValue::Object(fields) => fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| state_error::<()>(format!("host object missing field `{key}`")).unwrap_err()),
            _ => state_error(format!("expected host object, looking up `{key}`")),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            HostValue::Number(n) => Ok(*n),
            other => state_error(format!("expected host number, found {other}")),
        }
    }

    pub fn as_f32(&self) -> Result<f32> {
        self.as_f64().map(|v| v as f32)
    }

    pub fn as_i32(&self) -> Result<i32> {
        self.as_f64().map(|v| v as i32)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            HostValue::Bool(b) => Ok(*b),
            other => state_error(format!("expected host bool, found {other}")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            HostValue::Str(s) => Ok(s),
            other => state_error(format!("expected host string, found {other}")),
        }
    }

    pub fn as_array(&self) -> Result<&[HostValue]> {
        match self {
            HostValue::Array(items) => Ok(items),
            other => state_error(format!("expected host array, found {other}")),
        }
    }

    /// Convenience: a float array transported as a host array of numbers.
    pub fn as_float_array(&self) -> Result<Vec<f32>> {
        self.as_array()?.iter().map(HostValue::as_f32).collect()
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Object(_) => write!(f, "object"),
            HostValue::Array(_) => write!(f, "array"),
            HostValue::Number(n) => write!(f, "number({n})"),
            HostValue::Bool(b) => write!(f, "bool({b})"),
            HostValue::Str(s) => write!(f, "string({s})"),
        }
    }
}

/// Small ergonomic builder so stages can write `HostValue::object().field(...).build()` instead
/// of constructing the `Vec<(String, HostValue)>` by hand.
pub struct HostObjectBuilder {
    fields: Vec<(String, HostValue)>,
}

impl HostObjectBuilder {
    pub fn field(mut self, key: &str, value: HostValue) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }

    pub fn build(self) -> HostValue {
        HostValue::Object(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_object_round_trip() {
        let v = HostValue::object()
            .field("mode", HostValue::Str("moving".into()))
            .field("alpha", HostValue::num(0.5f64))
            .field("initialized", HostValue::Bool(true))
            .build();

        assert_eq!(v.get("mode").unwrap().as_str().unwrap(), "moving");
        assert_eq!(v.get("alpha").unwrap().as_f32().unwrap(), 0.5);
        assert!(v.get("initialized").unwrap().as_bool().unwrap());
        assert!(v.get("missing").is_err());
    }

    #[test]
    fn verify_float_array() {
        let v = HostValue::array(vec![HostValue::num(1.0f64), HostValue::num(2.0f64)]);
        assert_eq!(v.as_float_array().unwrap(), vec![1.0, 2.0]);
    }
}
