// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RLS adaptive filter stage. Same two-channel interface as [`crate::stages::lms::Lms`], but
//! the weight update comes from an explicit inverse-covariance recursion rather than a gradient
//! step, at `O(N^2)` per sample instead of LMS's `O(N)`.

use crate::buffer::{deinterleave2ch, interleave2ch, ScratchBuffer};
use crate::error::{config_error, contract_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::toon::{Deserializer, Serializer};

#[derive(Debug, Clone, Copy)]
pub struct RlsConfig {
    pub num_taps: usize,
    pub lambda: f32,
    pub delta: f32,
}

pub struct Rls {
    config: RlsConfig,
    weights: Vec<f32>,
    inverse_cov: Vec<f32>,
    delay_line: Vec<f32>,
    delay_write: usize,
    initialized: bool,
    primary: ScratchBuffer,
    desired: ScratchBuffer,
    error: ScratchBuffer,
}

impl Rls {
    pub fn new(config: RlsConfig) -> Result<Self> {
        if config.num_taps < 1 {
            return config_error("rls num_taps must be >= 1");
        }
        if !(config.lambda > 0.0 && config.lambda <= 1.0) {
            return config_error("rls lambda must be in (0, 1]");
        }
        if config.delta <= 0.0 {
            return config_error("rls delta must be > 0");
        }
        let n = config.num_taps;
        let mut inverse_cov = vec![0.0; n * n];
        for i in 0..n {
            inverse_cov[i * n + i] = config.delta;
        }
        Ok(Self {
            config,
            weights: vec![0.0; n],
            inverse_cov,
            delay_line: vec![0.0; n],
            delay_write: 0,
            initialized: false,
            primary: ScratchBuffer::new(),
            desired: ScratchBuffer::new(),
            error: ScratchBuffer::new(),
        })
    }

    fn tap(&self, k: usize) -> f32 {
        let n = self.config.num_taps;
        let idx = (self.delay_write + n - 1 - k) % n;
        self.delay_line[idx]
    }

    fn tap_vec(&self) -> Vec<f32> {
        (0..self.config.num_taps).map(|k| self.tap(k)).collect()
    }

    fn push_sample(&mut self, x: f32) {
        let n = self.config.num_taps;
        self.delay_line[self.delay_write] = x;
        self.delay_write = (self.delay_write + 1) % n;
    }

    fn adapt_sample(&mut self, x: f32, d: f32) -> f32 {
        self.push_sample(x);
        let n = self.config.num_taps;
        let lambda = self.config.lambda;
        let u = self.tap_vec();

        let y: f32 = (0..n).map(|i| self.weights[i] * u[i]).sum();
        let e = d - y;

        // p = P * u
        let mut p = vec![0.0f32; n];
        for i in 0..n {
            let mut acc = 0.0f32;
            for j in 0..n {
                acc += self.inverse_cov[i * n + j] * u[j];
            }
            p[i] = acc;
        }

        let u_p: f32 = (0..n).map(|i| u[i] * p[i]).sum();
        let denom = lambda + u_p;
        let k: Vec<f32> = p.iter().map(|&pi| pi / denom).collect();

        for i in 0..n {
            self.weights[i] += k[i] * e;
        }

        // P = (P - k * u^T * P) / lambda
        let mut new_p = vec![0.0f32; n * n];
        for i in 0..n {
            for j in 0..n {
                new_p[i * n + j] = (self.inverse_cov[i * n + j] - k[i] * p[j]) / lambda;
            }
        }
        self.inverse_cov = new_p;

        self.initialized = true;
        e
    }
}

impl Stage for Rls {
    fn type_tag(&self) -> &'static str {
        "rls"
    }

    fn process(
        &mut self,
        buf: &mut [f32],
        num_samples_total: usize,
        num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        if num_channels != 2 {
            return contract_error("rls requires exactly 2 channels");
        }
        let samples_per_channel = num_samples_total / num_channels;

        self.primary.ensure_len(samples_per_channel);
        self.desired.ensure_len(samples_per_channel);
        deinterleave2ch(&buf[..num_samples_total], self.primary.as_mut_slice(), self.desired.as_mut_slice());

        let primary = self.primary.as_slice().to_vec();
        let desired = self.desired.as_slice().to_vec();
        self.error.ensure_len(samples_per_channel);
        for k in 0..samples_per_channel {
            let e = self.adapt_sample(primary[k], desired[k]);
            self.error.as_mut_slice()[k] = e;
        }

        interleave2ch(self.error.as_slice(), self.error.as_slice(), &mut buf[..num_samples_total]);
        Ok(())
    }

    fn reset(&mut self) {
        let n = self.config.num_taps;
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.inverse_cov.iter_mut().for_each(|p| *p = 0.0);
        for i in 0..n {
            self.inverse_cov[i * n + i] = self.config.delta;
        }
        self.delay_line.iter_mut().for_each(|x| *x = 0.0);
        self.delay_write = 0;
        self.initialized = false;
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_i32(self.config.num_taps as i32);
        ser.write_f32(self.config.lambda);
        ser.write_f32(self.config.delta);
        ser.write_bool(self.initialized);
        ser.write_float_array(&self.weights);
        ser.write_float_array(&self.inverse_cov);
        ser.write_float_array(&self.delay_line);
        ser.write_i32(self.delay_write as i32);
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let num_taps = de.read_i32()? as usize;
        let lambda = de.read_f32()?;
        let delta = de.read_f32()?;
        let initialized = de.read_bool()?;
        let weights = de.read_float_array()?;
        let inverse_cov = de.read_float_array()?;
        let delay_line = de.read_float_array()?;
        let delay_write = de.read_i32()? as usize;

        if num_taps != self.config.num_taps {
            return state_error("rls num_taps mismatch");
        }
        if (lambda - self.config.lambda).abs() > 1e-6 {
            return state_error("rls lambda mismatch");
        }
        if (delta - self.config.delta).abs() > 1e-6 {
            return state_error("rls delta mismatch");
        }
        if weights.len() != num_taps {
            return state_error("rls restored weights have wrong length");
        }
        if inverse_cov.len() != num_taps * num_taps {
            return state_error("rls restored inverse covariance has wrong length");
        }
        if delay_line.len() != num_taps {
            return state_error("rls restored delay line has wrong length");
        }

        self.weights = weights;
        self.inverse_cov = inverse_cov;
        self.delay_line = delay_line;
        self.delay_write = delay_write % num_taps.max(1);
        self.initialized = initialized;
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        HostValue::object()
            .field("num_taps", HostValue::num(self.config.num_taps as f64))
            .field("lambda", HostValue::num(self.config.lambda as f64))
            .field("delta", HostValue::num(self.config.delta as f64))
            .field("initialized", HostValue::Bool(self.initialized))
            .field("weights", HostValue::Array(self.weights.iter().map(|&w| HostValue::num(w as f64)).collect()))
            .field("inverse_cov", HostValue::Array(self.inverse_cov.iter().map(|&p| HostValue::num(p as f64)).collect()))
            .field("delay_line", HostValue::Array(self.delay_line.iter().map(|&x| HostValue::num(x as f64)).collect()))
            .field("delay_write", HostValue::num(self.delay_write as f64))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let num_taps = value.get("num_taps")?.as_i32()? as usize;
        let lambda = value.get("lambda")?.as_f32()?;
        let delta = value.get("delta")?.as_f32()?;
        let initialized = value.get("initialized")?.as_bool()?;
        let weights = value.get("weights")?.as_float_array()?;
        let inverse_cov = value.get("inverse_cov")?.as_float_array()?;
        let delay_line = value.get("delay_line")?.as_float_array()?;
        let delay_write = value.get("delay_write")?.as_i32()? as usize;

        if num_taps != self.config.num_taps {
            return state_error("rls num_taps mismatch in host payload");
        }
        if (lambda - self.config.lambda).abs() > 1e-6 {
            return state_error("rls lambda mismatch in host payload");
        }
        if (delta - self.config.delta).abs() > 1e-6 {
            return state_error("rls delta mismatch in host payload");
        }
        if weights.len() != num_taps {
            return state_error("rls restored weights have wrong length in host payload");
        }
        if inverse_cov.len() != num_taps * num_taps {
            return state_error("rls restored inverse covariance has wrong length in host payload");
        }
        if delay_line.len() != num_taps {
            return state_error("rls restored delay line has wrong length in host payload");
        }

        self.weights = weights;
        self.inverse_cov = inverse_cov;
        self.delay_line = delay_line;
        self.delay_write = delay_write % num_taps.max(1);
        self.initialized = initialized;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_channel_count() {
        let mut rls = Rls::new(RlsConfig { num_taps: 4, lambda: 0.99, delta: 1.0 }).unwrap();
        let mut buf = [0.0, 0.0, 0.0];
        assert!(rls.process(&mut buf, 3, 1, None).is_err());
    }

    #[test]
    fn identity_system_converges_faster_than_lms() {
        let mut rls = Rls::new(RlsConfig { num_taps: 1, lambda: 0.99, delta: 1.0 }).unwrap();
        let mut last_abs_error = f32::MAX;
        for _ in 0..20 {
            let mut buf = [1.0, 1.0];
            rls.process(&mut buf, 2, 2, None).unwrap();
            last_abs_error = buf[0].abs();
        }
        assert!(last_abs_error < 0.05, "expected fast convergence, got final |e|={last_abs_error}");
    }

    #[test]
    fn both_output_channels_carry_the_same_error() {
        let mut rls = Rls::new(RlsConfig { num_taps: 2, lambda: 0.98, delta: 1.0 }).unwrap();
        let mut buf = [0.5, 0.2, -0.3, 0.1];
        rls.process(&mut buf, 4, 2, None).unwrap();
        assert_eq!(buf[0], buf[1]);
        assert_eq!(buf[2], buf[3]);
    }

    #[test]
    fn rejects_invalid_construction_parameters() {
        assert!(Rls::new(RlsConfig { num_taps: 0, lambda: 0.99, delta: 1.0 }).is_err());
        assert!(Rls::new(RlsConfig { num_taps: 4, lambda: 0.0, delta: 1.0 }).is_err());
        assert!(Rls::new(RlsConfig { num_taps: 4, lambda: 0.99, delta: 0.0 }).is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = Rls::new(RlsConfig { num_taps: 3, lambda: 0.99, delta: 1.0 }).unwrap();
        let mut buf = [0.3, 0.1, -0.2, 0.4];
        a.process(&mut buf, 4, 2, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b = Rls::new(RlsConfig { num_taps: 3, lambda: 0.99, delta: 1.0 }).unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let mut next_a = [0.1, -0.1];
        let mut next_b = [0.1, -0.1];
        a.process(&mut next_a, 2, 2, None).unwrap();
        b.process(&mut next_b, 2, 2, None).unwrap();
        assert_eq!(next_a, next_b);
    }
}
