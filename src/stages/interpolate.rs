// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The polyphase FIR interpolator: a resizing stage that upsamples by an integer factor `L` using
//! a Hamming-windowed sinc filter designed once at construction.

use std::f32::consts::PI;

use smallvec::SmallVec;

use crate::aggregate::PerChannelState;
use crate::error::{config_error, contract_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::toon::{Deserializer, Serializer};

fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-7 {
        1.0
    }
    else {
        (PI * x).sin() / (PI * x)
    }
}

fn design_filter(l: usize, m: usize) -> Vec<f32> {
    let fc = 1.0 / (2.0 * l as f32);
    let half = (m / 2) as f32;
    (0..m)
        .map(|n| {
            let nf = n as f32 - half;
            let window = 0.54 - 0.46 * (2.0 * PI * n as f32 / (m - 1) as f32).cos();
            sinc(2.0 * fc * nf) * window
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct InterpolatorConfig {
    pub l: usize,
    pub m: usize,
    pub fs_in: f64,
}

struct ChannelRing {
    ring: Vec<f32>,
    state_idx: usize,
}

impl ChannelRing {
    fn new(m: usize) -> Self {
        Self { ring: vec![0.0; m], state_idx: 0 }
    }
}

pub struct Interpolator {
    config: InterpolatorConfig,
    taps: Vec<f32>,
    channels: PerChannelState<ChannelRing>,
}

impl Interpolator {
    pub fn new(config: InterpolatorConfig) -> Result<Self> {
        if config.l < 2 {
            return config_error("interpolator L must be >= 2");
        }
        if config.m < 3 || config.m % 2 == 0 {
            return config_error("interpolator filter order M must be odd and >= 3");
        }
        if config.fs_in <= 0.0 {
            return config_error("interpolator Fs_in must be > 0");
        }
        let taps = design_filter(config.l, config.m);
        Ok(Self { config, taps, channels: PerChannelState::new() })
    }
}

impl Stage for Interpolator {
    fn type_tag(&self) -> &'static str {
        "interpolate"
    }

    fn is_resizing(&self) -> bool {
        true
    }

    fn time_scale_factor(&self) -> f64 {
        1.0 / self.config.l as f64
    }

    fn calculate_output_size(&self, input_len: usize) -> usize {
        input_len * self.config.l
    }

    fn process(
        &mut self,
        _buf: &mut [f32],
        _num_samples_total: usize,
        _num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        contract_error("interpolator is a resizing stage; call process_resizing")
    }

    fn process_resizing(
        &mut self,
        input: &[f32],
        input_len: usize,
        output: &mut [f32],
        output_len: &mut usize,
        num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        let l = self.config.l;
        let m = self.config.m;
        let samples_per_channel = input_len / num_channels;
        let out_len = samples_per_channel * l * num_channels;
        if output.len() < out_len {
            return contract_error("interpolator: output buffer shorter than calculate_output_size");
        }

        self.channels.bind(num_channels, || ChannelRing::new(m));

        for c in 0..num_channels {
            let ring_state = self.channels.get_mut(c);
            for k in 0..samples_per_channel {
                let x = input[k * num_channels + c];
                ring_state.ring[ring_state.state_idx] = x;
                ring_state.state_idx = (ring_state.state_idx + 1) % m;

                for phi in 0..l {
                    let mut y = 0.0f32;
                    let mut key = phi;
                    while key < m {
                        let tap_idx = ring_state.state_idx + m - 1 - key / l;
                        y += self.taps[key] * ring_state.ring[tap_idx % m];
                        key += l;
                    }
                    let out_idx = (k * l + phi) * num_channels + c;
                    output[out_idx] = y;
                }
            }
        }

        *output_len = out_len;
        Ok(())
    }

    fn reset(&mut self) {
        self.channels.clear();
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_i32(self.config.l as i32);
        ser.write_i32(self.config.m as i32);
        ser.write_f64(self.config.fs_in);
        ser.write_i32(self.channels.num_channels() as i32);
        for ch in self.channels.iter() {
            ser.write_float_array(&ch.ring);
        }
        for ch in self.channels.iter() {
            ser.write_i32(ch.state_idx as i32);
        }
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let l = de.read_i32()? as usize;
        let m = de.read_i32()? as usize;
        let fs_in = de.read_f64()?;
        let num_channels = de.read_i32()? as usize;

        if l != self.config.l {
            return state_error("interpolator L mismatch");
        }
        if m != self.config.m {
            return state_error("interpolator M mismatch");
        }
        if (fs_in - self.config.fs_in).abs() > f64::EPSILON {
            return state_error("interpolator Fs_in mismatch");
        }
        if self.channels.is_bound() && num_channels != self.channels.num_channels() {
            return state_error("interpolator channel count mismatch");
        }

        let mut rings: SmallVec<[Vec<f32>; 2]> = SmallVec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let values = de.read_float_array()?;
            if values.len() != m {
                return state_error("interpolator restored ring has wrong length");
            }
            rings.push(values);
        }
        let mut idxs = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            idxs.push(de.read_i32()? as usize);
        }

        let channels = rings
            .into_iter()
            .zip(idxs)
            .map(|(ring, state_idx)| ChannelRing { ring, state_idx })
            .collect::<Vec<_>>();
        self.channels.restore(channels);
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                HostValue::object()
                    .field("ring", HostValue::Array(ch.ring.iter().map(|&x| HostValue::num(x as f64)).collect()))
                    .field("state_idx", HostValue::num(ch.state_idx as f64))
                    .build()
            })
            .collect();
        HostValue::object()
            .field("l", HostValue::num(self.config.l as f64))
            .field("m", HostValue::num(self.config.m as f64))
            .field("fs_in", HostValue::num(self.config.fs_in))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let l = value.get("l")?.as_i32()? as usize;
        let m = value.get("m")?.as_i32()? as usize;
        let fs_in = value.get("fs_in")?.as_f64()?;

        if l != self.config.l {
            return state_error("interpolator L mismatch in host payload");
        }
        if m != self.config.m {
            return state_error("interpolator M mismatch in host payload");
        }
        if (fs_in - self.config.fs_in).abs() > f64::EPSILON {
            return state_error("interpolator Fs_in mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                let ring = ch.get("ring")?.as_float_array()?;
                if ring.len() != m {
                    return state_error("interpolator restored ring has wrong length in host payload");
                }
                let state_idx = ch.get("state_idx")?.as_i32()? as usize;
                Ok(ChannelRing { ring, state_idx })
            })
            .collect::<Result<Vec<_>>>()?;

        self.channels.restore(channels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::process_buffer;

    #[test]
    fn output_length_is_input_times_l() {
        let mut interp = Interpolator::new(InterpolatorConfig { l: 4, m: 15, fs_in: 8000.0 }).unwrap();
        let input = [0.0, 1.0, 0.0, -1.0];
        let (out, len, _) = process_buffer(&mut interp, &mut input.clone(), 4, 1, None).unwrap();
        assert_eq!(len, 16);
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn dc_input_converges_to_dc_output_after_filter_fills() {
        let mut interp = Interpolator::new(InterpolatorConfig { l: 2, m: 15, fs_in: 8000.0 }).unwrap();
        let input = [1.0f32; 40];
        let (out, _, _) = process_buffer(&mut interp, &mut input.clone(), 40, 1, None).unwrap();
        for &v in &out[40..] {
            assert!((v - 1.0).abs() < 0.05, "expected near 1.0 once the filter has filled, got {v}");
        }
    }

    #[test]
    fn plain_process_is_a_contract_error() {
        let mut interp = Interpolator::new(InterpolatorConfig { l: 2, m: 7, fs_in: 8000.0 }).unwrap();
        let mut buf = [0.0, 1.0];
        assert!(interp.process(&mut buf, 2, 1, None).is_err());
    }

    #[test]
    fn rejects_invalid_construction_parameters() {
        assert!(Interpolator::new(InterpolatorConfig { l: 1, m: 7, fs_in: 8000.0 }).is_err());
        assert!(Interpolator::new(InterpolatorConfig { l: 2, m: 6, fs_in: 8000.0 }).is_err());
        assert!(Interpolator::new(InterpolatorConfig { l: 2, m: 7, fs_in: 0.0 }).is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = Interpolator::new(InterpolatorConfig { l: 3, m: 9, fs_in: 8000.0 }).unwrap();
        let input = [0.2, -0.4, 0.6, 0.1];
        let (_, _, _) = process_buffer(&mut a, &mut input.clone(), 4, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b = Interpolator::new(InterpolatorConfig { l: 3, m: 9, fs_in: 8000.0 }).unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let next = [0.3, -0.1];
        let (out_a, _, _) = process_buffer(&mut a, &mut next.clone(), 2, 1, None).unwrap();
        let (out_b, _, _) = process_buffer(&mut b, &mut next.clone(), 2, 1, None).unwrap();
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn toon_rejects_l_mismatch() {
        let a = Interpolator::new(InterpolatorConfig { l: 2, m: 7, fs_in: 8000.0 }).unwrap();
        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();

        let mut b = Interpolator::new(InterpolatorConfig { l: 4, m: 7, fs_in: 8000.0 }).unwrap();
        assert!(b.deserialize_toon(&mut Deserializer::new(&bytes)).is_err());
    }
}
