// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Root Mean Square (RMS) stage.
//!
//! Shaped identically to [`crate::stages::mav::Mav`], but the running statistic is the sum of
//! squares rather than the sum of absolute values, and the batch form may use the fused
//! [`crate::buffer::sum_of_squares`] primitive directly on the buffer when `C = 1`.

use crate::aggregate::{CircularWindow, PerChannelState};
use crate::buffer::sum_of_squares;
use crate::error::{config_error, contract_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::stages::Mode;
use crate::toon::{Deserializer, Serializer};

const DURATION_HEADROOM: usize = 3;
const MAX_RATE_ESTIMATE_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct RmsConfig {
    pub mode: Mode,
    pub window_size: usize,
    pub window_duration_ms: f64,
}

struct RmsChannelState {
    window: CircularWindow,
    running_sum_sq: f32,
}

impl RmsChannelState {
    fn new(window_size: usize) -> Self {
        Self { window: CircularWindow::new(window_size), running_sum_sq: 0.0 }
    }

    fn admit(&mut self, x: f32) -> f32 {
        if let Some(evicted) = self.window.push(x) {
            self.running_sum_sq -= evicted * evicted;
        }
        self.running_sum_sq += x * x;
        (self.running_sum_sq.max(0.0) / self.window.len() as f32).sqrt()
    }
}

pub struct Rms {
    config: RmsConfig,
    bound_window_size: Option<usize>,
    channels: PerChannelState<RmsChannelState>,
}

impl Rms {
    pub fn new(config: RmsConfig) -> Result<Self> {
        if config.mode == Mode::Moving && config.window_size == 0 && config.window_duration_ms <= 0.0 {
            return config_error("rms moving mode requires window_size or window_duration_ms > 0");
        }
        let bound_window_size = if config.window_size > 0 { Some(config.window_size) } else { None };
        Ok(Self { config, bound_window_size, channels: PerChannelState::new() })
    }

    fn estimate_window_size(&self, timestamps_ms: &[f64]) -> usize {
        let n = timestamps_ms.len().min(MAX_RATE_ESTIMATE_SAMPLES);
        let span_ms = timestamps_ms[n - 1] - timestamps_ms[0];
        let rate = (n - 1) as f64 / span_ms * 1000.0;
        let duration_s = self.config.window_duration_ms / 1000.0;
        (duration_s * rate).ceil().max(1.0) as usize * DURATION_HEADROOM
    }

    fn bind_window_size(&mut self, timestamps_ms: Option<&[f64]>) -> Result<usize> {
        if let Some(size) = self.bound_window_size {
            return Ok(size);
        }
        match timestamps_ms {
            Some(ts) if !ts.is_empty() => {
                let size = self.estimate_window_size(ts);
                self.bound_window_size = Some(size);
                Ok(size)
            }
            _ => contract_error("rms: window_duration_ms set but no timestamps were supplied and window_size is unbound"),
        }
    }

    fn process_batch(&self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        if num_channels == 1 {
            let rms = (sum_of_squares(buf).max(0.0) / samples_per_channel as f32).sqrt();
            buf.fill(rms);
            return;
        }
        for c in 0..num_channels {
            let mut sum_sq = 0.0f32;
            for k in 0..samples_per_channel {
                let v = buf[k * num_channels + c];
                sum_sq += v * v;
            }
            let rms = (sum_sq.max(0.0) / samples_per_channel as f32).sqrt();
            for k in 0..samples_per_channel {
                buf[k * num_channels + c] = rms;
            }
        }
    }
}

impl Stage for Rms {
    fn type_tag(&self) -> &'static str {
        "rms"
    }

    fn process(
        &mut self,
        buf: &mut [f32],
        num_samples_total: usize,
        num_channels: usize,
        timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        let samples_per_channel = num_samples_total / num_channels;
        match self.config.mode {
            Mode::Batch => {
                self.process_batch(buf, samples_per_channel, num_channels);
                Ok(())
            }
            Mode::Moving => {
                let window_size = self.bind_window_size(timestamps_ms)?;
                self.channels.bind(num_channels, || RmsChannelState::new(window_size));
                for c in 0..num_channels {
                    let state = self.channels.get_mut(c);
                    for k in 0..samples_per_channel {
                        let idx = k * num_channels + c;
                        buf[idx] = state.admit(buf[idx]);
                    }
                }
                Ok(())
            }
        }
    }

    fn reset(&mut self) {
        self.channels.clear();
        self.bound_window_size = if self.config.window_size > 0 { Some(self.config.window_size) } else { None };
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_string(self.config.mode.as_str());
        ser.write_i32(self.bound_window_size.unwrap_or(0) as i32);
        ser.write_f64(self.config.window_duration_ms);
        ser.write_bool(self.channels.is_bound());
        ser.write_i32(self.channels.num_channels() as i32);
        for ch in self.channels.iter() {
            let arrival: Vec<f32> = ch.window.iter_arrival_order().collect();
            ser.write_float_array(&arrival);
            ser.write_f32(ch.running_sum_sq);
        }
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let mode_str = de.read_string()?;
        let window_size = de.read_i32()? as usize;
        let window_duration_ms = de.read_f64()?;
        let is_initialized = de.read_bool()?;
        let num_channels = de.read_i32()? as usize;

        let mode = Mode::from_str(&mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown rms mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("rms mode mismatch");
        }
        if self.config.window_size > 0 && window_size != self.config.window_size {
            return state_error("rms window_size mismatch");
        }
        if (window_duration_ms - self.config.window_duration_ms).abs() > f64::EPSILON {
            return state_error("rms window_duration_ms mismatch");
        }

        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let arrival = de.read_float_array()?;
            let running_sum_sq = de.read_f32()?;
            if arrival.len() > window_size {
                return state_error("rms restored window holds more samples than window_size");
            }
            let mut window = CircularWindow::new(window_size);
            for &x in &arrival {
                window.push(x);
            }
            let recomputed = window.fold(0.0f32, |acc, x| acc + x * x);
            let tolerance = recomputed.abs().max(1.0) * 1e-3;
            if (running_sum_sq - recomputed).abs() > tolerance {
                return state_error(format!(
                    "rms restored running sum of squares {running_sum_sq} disagrees with recomputed {recomputed}"
                ));
            }
            channels.push(RmsChannelState { window, running_sum_sq });
        }

        self.bound_window_size = if is_initialized { Some(window_size) } else { None };
        self.channels.restore(channels);
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                HostValue::object()
                    .field(
                        "window",
                        HostValue::Array(ch.window.iter_arrival_order().map(|x| HostValue::num(x as f64)).collect()),
                    )
                    .field("running_sum_sq", HostValue::num(ch.running_sum_sq as f64))
                    .build()
            })
            .collect();
        HostValue::object()
            .field("mode", HostValue::Str(self.config.mode.as_str().to_string()))
            .field("window_size", HostValue::num(self.bound_window_size.unwrap_or(0) as f64))
            .field("window_duration_ms", HostValue::num(self.config.window_duration_ms))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let mode_str = value.get("mode")?.as_str()?;
        let window_size = value.get("window_size")?.as_i32()? as usize;
        let window_duration_ms = value.get("window_duration_ms")?.as_f64()?;

        let mode = Mode::from_str(mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown rms mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("rms mode mismatch in host payload");
        }
        if self.config.window_size > 0 && window_size != self.config.window_size {
            return state_error("rms window_size mismatch in host payload");
        }
        if (window_duration_ms - self.config.window_duration_ms).abs() > f64::EPSILON {
            return state_error("rms window_duration_ms mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                let arrival = ch.get("window")?.as_float_array()?;
                let running_sum_sq = ch.get("running_sum_sq")?.as_f32()?;
                if window_size > 0 && arrival.len() > window_size {
                    return state_error("rms restored window holds more samples than window_size in host payload");
                }
                let mut window = CircularWindow::new(window_size.max(arrival.len()));
                for &x in &arrival {
                    window.push(x);
                }
                let recomputed = window.fold(0.0f32, |acc, x| acc + x * x);
                let tolerance = recomputed.abs().max(1.0) * 1e-3;
                if (running_sum_sq - recomputed).abs() > tolerance {
                    return state_error(format!(
                        "rms restored running sum of squares {running_sum_sq} disagrees with recomputed {recomputed}"
                    ));
                }
                Ok(RmsChannelState { window, running_sum_sq })
            })
            .collect::<Result<Vec<_>>>()?;

        self.bound_window_size = if window_size > 0 { Some(window_size) } else { None };
        self.channels.restore(channels);
        Ok(())
    }
}
