// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Moving Absolute Value (MAV) stage.

use crate::aggregate::{CircularWindow, PerChannelState};
use crate::error::{config_error, contract_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::stages::Mode;
use crate::toon::{Deserializer, Serializer};

/// The headroom multiplier applied when a window size is derived from a duration estimate:
/// duration-aware filters evict by timestamp, not by count.
const DURATION_HEADROOM: usize = 3;
const MAX_RATE_ESTIMATE_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct MavConfig {
    pub mode: Mode,
    /// `0` means "not yet bound"; set directly, or derived lazily from `window_duration_ms`.
    pub window_size: usize,
    /// `0.0` means duration-based binding is unused.
    pub window_duration_ms: f64,
}

struct MavChannelState {
    window: CircularWindow,
    running_sum_abs: f32,
}

impl MavChannelState {
    fn new(window_size: usize) -> Self {
        Self { window: CircularWindow::new(window_size), running_sum_abs: 0.0 }
    }

    fn admit(&mut self, x: f32) -> f32 {
        if let Some(evicted) = self.window.push(x) {
            self.running_sum_abs -= evicted.abs();
        }
        self.running_sum_abs += x.abs();
        self.running_sum_abs / self.window.len() as f32
    }
}

pub struct Mav {
    config: MavConfig,
    bound_window_size: Option<usize>,
    channels: PerChannelState<MavChannelState>,
}

impl Mav {
    pub fn new(config: MavConfig) -> Result<Self> {
        if config.mode == Mode::Moving && config.window_size == 0 && config.window_duration_ms <= 0.0 {
            return config_error("mav moving mode requires window_size or window_duration_ms > 0");
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
            _ => contract_error("mav: window_duration_ms set but no timestamps were supplied and window_size is unbound"),
        }
    }

    fn process_batch(&self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        for c in 0..num_channels {
            let mut sum_abs = 0.0f32;
            for k in 0..samples_per_channel {
                sum_abs += buf[k * num_channels + c].abs();
            }
            let mean = sum_abs / samples_per_channel as f32;
            for k in 0..samples_per_channel {
                buf[k * num_channels + c] = mean;
            }
        }
    }
}

impl Stage for Mav {
    fn type_tag(&self) -> &'static str {
        "mav"
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
                self.channels.bind(num_channels, || MavChannelState::new(window_size));
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
            ser.write_f32(ch.running_sum_abs);
        }
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let mode_str = de.read_string()?;
        let window_size = de.read_i32()? as usize;
        let window_duration_ms = de.read_f64()?;
        let is_initialized = de.read_bool()?;
        let num_channels = de.read_i32()? as usize;

        let mode = Mode::from_str(&mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown mav mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("mav mode mismatch");
        }
        if self.config.window_size > 0 && window_size != self.config.window_size {
            return state_error("mav window_size mismatch");
        }
        if (window_duration_ms - self.config.window_duration_ms).abs() > f64::EPSILON {
            return state_error("mav window_duration_ms mismatch");
        }

        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let arrival = de.read_float_array()?;
            let running_sum_abs = de.read_f32()?;
            if arrival.len() > window_size {
                return state_error("mav restored window holds more samples than window_size");
            }
            let mut window = CircularWindow::new(window_size);
            for &x in &arrival {
                window.push(x);
            }
            let recomputed = window.fold(0.0f32, |acc, x| acc + x.abs());
            let tolerance = recomputed.abs().max(1.0) * 1e-4;
            if (running_sum_abs - recomputed).abs() > tolerance {
                return state_error(format!(
                    "mav restored running sum {running_sum_abs} disagrees with recomputed {recomputed}"
                ));
            }
            channels.push(MavChannelState { window, running_sum_abs });
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
                    .field("running_sum_abs", HostValue::num(ch.running_sum_abs as f64))
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
            .ok_or_else(|| state_error::<()>(format!("unknown mav mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("mav mode mismatch in host payload");
        }
        if self.config.window_size > 0 && window_size != self.config.window_size {
            return state_error("mav window_size mismatch in host payload");
        }
        if (window_duration_ms - self.config.window_duration_ms).abs() > f64::EPSILON {
            return state_error("mav window_duration_ms mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                let arrival = ch.get("window")?.as_float_array()?;
                let running_sum_abs = ch.get("running_sum_abs")?.as_f32()?;
                if window_size > 0 && arrival.len() > window_size {
                    return state_error("mav restored window holds more samples than window_size in host payload");
                }
                let mut window = CircularWindow::new(window_size.max(arrival.len()));
                for &x in &arrival {
                    window.push(x);
                }
                let recomputed = window.fold(0.0f32, |acc, x| acc + x.abs());
                let tolerance = recomputed.abs().max(1.0) * 1e-4;
                if (running_sum_abs - recomputed).abs() > tolerance {
                    return state_error(format!(
                        "mav restored running sum {running_sum_abs} disagrees with recomputed {recomputed}"
                    ));
                }
                Ok(MavChannelState { window, running_sum_abs })
            })
            .collect::<Result<Vec<_>>>()?;

        self.bound_window_size = if window_size > 0 { Some(window_size) } else { None };
        self.channels.restore(channels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_mav_emits_mean_abs_uniformly() {
        let mut mav = Mav::new(MavConfig { mode: Mode::Batch, window_size: 0, window_duration_ms: 0.0 }).unwrap();
        let mut buf = [-2.0, 4.0, -6.0];
        mav.process(&mut buf, 3, 1, None).unwrap();
        assert_eq!(buf, [4.0, 4.0, 4.0]);
    }

    #[test]
    fn moving_mav_evicts_and_averages() {
        let mut mav = Mav::new(MavConfig { mode: Mode::Moving, window_size: 2, window_duration_ms: 0.0 }).unwrap();
        let mut buf = [3.0, 4.0, -10.0, 0.0];
        mav.process(&mut buf, 4, 1, None).unwrap();
        assert_eq!(buf, [3.0, 3.5, 7.0, 5.0]);
    }

    #[test]
    fn duration_mode_without_timestamps_is_fatal() {
        let mut mav = Mav::new(MavConfig { mode: Mode::Moving, window_size: 0, window_duration_ms: 100.0 }).unwrap();
        let mut buf = [1.0, 2.0];
        assert!(mav.process(&mut buf, 2, 1, None).is_err());
    }

    #[test]
    fn duration_mode_binds_window_from_timestamps() {
        let mut mav = Mav::new(MavConfig { mode: Mode::Moving, window_size: 0, window_duration_ms: 1000.0 }).unwrap();
        let mut buf = [1.0; 20];
        let ts: Vec<f64> = (0..20).map(|i| i as f64 * 10.0).collect();
        mav.process(&mut buf, 20, 1, Some(&ts)).unwrap();
        // rate = 1000 samples/s -> duration_s=1.0 -> raw window=100 -> *3 headroom = 300
        assert_eq!(mav.bound_window_size, Some(300));
    }

    #[test]
    fn rejects_zero_window_without_duration() {
        assert!(Mav::new(MavConfig { mode: Mode::Moving, window_size: 0, window_duration_ms: 0.0 }).is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = Mav::new(MavConfig { mode: Mode::Moving, window_size: 3, window_duration_ms: 0.0 }).unwrap();
        let mut buf = [1.0, -2.0, 3.0, -4.0];
        a.process(&mut buf, 4, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b = Mav::new(MavConfig { mode: Mode::Moving, window_size: 3, window_duration_ms: 0.0 }).unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let mut na = [5.0];
        let mut nb = [5.0];
        a.process(&mut na, 1, 1, None).unwrap();
        b.process(&mut nb, 1, 1, None).unwrap();
        assert_eq!(na, nb);
    }

    #[test]
    fn toon_rejects_corrupted_running_sum() {
        let mut a = Mav::new(MavConfig { mode: Mode::Moving, window_size: 3, window_duration_ms: 0.0 }).unwrap();
        let mut buf = [1.0, -2.0, 3.0];
        a.process(&mut buf, 3, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let mut bytes = ser.into_bytes();
        // Corrupt the trailing running_sum_abs f32 (last 4 bytes).
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&1000.0f32.to_le_bytes());

        let mut b = Mav::new(MavConfig { mode: Mode::Moving, window_size: 3, window_duration_ms: 0.0 }).unwrap();
        assert!(b.deserialize_toon(&mut Deserializer::new(&bytes)).is_err());
    }
}
