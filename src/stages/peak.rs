// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The peak detection stage: a 3-point moving detector with one-sample latency, and a windowed
//! batch detector shared between the time and frequency domains.

use crate::aggregate::PerChannelState;
use crate::error::{config_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::stages::Mode;
use crate::toon::{Deserializer, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Time,
    Frequency,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Time => "time",
            Domain::Frequency => "frequency",
        }
    }

    pub fn from_str(s: &str) -> Option<Domain> {
        match s {
            "time" => Some(Domain::Time),
            "frequency" => Some(Domain::Frequency),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeakConfig {
    pub threshold: f32,
    pub mode: Mode,
    pub domain: Domain,
    pub window_size: usize,
    pub min_peak_distance: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct MovingChannelState {
    prev_prev: f32,
    prev: f32,
    cooldown: usize,
    seen: u8,
}

pub struct Peak {
    config: PeakConfig,
    window_size: usize,
    channels: PerChannelState<MovingChannelState>,
}

impl Peak {
    pub fn new(config: PeakConfig) -> Result<Self> {
        if config.threshold < 0.0 {
            return config_error("peak threshold must be >= 0");
        }
        if config.window_size < 3 || config.window_size % 2 == 0 {
            return config_error("peak window_size must be odd and >= 3");
        }
        if config.min_peak_distance < 1 {
            return config_error("peak min_peak_distance must be >= 1");
        }
        let window_size = if config.mode == Mode::Moving { 3 } else { config.window_size };
        Ok(Self { config, window_size, channels: PerChannelState::new() })
    }

    fn process_moving(&mut self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        let threshold = self.config.threshold;
        let min_peak_distance = self.config.min_peak_distance;
        self.channels.bind(num_channels, MovingChannelState::default);

        for c in 0..num_channels {
            let state = self.channels.get_mut(c);
            for k in 0..samples_per_channel {
                let idx = k * num_channels + c;
                let current = buf[idx];

                if state.cooldown > 0 {
                    state.cooldown -= 1;
                }

                if state.seen >= 2 {
                    let prev_is_peak =
                        state.cooldown == 0 && state.prev > state.prev_prev && state.prev > current && state.prev >= threshold;
                    if prev_is_peak {
                        state.cooldown = min_peak_distance - 1;
                    }
                    // `prev` may belong to a buffer from an earlier call; the retro-write can only
                    // land within the buffer currently in hand.
                    if k >= 1 {
                        buf[idx - num_channels] = if prev_is_peak { 1.0 } else { 0.0 };
                    }
                }

                state.prev_prev = state.prev;
                state.prev = current;
                state.seen = state.seen.saturating_add(1).min(2);
                buf[idx] = 0.0;
            }
        }
    }

    fn process_batch(&self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        let threshold = self.config.threshold;
        let window_size = self.window_size;
        let half = window_size / 2;
        let min_peak_distance = self.config.min_peak_distance;

        let mut channel_buf = vec![0.0f32; samples_per_channel];
        let mut out = vec![0.0f32; samples_per_channel];

        for c in 0..num_channels {
            for k in 0..samples_per_channel {
                channel_buf[k] = buf[k * num_channels + c];
            }
            out.iter_mut().for_each(|x| *x = 0.0);

            let mut last_peak: Option<usize> = None;
            for i in 0..samples_per_channel {
                if i < half || i + half >= samples_per_channel {
                    continue;
                }
                let v = channel_buf[i];
                if v < threshold {
                    continue;
                }
                if let Some(last) = last_peak {
                    if i - last < min_peak_distance {
                        continue;
                    }
                }

                let mut is_max = true;
                for w in 0..window_size {
                    let j = i + w - half;
                    if j == i {
                        continue;
                    }
                    let boundary = matches!(self.config.domain, Domain::Frequency) && (j == i - half || j == i + half);
                    let beats = if boundary { channel_buf[j] > v } else { channel_buf[j] >= v };
                    if beats {
                        is_max = false;
                        break;
                    }
                }

                if is_max {
                    out[i] = 1.0;
                    last_peak = Some(i);
                }
            }

            for k in 0..samples_per_channel {
                buf[k * num_channels + c] = out[k];
            }
        }
    }
}

impl Stage for Peak {
    fn type_tag(&self) -> &'static str {
        "peak"
    }

    fn process(
        &mut self,
        buf: &mut [f32],
        num_samples_total: usize,
        num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        let samples_per_channel = num_samples_total / num_channels;
        match self.config.mode {
            Mode::Moving => self.process_moving(buf, samples_per_channel, num_channels),
            Mode::Batch => self.process_batch(buf, samples_per_channel, num_channels),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.channels.clear();
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_f32(self.config.threshold);
        ser.write_string(self.config.mode.as_str());
        ser.write_string(self.config.domain.as_str());
        ser.write_i32(self.config.window_size as i32);
        ser.write_i32(self.config.min_peak_distance as i32);
        ser.write_i32(self.channels.num_channels() as i32);
        for ch in self.channels.iter() {
            ser.write_f32(ch.prev_prev);
            ser.write_f32(ch.prev);
            ser.write_i32(ch.cooldown as i32);
            ser.write_bool(ch.seen >= 2);
        }
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let threshold = de.read_f32()?;
        let mode_str = de.read_string()?;
        let domain_str = de.read_string()?;
        let window_size = de.read_i32()? as usize;
        let min_peak_distance = de.read_i32()? as usize;
        let num_channels = de.read_i32()? as usize;

        let mode = Mode::from_str(&mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown peak mode `{mode_str}`")).unwrap_err())?;
        let domain = Domain::from_str(&domain_str)
            .ok_or_else(|| state_error::<()>(format!("unknown peak domain `{domain_str}`")).unwrap_err())?;

        if (threshold - self.config.threshold).abs() > 1e-6 {
            return state_error("peak threshold mismatch");
        }
        if mode != self.config.mode {
            return state_error("peak mode mismatch");
        }
        if domain != self.config.domain {
            return state_error("peak domain mismatch");
        }
        if window_size != self.config.window_size {
            return state_error("peak window_size mismatch");
        }
        if min_peak_distance != self.config.min_peak_distance {
            return state_error("peak min_peak_distance mismatch");
        }

        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let prev_prev = de.read_f32()?;
            let prev = de.read_f32()?;
            let cooldown = de.read_i32()? as usize;
            let seen_full = de.read_bool()?;
            channels.push(MovingChannelState { prev_prev, prev, cooldown, seen: if seen_full { 2 } else { 1 } });
        }

        self.channels.restore(channels);
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                HostValue::object()
                    .field("prev_prev", HostValue::num(ch.prev_prev as f64))
                    .field("prev", HostValue::num(ch.prev as f64))
                    .field("cooldown", HostValue::num(ch.cooldown as f64))
                    .field("seen_full", HostValue::Bool(ch.seen >= 2))
                    .build()
            })
            .collect();
        HostValue::object()
            .field("threshold", HostValue::num(self.config.threshold as f64))
            .field("mode", HostValue::Str(self.config.mode.as_str().to_string()))
            .field("domain", HostValue::Str(self.config.domain.as_str().to_string()))
            .field("window_size", HostValue::num(self.config.window_size as f64))
            .field("min_peak_distance", HostValue::num(self.config.min_peak_distance as f64))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let threshold = value.get("threshold")?.as_f32()?;
        let mode_str = value.get("mode")?.as_str()?;
        let domain_str = value.get("domain")?.as_str()?;
        let window_size = value.get("window_size")?.as_i32()? as usize;
        let min_peak_distance = value.get("min_peak_distance")?.as_i32()? as usize;

        let mode = Mode::from_str(mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown peak mode `{mode_str}`")).unwrap_err())?;
        let domain = Domain::from_str(domain_str)
            .ok_or_else(|| state_error::<()>(format!("unknown peak domain `{domain_str}`")).unwrap_err())?;

        if (threshold - self.config.threshold).abs() > 1e-6 {
            return state_error("peak threshold mismatch in host payload");
        }
        if mode != self.config.mode {
            return state_error("peak mode mismatch in host payload");
        }
        if domain != self.config.domain {
            return state_error("peak domain mismatch in host payload");
        }
        if window_size != self.config.window_size {
            return state_error("peak window_size mismatch in host payload");
        }
        if min_peak_distance != self.config.min_peak_distance {
            return state_error("peak min_peak_distance mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                Ok(MovingChannelState {
                    prev_prev: ch.get("prev_prev")?.as_f32()?,
                    prev: ch.get("prev")?.as_f32()?,
                    cooldown: ch.get("cooldown")?.as_i32()? as usize,
                    seen: if ch.get("seen_full")?.as_bool()? { 2 } else { 1 },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.channels.restore(channels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_peak_detects_single_interior_peak_with_one_sample_latency() {
        let mut peak =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Moving, domain: Domain::Time, window_size: 3, min_peak_distance: 1 })
                .unwrap();
        let mut buf = [1.0, 3.0, 1.0, 1.0, 1.0];
        peak.process(&mut buf, 5, 1, None).unwrap();
        assert_eq!(buf, [0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn moving_peak_respects_cooldown() {
        let mut peak =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Moving, domain: Domain::Time, window_size: 3, min_peak_distance: 6 })
                .unwrap();
        let mut buf = [0.0, 5.0, 0.0, 0.0, 5.0, 0.0, 0.0];
        peak.process(&mut buf, 7, 1, None).unwrap();
        assert_eq!(buf[1], 1.0);
        assert_eq!(buf[4], 0.0, "second peak inside cooldown must not fire");
    }

    #[test]
    fn moving_peak_rejects_below_threshold() {
        let mut peak =
            Peak::new(PeakConfig { threshold: 10.0, mode: Mode::Moving, domain: Domain::Time, window_size: 3, min_peak_distance: 1 })
                .unwrap();
        let mut buf = [1.0, 3.0, 1.0];
        peak.process(&mut buf, 3, 1, None).unwrap();
        assert_eq!(buf, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn batch_time_domain_detects_centered_max_with_boundary_zeros() {
        let mut peak =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Batch, domain: Domain::Time, window_size: 3, min_peak_distance: 1 })
                .unwrap();
        let mut buf = [1.0, 5.0, 1.0, 1.0, 4.0, 1.0];
        peak.process(&mut buf, 6, 1, None).unwrap();
        assert_eq!(buf, [0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn batch_min_peak_distance_suppresses_nearby_peak() {
        let mut peak =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Batch, domain: Domain::Time, window_size: 3, min_peak_distance: 5 })
                .unwrap();
        let mut buf = [0.0, 5.0, 0.0, 0.0, 4.0, 0.0, 0.0];
        peak.process(&mut buf, 7, 1, None).unwrap();
        assert_eq!(buf[1], 1.0);
        assert_eq!(buf[4], 0.0);
    }

    #[test]
    fn rejects_invalid_window_size() {
        assert!(Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Batch, domain: Domain::Time, window_size: 4, min_peak_distance: 1 })
            .is_err());
        assert!(Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Batch, domain: Domain::Time, window_size: 2, min_peak_distance: 1 })
            .is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Moving, domain: Domain::Time, window_size: 3, min_peak_distance: 2 })
                .unwrap();
        let mut buf = [0.0, 5.0, 0.0, 0.0];
        a.process(&mut buf, 4, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b =
            Peak::new(PeakConfig { threshold: 0.0, mode: Mode::Moving, domain: Domain::Time, window_size: 3, min_peak_distance: 2 })
                .unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let mut na = [9.0, 0.0];
        let mut nb = [9.0, 0.0];
        a.process(&mut na, 2, 1, None).unwrap();
        b.process(&mut nb, 2, 1, None).unwrap();
        assert_eq!(na, nb);
    }
}
