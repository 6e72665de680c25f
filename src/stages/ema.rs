// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Exponential Moving Average (EMA) stage.

use crate::aggregate::PerChannelState;
use crate::error::{config_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::stages::Mode;
use crate::toon::{Deserializer, Serializer, Token};

const ALPHA_TOLERANCE: f32 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct EmaConfig {
    pub mode: Mode,
    pub alpha: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct EmaChannelState {
    ema: f32,
    initialized: bool,
}

pub struct Ema {
    config: EmaConfig,
    channels: PerChannelState<EmaChannelState>,
}

impl Ema {
    pub fn new(config: EmaConfig) -> Result<Self> {
        if !(config.alpha > 0.0 && config.alpha <= 1.0) {
            return config_error(format!("ema alpha must be in (0, 1], got {}", config.alpha));
        }
        Ok(Self { config, channels: PerChannelState::new() })
    }

    fn process_batch(&self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        let alpha = self.config.alpha;
        for c in 0..num_channels {
            let mut ema = buf[c];
            for k in 1..samples_per_channel {
                let idx = k * num_channels + c;
                ema = alpha * buf[idx] + (1.0 - alpha) * ema;
                buf[idx] = ema;
            }
        }
    }

    fn process_moving(&mut self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        let alpha = self.config.alpha;
        self.channels.bind(num_channels, EmaChannelState::default);
        for c in 0..num_channels {
            let state = self.channels.get_mut(c);
            for k in 0..samples_per_channel {
                let idx = k * num_channels + c;
                if !state.initialized {
                    state.ema = buf[idx];
                    state.initialized = true;
                }
                else {
                    state.ema = alpha * buf[idx] + (1.0 - alpha) * state.ema;
                }
                buf[idx] = state.ema;
            }
        }
    }
}

impl Stage for Ema {
    fn type_tag(&self) -> &'static str {
        "ema"
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
            Mode::Batch => self.process_batch(buf, samples_per_channel, num_channels),
            Mode::Moving => self.process_moving(buf, samples_per_channel, num_channels),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.channels.clear();
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.object_start();
        ser.write_string(self.config.mode.as_str());
        ser.write_f32(self.config.alpha);
        ser.array_start();
        for ch in self.channels.iter() {
            ser.object_start();
            ser.write_f32(ch.ema);
            ser.write_bool(ch.initialized);
            ser.object_end();
        }
        ser.array_end();
        ser.object_end();
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        de.consume_token(Token::ObjectStart)?;
        let mode_str = de.read_string()?;
        let alpha = de.read_f32()?;

        let mode = Mode::from_str(&mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown ema mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("ema mode mismatch");
        }
        if (alpha - self.config.alpha).abs() > ALPHA_TOLERANCE {
            return state_error(format!(
                "ema alpha mismatch: payload {alpha}, stage {}",
                self.config.alpha
            ));
        }

        de.consume_token(Token::ArrayStart)?;
        let mut channels = Vec::new();
        while de.peek_token()? == Token::ObjectStart {
            de.consume_token(Token::ObjectStart)?;
            let ema = de.read_f32()?;
            let initialized = de.read_bool()?;
            de.consume_token(Token::ObjectEnd)?;
            channels.push(EmaChannelState { ema, initialized });
        }
        de.consume_token(Token::ArrayEnd)?;
        de.consume_token(Token::ObjectEnd)?;

        self.channels.restore(channels);
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                HostValue::object()
                    .field("ema", HostValue::num(ch.ema as f64))
                    .field("initialized", HostValue::Bool(ch.initialized))
                    .build()
            })
            .collect();
        HostValue::object()
            .field("mode", HostValue::Str(self.config.mode.as_str().to_string()))
            .field("alpha", HostValue::num(self.config.alpha as f64))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let mode_str = value.get("mode")?.as_str()?;
        let alpha = value.get("alpha")?.as_f32()?;

        let mode = Mode::from_str(mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown ema mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("ema mode mismatch in host payload");
        }
        if (alpha - self.config.alpha).abs() > ALPHA_TOLERANCE {
            return state_error("ema alpha mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                Ok(EmaChannelState {
                    ema: ch.get("ema")?.as_f32()?,
                    initialized: ch.get("initialized")?.as_bool()?,
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
    fn moving_ema_scenario() {
        let mut ema = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.5 }).unwrap();
        let mut buf = [10.0, 0.0, 0.0, 0.0];
        ema.process(&mut buf, 4, 1, None).unwrap();
        assert_eq!(buf, [10.0, 5.0, 2.5, 1.25]);
    }

    #[test]
    fn alpha_one_is_identity() {
        let mut ema = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 1.0 }).unwrap();
        let mut buf = [3.0, -7.0, 2.0];
        let input = buf;
        ema.process(&mut buf, 3, 1, None).unwrap();
        assert_eq!(buf, input);
    }

    #[test]
    fn tiny_alpha_converges_to_first_sample() {
        let mut ema = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 1e-4 }).unwrap();
        let mut buf = [42.0, 100.0, -50.0, 0.0];
        ema.process(&mut buf, 4, 1, None).unwrap();
        for &v in &buf {
            assert!((v - 42.0).abs() < 0.1, "expected near 42.0, got {v}");
        }
    }

    #[test]
    fn rejects_invalid_alpha() {
        assert!(Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.0 }).is_err());
        assert!(Ema::new(EmaConfig { mode: Mode::Moving, alpha: 1.5 }).is_err());
    }

    #[test]
    fn toon_rejects_alpha_mismatch() {
        let a = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.5 }).unwrap();
        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();

        let mut b = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.9 }).unwrap();
        let mut de = Deserializer::new(&bytes);
        assert!(b.deserialize_toon(&mut de).is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.3 }).unwrap();
        let mut buf = [1.0, 2.0, 3.0];
        a.process(&mut buf, 3, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b = Ema::new(EmaConfig { mode: Mode::Moving, alpha: 0.3 }).unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let mut na = [9.0];
        let mut nb = [9.0];
        a.process(&mut na, 1, 1, None).unwrap();
        b.process(&mut nb, 1, 1, None).unwrap();
        assert_eq!(na, nb);
    }
}
