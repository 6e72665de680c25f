// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Cumulative Moving Average (CMA) stage.

use crate::aggregate::PerChannelState;
use crate::error::{state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::stages::Mode;
use crate::toon::{Deserializer, Serializer, Token};

#[derive(Debug, Clone, Copy)]
pub struct CmaConfig {
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, Default)]
struct CmaChannelState {
    sum: f32,
    count: u32,
}

pub struct Cma {
    config: CmaConfig,
    channels: PerChannelState<CmaChannelState>,
}

impl Cma {
    pub fn new(config: CmaConfig) -> Result<Self> {
        Ok(Self { config, channels: PerChannelState::new() })
    }

    fn process_batch(&self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        for c in 0..num_channels {
            let mut sum = 0.0f32;
            for k in 0..samples_per_channel {
                let idx = k * num_channels + c;
                sum += buf[idx];
                buf[idx] = sum / (k + 1) as f32;
            }
        }
    }

    fn process_moving(&mut self, buf: &mut [f32], samples_per_channel: usize, num_channels: usize) {
        self.channels.bind(num_channels, CmaChannelState::default);
        for c in 0..num_channels {
            let state = self.channels.get_mut(c);
            for k in 0..samples_per_channel {
                let idx = k * num_channels + c;
                state.sum += buf[idx];
                state.count += 1;
                buf[idx] = state.sum / state.count as f32;
            }
        }
    }
}

impl Stage for Cma {
    fn type_tag(&self) -> &'static str {
        "cma"
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
        ser.array_start();
        for ch in self.channels.iter() {
            ser.object_start();
            ser.write_f32(ch.sum);
            ser.write_i32(ch.count as i32);
            ser.object_end();
        }
        ser.array_end();
        ser.object_end();
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        de.consume_token(Token::ObjectStart)?;
        let mode_str = de.read_string()?;
        let mode = Mode::from_str(&mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown cma mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error(format!(
                "cma mode mismatch: payload is `{mode_str}`, stage is `{}`",
                self.config.mode.as_str()
            ));
        }

        de.consume_token(Token::ArrayStart)?;
        let mut channels = Vec::new();
        while de.peek_token()? == Token::ObjectStart {
            de.consume_token(Token::ObjectStart)?;
            let sum = de.read_f32()?;
            let count = de.read_i32()? as u32;
            de.consume_token(Token::ObjectEnd)?;
            channels.push(CmaChannelState { sum, count });
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
                    .field("sum", HostValue::num(ch.sum as f64))
                    .field("count", HostValue::num(ch.count as f64))
                    .build()
            })
            .collect();
        HostValue::object()
            .field("mode", HostValue::Str(self.config.mode.as_str().to_string()))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let mode_str = value.get("mode")?.as_str()?;
        let mode = Mode::from_str(mode_str)
            .ok_or_else(|| state_error::<()>(format!("unknown cma mode `{mode_str}`")).unwrap_err())?;
        if mode != self.config.mode {
            return state_error("cma mode mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                Ok(CmaChannelState { sum: ch.get("sum")?.as_f32()?, count: ch.get("count")?.as_i32()? as u32 })
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
    fn moving_cma_scenario() {
        let mut cma = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut buf = [2.0, 4.0, 4.0, 4.0, 4.0];
        cma.process(&mut buf, 5, 1, None).unwrap();
        assert_eq!(buf, [2.0, 3.0, 10.0 / 3.0, 3.5, 3.6]);
    }

    #[test]
    fn moving_cma_on_constant_input_emits_constant_from_first_sample() {
        let mut cma = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut buf = [5.0, 5.0, 5.0];
        cma.process(&mut buf, 3, 1, None).unwrap();
        assert_eq!(buf, [5.0, 5.0, 5.0]);
    }

    #[test]
    fn reset_then_reuse_matches_fresh_stage() {
        let mut used = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut buf = [1.0, 2.0, 3.0];
        used.process(&mut buf, 3, 1, None).unwrap();
        used.reset();

        let mut fresh = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();

        let mut a = [7.0, 8.0];
        let mut b = [7.0, 8.0];
        used.process(&mut a, 2, 1, None).unwrap();
        fresh.process(&mut b, 2, 1, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut buf = [1.0, 3.0, 5.0];
        a.process(&mut buf, 3, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();

        let mut b = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut de = Deserializer::new(&bytes);
        b.deserialize_toon(&mut de).unwrap();

        let mut next_a = [2.0];
        let mut next_b = [2.0];
        a.process(&mut next_a, 1, 1, None).unwrap();
        b.process(&mut next_b, 1, 1, None).unwrap();
        assert_eq!(next_a, next_b);
    }

    #[test]
    fn toon_rejects_mode_mismatch() {
        let moving = Cma::new(CmaConfig { mode: Mode::Moving }).unwrap();
        let mut ser = Serializer::new();
        moving.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();

        let mut batch = Cma::new(CmaConfig { mode: Mode::Batch }).unwrap();
        let mut de = Deserializer::new(&bytes);
        assert!(batch.deserialize_toon(&mut de).is_err());
    }

    #[test]
    fn batch_cma_is_stateless_across_calls() {
        let mut cma = Cma::new(CmaConfig { mode: Mode::Batch }).unwrap();
        let mut buf1 = [2.0, 4.0, 4.0, 4.0, 4.0];
        cma.process(&mut buf1, 5, 1, None).unwrap();
        assert_eq!(buf1, [2.0, 3.0, 10.0 / 3.0, 3.5, 3.6]);

        let mut buf2 = [2.0, 4.0, 4.0, 4.0, 4.0];
        cma.process(&mut buf2, 5, 1, None).unwrap();
        assert_eq!(buf1, buf2);
    }
}
