// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The policy-parameterized linear regression stage: a circular-window least-squares fit shared
//! by four output policies (`slope`, `intercept`, `residuals`, `predictions`). The policy is a
//! tagged enum dispatched at emit time rather than four monomorphized types, since all four share
//! the entire per-sample fit and differ only in the final projection.

use crate::aggregate::{CircularWindow, PerChannelState};
use crate::error::{config_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::toon::{Deserializer, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Slope,
    Intercept,
    Residuals,
    Predictions,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Slope => "slope",
            Policy::Intercept => "intercept",
            Policy::Residuals => "residuals",
            Policy::Predictions => "predictions",
        }
    }

    pub fn from_str(s: &str) -> Option<Policy> {
        match s {
            "slope" => Some(Policy::Slope),
            "intercept" => Some(Policy::Intercept),
            "residuals" => Some(Policy::Residuals),
            "predictions" => Some(Policy::Predictions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinRegConfig {
    pub window_size: usize,
    pub policy: Policy,
}

struct Fit {
    slope: f32,
    intercept: f32,
}

fn fit_window(window: &CircularWindow) -> Fit {
    let count = window.len();
    let mean_x = (count - 1) as f32 / 2.0;
    let sum_y: f32 = window.iter_arrival_order().sum();
    let mean_y = sum_y / count as f32;

    let mut sum_xy = 0.0f32;
    let mut sum_xx = 0.0f32;
    for (i, y) in window.iter_arrival_order().enumerate() {
        let x = i as f32 - mean_x;
        let dy = y - mean_y;
        sum_xy += x * dy;
        sum_xx += x * x;
    }

    let slope = if sum_xx.abs() < 1e-10 { 0.0 } else { sum_xy / sum_xx };
    let intercept = mean_y - slope * mean_x;
    Fit { slope, intercept }
}

pub struct LinearRegression {
    config: LinRegConfig,
    channels: PerChannelState<CircularWindow>,
}

impl LinearRegression {
    pub fn new(config: LinRegConfig) -> Result<Self> {
        if config.window_size < 2 {
            return config_error("linear regression window_size must be >= 2");
        }
        Ok(Self { config, channels: PerChannelState::new() })
    }
}

impl Stage for LinearRegression {
    fn type_tag(&self) -> &'static str {
        self.config.policy.as_str()
    }

    fn process(
        &mut self,
        buf: &mut [f32],
        num_samples_total: usize,
        num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        let samples_per_channel = num_samples_total / num_channels;
        let window_size = self.config.window_size;
        self.channels.bind(num_channels, || CircularWindow::new(window_size));

        for c in 0..num_channels {
            let window = self.channels.get_mut(c);
            for k in 0..samples_per_channel {
                let idx = k * num_channels + c;
                let y = buf[idx];
                window.push(y);

                if window.len() < 2 {
                    buf[idx] = 0.0;
                    continue;
                }

                let fit = fit_window(window);
                let x_now = (window.len() - 1) as f32;
                buf[idx] = match self.config.policy {
                    Policy::Slope => fit.slope,
                    Policy::Intercept => fit.intercept,
                    Policy::Residuals => y - (fit.slope * x_now + fit.intercept),
                    Policy::Predictions => fit.slope * x_now + fit.intercept,
                };
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.channels.clear();
    }

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_string(self.config.policy.as_str());
        ser.write_i32(self.config.window_size as i32);
        ser.write_i32(self.channels.num_channels() as i32);
        for window in self.channels.iter() {
            let values: Vec<f32> = window.iter_arrival_order().collect();
            ser.write_float_array(&values);
        }
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let policy_str = de.read_string()?;
        let window_size = de.read_i32()? as usize;
        let num_channels = de.read_i32()? as usize;

        let policy = Policy::from_str(&policy_str)
            .ok_or_else(|| state_error::<()>(format!("unknown linear regression policy `{policy_str}`")).unwrap_err())?;
        if policy != self.config.policy {
            return state_error("linear regression policy mismatch");
        }
        if window_size != self.config.window_size {
            return state_error("linear regression window_size mismatch");
        }

        let mut channels = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let values = de.read_float_array()?;
            let mut window = CircularWindow::new(window_size);
            for v in values {
                window.push(v);
            }
            channels.push(window);
        }

        self.channels.restore(channels);
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        let channels = self
            .channels
            .iter()
            .map(|window| HostValue::Array(window.iter_arrival_order().map(|x| HostValue::num(x as f64)).collect()))
            .collect();
        HostValue::object()
            .field("policy", HostValue::Str(self.config.policy.as_str().to_string()))
            .field("window_size", HostValue::num(self.config.window_size as f64))
            .field("channels", HostValue::Array(channels))
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let policy_str = value.get("policy")?.as_str()?;
        let window_size = value.get("window_size")?.as_i32()? as usize;

        let policy = Policy::from_str(policy_str)
            .ok_or_else(|| state_error::<()>(format!("unknown linear regression policy `{policy_str}`")).unwrap_err())?;
        if policy != self.config.policy {
            return state_error("linear regression policy mismatch in host payload");
        }
        if window_size != self.config.window_size {
            return state_error("linear regression window_size mismatch in host payload");
        }

        let channels = value
            .get("channels")?
            .as_array()?
            .iter()
            .map(|ch| {
                let values = ch.as_float_array()?;
                let mut window = CircularWindow::new(window_size);
                for v in values {
                    window.push(v);
                }
                Ok(window)
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
    fn slope_policy_scenario() {
        let mut stage = LinearRegression::new(LinRegConfig { window_size: 3, policy: Policy::Slope }).unwrap();
        let mut buf = [1.0, 3.0, 5.0];
        stage.process(&mut buf, 3, 1, None).unwrap();
        assert!((buf[2] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn all_policies_on_a_filled_window_of_a_line() {
        // y = 2k + 1 over a window of 4.
        let a = 2.0f32;
        let b = 1.0f32;
        let w = 4usize;
        let ys: Vec<f32> = (0..w as i32).map(|k| a * k as f32 + b).collect();

        let mut slope = LinearRegression::new(LinRegConfig { window_size: w, policy: Policy::Slope }).unwrap();
        let mut intercept = LinearRegression::new(LinRegConfig { window_size: w, policy: Policy::Intercept }).unwrap();
        let mut residuals = LinearRegression::new(LinRegConfig { window_size: w, policy: Policy::Residuals }).unwrap();
        let mut predictions = LinearRegression::new(LinRegConfig { window_size: w, policy: Policy::Predictions }).unwrap();

        let mut buf_slope = ys.clone();
        let mut buf_intercept = ys.clone();
        let mut buf_residuals = ys.clone();
        let mut buf_predictions = ys.clone();

        slope.process(&mut buf_slope, w, 1, None).unwrap();
        intercept.process(&mut buf_intercept, w, 1, None).unwrap();
        residuals.process(&mut buf_residuals, w, 1, None).unwrap();
        predictions.process(&mut buf_predictions, w, 1, None).unwrap();

        assert!((buf_slope[w - 1] - a).abs() < 1e-4);
        assert!((buf_intercept[w - 1] - b).abs() < 1e-4);
        assert!(buf_residuals[w - 1].abs() < 1e-4);
        assert!((buf_predictions[w - 1] - (a * (w - 1) as f32 + b)).abs() < 1e-4);
    }

    #[test]
    fn fewer_than_two_samples_emits_zero() {
        let mut stage = LinearRegression::new(LinRegConfig { window_size: 5, policy: Policy::Slope }).unwrap();
        let mut buf = [42.0];
        stage.process(&mut buf, 1, 1, None).unwrap();
        assert_eq!(buf[0], 0.0);
    }

    #[test]
    fn toon_rejects_policy_and_window_mismatch() {
        let a = LinearRegression::new(LinRegConfig { window_size: 4, policy: Policy::Slope }).unwrap();
        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();

        let mut wrong_policy = LinearRegression::new(LinRegConfig { window_size: 4, policy: Policy::Intercept }).unwrap();
        assert!(wrong_policy.deserialize_toon(&mut Deserializer::new(&bytes)).is_err());

        let mut wrong_window = LinearRegression::new(LinRegConfig { window_size: 5, policy: Policy::Slope }).unwrap();
        assert!(wrong_window.deserialize_toon(&mut Deserializer::new(&bytes)).is_err());
    }

    #[test]
    fn toon_round_trip_is_behaviorally_identical() {
        let mut a = LinearRegression::new(LinRegConfig { window_size: 4, policy: Policy::Slope }).unwrap();
        let mut buf = [1.0, 3.0, 2.0, 5.0];
        a.process(&mut buf, 4, 1, None).unwrap();

        let mut ser = Serializer::new();
        a.serialize_toon(&mut ser);
        let bytes = ser.into_bytes();
        let mut b = LinearRegression::new(LinRegConfig { window_size: 4, policy: Policy::Slope }).unwrap();
        b.deserialize_toon(&mut Deserializer::new(&bytes)).unwrap();

        let mut na = [7.0];
        let mut nb = [7.0];
        a.process(&mut na, 1, 1, None).unwrap();
        b.process(&mut nb, 1, 1, None).unwrap();
        assert_eq!(na, nb);
    }
}
