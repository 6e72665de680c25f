// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Mel spectrogram stage: a stateless matrix-vector projection of each `num_bins`-wide frame
//! onto a `num_mel_bands`-wide output through a fixed filterbank matrix.

use crate::error::{config_error, contract_error, state_error, Result};
use crate::host::HostValue;
use crate::stage::Stage;
use crate::toon::{Deserializer, Serializer};

#[derive(Debug, Clone)]
pub struct MelConfig {
    pub num_bins: usize,
    pub num_mel_bands: usize,
    /// Row-major, `num_mel_bands x num_bins`.
    pub filterbank: Vec<f32>,
}

pub struct Mel {
    config: MelConfig,
}

impl Mel {
    pub fn new(config: MelConfig) -> Result<Self> {
        if config.num_bins == 0 {
            return config_error("mel num_bins must be > 0");
        }
        if config.num_mel_bands == 0 {
            return config_error("mel num_mel_bands must be > 0");
        }
        if config.filterbank.len() != config.num_mel_bands * config.num_bins {
            return config_error("mel filterbank length must equal num_mel_bands * num_bins");
        }
        Ok(Self { config })
    }

    fn project_frame(&self, frame: &[f32], out: &mut [f32]) {
        let bins = self.config.num_bins;
        for (band, out_slot) in out.iter_mut().enumerate() {
            let row = &self.config.filterbank[band * bins..(band + 1) * bins];
            *out_slot = row.iter().zip(frame).map(|(&f, &v)| f * v).sum();
        }
    }
}

impl Stage for Mel {
    fn type_tag(&self) -> &'static str {
        "mel"
    }

    fn is_resizing(&self) -> bool {
        true
    }

    fn calculate_output_size(&self, input_len: usize) -> usize {
        (input_len / self.config.num_bins) * self.config.num_mel_bands
    }

    fn process(
        &mut self,
        _buf: &mut [f32],
        _num_samples_total: usize,
        _num_channels: usize,
        _timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        contract_error("mel is a resizing stage; call process_resizing")
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
        let num_bins = self.config.num_bins;
        let num_mel_bands = self.config.num_mel_bands;
        let samples_per_channel = input_len / num_channels;
        let num_frames = samples_per_channel / num_bins;

        if num_frames == 0 {
            *output_len = 0;
            return Ok(());
        }

        let out_len = num_frames * num_mel_bands * num_channels;
        if output.len() < out_len {
            return contract_error("mel: output buffer shorter than calculate_output_size");
        }

        let mut frame = vec![0.0f32; num_bins];
        let mut projected = vec![0.0f32; num_mel_bands];
        for c in 0..num_channels {
            for f in 0..num_frames {
                for b in 0..num_bins {
                    frame[b] = input[(f * num_bins + b) * num_channels + c];
                }
                self.project_frame(&frame, &mut projected);
                for m in 0..num_mel_bands {
                    output[(f * num_mel_bands + m) * num_channels + c] = projected[m];
                }
            }
        }

        *output_len = out_len;
        Ok(())
    }

    fn reset(&mut self) {}

    fn serialize_toon(&self, ser: &mut Serializer) {
        ser.write_i32(self.config.num_bins as i32);
        ser.write_i32(self.config.num_mel_bands as i32);
        ser.write_float_array(&self.config.filterbank);
    }

    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()> {
        let num_bins = de.read_i32()? as usize;
        let num_mel_bands = de.read_i32()? as usize;
        let filterbank = de.read_float_array()?;

        if num_bins != self.config.num_bins {
            return state_error("mel num_bins mismatch");
        }
        if num_mel_bands != self.config.num_mel_bands {
            return state_error("mel num_mel_bands mismatch");
        }
        if filterbank.len() != num_mel_bands * num_bins {
            return state_error("mel restored filterbank has wrong length");
        }

        self.config.filterbank = filterbank;
        Ok(())
    }

    fn serialize_host(&self) -> HostValue {
        HostValue::object()
            .field("num_bins", HostValue::num(self.config.num_bins as f64))
            .field("num_mel_bands", HostValue::num(self.config.num_mel_bands as f64))
            .field(
                "filterbank",
                HostValue::Array(self.config.filterbank.iter().map(|&f| HostValue::num(f as f64)).collect()),
            )
            .build()
    }

    fn deserialize_host(&mut self, value: &HostValue) -> Result<()> {
        let num_bins = value.get("num_bins")?.as_i32()? as usize;
        let num_mel_bands = value.get("num_mel_bands")?.as_i32()? as usize;
        let filterbank = value.get("filterbank")?.as_float_array()?;

        if num_bins != self.config.num_bins {
            return state_error("mel num_bins mismatch in host payload");
        }
        if num_mel_bands != self.config.num_mel_bands {
            return state_error("mel num_mel_bands mismatch in host payload");
        }
        if filterbank.len() != num_mel_bands * num_bins {
            return state_error("mel restored filterbank has wrong length in host payload");
        }

        self.config.filterbank = filterbank;
        Ok(())
    }
}
