// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `stage` module defines the uniform [`Stage`] contract shared by every processing stage,
//! plus a small [`Pipeline`] harness and [`StageRegistry`] that exercise it end-to-end.

use std::collections::HashMap;

use crate::error::{contract_error, Result};
use crate::host::HostValue;
use crate::toon::{Deserializer, Serializer};

/// The uniform contract implemented by every processing stage.
///
/// A stage is strictly per-instance stateful and assumes single-threaded access: the caller
/// serializes all calls to any one stage. `Stage: Send` costs nothing here (no interior
/// mutability) and lets a [`Pipeline`] be handed off across a thread boundary between (not during)
/// buffer submissions.
pub trait Stage: Send {
    /// A stable identifier used for serialization discrimination and routing.
    fn type_tag(&self) -> &'static str;

    /// Whether this stage changes buffer length. Default: `false`.
    fn is_resizing(&self) -> bool {
        false
    }

    /// The ratio of an output timestamp's spacing to an input timestamp's spacing. Default: `1.0`;
    /// resizing stages override.
    fn time_scale_factor(&self) -> f64 {
        1.0
    }

    /// The output buffer length a resizing stage needs for a given input length. Default: identity.
    fn calculate_output_size(&self, input_len: usize) -> usize {
        input_len
    }

    /// Mutate `buf` in place. Fatal (a [`crate::error::StageError::Contract`]) for stages that
    /// declare `is_resizing() == true`.
    fn process(
        &mut self,
        buf: &mut [f32],
        num_samples_total: usize,
        num_channels: usize,
        timestamps_ms: Option<&[f64]>,
    ) -> Result<()>;

    /// Process into a separately-sized output buffer. The default delegates to [`Stage::process`]
    /// after copying `input` into `output`, which is correct for every non-resizing stage.
    /// Resizing stages must override this.
    fn process_resizing(
        &mut self,
        input: &[f32],
        input_len: usize,
        output: &mut [f32],
        output_len: &mut usize,
        num_channels: usize,
        timestamps_ms: Option<&[f64]>,
    ) -> Result<()> {
        if output.len() < input_len {
            return contract_error("process_resizing: output buffer shorter than input");
        }
        output[..input_len].copy_from_slice(&input[..input_len]);
        self.process(&mut output[..input_len], input_len, num_channels, timestamps_ms)?;
        *output_len = input_len;
        Ok(())
    }

    /// Return the stage to its post-construction state, preserving configuration.
    fn reset(&mut self);

    /// Write this stage's persisted state to `ser`, in the stage-specific framing fixed by its
    /// own implementation.
    fn serialize_toon(&self, ser: &mut Serializer);

    /// Restore this stage's persisted state from `de`. Must validate the payload's configuration
    /// against this stage's own configuration *before* mutating any state.
    fn deserialize_toon(&mut self, de: &mut Deserializer) -> Result<()>;

    /// Mirror of [`Stage::serialize_toon`] using the host object-tree schema.
    fn serialize_host(&self) -> HostValue;

    /// Mirror of [`Stage::deserialize_toon`] using the host object-tree schema.
    fn deserialize_host(&mut self, value: &HostValue) -> Result<()>;
}

/// Process one buffer through `stage`, dispatching to [`Stage::process`] or
/// [`Stage::process_resizing`] depending on [`Stage::is_resizing`].
///
/// For a resizing stage, the output buffer is allocated from [`Stage::calculate_output_size`] and
/// an optional timestamp vector is rescaled by [`Stage::time_scale_factor`], assuming (as the
/// pipeline harness does throughout) uniformly spaced input timestamps.
pub fn process_buffer(
    stage: &mut dyn Stage,
    buf: &mut [f32],
    num_samples_total: usize,
    num_channels: usize,
    timestamps_ms: Option<&[f64]>,
) -> Result<(Vec<f32>, usize, Option<Vec<f64>>)> {
    if !stage.is_resizing() {
        stage.process(buf, num_samples_total, num_channels, timestamps_ms)?;
        return Ok((buf.to_vec(), num_samples_total, timestamps_ms.map(|t| t.to_vec())));
    }

    let out_cap = stage.calculate_output_size(num_samples_total);
    let mut output = vec![0.0f32; out_cap];
    let mut out_len = 0usize;
    stage.process_resizing(buf, num_samples_total, &mut output, &mut out_len, num_channels, timestamps_ms)?;
    output.truncate(out_len);

    let out_ts = timestamps_ms.and_then(|ts| rescale_timestamps(ts, num_channels, out_len, stage.time_scale_factor()));

    Ok((output, out_len, out_ts))
}

/// Linearly rescale a timestamp vector assuming uniform input spacing. Only used by this
/// additive pipeline harness, not a core stage responsibility.
fn rescale_timestamps(ts: &[f64], num_channels: usize, out_len: usize, scale: f64) -> Option<Vec<f64>> {
    if ts.len() < 2 || num_channels == 0 {
        return None;
    }
    let out_samples_per_channel = out_len / num_channels;
    let dt = (ts[1] - ts[0]) * scale;
    let t0 = ts[0];
    Some((0..out_samples_per_channel).map(|j| t0 + j as f64 * dt).collect())
}

/// An ordered chain of stages that threads one buffer through each in turn.
///
/// This is explicitly *not* a scheduler: there is no threading, no back-pressure, and no topology
/// graph. It exists so the stage library has a realized, testable caller that exercises the
/// dispatch contract end-to-end, per the teacher's `formats`/`codecs` pattern of a thin loop
/// driving caller-supplied trait objects.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: Box<dyn Stage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Thread `buf` through every stage, returning the final buffer, its length, and optionally
    /// rescaled timestamps.
    pub fn run(
        &mut self,
        mut buf: Vec<f32>,
        mut len: usize,
        num_channels: usize,
        mut timestamps_ms: Option<Vec<f64>>,
    ) -> Result<(Vec<f32>, usize, Option<Vec<f64>>)> {
        for stage in self.stages.iter_mut() {
            log::trace!("pipeline: threading {} samples through stage `{}`", len, stage.type_tag());
            let (out, out_len, out_ts) =
                process_buffer(stage.as_mut(), &mut buf[..len], len, num_channels, timestamps_ms.as_deref())?;
            buf = out;
            len = out_len;
            timestamps_ms = out_ts;
        }
        Ok((buf, len, timestamps_ms))
    }

    pub fn reset_all(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.reset();
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a stage's `type_tag` to a constructor, so a TOON or host payload carrying a type tag can
/// be routed to the right concrete stage without the caller hand-writing a big `match`.
#[derive(Default)]
pub struct StageRegistry {
    ctors: HashMap<&'static str, Box<dyn Fn() -> Box<dyn Stage>>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self { ctors: HashMap::new() }
    }

    pub fn register(&mut self, type_tag: &'static str, ctor: impl Fn() -> Box<dyn Stage> + 'static) {
        self.ctors.insert(type_tag, Box::new(ctor));
    }

    pub fn construct(&self, type_tag: &str) -> Option<Box<dyn Stage>> {
        self.ctors.get(type_tag).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::cma::{Cma, CmaConfig};
    use crate::stages::Mode;

    #[test]
    fn pipeline_threads_buffer_through_stage() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Box::new(Cma::new(CmaConfig { mode: Mode::Moving }).unwrap()));

        let (out, len, _) = pipeline.run(vec![2.0, 4.0, 4.0, 4.0, 4.0], 5, 1, None).unwrap();
        assert_eq!(len, 5);
        assert_eq!(out, vec![2.0, 3.0, 10.0 / 3.0, 3.5, 3.6]);
    }

    #[test]
    fn registry_constructs_by_type_tag() {
        let mut registry = StageRegistry::new();
        registry.register("cma", || Box::new(Cma::new(CmaConfig { mode: Mode::Moving }).unwrap()));

        let stage = registry.construct("cma").expect("registered");
        assert_eq!(stage.type_tag(), "cma");
        assert!(registry.construct("unknown").is_none());
    }
}
