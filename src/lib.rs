// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A streaming DSP pipeline runtime: a uniform [`stage::Stage`] contract, the TOON binary state
//! format, a mirrored host object-tree format, and a library of stateful/stateless processing
//! stages (moving averages, adaptive filters, an interpolator, peak detection, and a mel
//! spectrogram projection).

pub mod aggregate;
pub mod buffer;
pub mod error;
pub mod host;
pub mod stage;
pub mod stages;
pub mod toon;

pub use error::{StageError, Result};
pub use host::HostValue;
pub use stage::{process_buffer, Pipeline, Stage, StageRegistry};
pub use toon::{Deserializer, Serializer};
