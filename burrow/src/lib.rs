// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Data-plane relay for tunnel channels, plus the key material and fingerprints
//! that identify a tunnel endpoint across restarts.

pub mod common;
pub mod util;
