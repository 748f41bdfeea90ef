// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: slot ring, thread creation and the two realizations.

mod engine;
mod error;
mod mono;
mod multi;
mod ring;
mod spawn;
mod worker;

pub use engine::{AnyEngine, Engine, EngineBuilder, EngineMode, EngineStats, SlotCount};
pub use error::{InitError, LaunchError};
pub use mono::MonoEngine;
pub use multi::MultiEngine;
pub use spawn::{is_transient, CpuPinningPolicy, Joined, OsThreads, ThreadSpawner};
pub use worker::{Worker, WorkerContext};
