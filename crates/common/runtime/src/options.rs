// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::thread::available_parallelism;

use bon::Builder;
use smart_default::SmartDefault;

/// Sizing of the process-wide pools.
///
/// `transfer` runs fetch operations (network and file I/O), `delivery` runs
/// the per-subscriber callback drains so slow callbacks never stall a
/// transfer.
#[derive(Debug, Clone, SmartDefault, Builder)]
#[builder(finish_fn = build)]
pub struct GlobalRuntimeOptions {
    #[default(cpu_threads())]
    #[builder(default = cpu_threads())]
    pub transfer_threads: usize,

    #[default(delivery_threads())]
    #[builder(default = delivery_threads())]
    pub delivery_threads: usize,

    /// Cap on the transfer pool's blocking threads, which serve `file://`
    /// reads.
    #[default = 64]
    #[builder(default = 64)]
    pub transfer_blocking_threads: usize,
}

#[derive(Debug, Clone, SmartDefault, Builder)]
#[builder(finish_fn = build)]
pub struct RuntimeOptions {
    /// Defaults to one per CPU.
    pub worker_threads: Option<usize>,

    /// Defaults to tokio's own limit.
    pub max_blocking_threads: Option<usize>,

    #[default("pixload-rt".to_string())]
    #[builder(default = "pixload-rt".to_string())]
    pub thread_name: String,

    #[default(true)]
    #[builder(default = true)]
    pub enable_io: bool,

    #[default(true)]
    #[builder(default = true)]
    pub enable_time: bool,
}

pub(crate) fn cpu_threads() -> usize {
    available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
        .max(1)
}

pub(crate) fn delivery_threads() -> usize { (cpu_threads() / 2).clamp(1, 4) }
