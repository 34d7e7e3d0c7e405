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

use std::sync::atomic::{AtomicUsize, Ordering};

use snafu::ResultExt;
use tokio::runtime::{Builder, Runtime};

use crate::{
    error::{BuildSnafu, Result},
    options::{RuntimeOptions, cpu_threads},
};

impl RuntimeOptions {
    /// Build a multi-thread runtime. Threads are named `{thread_name}-{n}`,
    /// with `n` counting up from 0 across workers and blocking threads.
    pub fn create(self) -> Result<Runtime> {
        let Self {
            worker_threads,
            max_blocking_threads,
            thread_name,
            enable_io,
            enable_time,
        } = self;

        let mut builder = Builder::new_multi_thread();
        builder.worker_threads(worker_threads.unwrap_or_else(cpu_threads).max(1));
        if let Some(max) = max_blocking_threads {
            builder.max_blocking_threads(max.max(1));
        }
        if enable_io {
            builder.enable_io();
        }
        if enable_time {
            builder.enable_time();
        }

        let next = AtomicUsize::new(0);
        builder.thread_name_fn(move || {
            format!("{thread_name}-{}", next.fetch_add(1, Ordering::Relaxed))
        });
        builder.build().context(BuildSnafu)
    }
}
