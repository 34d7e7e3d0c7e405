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

use std::{future::Future, sync::Arc};

use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;

use crate::{
    error::{AlreadyInitializedSnafu, Result},
    options::{GlobalRuntimeOptions, RuntimeOptions},
};

#[derive(Debug)]
struct GlobalRuntimes {
    transfer: Arc<Runtime>,
    delivery: Arc<Runtime>,
}

static GLOBAL_RUNTIMES: OnceCell<GlobalRuntimes> = OnceCell::new();

fn build_global_runtimes(options: &GlobalRuntimeOptions) -> Result<GlobalRuntimes> {
    let transfer = RuntimeOptions::builder()
        .thread_name("rt-transfer".to_string())
        .worker_threads(options.transfer_threads)
        .max_blocking_threads(options.transfer_blocking_threads)
        .build()
        .create()?;
    let delivery = RuntimeOptions::builder()
        .thread_name("rt-delivery".to_string())
        .worker_threads(options.delivery_threads)
        .build()
        .create()?;

    Ok(GlobalRuntimes {
        transfer: Arc::new(transfer),
        delivery: Arc::new(delivery),
    })
}

fn global_runtimes() -> &'static GlobalRuntimes {
    GLOBAL_RUNTIMES.get_or_init(|| {
        build_global_runtimes(&GlobalRuntimeOptions::default())
            .expect("Failed to create global runtimes")
    })
}

/// Size the global pools explicitly. Must run before the first call to any
/// accessor below, otherwise the defaults are already in place.
pub fn init_global_runtimes(options: &GlobalRuntimeOptions) -> Result<()> {
    let runtimes = build_global_runtimes(options)?;
    GLOBAL_RUNTIMES
        .set(runtimes)
        .map_err(|_| AlreadyInitializedSnafu.build())
}

#[must_use]
pub fn transfer_runtime() -> Arc<Runtime> { Arc::clone(&global_runtimes().transfer) }

#[must_use]
pub fn delivery_runtime() -> Arc<Runtime> { Arc::clone(&global_runtimes().delivery) }

/// Drive `future` to completion on the delivery runtime.
pub fn block_on_delivery<F>(future: F) -> F::Output
where
    F: Future,
{
    delivery_runtime().block_on(future)
}
