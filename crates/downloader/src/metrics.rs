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

use std::sync::LazyLock;

use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

pub const OUTCOME_LABEL: &str = "outcome";

pub static FETCH_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "pixload_fetch_started_total",
        "Total number of fetch operations that started executing"
    )
    .unwrap()
});

pub static FETCH_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "pixload_fetch_finished_total",
        "Total number of fetch operations that reached a terminal state",
        &[OUTCOME_LABEL]
    )
    .unwrap()
});

pub static FETCH_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "pixload_fetch_active",
        "Number of fetch operations currently executing"
    )
    .unwrap()
});

pub static FETCH_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "pixload_fetch_bytes_total",
        "Total number of body bytes received"
    )
    .unwrap()
});

pub static FETCH_COALESCED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "pixload_fetch_coalesced_total",
        "Total number of fetches attached to an operation already in flight"
    )
    .unwrap()
});

pub static FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "pixload_fetch_duration_seconds",
        "Time from admission to terminal state",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});
