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

//! Panic hook that reports through `tracing` and prometheus before handing
//! over to the default hook.

#[cfg(feature = "deadlock_detection")]
use std::time::Duration;
use std::{panic, sync::LazyLock};

use backtrace::Backtrace;
use prometheus::{IntCounter, register_int_counter};

pub static PANIC_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("pixload_panic_total", "Number of panics observed").unwrap()
});

/// Replace the panic hook with one that logs the panic, its location and a
/// backtrace as a structured error event and bumps [`PANIC_COUNTER`].
///
/// With the `deadlock_detection` feature a watchdog thread also reports
/// `parking_lot` deadlocks every five seconds.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let backtrace = format!("{:?}", Backtrace::new());
        match info.location() {
            Some(location) => tracing::error!(
                message = %info,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            ),
            None => tracing::error!(message = %info, backtrace = %backtrace),
        }
        PANIC_COUNTER.inc();
        default_hook(info);
    }));

    #[cfg(feature = "deadlock_detection")]
    let _ = std::thread::Builder::new()
        .name("deadlock-watchdog".to_string())
        .spawn(|| {
            loop {
                std::thread::sleep(Duration::from_secs(5));
                let deadlocks = parking_lot::deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }

                tracing::warn!(count = deadlocks.len(), "deadlocks detected");
                for (i, threads) in deadlocks.iter().enumerate() {
                    for t in threads {
                        tracing::warn!(
                            deadlock = i,
                            thread_id = ?t.thread_id(),
                            backtrace = ?t.backtrace(),
                        );
                    }
                }
            }
        });
}
