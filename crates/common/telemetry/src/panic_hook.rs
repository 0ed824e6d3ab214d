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

//! Routes panics through `tracing` so they reach the log files as well as
//! stderr.

use std::{panic, thread};

use backtrace::Backtrace;

/// Logs every panic as an error event, with the panicking thread and a
/// backtrace, then hands over to the previously installed hook.
pub fn set_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let current = thread::current();
        let thread = current.name().unwrap_or("<unnamed>");
        let backtrace = format!("{:?}", Backtrace::new());
        match info.location() {
            Some(at) => tracing::error!(
                thread,
                file = at.file(),
                line = at.line(),
                %backtrace,
                "panic: {info}"
            ),
            None => tracing::error!(thread, %backtrace, "panic: {info}"),
        }
        previous(info);
    }));
}
