// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: `log` facade backend writing single-line records to a console
//! OWNERS: @kernel-team
//! PUBLIC API: init(console, level)
//! DEPENDS_ON: hal::Console, spin::Mutex
//! INVARIANTS: One line per record, formatted `[LEVEL target] message`

extern crate alloc;

use alloc::sync::Arc;
use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

use crate::hal::Console;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static SINK: Mutex<Option<Arc<dyn Console>>> = Mutex::new(None);

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = SINK.lock();
        let Some(console) = sink.as_ref() else {
            return;
        };
        let mut out = ConsoleWriter(console.as_ref());
        let _ = writeln!(out, "[{} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Routes kernel log records to `console`. Later calls only swap the sink and level.
pub fn init(console: Arc<dyn Console>, level: LevelFilter) {
    *SINK.lock() = Some(console);
    // Already installed by an earlier call.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::CaptureConsole;

    #[test]
    fn records_are_single_tagged_lines() {
        let console = Arc::new(CaptureConsole::new());
        init(console.clone(), LevelFilter::Info);
        log::info!(target: "diag", "hello {}", 7);
        log::debug!(target: "diag", "filtered");
        let text = console.contents();
        assert!(text.contains("[INFO diag] hello 7\n"));
        assert!(!text.contains("filtered"));
    }
}
