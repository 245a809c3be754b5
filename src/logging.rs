//! Log output for the sync engine and CLI.
//!
//! One line per event via [`clog!`]: time of day, source location, message.
//! Lines go to stderr by default; [`set_writer`] redirects them, which tests
//! use to capture output in a buffer.  Conversation and message ids are long
//! opaque strings, so [`conv_id`] and [`msg_id`] shorten them for log lines
//! and tint them when stderr is a terminal.

use std::io::{self, IsTerminal, Write};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

struct Sink {
    writer: Box<dyn Write + Send>,
    colour: bool,
}

static SINK: LazyLock<Mutex<Sink>> = LazyLock::new(|| {
    Mutex::new(Sink {
        writer: Box::new(io::stderr()),
        colour: false,
    })
});

/// Enable colour when stderr is a terminal.  Call once at startup.
pub fn init() {
    let colour = io::stderr().is_terminal();
    SINK.lock().unwrap().colour = colour;
}

/// Redirect log output.  Colour is turned off for custom writers.
pub fn set_writer(writer: Box<dyn Write + Send>) {
    let mut sink = SINK.lock().unwrap();
    sink.writer = writer;
    sink.colour = false;
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Tints applied to shortened ids, picked by byte sum so the same id always
/// renders in the same colour.
const TINTS: [&str; 6] = [
    "\x1b[36m", // cyan
    "\x1b[32m", // green
    "\x1b[35m", // magenta
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[31m", // red
];

const SHORT_ID_LEN: usize = 8;

fn tint_for(id: &str) -> &'static str {
    let sum: usize = id.bytes().map(usize::from).sum();
    TINTS[sum % TINTS.len()]
}

fn short_id(prefix: &str, id: &str) -> String {
    let short: String = id.chars().take(SHORT_ID_LEN).collect();
    let tagged = format!("{prefix}{short}");
    if SINK.lock().unwrap().colour {
        format!("{}{tagged}{RESET}", tint_for(id))
    } else {
        tagged
    }
}

/// Shortened conversation id for log lines, e.g. `c:27761234`.
pub fn conv_id(id: &str) -> String {
    short_id("c:", id)
}

/// Shortened message id for log lines, e.g. `m:kJ3n9QxZ`.
pub fn msg_id(id: &str) -> String {
    short_id("m:", id)
}

fn time_of_day() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = elapsed.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

/// Backing function for [`clog!`]; use the macro instead.
pub fn emit(file: &str, line: u32, msg: &str) {
    let stamp = time_of_day();
    let mut sink = SINK.lock().unwrap();
    let rendered = if sink.colour {
        format!("{DIM}{stamp} {file}:{line}{RESET} {msg}")
    } else {
        format!("{stamp} {file}:{line} {msg}")
    };
    let _ = writeln!(sink.writer, "{rendered}");
}

/// Emit one log line with a time stamp and the call site's location.
///
/// ```ignore
/// clog!("sync: fetched {} conversation(s)", count);
/// clog!("send: queued message for {}", logging::conv_id(&cid));
/// ```
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::logging::emit(file!(), line!(), &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn emit_includes_location_and_message() {
        let capture = Capture::default();
        set_writer(Box::new(capture.clone()));
        clog!("sync: merged {} conversation(s)", 3);
        set_writer(Box::new(io::stderr()));

        let logged = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("logging.rs"));
        assert!(logged.contains("sync: merged 3 conversation(s)"));
    }

    #[test]
    fn ids_are_shortened() {
        assert_eq!(conv_id("277612345678@c.us"), "c:27761234");
        assert_eq!(msg_id("short"), "m:short");
    }
}
