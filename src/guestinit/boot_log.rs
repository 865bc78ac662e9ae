//! Serial-console boot log.
//!
//! PID 1 has no subscriber infrastructure; lines go straight to stderr,
//! which the essentials phase re-binds to the serial console. Shape:
//! `<RFC3339> [INFO|ERROR] [<phase>] <msg>[: <error>]`.

use std::fmt::Display;
use std::io::Write;

use chrono::{SecondsFormat, Utc};

pub fn info(phase: &str, msg: impl Display) {
    line("INFO", phase, msg);
}

pub fn error(phase: &str, msg: impl Display) {
    line("ERROR", phase, msg);
}

fn line(level: &str, phase: &str, msg: impl Display) {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "{ts} [{level}] [{phase}] {msg}");
}
