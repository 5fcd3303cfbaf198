//! UCI output helpers

use std::io::{self, Write};

/// Print one protocol line and flush, so a GUI on the other side of a
/// pipe sees it immediately.
pub fn uci_println(s: &str) {
    println!("{s}");
    let _ = io::stdout().flush();
}

/// `info string ...` convenience.
pub fn info_string<S: AsRef<str>>(s: S) {
    uci_println(&format!("info string {}", s.as_ref()));
}
