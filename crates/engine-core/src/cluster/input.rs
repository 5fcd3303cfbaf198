//! Stdin relay
//!
//! The root rank reads a line from its input and broadcasts it so every
//! rank's UCI thread sees the same command stream. Non-root ranks block
//! only inside this call, never on a terminal, and wait for the length
//! broadcast in a coarse sleep loop: transports tend to busy-spin in
//! their wait primitives, which would starve the search threads.

use crate::cluster::transport::Comm;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared replacement for a plain line read. Returns the root's stream
/// state: false once the root hits end of input, on every rank in the
/// same call.
pub(crate) fn relay_getline(comm: &Comm, input: &mut dyn BufRead, out: &mut String) -> bool {
    let is_root = comm.rank() == 0;
    let mut state = false;

    if is_root {
        state = read_trimmed_line(input, out);
    }

    let len_payload = (out.len() as i32).to_le_bytes();
    let mut req = comm.ibcast(0, &len_payload);
    if is_root {
        req.wait();
    } else {
        while !req.test() {
            thread::sleep(POLL_INTERVAL);
        }
    }
    let len = i32::from_le_bytes(req.data().try_into().unwrap()) as usize;

    let body = comm.bcast(0, out.as_bytes());
    let flag = comm.bcast(0, &[state as u8]);
    if !is_root {
        debug_assert_eq!(body.len(), len);
        *out = String::from_utf8_lossy(&body).into_owned();
        state = flag[0] != 0;
    }
    state
}

/// Plain line read with the line terminator stripped, used directly in
/// the single-rank flavour. False on end of input or a read error.
pub(crate) fn read_trimmed_line(input: &mut dyn BufRead, out: &mut String) -> bool {
    out.clear();
    match input.read_line(out) {
        Ok(0) => false,
        Ok(_) => {
            if out.ends_with('\n') {
                out.pop();
                if out.ends_with('\r') {
                    out.pop();
                }
            }
            true
        }
        Err(e) => {
            log::warn!("input read failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn trims_line_endings() {
        let mut out = String::new();
        assert!(read_trimmed_line(&mut Cursor::new(b"go depth 5\r\n".to_vec()), &mut out));
        assert_eq!(out, "go depth 5");
    }

    #[test]
    fn empty_line_is_still_a_line() {
        let mut out = String::new();
        assert!(read_trimmed_line(&mut Cursor::new(b"\n".to_vec()), &mut out));
        assert_eq!(out, "");
    }

    #[test]
    fn end_of_input_returns_false() {
        let mut out = String::new();
        assert!(!read_trimmed_line(&mut Cursor::new(Vec::new()), &mut out));
    }
}
