//! Client-to-proxy frames of the terminal protocol.
//!
//! The proxy multiplexes control messages over one binary websocket:
//! `0:<len>:<data>` carries keystrokes, `1:<cols>:<rows>:` resizes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{OsRng, RngCore};

pub const RESIZE: &[u8] = b"1:80:24:";
pub const SUBMIT: &[u8] = b"0:1:\n";

const PASTE_START: &str = "\x1b[200~";
const PASTE_END: &str = "\x1b[201~";

/// First message of a session: `<user>:<ticket>\n`.
pub fn login(user: &str, ticket: &str) -> Vec<u8> {
    format!("{user}:{ticket}\n").into_bytes()
}

pub fn keystrokes(data: &[u8]) -> Vec<u8> {
    let mut frame = format!("0:{}:", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame
}

pub fn begin_marker(boundary: &str) -> String {
    format!("CMD-BEGIN-{boundary}")
}

pub fn finish_marker(boundary: &str) -> String {
    format!("CMD-FINISH-{boundary}")
}

pub fn end_marker(boundary: &str) -> String {
    format!("CMD-END-{boundary}")
}

/// The pasted shell line that runs `command` between boundary markers and
/// reports its exit status.
pub fn command_line(boundary: &str, command: &str) -> String {
    let encoded = STANDARD.encode(command.as_bytes());
    format!(
        "{PASTE_START}echo;echo {begin};echo \"{encoded}\" | base64 -d | bash; exit_status=$?; echo {finish}; echo exit_status=$exit_status; echo {end}{PASTE_END}",
        begin = begin_marker(boundary),
        finish = finish_marker(boundary),
        end = end_marker(boundary),
    )
}

/// Random non-negative 63-bit integer in base 36.
pub fn boundary_token() -> String {
    to_base36(OsRng.next_u64() & i64::MAX as u64)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
