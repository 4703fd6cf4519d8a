//! Cloud-init user-data snippets stored on the node's snippet storage.
//!
//! The management API cannot upload snippet files, so they are written and
//! removed with shell commands run through the terminal proxy.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// File name of the user-data snippet for a VM.
pub fn snippet_name(vmid: u32) -> String {
    format!("vm-{vmid}-cloudinit-user-data")
}

/// Shell command that writes `user_data` to `<dir>/<name>`.
///
/// The payload is base64-encoded so no quoting of the user data is needed.
pub fn write_command(dir: &str, name: &str, user_data: &str) -> String {
    let encoded = STANDARD.encode(user_data.as_bytes());
    format!("echo \"{encoded}\" | base64 -d > {dir}/{name}")
}

pub fn remove_command(dir: &str, name: &str) -> String {
    format!("rm -f {dir}/{name}")
}

/// `cicustom` value pointing the VM at a user-data snippet.
pub fn cicustom_value(storage: &str, name: &str) -> String {
    format!("user={storage}:snippets/{name}")
}

/// Volume named by the `user=` entry of a `cicustom` value.
fn user_volume(cicustom: &str) -> Option<&str> {
    cicustom
        .split(',')
        .find_map(|part| part.trim().strip_prefix("user="))
}

/// Whether `cicustom` points user data at the snippet `name` on `storage`,
/// i.e. the pointer this crate writes with [`cicustom_value`].
pub fn points_at_snippet(cicustom: &str, storage: &str, name: &str) -> bool {
    user_volume(cicustom) == Some(format!("{storage}:snippets/{name}").as_str())
}
