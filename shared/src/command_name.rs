//! Device-name conventions for legacy string commands.
//!
//! A legacy command travels as a `STRING` message whose device name is
//! `CMD_<uid>`; the reply comes back on `ACK_<uid>`.

pub const COMMAND_PREFIX: &str = "CMD";
pub const REPLY_PREFIX: &str = "ACK";

/// Device name used when a command's own name could not be parsed.
pub const DEVICE_NAME_REPLY: &str = REPLY_PREFIX;

/// True for any device name that starts with `CMD_`, well formed or not.
pub fn is_command_device_name(device_name: &str) -> bool {
    device_name
        .strip_prefix(COMMAND_PREFIX)
        .map_or(false, |rest| rest.starts_with('_'))
}

/// Extracts the numeric uid from `<prefix>_<uid>`.
pub fn parse_uid(device_name: &str) -> Option<u32> {
    let (prefix, uid) = device_name.split_once('_')?;
    if prefix.is_empty() || uid.is_empty() || !uid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    uid.parse().ok()
}

/// The `<prefix>` part of `<prefix>_<uid>`, or the whole name if it has no uid.
pub fn device_name_prefix(device_name: &str) -> &str {
    device_name
        .split_once('_')
        .map_or(device_name, |(prefix, _)| prefix)
}

pub fn reply_device_name(uid: u32) -> String {
    format!("{}_{}", REPLY_PREFIX, uid)
}
