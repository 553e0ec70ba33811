//! Terraria dedicated server support
//!
//! Wire format reference: <https://seancode.com/terrafirma/net.html>

use regex::Regex;

pub const DEFAULT_COMMAND: &[&str] = &["TerrariaServer.bin.x86_64"];
pub const STOP_COMMAND: &str = "exit\n";

const READY_PATTERN: &str = r"(?i)^Server started$";
const STARTING_MESSAGE: &str = "Server is starting up... Please wait and try again";

/// Message type of the client's first packet
const MSG_CONNECT_REQUEST: u8 = 0x01;
/// Message type for a fatal error shown on the client's screen
const MSG_SERVER_ERROR: u8 = 0x02;
const VERSION_PREFIX: &[u8] = b"Terraria";

pub fn ready_pattern() -> Regex {
    Regex::new(READY_PATTERN).expect("valid terraria ready pattern")
}

/// Error packet shown to a client while the world loads
pub fn fake_status_packet() -> Vec<u8> {
    let message = STARTING_MESSAGE.as_bytes();
    let total = (message.len() + 6) as u16;

    let mut data = Vec::with_capacity(total as usize);
    data.extend_from_slice(&total.to_le_bytes());
    // The type byte is repeated, clients expect both
    data.push(MSG_SERVER_ERROR);
    data.push(MSG_SERVER_ERROR);
    data.push(message.len() as u8);
    data.extend_from_slice(message);
    data.push(0x00);
    data
}

/// Check that `data` starts with a connect request carrying a `Terraria###` version
pub fn is_valid_connect_request(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    let length = u16::from_le_bytes([data[0], data[1]]) as usize;
    if length < 3 || data[2] != MSG_CONNECT_REQUEST {
        return false;
    }

    // Version string is prefixed by a 7-bit encoded length; short strings use one byte
    match data.get(3) {
        Some(&len) if (len as usize) >= VERSION_PREFIX.len() => data
            .get(4..4 + VERSION_PREFIX.len())
            .map(|v| v == VERSION_PREFIX)
            .unwrap_or(false),
        _ => false,
    }
}
