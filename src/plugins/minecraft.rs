//! Minecraft (Java edition) server support
//!
//! Readiness is the `Done (12.345s)!` line the server thread prints once the world is
//! loaded. Clients are validated by parsing the handshake packet that every server-list
//! ping and login starts with.

use regex::Regex;

pub const DEFAULT_COMMAND: &[&str] = &["java", "-jar", "server.jar", "nogui"];
pub const STOP_COMMAND: &str = "/stop\n";

const READY_PATTERN: &str = r"(?i).*\[Server thread/INFO\]: Done \([0-9.]*s\).*";
const STARTING_MESSAGE: &str = "Server starting up...";

/// Packet id of both the handshake (serverbound) and status response (clientbound)
const PACKET_ID_HANDSHAKE: i32 = 0x00;
/// First byte of the pre-1.7 server list ping
const LEGACY_PING: u8 = 0xFE;
const MAX_ADDRESS_LEN: i32 = 255;

pub fn ready_pattern() -> Regex {
    Regex::new(READY_PATTERN).expect("valid minecraft ready pattern")
}

/// Status response packet telling the client the server is still loading
pub fn fake_status_packet() -> Vec<u8> {
    let json = serde_json::json!({
        "description": {"text": STARTING_MESSAGE},
        "players": {"max": 0, "online": 0},
        "version": {"name": "loading", "protocol": 0},
    })
    .to_string();
    let json = json.as_bytes();

    let mut body = Vec::with_capacity(json.len() + 6);
    write_varint(&mut body, PACKET_ID_HANDSHAKE);
    write_varint(&mut body, json.len() as i32);
    body.extend_from_slice(json);

    let mut packet = Vec::with_capacity(body.len() + 5);
    write_varint(&mut packet, body.len() as i32);
    packet.extend_from_slice(&body);
    packet
}

/// Check that `data` starts with a well-formed handshake packet
pub fn is_valid_handshake(data: &[u8]) -> bool {
    if data.first() == Some(&LEGACY_PING) {
        return true;
    }

    parse_handshake(&mut Cursor::new(data)).unwrap_or(false)
}

fn parse_handshake(cursor: &mut Cursor<'_>) -> Option<bool> {
    let length = cursor.varint()?;
    if length <= 0 || length as usize > cursor.remaining() {
        return None;
    }
    if cursor.varint()? != PACKET_ID_HANDSHAKE {
        return None;
    }
    let _protocol_version = cursor.varint()?;
    let address_len = cursor.varint()?;
    if !(0..=MAX_ADDRESS_LEN).contains(&address_len) {
        return None;
    }
    std::str::from_utf8(cursor.take(address_len as usize)?).ok()?;
    let _port = cursor.take(2)?;
    let next_state = cursor.varint()?;
    Some((1..=3).contains(&next_state))
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn varint(&mut self) -> Option<i32> {
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            value |= ((byte & 0x7F) as u32) << (7 * shift);
            if byte & 0x80 == 0 {
                return Some(value as i32);
            }
        }
        None
    }
}
