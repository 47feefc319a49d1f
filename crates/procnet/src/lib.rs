//! Parser for the kernel's textual TCP connection tables.
//!
//! `/proc/net/tcp` and `/proc/net/tcp6` expose one header line followed by one
//! socket per line, whitespace-separated. Only the local/remote address
//! columns (`HEX_IP:HEX_PORT`), the state column, and the owning uid are
//! consumed; everything else is ignored. IPv4 addresses are stored by the
//! kernel as little-endian hex.

mod state;

pub use state::TcpState;

use std::io::{self, BufRead, BufReader, Read};
use std::net::Ipv4Addr;
use std::path::Path;

/// Longest table row the scanner will accept. Real rows are well under 200
/// bytes; anything larger means the file is not what we think it is.
const MAX_ROW_LEN: usize = 64 * 1024;

/// Minimum field count for a row to be considered well-formed.
const MIN_FIELDS: usize = 10;

/// One row of a kernel TCP table.
///
/// Rows are produced fresh on every parse and never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Local IPv4 address, when the row carries one (IPv6 rows yield `None`).
    pub local_addr: Option<Ipv4Addr>,
    pub local_port: u16,
    pub remote_addr: Option<Ipv4Addr>,
    pub remote_port: u16,
    /// Protocol state; `None` for codes outside the known set.
    pub state: Option<TcpState>,
    /// Owning user id.
    pub uid: u32,
}

/// Parse every connection row of the table at `path`.
///
/// The header line is skipped. Rows with fewer than ten fields are skipped
/// silently; a row longer than the scanner buffer is an `InvalidData` error,
/// and any underlying read failure propagates.
pub fn parse_table(path: &Path) -> io::Result<Vec<Connection>> {
    let file = std::fs::File::open(path)?;
    parse_reader(BufReader::new(file))
}

/// Parse table rows from an arbitrary reader (first line is the header).
pub fn parse_reader<R: BufRead>(mut reader: R) -> io::Result<Vec<Connection>> {
    let mut conns = Vec::new();
    let mut buf = Vec::new();
    let mut first = true;

    while read_row(&mut reader, &mut buf)? {
        if first {
            first = false;
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(conn) = parse_row(&line) {
            conns.push(conn);
        }
    }

    Ok(conns)
}

/// Read one newline-terminated row into `buf`, enforcing [`MAX_ROW_LEN`].
/// Returns `false` at end of input.
fn read_row<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    let n = reader
        .take(MAX_ROW_LEN as u64 + 1)
        .read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(false);
    }
    if n > MAX_ROW_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "table row exceeds scanner buffer",
        ));
    }
    Ok(true)
}

fn parse_row(line: &str) -> Option<Connection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }

    let (local_addr, local_port) = parse_hex_addr(fields[1]);
    let (remote_addr, remote_port) = parse_hex_addr(fields[2]);
    let state = u8::from_str_radix(fields[3], 16)
        .ok()
        .and_then(TcpState::from_code);
    let uid = fields[7].parse().unwrap_or(0);

    Some(Connection {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        state,
        uid,
    })
}

/// Split a `HEX_IP:HEX_PORT` column into address and port.
///
/// Malformed columns yield `(None, 0)`; the port parses independently of the
/// address, so IPv6 rows still carry a usable port.
pub fn parse_hex_addr(field: &str) -> (Option<Ipv4Addr>, u16) {
    let Some((ip_hex, port_hex)) = field.split_once(':') else {
        return (None, 0);
    };
    let port = u16::from_str_radix(port_hex, 16).unwrap_or(0);
    (parse_ipv4_hex(ip_hex), port)
}

/// Decode the kernel's 8-digit little-endian hex IPv4 encoding.
pub fn parse_ipv4_hex(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    // Stored little-endian; reverse before formatting as dotted-quad.
    Some(Ipv4Addr::from(raw.swap_bytes()))
}

/// Encode an address:port pair the way the kernel tables do.
pub fn encode_hex_addr(addr: Ipv4Addr, port: u16) -> String {
    format!("{:08X}:{:04X}", u32::from(addr).swap_bytes(), port)
}
