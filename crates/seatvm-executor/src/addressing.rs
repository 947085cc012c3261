//! Deterministic addressing and naming for a seat.
//!
//! Everything here is a pure function of the seat identity so a restarted host
//! derives the same names and addresses for the same seat.

use seatvm_common::{MacAddr, Result, SeatError, SeatKey};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Guest addresses start at `.11` for seat 1; `.1` is the bridge.
pub const SEAT_IP_OFFSET: u32 = 10;
/// Highest seat whose address still fits below the broadcast address of a /24.
pub const MAX_SEAT: u32 = 254 - SEAT_IP_OFFSET;

/// Locally administered, unicast.
const MAC_PREFIX: [u8; 4] = [0xAA, 0xFC, 0x00, 0x00];

/// Linux IFNAMSIZ is 16 including the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;
const IFNAME_PREFIX: &str = "st";
const IFNAME_HASH_CHARS: usize = 12;

fn check_seat(seat: u32) -> Result<()> {
    if seat == 0 || seat > MAX_SEAT {
        return Err(SeatError::InvalidSeat {
            seat,
            max: MAX_SEAT,
        });
    }
    Ok(())
}

/// `network.(10 + seat)` inside the bridge's /24.
pub fn guest_ip(network: Ipv4Addr, seat: u32) -> Result<Ipv4Addr> {
    check_seat(seat)?;
    let [a, b, c, _] = network.octets();
    Ok(Ipv4Addr::new(a, b, c, (SEAT_IP_OFFSET + seat) as u8))
}

/// Fixed prefix with the seat number in the low two octets.
pub fn guest_mac(seat: u32) -> MacAddr {
    let [_, _, hi, lo] = seat.to_be_bytes();
    MacAddr([
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        MAC_PREFIX[2],
        MAC_PREFIX[3],
        hi,
        lo,
    ])
}

/// Host tap name for a seat.
///
/// Workshop ids are arbitrary length while interface names are capped at 15
/// bytes, so the name carries a hash of the whole identity rather than a
/// truncated workshop id.
pub fn interface_name(key: &SeatKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.workshop.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.seat.to_be_bytes());
    let digest = hasher.finalize();

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let mut name = format!("{IFNAME_PREFIX}{}", &hex[..IFNAME_HASH_CHARS]);
    name.truncate(MAX_IFNAME_LEN);
    name
}

/// Filesystem-safe rendering of a seat identity, e.g. `demo-1`.
///
/// Workshop ids that need rewriting get a short identity hash so two ids that
/// sanitize to the same string still map to different files.
pub fn path_stem(key: &SeatKey) -> String {
    let workshop: String = key
        .workshop
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if workshop == key.workshop {
        format!("{workshop}-{}", key.seat)
    } else {
        let hashed = interface_name(key);
        let short = &hashed[IFNAME_PREFIX.len()..IFNAME_PREFIX.len() + 8];
        format!("{workshop}-{short}-{}", key.seat)
    }
}

pub fn image_path(instance_dir: &Path, key: &SeatKey) -> PathBuf {
    instance_dir.join(format!("{}.ext4", path_stem(key)))
}

pub fn socket_path(run_dir: &Path, key: &SeatKey) -> PathBuf {
    run_dir.join(format!("{}.sock", path_stem(key)))
}

pub fn log_path(run_dir: &Path, key: &SeatKey) -> PathBuf {
    run_dir.join(format!("{}.log", path_stem(key)))
}
