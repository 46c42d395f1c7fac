//! Message framing on top of a channel: strings and string maps.
//!
//! ## Wire layout
//!
//! A **string** frame is an 8-byte big-endian length `L` counting the
//! terminating NUL, followed by `L` bytes whose last byte is NUL.
//!
//! A **map** frame is an 8-byte big-endian byte length `B`, followed by
//! `B` bytes of packed map body (see [`StrMap::pack`]): NUL-terminated
//! key/value pairs ended by an empty key. Entry order on the wire is the
//! map's insertion order and survives decode.
//!
//! ## Safety limits
//!
//! Decoders reject frames above a fixed size before allocating, so a
//! corrupt length prefix cannot take the process down with it.

use grove_common::{Result, SpawnError, StrMap};

use crate::endpoint::Channel;

/// Maximum accepted string frame (16 MiB).
const MAX_STR_FRAME: u64 = 16 * 1024 * 1024;

/// Maximum accepted map frame (256 MiB). PMI databases scale with the
/// job, so this is far looser than the string limit.
const MAX_MAP_FRAME: u64 = 256 * 1024 * 1024;

/// Write one string frame.
pub fn write_str(ch: &mut Channel, s: &str) -> Result<()> {
    let len = (s.len() + 1) as u64;
    ch.write_all(&len.to_be_bytes())?;
    ch.write_all(s.as_bytes())?;
    ch.write_all(&[0])
}

/// Read one string frame, returning a freshly allocated string.
pub fn read_str(ch: &mut Channel) -> Result<String> {
    let mut header = [0u8; 8];
    ch.read_exact(&mut header)?;
    let len = u64::from_be_bytes(header);
    if len == 0 || len > MAX_STR_FRAME {
        return Err(SpawnError::protocol(format!(
            "string frame length {len} out of range on `{}`",
            ch.name()
        )));
    }
    let mut buf = vec![0u8; len as usize];
    ch.read_exact(&mut buf)?;
    match buf.pop() {
        Some(0) => {}
        _ => {
            return Err(SpawnError::protocol(format!(
                "string frame missing NUL terminator on `{}`",
                ch.name()
            )))
        }
    }
    String::from_utf8(buf).map_err(|_| {
        SpawnError::protocol(format!("string frame is not valid UTF-8 on `{}`", ch.name()))
    })
}

/// Write one map frame.
pub fn write_map(ch: &mut Channel, map: &StrMap) -> Result<()> {
    let body = map.pack();
    let len = body.len() as u64;
    ch.write_all(&len.to_be_bytes())?;
    ch.write_all(&body)
}

/// Read one map frame into a freshly allocated map.
pub fn read_map(ch: &mut Channel) -> Result<StrMap> {
    let mut header = [0u8; 8];
    ch.read_exact(&mut header)?;
    let len = u64::from_be_bytes(header);
    if len == 0 || len > MAX_MAP_FRAME {
        return Err(SpawnError::protocol(format!(
            "map frame length {len} out of range on `{}`",
            ch.name()
        )));
    }
    let mut body = vec![0u8; len as usize];
    ch.read_exact(&mut body)?;
    StrMap::unpack(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, Transport};

    /// Build a connected loopback channel pair.
    fn channel_pair() -> (Channel, Channel) {
        let ep = Endpoint::open(Transport::Tcp).unwrap();
        let port = ep.name().rsplit(':').next().unwrap().to_string();
        let client =
            std::thread::spawn(move || Channel::connect(&format!("tcp:127.0.0.1:{port}")).unwrap());
        let server = ep.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn string_roundtrip() {
        let (mut a, mut b) = channel_pair();
        write_str(&mut a, "BARRIER").unwrap();
        write_str(&mut a, "").unwrap();
        assert_eq!(read_str(&mut b).unwrap(), "BARRIER");
        assert_eq!(read_str(&mut b).unwrap(), "");
    }

    #[test]
    fn string_roundtrip_large() {
        let (mut a, mut b) = channel_pair();
        let big = "x".repeat(64 * 1024);
        let sender = {
            let big = big.clone();
            std::thread::spawn(move || {
                write_str(&mut a, &big).unwrap();
            })
        };
        assert_eq!(read_str(&mut b).unwrap(), big);
        sender.join().unwrap();
    }

    #[test]
    fn map_roundtrip_preserves_order() {
        let (mut a, mut b) = channel_pair();
        let mut map = StrMap::new();
        map.set("RANK", "3");
        map.set("RANKS", "8");
        map.set("JOBID", "12345");
        write_map(&mut a, &map).unwrap();
        let decoded = read_map(&mut b).unwrap();
        assert_eq!(decoded, map);
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["RANK", "RANKS", "JOBID"]);
    }

    #[test]
    fn empty_map_roundtrip() {
        let (mut a, mut b) = channel_pair();
        write_map(&mut a, &StrMap::new()).unwrap();
        assert!(read_map(&mut b).unwrap().is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (mut a, mut b) = channel_pair();
        let bogus = (MAX_STR_FRAME + 1).to_be_bytes();
        a.write_all(&bogus).unwrap();
        let err = read_str(&mut b).unwrap_err();
        assert_eq!(err.kind(), "ProtocolError");
    }
}
