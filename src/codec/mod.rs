//! Pure encode/decode functions between typed items and their byte layout.
//!
//! # Varuint
//! Little-endian base-128: each byte carries 7 bits, high bit set means
//! "more follows". `encode_varuint(0) == [0x00]`; decoding is canonical (no
//! value has a representation with a trailing all-zero continuation byte).
//!
//! # Packed mtime (9 bytes)
//! bytes 0..1: year (u16 LE); year = 0 means the zero time (second = nsec = 0).
//! bytes 2..4 + top bit of byte 5 (<<17): second_of_year, 0..366*86400.
//! low 6 bits of byte 5 + bytes 6..8 (30 bits): nsec, 0..1_000_000_000.
//!
//! # Data-block item framing
//! First byte is a tag (see the `tag` module). `0x00` is never a valid tag —
//! it is the terminator that begins a data block's zero padding.
//!
//! This module replaces the dynamic-typed item dispatch of the original
//! with a closed tagged sum: decoders return `Item`, encoders match on it.
//! Settings-block entries (`magic`, `setting`) are textual and live in
//! `crate::block`'s settings-block codec, not here — only the binary
//! data-block item tags are framed by this module.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DataItemError {
    #[error("unexpected end of data while decoding item")]
    Truncated,
    #[error("unknown item tag {0:#04x}")]
    UnknownTag(u8),
    #[error("varuint is not canonically encoded")]
    NonCanonicalVaruint,
    #[error("name contains a forbidden byte (LF)")]
    NameContainsLf,
}

// ── Varuint ──────────────────────────────────────────────────────────────────

pub fn encode_varuint(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0x00];
    }
    let mut v = value;
    let mut out = Vec::with_capacity(10);
    while v > 0x7f {
        out.push(((v & 0x7f) | 0x80) as u8);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

/// Decode a varuint starting at `data[pos]`. Returns `(value, next_pos)`.
pub fn decode_varuint(data: &[u8], pos: usize) -> Result<(u64, usize), DataItemError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut i = pos;
    loop {
        let byte = *data.get(i).ok_or(DataItemError::Truncated)?;
        let continues = byte & 0x80 != 0;
        let payload = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && payload > 1) {
            return Err(DataItemError::NonCanonicalVaruint);
        }
        value |= payload << shift;
        i += 1;
        if !continues {
            if byte == 0x00 && i - pos > 1 {
                // a zero-valued final byte after a non-empty prefix is a
                // non-canonical re-encoding of a shorter value.
                return Err(DataItemError::NonCanonicalVaruint);
            }
            return Ok((value, i));
        }
        shift += 7;
    }
}

// ── Packed mtime ─────────────────────────────────────────────────────────────

pub const MTIME_SIZE: usize = 9;

/// A decomposed packed mtime: year, seconds into the year, and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedMtime {
    pub year: u16,
    pub second_of_year: u32,
    pub nsec: u32,
}

impl PackedMtime {
    pub const ZERO: PackedMtime = PackedMtime {
        year: 0,
        second_of_year: 0,
        nsec: 0,
    };

    pub fn encode(self) -> [u8; MTIME_SIZE] {
        let mut out = [0u8; MTIME_SIZE];
        out[0] = (self.year & 0xff) as u8;
        out[1] = (self.year >> 8) as u8;
        let sec = self.second_of_year;
        out[2] = (sec & 0xff) as u8;
        out[3] = ((sec >> 8) & 0xff) as u8;
        out[4] = ((sec >> 16) & 0xff) as u8;
        out[5] = (((sec >> 17) & 0x80) as u8) | ((self.nsec & 0x3f) as u8);
        out[6] = ((self.nsec >> 6) & 0xff) as u8;
        out[7] = ((self.nsec >> 14) & 0xff) as u8;
        out[8] = ((self.nsec >> 22) & 0xff) as u8;
        out
    }

    pub fn decode(buf: &[u8; MTIME_SIZE]) -> Self {
        let year = buf[0] as u16 + ((buf[1] as u16) << 8);
        let second_of_year = buf[2] as u32
            + ((buf[3] as u32) << 8)
            + ((buf[4] as u32) << 16)
            + (((buf[5] & 0x80) as u32) << 17);
        let nsec = (buf[5] & 0x3f) as u32
            + ((buf[6] as u32) << 6)
            + ((buf[7] as u32) << 14)
            + ((buf[8] as u32) << 22);
        PackedMtime {
            year,
            second_of_year,
            nsec,
        }
    }
}

/// `[31,29,31,30,31,30,31,31,30,31,30,31]` — February is always counted as 29
/// days here; non-leap years skip zero-indexed day_of_year 59 when converting
/// back to a calendar date.
pub const DAYS_OF_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

pub fn is_leap_year(year: u16) -> bool {
    let y = year as u32;
    y % 400 == 0 || (y % 4 == 0 && y % 100 != 0)
}

/// Split `second_of_year` into (day_of_year, hour, minute, second).
pub fn day_hms_from_second_of_year(second_of_year: u32) -> (u32, u32, u32, u32) {
    let day = second_of_year / 86400;
    let left = second_of_year - day * 86400;
    let hour = left / 3600;
    let left = left - hour * 3600;
    let minute = left / 60;
    let second = left - minute * 60;
    (day, hour, minute, second)
}

/// Inverse of [`day_hms_from_second_of_year`].
pub fn second_of_year_from_day_hms(day: u32, hour: u32, minute: u32, second: u32) -> u32 {
    day * 86400 + hour * 3600 + minute * 60 + second
}

/// Map a zero-indexed `day_of_year` to 1-indexed `(month, day)`.
pub fn month_and_day_from_day_of_year(year: u16, day_of_year: u32) -> (u32, u32) {
    let mut day = day_of_year;
    if !is_leap_year(year) && day >= 59 {
        // skip February 29, which does not exist in a non-leap year.
        day += 1;
    }
    for (month, &days) in DAYS_OF_MONTH.iter().enumerate() {
        if day < days {
            return (month as u32 + 1, day + 1);
        }
        day -= days;
    }
    unreachable!("day_of_year out of range");
}

/// Inverse of [`month_and_day_from_day_of_year`]: 1-indexed `(month, day)` to
/// a zero-indexed day-of-year.
pub fn day_of_year_from_month_day(year: u16, month: u32, day: u32) -> u32 {
    let mut d: u32 = DAYS_OF_MONTH[..(month as usize - 1)].iter().sum();
    d += day;
    if !is_leap_year(year) && d >= 60 {
        d -= 1;
    }
    d - 1
}

// ── Item tags ────────────────────────────────────────────────────────────────

pub mod tag {
    pub const DIRECTORY: u8 = 0x90;
    pub const FILE: u8 = 0x91;
    pub const FILE_SYMLINK: u8 = 0x92;
    pub const FILE_SOCKET: u8 = 0x93;
    pub const FILE_PIPE: u8 = 0x94;
    pub const FILE_DEVICE: u8 = 0x95;
    pub const FILE_UNKNOWN: u8 = 0x96;
    pub const KEY_VALUE: u8 = 0xc0;
    pub const EXTRADEF: u8 = 0xdd;
    pub const CONTENT: u8 = 0xa0;
    /// Legacy content-record variant ("updates"); read and skipped, never written.
    pub const CONTENT_CHANGED: u8 = 0xa1;
    /// Legacy content-record variant ("last"); read and skipped, never written.
    pub const CONTENT_RESTORED: u8 = 0xa2;
    /// Terminates the usable portion of a data block.
    pub const TERMINATOR: u8 = 0x00;
}

/// The file-type discriminant for `file`/`file-<type>` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Symlink,
    Socket,
    Pipe,
    Device,
    Unknown,
}

impl FileType {
    fn tag(self) -> u8 {
        match self {
            FileType::Regular => tag::FILE,
            FileType::Symlink => tag::FILE_SYMLINK,
            FileType::Socket => tag::FILE_SOCKET,
            FileType::Pipe => tag::FILE_PIPE,
            FileType::Device => tag::FILE_DEVICE,
            FileType::Unknown => tag::FILE_UNKNOWN,
        }
    }

    fn from_tag(t: u8) -> Option<Self> {
        match t {
            tag::FILE => Some(FileType::Regular),
            tag::FILE_SYMLINK => Some(FileType::Symlink),
            tag::FILE_SOCKET => Some(FileType::Socket),
            tag::FILE_PIPE => Some(FileType::Pipe),
            tag::FILE_DEVICE => Some(FileType::Device),
            tag::FILE_UNKNOWN => Some(FileType::Unknown),
            _ => None,
        }
    }
}

/// One decoded item from a data block.
///
/// `magic`/`setting` are not represented here — those live only in the
/// textual settings block (block 0) and are handled by `crate::block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Directory {
        dirid: u64,
        parent: u64,
        name: Vec<u8>,
        extra: u64,
    },
    File {
        filetype: FileType,
        parent: u64,
        name: Vec<u8>,
        cid: Vec<u8>,
        size: u64,
        mtime: PackedMtime,
        extra: u64,
    },
    Content {
        cid: Vec<u8>,
        checksum: Vec<u8>,
        first_seen: u32,
    },
    KeyValue {
        kvid: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    ExtraDef {
        xid: u64,
        kvids: Vec<u64>,
    },
}

fn put_bytes_with_len(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend(encode_varuint(bytes.len() as u64));
    out.extend_from_slice(bytes);
}

fn take_bytes_with_len(data: &[u8], pos: usize) -> Result<(&[u8], usize), DataItemError> {
    let (len, pos) = decode_varuint(data, pos)?;
    let len = len as usize;
    let end = pos.checked_add(len).ok_or(DataItemError::Truncated)?;
    let slice = data.get(pos..end).ok_or(DataItemError::Truncated)?;
    Ok((slice, end))
}

impl Item {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Item::Directory {
                dirid,
                parent,
                name,
                extra,
            } => {
                out.push(tag::DIRECTORY);
                out.extend(encode_varuint(*dirid));
                out.extend(encode_varuint(*parent));
                put_bytes_with_len(&mut out, name);
                out.extend(encode_varuint(*extra));
            }
            Item::File {
                filetype,
                parent,
                name,
                cid,
                size,
                mtime,
                extra,
            } => {
                out.push(filetype.tag());
                out.extend(encode_varuint(*parent));
                put_bytes_with_len(&mut out, name);
                put_bytes_with_len(&mut out, cid);
                out.extend(encode_varuint(*size));
                out.extend_from_slice(&mtime.encode());
                out.extend(encode_varuint(*extra));
            }
            Item::Content {
                cid,
                checksum,
                first_seen,
            } => {
                out.push(tag::CONTENT);
                put_bytes_with_len(&mut out, cid);
                put_bytes_with_len(&mut out, checksum);
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, *first_seen);
                out.extend_from_slice(&buf);
            }
            Item::KeyValue { kvid, key, value } => {
                out.push(tag::KEY_VALUE);
                out.extend(encode_varuint(*kvid));
                put_bytes_with_len(&mut out, key);
                put_bytes_with_len(&mut out, value);
            }
            Item::ExtraDef { xid, kvids } => {
                out.push(tag::EXTRADEF);
                out.extend(encode_varuint(*xid));
                out.extend(encode_varuint(kvids.len() as u64));
                for kvid in kvids {
                    out.extend(encode_varuint(*kvid));
                }
            }
        }
        out
    }

    /// Decode one item starting at `data[0]`. Returns `(item_or_none,
    /// bytes_consumed)`. `None` means the tag was a recognised-but-legacy
    /// content variant that is skipped rather than surfaced.
    pub fn decode(data: &[u8]) -> Result<(Option<Item>, usize), DataItemError> {
        let t = *data.first().ok_or(DataItemError::Truncated)?;
        let mut pos = 1usize;
        match t {
            tag::DIRECTORY => {
                let (dirid, p) = decode_varuint(data, pos)?;
                pos = p;
                let (parent, p) = decode_varuint(data, pos)?;
                pos = p;
                let (name, p) = take_bytes_with_len(data, pos)?;
                let name = name.to_vec();
                pos = p;
                let (extra, p) = decode_varuint(data, pos)?;
                pos = p;
                Ok((
                    Some(Item::Directory {
                        dirid,
                        parent,
                        name,
                        extra,
                    }),
                    pos,
                ))
            }
            t if FileType::from_tag(t).is_some() => {
                let filetype = FileType::from_tag(t).unwrap();
                let (parent, p) = decode_varuint(data, pos)?;
                pos = p;
                let (name, p) = take_bytes_with_len(data, pos)?;
                let name = name.to_vec();
                pos = p;
                let (cid, p) = take_bytes_with_len(data, pos)?;
                let cid = cid.to_vec();
                pos = p;
                let (size, p) = decode_varuint(data, pos)?;
                pos = p;
                let mtime_buf: [u8; MTIME_SIZE] = data
                    .get(pos..pos + MTIME_SIZE)
                    .ok_or(DataItemError::Truncated)?
                    .try_into()
                    .unwrap();
                pos += MTIME_SIZE;
                let mtime = PackedMtime::decode(&mtime_buf);
                let (extra, p) = decode_varuint(data, pos)?;
                pos = p;
                Ok((
                    Some(Item::File {
                        filetype,
                        parent,
                        name,
                        cid,
                        size,
                        mtime,
                        extra,
                    }),
                    pos,
                ))
            }
            tag::CONTENT => {
                let (cid, p) = take_bytes_with_len(data, pos)?;
                let cid = cid.to_vec();
                pos = p;
                let (checksum, p) = take_bytes_with_len(data, pos)?;
                let checksum = checksum.to_vec();
                pos = p;
                let first_seen_buf = data.get(pos..pos + 4).ok_or(DataItemError::Truncated)?;
                pos += 4;
                let first_seen = LittleEndian::read_u32(first_seen_buf);
                Ok((
                    Some(Item::Content {
                        cid,
                        checksum,
                        first_seen,
                    }),
                    pos,
                ))
            }
            tag::CONTENT_CHANGED | tag::CONTENT_RESTORED => {
                // Legacy per-content history timeline entries: same (cid,
                // checksum, uint32) shape as `content`. Skip over them;
                // callers log a deprecation warning rather than surface them.
                let (_cid, p) = take_bytes_with_len(data, pos)?;
                pos = p;
                let (_checksum, p) = take_bytes_with_len(data, pos)?;
                pos = p;
                pos = pos
                    .checked_add(4)
                    .filter(|&end| end <= data.len())
                    .ok_or(DataItemError::Truncated)?;
                Ok((None, pos))
            }
            tag::KEY_VALUE => {
                let (kvid, p) = decode_varuint(data, pos)?;
                pos = p;
                let (key, p) = take_bytes_with_len(data, pos)?;
                let key = key.to_vec();
                pos = p;
                let (value, p) = take_bytes_with_len(data, pos)?;
                let value = value.to_vec();
                pos = p;
                Ok((Some(Item::KeyValue { kvid, key, value }), pos))
            }
            tag::EXTRADEF => {
                let (xid, p) = decode_varuint(data, pos)?;
                pos = p;
                let (n, p) = decode_varuint(data, pos)?;
                pos = p;
                let mut kvids = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let (kvid, p) = decode_varuint(data, pos)?;
                    kvids.push(kvid);
                    pos = p;
                }
                Ok((Some(Item::ExtraDef { xid, kvids }), pos))
            }
            other => Err(DataItemError::UnknownTag(other)),
        }
    }
}

/// `true` if `name` is a legal path component name (no embedded LF, which
/// would be ambiguous in the textual settings block and is forbidden
/// everywhere for consistency).
pub fn is_valid_name(name: &[u8]) -> bool {
    !name.contains(&b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_zero() {
        assert_eq!(encode_varuint(0), vec![0x00]);
        assert_eq!(decode_varuint(&[0x00], 0).unwrap(), (0, 1));
    }

    #[test]
    fn varuint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let enc = encode_varuint(v);
            let (dec, consumed) = decode_varuint(&enc, 0).unwrap();
            assert_eq!(dec, v);
            assert_eq!(consumed, enc.len());
        }
    }

    #[test]
    fn varuint_rejects_trailing_continuation_on_canonical_zero() {
        // 0x80 0x00 decodes to the same value (0) as a lone 0x00, but is not
        // the canonical encoding.
        assert!(decode_varuint(&[0x80, 0x00], 0).is_err());
    }

    #[test]
    fn mtime_epoch() {
        let m = PackedMtime {
            year: 1,
            second_of_year: 0,
            nsec: 0,
        };
        let encoded = m.encode();
        assert_eq!(
            encoded,
            [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(PackedMtime::decode(&encoded), m);
    }

    #[test]
    fn mtime_day_of_year_after_leap_shift() {
        // 1-Feb of year 1 (non-leap): month=2, day=1 -> day_of_year index 31
        // (January has 31 days), which after the leap shift (day >= 59 -> +1)
        // is unaffected since 31 < 59.
        let doy = day_of_year_from_month_day(1, 2, 1);
        assert_eq!(doy, 31);
        let (month, day) = month_and_day_from_day_of_year(1, 31);
        assert_eq!((month, day), (2, 1));
    }

    #[test]
    fn mtime_roundtrip_many() {
        for year in [1u16, 4, 100, 400, 1600, 2000, 2024, 65535] {
            for (month, day) in [(1, 1), (2, 28), (3, 1), (12, 31)] {
                if month == 2 && day == 29 && !is_leap_year(year) {
                    continue;
                }
                let doy = day_of_year_from_month_day(year, month, day);
                let (m2, d2) = month_and_day_from_day_of_year(year, doy);
                assert_eq!((month, day), (m2, d2), "year={year}");
            }
        }
    }

    #[test]
    fn file_item_roundtrip() {
        let item = Item::File {
            filetype: FileType::Regular,
            parent: 8,
            name: b"file.txt".to_vec(),
            cid: vec![1, 2, 3, 4],
            size: 20043,
            mtime: PackedMtime {
                year: 2014,
                second_of_year: 12345,
                nsec: 907388851,
            },
            extra: 0,
        };
        let encoded = item.encode();
        let (decoded, consumed) = Item::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, Some(item));
    }

    #[test]
    fn directory_item_roundtrip() {
        let item = Item::Directory {
            dirid: 8,
            parent: 0,
            name: b"path".to_vec(),
            extra: 0,
        };
        let encoded = item.encode();
        let (decoded, consumed) = Item::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, Some(item));
    }

    #[test]
    fn content_item_roundtrip() {
        let item = Item::Content {
            cid: vec![0xaa; 32],
            checksum: vec![0xaa; 32],
            first_seen: 1_420_000_000,
        };
        let encoded = item.encode();
        let (decoded, consumed) = Item::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, Some(item));
    }

    #[test]
    fn extradef_and_keyvalue_roundtrip() {
        let kv = Item::KeyValue {
            kvid: 1,
            key: b"owner".to_vec(),
            value: b"me".to_vec(),
        };
        let encoded = kv.encode();
        assert_eq!(Item::decode(&encoded).unwrap().0, Some(kv));

        let ed = Item::ExtraDef {
            xid: 3,
            kvids: vec![1, 2],
        };
        let encoded = ed.encode();
        assert_eq!(Item::decode(&encoded).unwrap().0, Some(ed));
    }

    #[test]
    fn legacy_content_variants_are_skipped_not_surfaced() {
        let mut data = vec![tag::CONTENT_CHANGED];
        data.extend(encode_varuint(2));
        data.extend_from_slice(&[1, 2]);
        data.extend(encode_varuint(2));
        data.extend_from_slice(&[3, 4]);
        data.extend_from_slice(&0u32.to_le_bytes());
        let (item, consumed) = Item::decode(&data).unwrap();
        assert_eq!(item, None);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(Item::decode(&[0x01]), Err(DataItemError::UnknownTag(0x01)));
    }

    #[test]
    fn name_with_lf_is_rejected_by_validator() {
        assert!(!is_valid_name(b"has\nlf"));
        assert!(is_valid_name(b"plain"));
    }
}
