//! Timestamp codecs and password sealing.
//!
//! Three mutually exclusive stamp schemes exist:
//! - CP/M 3 / P2DOS: every fourth directory slot (status 0x21) holds the
//!   stamps of the three slots before it.
//! - MP/M: stamps live in the file's XFCB.
//! - DataStamper: a side file `!!!TIME&.DAT` holds a 16-byte record per
//!   directory slot.
//!
//! CP/M dates are a day count where day 1 is 1978-01-01, followed by BCD
//! hour and minute. DataStamper dates are five BCD bytes (year, month, day,
//! hour, minute).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{CpmError, CpmResult};
use crate::layout::RECORD_SIZE;

/// Bytes of one DataStamper record.
pub const DS_RECORD_SIZE: usize = 16;

/// Name of the DataStamper side file.
pub const DS_FILE_NAME: &[u8; 11] = b"!!!TIME&DAT";

/// Which timestamp scheme a mounted volume uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampScheme {
    None,
    /// Stamp entries in the directory; `create_not_access` selects whether
    /// the first stamp of a group is the creation or the access time.
    Cpm3 { create_not_access: bool },
    /// Stamps in XFCBs, first stamp chosen as for `Cpm3`.
    Mpm { create_not_access: bool },
    /// Side-file stamps.
    DataStamper(DsStore),
}

pub fn from_bcd(b: u8) -> u32 {
    ((b >> 4) & 0xF) as u32 * 10 + (b & 0xF) as u32
}

pub fn to_bcd(v: u32) -> u8 {
    (((v / 10) % 10) << 4 | (v % 10)) as u8
}

fn is_leap(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Decode a CP/M day count plus BCD hour and minute. Day 0 means unset.
pub fn decode_day(days: u16, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    if days == 0 {
        return None;
    }
    let mut days = days as u32;
    let mut year = 1978;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days > len {
            days -= len;
            year += 1;
        } else {
            break;
        }
    }
    let mut month = 1;
    while month < 12 && days > days_in_month(year, month) {
        days -= days_in_month(year, month);
        month += 1;
    }
    Utc.with_ymd_and_hms(year, month, days, from_bcd(hour), from_bcd(minute), 0)
        .single()
}

/// Encode a time as (day count, BCD hour, BCD minute).
pub fn encode_day(time: DateTime<Utc>) -> (u16, u8, u8) {
    let Some(epoch) = NaiveDate::from_ymd_opt(1978, 1, 1) else {
        return (0, 0, 0);
    };
    let days = (time.date_naive() - epoch).num_days() + 1;
    if !(1..=u16::MAX as i64).contains(&days) {
        return (0, 0, 0);
    }
    (days as u16, to_bcd(time.hour()), to_bcd(time.minute()))
}

/// Decode a 4-byte directory stamp (day low, day high, hour, minute).
pub fn decode_stamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
    decode_day(u16::from_le_bytes([bytes[0], bytes[1]]), bytes[2], bytes[3])
}

/// Encode a 4-byte directory stamp.
pub fn encode_stamp(time: Option<DateTime<Utc>>, out: &mut [u8]) {
    let (days, hour, minute) = time.map(encode_day).unwrap_or((0, 0, 0));
    out[..2].copy_from_slice(&days.to_le_bytes());
    out[2] = hour;
    out[3] = minute;
}

/// Offset of a slot's stamp group inside its 0x21 entry.
///
/// Returns `None` for the stamp slot itself (every fourth slot).
pub fn cpm3_group(slot: usize) -> Option<(usize, usize)> {
    let within = slot & 3;
    if within == 3 {
        None
    } else {
        Some((slot | 3, 1 + 10 * within))
    }
}

/// Decode a DataStamper stamp (BCD year, month, day, hour, minute).
pub fn decode_ds(bytes: &[u8]) -> Option<DateTime<Utc>> {
    if bytes[..5].iter().all(|&b| b == 0) {
        return None;
    }
    let yy = from_bcd(bytes[0]) as i32;
    let year = if yy < 70 { 2000 + yy } else { 1900 + yy };
    Utc.with_ymd_and_hms(
        year,
        from_bcd(bytes[1]),
        from_bcd(bytes[2]),
        from_bcd(bytes[3]),
        from_bcd(bytes[4]),
        0,
    )
    .single()
}

pub fn encode_ds(time: Option<DateTime<Utc>>, out: &mut [u8]) {
    match time {
        Some(t) => {
            out[0] = to_bcd((t.year() % 100) as u32);
            out[1] = to_bcd(t.month());
            out[2] = to_bcd(t.day());
            out[3] = to_bcd(t.hour());
            out[4] = to_bcd(t.minute());
        }
        None => out[..5].fill(0),
    }
}

/// Stamps of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
}

/// In-memory copy of the DataStamper side file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsStore {
    records: Vec<[u8; DS_RECORD_SIZE]>,
    dirty: bool,
}

impl DsStore {
    /// Parse the side file contents, verifying every 128-byte checksum.
    pub fn load(data: &[u8], slots: usize) -> CpmResult<Self> {
        for (index, record) in data.chunks(RECORD_SIZE).enumerate() {
            if record.len() < RECORD_SIZE {
                break;
            }
            let sum = record[..RECORD_SIZE - 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != record[RECORD_SIZE - 1] {
                return Err(CpmError::Corrupt(format!(
                    "DataStamper checksum mismatch in record {}",
                    index
                )));
            }
        }
        let mut records = vec![[0u8; DS_RECORD_SIZE]; slots];
        for (dst, src) in records.iter_mut().zip(data.chunks(DS_RECORD_SIZE)) {
            dst[..src.len()].copy_from_slice(src);
        }
        Ok(Self {
            records,
            dirty: false,
        })
    }

    /// Serialise with fresh checksums, padded to whole records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.records.iter().flatten().copied().collect();
        out.resize(out.len().div_ceil(RECORD_SIZE) * RECORD_SIZE, 0);
        for record in out.chunks_mut(RECORD_SIZE) {
            let sum = record[..RECORD_SIZE - 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            record[RECORD_SIZE - 1] = sum;
        }
        out
    }

    pub fn times(&self, slot: usize) -> FileTimes {
        match self.records.get(slot) {
            Some(r) => FileTimes {
                ctime: decode_ds(&r[0..5]),
                atime: decode_ds(&r[5..10]),
                mtime: decode_ds(&r[10..15]),
            },
            None => FileTimes::default(),
        }
    }

    pub fn set_times(&mut self, slot: usize, times: &FileTimes) {
        if let Some(r) = self.records.get_mut(slot) {
            encode_ds(times.ctime, &mut r[0..5]);
            encode_ds(times.atime, &mut r[5..10]);
            encode_ds(times.mtime, &mut r[10..15]);
            self.dirty = true;
        }
    }

    /// Forget the stamps of a freed slot.
    pub fn clear(&mut self, slot: usize) {
        if let Some(r) = self.records.get_mut(slot) {
            r[..15].fill(0);
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Reveal a password sealed in 8 bytes with `key` (stored reversed).
pub fn unseal_password(sealed: &[u8], key: u8) -> String {
    (0..8)
        .map(|j| (sealed[7 - j] ^ key) & 0x7F)
        .take_while(|&c| c != b' ' && c != 0)
        .map(|c| c as char)
        .collect()
}

/// Seal a password of up to 8 characters. Returns the 8 bytes.
#[cfg(test)]
pub(crate) fn seal_password(password: &str, key: u8) -> [u8; 8] {
    let mut plain = [b' '; 8];
    for (dst, src) in plain.iter_mut().zip(password.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    let mut sealed = [0u8; 8];
    for j in 0..8 {
        sealed[7 - j] = plain[j] ^ key;
    }
    sealed
}
