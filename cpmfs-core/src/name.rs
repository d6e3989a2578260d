//! CP/M file names: parsing, validation and host-name conversion.

use std::fmt;

use crate::error::{CpmError, CpmResult};

/// Characters that may never appear in a stored name.
const DELIMITERS: &[u8] = b"<>.,;:=?*[]";

/// Whether `c` may appear in a stored name or extension.
pub fn is_file_char(c: u8, first: bool) -> bool {
    (!first || c != b' ') && c >= b' ' && c < 0x80 && !DELIMITERS.contains(&c)
}

/// A fully qualified CP/M name: user number plus upper-case, space-padded
/// 8.3 name without attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpmName {
    pub user: u8,
    pub name: [u8; 8],
    pub ext: [u8; 3],
}

impl CpmName {
    /// Parse `user:name.ext` or `name.ext`.
    ///
    /// Names are upper-cased. A name longer than 8 characters or an
    /// extension longer than 3 is rejected, as is any delimiter or control
    /// character.
    pub fn parse(path: &str, default_user: u8, max_user: u8) -> CpmResult<Self> {
        let invalid = || CpmError::InvalidName(path.to_string());

        let (user, rest) = match path.split_once(':') {
            Some((digits, rest)) => {
                if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(invalid());
                }
                let user: u8 = digits.parse().map_err(|_| invalid())?;
                (user, rest)
            }
            None => (default_user, path),
        };
        if user > max_user {
            return Err(invalid());
        }

        let (stem, ext) = match rest.split_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (rest, ""),
        };
        if stem.is_empty() || stem.len() > 8 || ext.len() > 3 {
            return Err(invalid());
        }

        let mut name = [b' '; 8];
        for (i, c) in stem.bytes().enumerate() {
            if !is_file_char(c, i == 0) {
                return Err(invalid());
            }
            name[i] = c.to_ascii_uppercase();
        }
        let mut extension = [b' '; 3];
        for (i, c) in ext.bytes().enumerate() {
            if !is_file_char(c, false) {
                return Err(invalid());
            }
            extension[i] = c.to_ascii_uppercase();
        }

        Ok(Self {
            user,
            name,
            ext: extension,
        })
    }

    /// Build from raw directory bytes, masking attribute bits.
    pub fn from_raw(user: u8, name: &[u8], ext: &[u8]) -> Self {
        let mut n = [b' '; 8];
        let mut e = [b' '; 3];
        for (dst, src) in n.iter_mut().zip(name) {
            *dst = src & 0x7F;
        }
        for (dst, src) in e.iter_mut().zip(ext) {
            *dst = src & 0x7F;
        }
        Self {
            user,
            name: n,
            ext: e,
        }
    }

    /// `name.ext` without padding; lower case unless `uppercase`.
    pub fn render(&self, uppercase: bool) -> String {
        let mut out = trimmed(&self.name);
        let ext = trimmed(&self.ext);
        if !ext.is_empty() {
            out.push('.');
            out.push_str(&ext);
        }
        if uppercase {
            out
        } else {
            out.to_ascii_lowercase()
        }
    }

    /// Case-insensitive comparison against masked directory bytes.
    pub fn matches(&self, user: u8, name: &[u8], ext: &[u8]) -> bool {
        self.user == user
            && self
                .name
                .iter()
                .zip(name)
                .all(|(a, b)| a.eq_ignore_ascii_case(&(b & 0x7F)))
            && self
                .ext
                .iter()
                .zip(ext)
                .all(|(a, b)| a.eq_ignore_ascii_case(&(b & 0x7F)))
    }
}

impl fmt::Display for CpmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.render(true))
    }
}

fn trimmed(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    bytes[..end].iter().map(|&b| b as char).collect()
}

/// Convert a host filename to CP/M 8.3 form.
///
/// - Uppercases everything
/// - Truncates name to 8 chars, extension to 3 chars
/// - Removes characters a stored name may not carry
///
/// # Examples
/// ```
/// use cpmfs_core::to_8_3;
/// assert_eq!(to_8_3("hello.txt"), "HELLO.TXT");
/// assert_eq!(to_8_3("VeryLongName.extension"), "VERYLONG.EXT");
/// assert_eq!(to_8_3("noext"), "NOEXT");
/// ```
pub fn to_8_3(filename: &str) -> String {
    let upper = filename.to_uppercase();
    let (name, ext) = match upper.rfind('.') {
        Some(pos) => (&upper[..pos], &upper[pos + 1..]),
        None => (upper.as_str(), ""),
    };

    fn clean(s: &str) -> String {
        s.bytes()
            .filter(|&c| c != b' ' && is_file_char(c, false))
            .map(|c| c as char)
            .collect()
    }

    let clean_name: String = clean(name).chars().take(8).collect();
    let clean_ext: String = clean(ext).chars().take(3).collect();

    // Name must be at least 1 char
    let final_name = if clean_name.is_empty() {
        "_".to_string()
    } else {
        clean_name
    };

    if clean_ext.is_empty() {
        final_name
    } else {
        format!("{}.{}", final_name, clean_ext)
    }
}
