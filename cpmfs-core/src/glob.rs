//! Shell-style name matching over a directory.

use crate::device::Device;
use crate::error::CpmResult;
use crate::inode::DirEntry;
use crate::superblock::Superblock;

/// Match `name` against `pattern`, ignoring case.
///
/// Supports `*`, `?` and `[...]` classes with ranges and `!`/`^` negation.
pub fn matches(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let n: Vec<char> = name.to_ascii_lowercase().chars().collect();
    match_from(&p, &n)
}

fn match_from(p: &[char], n: &[char]) -> bool {
    match p.first() {
        None => n.is_empty(),
        Some('*') => (0..=n.len()).any(|skip| match_from(&p[1..], &n[skip..])),
        Some('?') => !n.is_empty() && match_from(&p[1..], &n[1..]),
        Some('[') => {
            let Some(&c) = n.first() else {
                return false;
            };
            match match_class(&p[1..], c) {
                Some((true, rest)) => match_from(rest, &n[1..]),
                Some((false, _)) => false,
                // unterminated class: treat '[' literally
                None => c == '[' && match_from(&p[1..], &n[1..]),
            }
        }
        Some(&lit) => n.first() == Some(&lit) && match_from(&p[1..], &n[1..]),
    }
}

/// Returns whether `c` is in the class and the pattern after `]`.
fn match_class(p: &[char], c: char) -> Option<(bool, &[char])> {
    let (negate, mut i) = match p.first() {
        Some('!') | Some('^') => (true, 1),
        _ => (false, 0),
    };
    let mut hit = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((hit != negate, &p[i + 1..]));
        }
        first = false;
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                hit = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                hit = true;
            }
            i += 1;
        }
    }
    None
}

/// Split `user:pattern`. `*:` selects all users; no prefix selects `default`.
fn split_user(pattern: &str, default: u8) -> (Option<u8>, &str) {
    match pattern.split_once(':') {
        Some(("*", rest)) => (None, rest),
        Some((digits, rest)) => match digits.parse::<u8>() {
            Ok(user) => (Some(user), rest),
            Err(_) => (Some(default), pattern),
        },
        None => (Some(default), pattern),
    }
}

impl<D: Device> Superblock<D> {
    /// Directory entries matching any of `patterns`, in directory order.
    ///
    /// Pseudo entries are never matched.
    pub fn glob(&self, patterns: &[&str]) -> CpmResult<Vec<DirEntry>> {
        let mut out: Vec<DirEntry> = Vec::new();
        for entry in self.read_dir() {
            let Some(user) = entry.user else {
                continue;
            };
            let hit = patterns.iter().any(|pattern| {
                let (want, pat) = split_user(pattern, self.current_user);
                want.map_or(true, |w| w == user) && matches(pat, &entry.name)
            });
            if hit {
                out.push(entry);
            }
        }
        log::debug!("glob {:?}: {} matches", patterns, out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::FormatCatalog;

    #[test]
    fn test_wildcards() {
        assert!(matches("*.com", "pip.com"));
        assert!(matches("*.COM", "pip.com"));
        assert!(!matches("*.com", "pip.cmd"));
        assert!(matches("p?p.*", "pip.com"));
        assert!(matches("*", ""));
        assert!(!matches("?", ""));
        assert!(matches("a*b*c", "axxbyyc"));
    }

    #[test]
    fn test_classes() {
        assert!(matches("[abc]*", "bdos.asm"));
        assert!(!matches("[!abc]*", "bdos.asm"));
        assert!(matches("[^x-z]1", "a1"));
        assert!(matches("file[0-9].txt", "file7.txt"));
        assert!(!matches("file[0-9].txt", "filex.txt"));
        assert!(matches("[]]", "]"));
        assert!(matches("a[", "a["));
    }

    #[test]
    fn test_split_user() {
        assert_eq!(split_user("3:*.com", 0), (Some(3), "*.com"));
        assert_eq!(split_user("*:*", 0), (None, "*"));
        assert_eq!(split_user("x.y", 5), (Some(5), "x.y"));
    }

    #[test]
    fn test_glob_directory() {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        let dev = MemoryDevice::for_format(&fmt);
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        let root = sb.root();
        for path in ["pip.com", "stat.com", "readme.txt", "2:hidden.com"] {
            sb.create(&root, path, 0o666).unwrap();
        }

        let names = |v: Vec<DirEntry>| v.into_iter().map(|e| e.path()).collect::<Vec<_>>();
        assert_eq!(names(sb.glob(&["*.com"]).unwrap()), vec!["0:pip.com", "0:stat.com"]);
        assert_eq!(names(sb.glob(&["*:*.com"]).unwrap()).len(), 3);
        assert_eq!(names(sb.glob(&["2:*"]).unwrap()), vec!["2:hidden.com"]);
        assert_eq!(
            names(sb.glob(&["README.*", "s*"]).unwrap()),
            vec!["0:stat.com", "0:readme.txt"]
        );
        assert!(sb.glob(&["nothing"]).unwrap().is_empty());
    }
}
