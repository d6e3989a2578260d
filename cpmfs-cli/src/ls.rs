//! Directory listings in the UNIX and CP/M styles.

use std::io::Write;

use chrono::{DateTime, Duration, Utc};

use cpmfs_core::{Attributes, CpmResult, Device, DirEntry, StampScheme, Stat, Superblock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// Names grouped by user
    Short,
    /// `ls -l` with mode, size and time
    Long,
    /// CP/M 2.2 DIR, four names per line
    Dir,
    /// Sizes, records, attributes and stamps
    DirLong,
    /// CP/M Plus DIR [FULL]
    Plus,
    /// lsattr-like attribute letters
    Attributes,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub style: Style,
    /// Show ctime instead of mtime in long listings.
    pub ctime: bool,
    pub inode: bool,
}

/// A matched file with fresh metadata.
struct Listed {
    user: u8,
    name: String,
    stat: Stat,
}

/// List files matching `patterns` (all users when empty) to `out`.
pub fn list<D: Device, W: Write>(
    sb: &Superblock<D>,
    patterns: &[String],
    options: &ListOptions,
    out: &mut W,
) -> CpmResult<()> {
    let matches: Vec<DirEntry> = if patterns.is_empty() {
        sb.glob(&["*:*"])?
    } else {
        let names: Vec<&str> = patterns.iter().map(String::as_str).collect();
        sb.glob(&names)?
    };

    let root = sb.root();
    let mut files = Vec::with_capacity(matches.len());
    for entry in matches {
        let inode = sb.lookup(&root, &entry.path())?;
        files.push(Listed {
            user: entry.user.unwrap_or(0),
            name: entry.name,
            stat: inode.stat,
        });
    }
    files.sort_by(|a, b| (a.user, &a.name).cmp(&(b.user, &b.name)));

    match options.style {
        Style::Short | Style::Long => unix(&files, options, out)?,
        Style::Dir => old_dir(&files, out)?,
        Style::DirLong => old_long_dir(sb, &files, out)?,
        Style::Plus => plus_dir(sb, &files, out)?,
        Style::Attributes => attributes(&files, out)?,
    }
    Ok(())
}

/// Missing stamps show as the epoch.
fn or_epoch(time: Option<DateTime<Utc>>) -> DateTime<Utc> {
    time.unwrap_or_default()
}

fn mode_string(mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(if mode & 0o040000 != 0 { 'd' } else { '-' });
    for (bit, c) in [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ] {
        s.push(if mode & bit != 0 { c } else { '-' });
    }
    s
}

/// `NAME    ` and `EXT` upper-cased and padded.
fn split_padded(name: &str, width: usize) -> (String, String) {
    let (stem, ext) = name.split_once('.').unwrap_or((name, ""));
    (
        format!("{:<width$}", stem.to_ascii_uppercase(), width = width),
        format!("{:<3}", ext.to_ascii_uppercase()),
    )
}

fn unix<W: Write>(files: &[Listed], options: &ListOptions, out: &mut W) -> CpmResult<()> {
    let now = Utc::now();
    let mut last_user = None;
    for file in files {
        if last_user != Some(file.user) {
            if last_user.is_some() {
                writeln!(out)?;
            }
            writeln!(out, "{}:", file.user)?;
            last_user = Some(file.user);
        }
        if options.inode {
            write!(out, "{:4} ", file.stat.ino)?;
        }
        if options.style == Style::Long {
            let time = or_epoch(if options.ctime {
                file.stat.ctime
            } else {
                file.stat.mtime
            });
            write!(out, "{}{:9} ", mode_string(file.stat.mode), file.stat.size)?;
            write!(out, "{} ", time.format("%b %d"))?;
            if time < now - Duration::days(182) {
                write!(out, "{}  ", time.format("%Y"))?;
            } else {
                write!(out, "{} ", time.format("%H:%M"))?;
            }
        }
        writeln!(out, "{}", file.name)?;
    }
    Ok(())
}

fn old_dir<W: Write>(files: &[Listed], out: &mut W) -> CpmResult<()> {
    if files.is_empty() {
        writeln!(out, "No file")?;
        return Ok(());
    }
    let show_user = files.iter().any(|f| f.user != 0);
    let mut last_user = None;
    let mut column = 0;
    for file in files {
        if last_user != Some(file.user) {
            if column != 0 {
                writeln!(out)?;
                column = 0;
            }
            if show_user {
                writeln!(out, "User {}", file.user)?;
            }
            last_user = Some(file.user);
        }
        if column != 0 {
            write!(out, " : ")?;
        }
        let (stem, ext) = split_padded(&file.name, 9);
        write!(out, "{}{}", stem, ext)?;
        column += 1;
        if column == 4 {
            writeln!(out)?;
            column = 0;
        }
    }
    if column != 0 {
        writeln!(out)?;
    }
    Ok(())
}

/// `  DD-Mon-YYYY HH:MM`
fn long_time(time: DateTime<Utc>) -> String {
    format!("  {}", time.format("%d-%b-%Y %H:%M"))
}

/// `MM/DD/YY HH:MM  `
fn short_time(time: DateTime<Utc>) -> String {
    format!("{}  ", time.format("%m/%d/%y %H:%M"))
}

fn kilobytes(size: u64, block_size: usize) -> u64 {
    let bs = block_size as u64;
    size.div_ceil(bs) * (bs / 1024)
}

fn old_long_dir<D: Device, W: Write>(
    sb: &Superblock<D>,
    files: &[Listed],
    out: &mut W,
) -> CpmResult<()> {
    if files.is_empty() {
        writeln!(out, "No files found")?;
        return Ok(());
    }
    let st = sb.statfs();
    let header = |out: &mut W| -> std::io::Result<()> {
        writeln!(out, "     Name    Bytes   Recs  Attr     update             create")?;
        writeln!(out, "------------ ------ ------ ---- -----------------  -----------------")
    };
    header(out)?;
    let mut last_user = files[0].user;
    for file in files {
        if file.user != last_user {
            writeln!(out, "\nUser {}:\n", file.user)?;
            header(out)?;
            last_user = file.user;
        }
        let (stem, ext) = split_padded(&file.name, 8);
        write!(out, "{}.{}", stem, ext)?;
        write!(out, " {:5}K", kilobytes(file.stat.size, st.block_size))?;
        write!(out, " {:6} ", file.stat.size / 128)?;
        write!(
            out,
            "{}{} ",
            if file.stat.mode & 0o200 != 0 { ' ' } else { 'R' },
            if file.stat.mode & 0o1000 != 0 { 'S' } else { ' ' }
        )?;
        match (file.stat.mtime, file.stat.ctime) {
            (Some(m), _) => write!(out, "{}", long_time(m))?,
            (None, Some(_)) => write!(out, "{:19}", "")?,
            (None, None) => {}
        }
        if let Some(c) = file.stat.ctime {
            write!(out, "{}", long_time(c))?;
        }
        writeln!(out)?;
    }
    writeln!(
        out,
        "{:5} Files occupying {:6}K, {:7}K Free.",
        files.len(),
        st.used_blocks * st.block_size / 1024,
        st.free_blocks * st.block_size / 1024
    )?;
    Ok(())
}

fn plus_dir<D: Device, W: Write>(
    sb: &Superblock<D>,
    files: &[Listed],
    out: &mut W,
) -> CpmResult<()> {
    if files.is_empty() {
        writeln!(out, "No files found")?;
        return Ok(());
    }
    let st = sb.statfs();
    let create = match sb.stamp_scheme() {
        StampScheme::Cpm3 { create_not_access } | StampScheme::Mpm { create_not_access } => {
            *create_not_access
        }
        _ => true,
    };

    let mut total_bytes = 0u64;
    let mut total_records = 0u64;
    let mut last_user = None;
    for file in files {
        if last_user != Some(file.user) {
            if last_user.is_some() {
                writeln!(out)?;
            }
            writeln!(out, "Directory For Drive A:  User {:2}\n", file.user)?;
            writeln!(
                out,
                "    Name     Bytes   Recs   Attributes   Prot      Update          {}",
                if create { "Create" } else { "Access" }
            )?;
            writeln!(
                out,
                "------------ ------ ------ ------------ ------ --------------  --------------\n"
            )?;
            last_user = Some(file.user);
        }
        let attr = file.stat.attr;
        let records = file.stat.size.div_ceil(128);
        total_bytes += file.stat.size;
        total_records += records;

        let (stem, ext) = split_padded(&file.name, 8);
        write!(out, "{} {}", stem, ext)?;
        write!(out, " {:5}k", kilobytes(file.stat.size, st.block_size))?;
        write!(out, " {:6} ", records)?;
        for (flag, c) in [
            (Attributes::F1, '1'),
            (Attributes::F2, '2'),
            (Attributes::F3, '3'),
            (Attributes::F4, '4'),
        ] {
            write!(out, "{}", if attr.contains(flag) { c } else { ' ' })?;
        }
        write!(out, "{}", if file.stat.mode & 0o222 != 0 { ' ' } else { 'R' })?;
        write!(out, "{}", if attr.contains(Attributes::SYSTEM) { 'S' } else { ' ' })?;
        write!(out, "{}", if attr.contains(Attributes::ARCHIVE) { 'A' } else { ' ' })?;
        write!(out, "      ")?;
        let protection = if attr.contains(Attributes::PW_READ) {
            "Read   "
        } else if attr.contains(Attributes::PW_WRITE) {
            "Write  "
        } else if attr.contains(Attributes::PW_DELETE) {
            "Delete "
        } else {
            "None   "
        };
        write!(out, "{}", protection)?;
        match file.stat.mtime {
            Some(m) => write!(out, "{}", short_time(m))?,
            None => write!(out, "{:16}", "")?,
        }
        let first = if create { file.stat.ctime } else { file.stat.atime };
        if let Some(t) = first {
            write!(out, "{}", short_time(t))?;
        }
        writeln!(out)?;
    }
    writeln!(
        out,
        "\nTotal Bytes     = {:6}k  Total Records = {:7}  Files Found = {:4}",
        total_bytes.div_ceil(1024),
        total_records,
        files.len()
    )?;
    writeln!(
        out,
        "Total 1k Blocks = {:6}   Used/Max Dir Entries For Drive A: {:4}/{:4}",
        st.used_blocks * st.block_size / 1024,
        st.max_dir - st.free_entries,
        st.max_dir
    )?;
    Ok(())
}

fn attributes<W: Write>(files: &[Listed], out: &mut W) -> CpmResult<()> {
    let mut last_user = None;
    for file in files {
        if last_user != Some(file.user) {
            if last_user.is_some() {
                writeln!(out)?;
            }
            writeln!(out, "{}:", file.user)?;
            last_user = Some(file.user);
        }
        let attr = file.stat.attr;
        let letters: String = [
            (Attributes::F1, '1'),
            (Attributes::F2, '2'),
            (Attributes::F3, '3'),
            (Attributes::F4, '4'),
            (Attributes::SYSTEM, 's'),
            (Attributes::ARCHIVE, 'a'),
            (Attributes::PW_READ, 'r'),
            (Attributes::PW_WRITE, 'w'),
            (Attributes::PW_DELETE, 'e'),
        ]
        .iter()
        .map(|&(flag, c)| if attr.contains(flag) { c } else { '-' })
        .collect();
        writeln!(out, "{} {}", letters, file.name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpmfs_core::{FormatCatalog, MemoryDevice};

    fn volume() -> Superblock<MemoryDevice> {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        let dev = MemoryDevice::for_format(&fmt);
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        let root = sb.root();
        for path in ["pip.com", "stat.com", "readme.txt", "3:games.bas", "ed.com"] {
            sb.create(&root, path, 0o666).unwrap();
        }
        let inode = sb.lookup(&root, "pip.com").unwrap();
        sb.attr_set(&inode, Attributes::SYSTEM | Attributes::F1).unwrap();
        sb
    }

    fn render(style: Style, patterns: &[&str]) -> String {
        let sb = volume();
        let options = ListOptions {
            style,
            ctime: false,
            inode: false,
        };
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        list(&sb, &patterns, &options, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_short_listing_groups_users() {
        assert_eq!(
            render(Style::Short, &[]),
            "0:\ned.com\npip.com\nreadme.txt\nstat.com\n\n3:\ngames.bas\n"
        );
        assert_eq!(render(Style::Short, &["*.com"]), "0:\ned.com\npip.com\nstat.com\n");
    }

    #[test]
    fn test_old_dir_columns() {
        let text = render(Style::Dir, &[]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "User 0");
        assert_eq!(
            lines[1],
            "ED       COM : PIP      COM : README   TXT : STAT     COM"
        );
        assert_eq!(lines[2], "User 3");
        assert_eq!(lines[3], "GAMES    BAS");
        assert_eq!(render(Style::Dir, &["none.*"]), "No file\n");
    }

    #[test]
    fn test_attribute_listing() {
        let text = render(Style::Attributes, &["pip.com"]);
        assert_eq!(text, "0:\n1---s---- pip.com\n");
    }

    #[test]
    fn test_long_listing() {
        let text = render(Style::Long, &["readme.txt"]);
        let line = text.lines().nth(1).unwrap();
        assert!(line.starts_with("-rw-rw-rw-        0 "));
        assert!(line.ends_with("readme.txt"));
    }

    #[test]
    fn test_plus_summary() {
        let text = render(Style::Plus, &["*:*"]);
        assert!(text.contains("Directory For Drive A:  User  0"));
        assert!(text.contains("Files Found =    5"));
        assert!(text.contains("Used/Max Dir Entries For Drive A:    5/  64"));
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(0o100444), "-r--r--r--");
        assert_eq!(mode_string(0o040777), "drwxrwxrwx");
    }
}
