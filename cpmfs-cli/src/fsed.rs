//! Interactive sector browser.
//!
//! Walks the image byte by byte in logical order (boot tracks, directory,
//! data) and decodes directory entries under the cursor. Read-only.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute, queue,
    style::Print,
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};

use cpmfs_core::layout::{EntryStatus, ENTRY_SIZE, RECORD_SIZE};
use cpmfs_core::{stamp, Device, FsFlags, RawEntry, Superblock};

/// Rows of the data map.
const MAP_ROWS: usize = 18;
/// Columns of the data map.
const MAP_COLS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    System,
    Directory,
    Data,
}

/// What the caller should do after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stay,
    Info,
    Map,
    Quit,
}

/// One rendered screen.
#[derive(Debug, Clone)]
pub struct Screen {
    pub lines: Vec<String>,
    /// (column, row)
    pub cursor: (u16, u16),
}

/// Browser state over a mounted volume.
pub struct Browser<D: Device> {
    sb: Superblock<D>,
    pos: u64,
    buf: Vec<u8>,
    /// Index of the sector held in `buf`.
    loaded: Option<u64>,
    error: Option<String>,
}

impl<D: Device> Browser<D> {
    pub fn new(sb: Superblock<D>) -> Self {
        let seclen = sb.format().sector_length;
        Self {
            sb,
            pos: 0,
            buf: vec![0u8; seclen],
            loaded: None,
            error: None,
        }
    }

    fn sector_length(&self) -> u64 {
        self.sb.format().sector_length as u64
    }

    fn track_bytes(&self) -> u64 {
        self.sector_length() * self.sb.format().sectors_per_track as u64
    }

    fn total_bytes(&self) -> u64 {
        self.track_bytes() * self.sb.format().tracks as u64
    }

    fn system_bytes(&self) -> u64 {
        self.track_bytes() * self.sb.format().boot_tracks as u64
    }

    fn directory_end(&self) -> u64 {
        self.system_bytes() + (self.sb.format().max_dir * ENTRY_SIZE) as u64
    }

    pub fn area(&self) -> Area {
        if self.pos < self.system_bytes() {
            Area::System
        } else if self.pos < self.directory_end() {
            Area::Directory
        } else {
            Area::Data
        }
    }

    /// (track, logical sector, physical sector) of the cursor.
    fn location(&self) -> (u32, u32, u32) {
        let spt = self.sb.format().sectors_per_track as u64;
        let index = self.pos / self.sector_length();
        let track = (index / spt) as u32;
        let logical = (index % spt) as u32;
        let physical = if self.area() == Area::System {
            logical
        } else {
            self.sb.sector_map().physical_sector(logical)
        };
        (track, logical, physical)
    }

    fn load(&mut self) {
        let index = self.pos / self.sector_length();
        if self.loaded == Some(index) {
            return;
        }
        let (track, _, physical) = self.location();
        match self.sb.device_mut().read_sector(track, physical, &mut self.buf) {
            Ok(()) => {
                self.loaded = Some(index);
                self.error = None;
            }
            Err(e) => {
                log::debug!("fsed: track {} sector {}: {}", track, physical, e);
                self.loaded = None;
                self.error = Some(e.to_string());
            }
        }
    }

    fn forward(&mut self, step: u64) {
        if self.pos + step < self.total_bytes() {
            self.pos += step;
        }
    }

    fn backward(&mut self, step: u64) {
        if self.pos >= step {
            self.pos -= step;
        }
    }

    /// Apply a key. Movement keys follow the classic fsed bindings.
    pub fn handle_key(&mut self, key: char) -> Action {
        let track = self.track_bytes();
        match key {
            'q' => return Action::Quit,
            'i' => return Action::Info,
            'm' => return Action::Map,
            'n' => self.forward(RECORD_SIZE as u64),
            'p' => self.backward(RECORD_SIZE as u64),
            'N' => self.forward(track),
            'P' => self.backward(track),
            'f' => self.forward(1),
            'b' => self.backward(1),
            'F' | 'B' => {
                let step = match self.area() {
                    Area::System => 16,
                    Area::Directory => ENTRY_SIZE as u64,
                    Area::Data => return Action::Stay,
                };
                if key == 'F' {
                    self.forward(step)
                } else {
                    self.backward(step)
                }
            }
            _ => {}
        }
        Action::Stay
    }

    /// Render the current position for a terminal of `cols` x `rows`.
    pub fn screen(&mut self, cols: usize, rows: usize) -> Screen {
        self.load();
        let rows = rows.max(24);
        let mut lines = vec![String::new(); rows];

        let title = match self.area() {
            Area::System => "System area",
            Area::Directory => "Directory area",
            Area::Data => "Data area",
        };
        lines[0] = format!("{:^width$}", title, width = cols);

        let (track, logical, physical) = self.location();
        let offset = self.pos % self.sector_length();
        let mut status = format!("Byte {:8} (0x{:08x})  ", self.pos, self.pos);
        if self.area() == Area::System {
            status.push_str(&format!("Physical sector {:3}  ", physical + 1));
        } else {
            status.push_str(&format!("Sector {:3} (physical {:3})  ", logical + 1, physical + 1));
        }
        status.push_str(&format!("Offset {:5}  Track {:5}", offset, track));
        lines[2] = status;

        match &self.error {
            Some(e) => lines[4] = format!("Data can not be read: {}", e),
            None => {
                for (row, line) in self.dump_lines().into_iter().enumerate() {
                    lines[4 + row] = line;
                }
                if self.area() == Area::Directory {
                    for (row, line) in self.entry_lines().into_iter().enumerate() {
                        lines[13 + row] = line;
                    }
                }
            }
        }

        let mut help = String::from("N)ext track    P)revious track");
        match self.area() {
            Area::System => help.push_str("      F)orward 16 byte   B)ackward 16 byte"),
            Area::Directory => help.push_str("      F)orward entry     B)ackward entry"),
            Area::Data => {}
        }
        lines[rows - 3] = help;
        lines[rows - 2] =
            "n)ext record   p)revious record     f)orward byte      b)ackward byte".to_string();
        lines[rows - 1] = "i)nfo          m)ap                 q)uit".to_string();

        let within = (self.pos % RECORD_SIZE as u64) as usize;
        let column = (within & 0x0F) * 3 + usize::from(within & 0x08 != 0);
        let cursor = (column as u16, (4 + (within >> 4)) as u16);
        Screen { lines, cursor }
    }

    /// Hex and ASCII dump of the 128-byte record under the cursor.
    fn dump_lines(&self) -> Vec<String> {
        let start = ((self.pos % self.sector_length()) as usize) & !(RECORD_SIZE - 1);
        let record = &self.buf[start..start + RECORD_SIZE];
        record
            .chunks(16)
            .map(|row| {
                let mut line = String::with_capacity(66);
                for (i, b) in row.iter().enumerate() {
                    if i == 8 {
                        line.push(' ');
                    }
                    line.push_str(&format!("{:02x} ", b));
                }
                while line.len() < 50 {
                    line.push(' ');
                }
                line.extend(row.iter().map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                }));
                line
            })
            .collect()
    }

    /// Decoded view of the directory entry under the cursor.
    fn entry_lines(&self) -> Vec<String> {
        let seclen = self.sector_length();
        let start = ((self.pos % seclen) as usize) & !(ENTRY_SIZE - 1);
        let entry = RawEntry::from_bytes(&self.buf[start..start + ENTRY_SIZE]);
        let b = entry.as_bytes();
        let index = (self.pos - self.system_bytes()) / ENTRY_SIZE as u64;
        let format = self.sb.format();
        let wide = format.wide_pointers();
        let text = |bytes: &[u8]| -> String { bytes.iter().map(|&c| (c & 0x7F) as char).collect() };

        let mut out = Vec::new();
        match EntryStatus::classify(entry.status(), format.flags) {
            EntryStatus::Free => {
                out.push(format!("Entry {:3}: Free", index));
            }
            EntryStatus::File(user) => {
                out.push(format!("Entry {:3}: Directory entry", index));
                out.push(String::new());
                out.push(format!(
                    "User: {:2} Name: {} Extension: {}",
                    user,
                    text(&b[1..9]),
                    text(&b[9..12])
                ));
                out.push(format!(
                    "Extent: {:3} (low: {:2}, high: {:2})",
                    entry.extent() as usize / format.extents_per_entry().max(1),
                    b[12],
                    b[14]
                ));
                out.push(format!("Last extent record count: {:3}", entry.rc()));
                out.push(format!("Last record byte count: {:3}", entry.lrc()));
                let blocks: Vec<String> = entry
                    .pointers(wide)
                    .map(|p| if wide { format!("{:5}", p) } else { format!("{:3}", p) })
                    .collect();
                out.push(format!("Data blocks: {}", blocks.join(" ")));
            }
            EntryStatus::Label if format.flags.contains(FsFlags::CPM3_OTHER) => {
                let flags = b[12];
                let on = |bit: u8, what: &str| {
                    if flags & bit != 0 {
                        format!("on {}", what)
                    } else {
                        format!("not on {}", what)
                    }
                };
                out.push(format!("Entry {:3}: Disc label", index));
                out.push(String::new());
                out.push(format!("Label: {}", text(&b[1..12])));
                out.push(format!(
                    "Bit 0,7: Label {}, password protection {}",
                    if flags & 0x01 != 0 { "set" } else { "not set" },
                    if flags & 0x80 != 0 { "set" } else { "not set" }
                ));
                out.push(format!(
                    "Bit 4,5,6: Time stamp {}, {}, {}",
                    on(0x10, "create"),
                    on(0x20, "modification"),
                    on(0x40, "access")
                ));
                out.push(format!(
                    "Password: {:8} XOR value: 0x{:02x}",
                    printable(&stamp::unseal_password(&b[16..24], b[13])),
                    b[13]
                ));
                out.push(format!(
                    "Created: {} Updated: {}",
                    show_time(stamp::decode_stamp(&b[24..28])),
                    show_time(stamp::decode_stamp(&b[28..32]))
                ));
            }
            EntryStatus::Stamps => {
                out.push(format!("Entry {:3}: Time stamps", index));
                out.push(String::new());
                for (label, at) in [("3rd last", 1), ("2nd last", 11), ("    Last", 21)] {
                    out.push(format!(
                        "{} extent: Created/Accessed {} Modified {}",
                        label,
                        show_time(stamp::decode_stamp(&b[at..at + 4])),
                        show_time(stamp::decode_stamp(&b[at + 4..at + 8]))
                    ));
                }
            }
            EntryStatus::Xfcb(_) => {
                let mode = b[12];
                let mut needed = Vec::new();
                if mode & 0x80 != 0 {
                    needed.push("Reading");
                }
                if mode & 0x40 != 0 {
                    needed.push("Writing");
                }
                if mode & 0x20 != 0 {
                    needed.push("Deleting");
                }
                out.push(format!("Entry {:3}: Password", index));
                out.push(String::new());
                out.push(format!("Name: {} Extension: {}", text(&b[1..9]), text(&b[9..12])));
                out.push(format!("Password required for: {}", needed.join(" ")));
                out.push(format!(
                    "Password: {:8} XOR value: 0x{:02x}",
                    printable(&stamp::unseal_password(&b[16..24], b[13])),
                    b[13]
                ));
            }
            _ => {
                out.push(format!("Entry {:3}: Bad status 0x{:02x}", index, entry.status()));
            }
        }
        out
    }

    /// Filesystem characteristics.
    pub fn info_lines(&self, image: &str, format_name: &str) -> Vec<String> {
        let format = self.sb.format();
        let st = self.sb.statfs();
        vec![
            "File system characteristics".to_string(),
            String::new(),
            format!("                      Image: {}", image),
            format!("                     Format: {}", format_name),
            format!("                File system: {}", format.flags.dialect()),
            String::new(),
            format!("              Sector length: {}", format.sector_length),
            format!("           Number of tracks: {}", format.tracks),
            format!("          Sectors per track: {}", format.sectors_per_track),
            String::new(),
            format!("                 Block size: {}", format.block_size),
            format!("Number of directory entries: {}", format.max_dir),
            format!(" Number of directory blocks: {}", st.directory_blocks),
            format!("        Logical sector skew: {}", format.skew),
            format!("    Number of system tracks: {}", format.boot_tracks),
            format!(" Logical extents per extent: {}", format.extents_per_entry()),
            format!(
                "    Allocatable data blocks: {}",
                st.total_blocks - st.directory_blocks
            ),
        ]
    }

    /// Coarse usage map: S system, D directory, # file data, . free.
    ///
    /// Each character covers the same number of sectors; the map is laid
    /// out column by column.
    pub fn map_lines(&self) -> Vec<String> {
        let format = self.sb.format();
        let cells = MAP_ROWS * MAP_COLS;
        let spt = format.sectors_per_track as usize;
        let total = spt * format.tracks as usize;
        let per_cell = total.div_ceil(cells).max(1);
        let spb = self.sb.sector_map().sectors_per_block();
        let system = format.boot_tracks as usize * spt;
        let directory = (format.max_dir * ENTRY_SIZE).div_ceil(format.sector_length);

        let mut map = vec![b' '; cells];
        let mut mark = |from: usize, count: usize, c: u8| {
            let first = from / per_cell;
            let last = (from + count).div_ceil(per_cell).min(cells);
            for cell in map.iter_mut().take(last).skip(first) {
                *cell = c;
            }
        };
        mark(0, total, b'.');
        mark(0, system, b'S');
        mark(system, directory, b'D');
        let alloc = self.sb.allocation();
        for block in alloc.first_data_block()..alloc.len() {
            if alloc.is_used(block) {
                mark(system + block * spb, spb, b'#');
            }
        }

        let mut lines: Vec<String> = (0..MAP_ROWS)
            .map(|row| {
                (0..MAP_COLS)
                    .map(|col| map[col * MAP_ROWS + row] as char)
                    .collect()
            })
            .collect();
        lines.push(String::new());
        lines.push("S=System area   D=Directory area   #=File data   .=Free".to_string());
        lines
    }
}

fn printable(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_graphic() { c } else { ' ' })
        .collect()
}

fn show_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => "--".to_string(),
    }
}

/// Translate crossterm key events to browser keys.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<char> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char('c') = code {
            return Some('q');
        }
    }
    match code {
        KeyCode::Char(c) => Some(c),
        KeyCode::Right => Some('f'),
        KeyCode::Left => Some('b'),
        KeyCode::Down => Some('n'),
        KeyCode::Up => Some('p'),
        KeyCode::PageDown => Some('N'),
        KeyCode::PageUp => Some('P'),
        KeyCode::Esc => Some('q'),
        _ => None,
    }
}

fn wait_key() -> io::Result<char> {
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if let Some(c) = translate_key(key.code, key.modifiers) {
                return Ok(c);
            }
        }
    }
}

fn draw<W: Write>(out: &mut W, lines: &[String], cursor_at: Option<(u16, u16)>) -> io::Result<()> {
    queue!(out, cursor::Hide, Clear(ClearType::All))?;
    for (row, line) in lines.iter().enumerate() {
        queue!(out, cursor::MoveTo(0, row as u16), Print(line))?;
    }
    if let Some((col, row)) = cursor_at {
        queue!(out, cursor::MoveTo(col, row), cursor::Show)?;
    }
    out.flush()
}

fn event_loop<D: Device, W: Write>(
    browser: &mut Browser<D>,
    out: &mut W,
    image: &str,
    format_name: &str,
) -> io::Result<()> {
    loop {
        let (cols, rows) = terminal::size()?;
        let screen = browser.screen(cols as usize, rows as usize);
        draw(out, &screen.lines, Some(screen.cursor))?;

        let key = wait_key()?;
        let extra = match browser.handle_key(key) {
            Action::Quit => return Ok(()),
            Action::Stay => continue,
            Action::Info => browser.info_lines(image, format_name),
            Action::Map => browser.map_lines(),
        };
        let mut page = extra;
        page.push(String::new());
        page.push("Any key to continue".to_string());
        draw(out, &page, None)?;
        wait_key()?;
    }
}

/// Run the browser on the terminal until the user quits.
pub fn run<D: Device>(sb: Superblock<D>, image: &str, format_name: &str) -> io::Result<()> {
    let mut browser = Browser::new(sb);
    let mut stdout = io::stdout();

    terminal::enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen)?;
    let result = event_loop(&mut browser, &mut stdout, image, format_name);
    let restore = execute!(stdout, LeaveAlternateScreen, cursor::Show);
    let _ = terminal::disable_raw_mode();
    result.and(restore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpmfs_core::{make_filesystem, FormatCatalog, MemoryDevice, MkfsOptions};

    fn browser(name: &str, options: &MkfsOptions) -> Browser<MemoryDevice> {
        let fmt = FormatCatalog::builtin().resolve(name).unwrap();
        let mut dev = MemoryDevice::for_format(&fmt);
        make_filesystem(&mut dev, &fmt, options).unwrap();
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        let root = sb.root();
        let inode = sb.create(&root, "hello.txt", 0o666).unwrap();
        let mut handle = sb.open(&inode, cpmfs_core::OpenMode::Write).unwrap();
        sb.write(&mut handle, b"Hello").unwrap();
        sb.sync().unwrap();
        Browser::new(sb)
    }

    #[test]
    fn test_areas_and_movement() {
        let mut b = browser("ibm-3740", &MkfsOptions::default());
        assert_eq!(b.area(), Area::System);
        b.handle_key('N');
        assert_eq!(b.area(), Area::System);
        b.handle_key('N');
        assert_eq!(b.area(), Area::Directory);
        assert_eq!(b.pos, 2 * 26 * 128);
        b.handle_key('F');
        assert_eq!(b.pos, 2 * 26 * 128 + 32);
        b.handle_key('b');
        b.handle_key('B');
        assert_eq!(b.pos, 2 * 26 * 128 - 1);
        assert_eq!(b.area(), Area::System);
        assert_eq!(b.handle_key('q'), Action::Quit);

        b.handle_key('P');
        b.handle_key('P');
        b.handle_key('P');
        assert_eq!(b.pos, 26 * 128 - 1);
    }

    #[test]
    fn test_directory_entry_decoding() {
        let mut b = browser("ibm-3740", &MkfsOptions::default());
        b.handle_key('N');
        b.handle_key('N');
        let screen = b.screen(80, 24);
        assert_eq!(screen.lines[0].trim(), "Directory area");
        assert!(screen.lines[13].contains("Directory entry"));
        assert!(screen.lines[15].contains("Name: HELLO    Extension: TXT"));
        assert!(screen.lines[4].starts_with("00 48 45 4c 4c 4f"));
        assert_eq!(screen.cursor, (0, 4));

        b.handle_key('F');
        let screen = b.screen(80, 24);
        assert!(screen.lines[13].contains("Free"));
        assert_eq!(screen.cursor, (0, 6));
    }

    #[test]
    fn test_label_and_stamp_entries() {
        let options = MkfsOptions {
            label: Some("BROWSE".to_string()),
            timestamps: true,
            boot: Vec::new(),
        };
        let mut b = browser("cpcdata", &options);
        let screen = b.screen(80, 24);
        assert!(screen.lines[13].contains("Disc label"));
        assert!(screen.lines[15].contains("Label: BROWSE"));
        for _ in 0..3 {
            b.handle_key('F');
        }
        let screen = b.screen(80, 24);
        assert!(screen.lines[13].contains("Time stamps"));
    }

    #[test]
    fn test_read_error_is_shown() {
        let mut b = browser("ibm-3740", &MkfsOptions::default());
        b.sb.device_mut().inject_read_error(0, 0);
        let screen = b.screen(80, 24);
        assert!(screen.lines[4].starts_with("Data can not be read"));
    }

    #[test]
    fn test_map_and_info() {
        let b = browser("ibm-3740", &MkfsOptions::default());
        let map = b.map_lines();
        assert_eq!(map.len(), MAP_ROWS + 2);
        let cells: String = map[..MAP_ROWS].concat();
        assert!(cells.contains('S'));
        assert!(cells.contains('D'));
        assert!(cells.contains('#'));
        assert!(cells.contains('.'));

        let info = b.info_lines("disk.img", "ibm-3740");
        assert!(info.iter().any(|l| l.ends_with("File system: CP/M 2.2")));
        assert!(info.iter().any(|l| l.ends_with("Allocatable data blocks: 241")));
    }
}
