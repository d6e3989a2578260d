//! Copying between host files and a CP/M image.
//!
//! The direction follows from which side carries a `user:` prefix:
//! `cp image 0:NAME.EXT host` copies out, `cp image host 0:` copies in.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use cpmfs_core::{to_8_3, CpmError, CpmResult, Device, OpenMode, Superblock};

use crate::Volume;

/// CP/M end-of-file marker in text files.
const CTRL_Z: u8 = 0x1A;

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Convert line ends and honour ^Z.
    pub text: bool,
    /// Carry timestamps over.
    pub preserve: bool,
}

/// User number of a `u:` or `uu:` prefixed CP/M path.
fn user_number(path: &str) -> Option<u8> {
    let (digits, _) = path.split_once(':')?;
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// CP/M text to host text: stop at ^Z, CR LF becomes LF.
pub fn text_to_host(data: &[u8]) -> Vec<u8> {
    let end = data.iter().position(|&b| b == CTRL_Z).unwrap_or(data.len());
    let mut out = Vec::with_capacity(end);
    let mut cr_pending = false;
    for &b in &data[..end] {
        if cr_pending && b != b'\n' {
            out.push(b'\r');
        }
        cr_pending = b == b'\r';
        if !cr_pending {
            out.push(b);
        }
    }
    if cr_pending {
        out.push(b'\r');
    }
    out
}

/// Host text to CP/M text: LF becomes CR LF, ^Z appended.
pub fn text_to_cpm(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 1);
    for &b in data {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out.push(CTRL_Z);
    out
}

/// Run a copy command over `paths` (sources, then destination).
pub fn run(
    volume: &Volume,
    image: &Path,
    paths: &[String],
    options: &CopyOptions,
) -> Result<bool, Box<dyn Error>> {
    let Some((dest, sources)) = paths.split_last() else {
        return Err("nothing to copy".into());
    };

    if sources.iter().all(|s| user_number(s).is_some()) {
        let dest = PathBuf::from(dest);
        let to_dir = dest.is_dir();
        if !to_dir && sources.len() > 1 {
            return Err(format!("{} is not a directory", dest.display()).into());
        }
        let sb = volume.mount(image, false)?;
        copy_out(sb, sources, &dest, to_dir, options)
    } else if let Some(user) = user_number(dest) {
        if sources.iter().any(|s| user_number(s).is_some()) {
            return Err("can not copy from CP/M to CP/M".into());
        }
        let name = dest.split_once(':').map(|(_, n)| n).unwrap_or("");
        if sources.len() > 1 && !name.is_empty() {
            return Err(format!("{} must be a bare user number for several files", dest).into());
        }
        let mut sb = volume.mount(image, true)?;
        let mut ok = true;
        for source in sources {
            let host = Path::new(source);
            let target = if name.is_empty() {
                let base = host
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}:{}", user, to_8_3(&base))
            } else {
                format!("{}:{}", user, name)
            };
            if let Err(e) = copy_in(&mut sb, host, &target, options) {
                eprintln!("cpmtools cp: can not copy {} to {}: {}", source, target, e);
                ok = false;
            }
        }
        sb.unmount()?;
        Ok(ok)
    } else {
        Err("one side of the copy needs a user: prefix".into())
    }
}

fn copy_out<D: Device>(
    mut sb: Superblock<D>,
    patterns: &[String],
    dest: &Path,
    to_dir: bool,
    options: &CopyOptions,
) -> Result<bool, Box<dyn Error>> {
    let names: Vec<&str> = patterns.iter().map(String::as_str).collect();
    let matches = sb.glob(&names)?;
    if matches.is_empty() {
        eprintln!("cpmtools cp: no files match {}", patterns.join(" "));
        return Ok(false);
    }
    if matches.len() > 1 && !to_dir {
        return Err(format!("{} is not a directory", dest.display()).into());
    }

    let mut ok = true;
    for entry in matches {
        let target = if to_dir {
            dest.join(entry.name.replace('/', ","))
        } else {
            dest.to_path_buf()
        };
        if let Err(e) = copy_one_out(&mut sb, &entry.path(), &target, options) {
            eprintln!(
                "cpmtools cp: can not copy {} to {}: {}",
                entry.path(),
                target.display(),
                e
            );
            ok = false;
        }
    }
    Ok(ok)
}

fn copy_one_out<D: Device>(
    sb: &mut Superblock<D>,
    path: &str,
    target: &Path,
    options: &CopyOptions,
) -> CpmResult<()> {
    let root = sb.root();
    let inode = sb.lookup(&root, path)?;
    let mut handle = sb.open(&inode, OpenMode::Read)?;
    let mut data = vec![0u8; inode.size() as usize];
    let n = sb.read(&mut handle, &mut data)?;
    data.truncate(n);
    sb.close(handle)?;

    if options.text {
        data = text_to_host(&data);
    }
    fs::write(target, &data)?;

    if options.preserve && (inode.stat.atime.is_some() || inode.stat.mtime.is_some()) {
        let now = SystemTime::now();
        let atime = inode.stat.atime.map(SystemTime::from).unwrap_or(now);
        let mtime = inode.stat.mtime.map(SystemTime::from).unwrap_or(now);
        let times = fs::FileTimes::new().set_accessed(atime).set_modified(mtime);
        fs::File::options().write(true).open(target)?.set_times(times)?;
    }
    log::debug!("copied {} to {} ({} bytes)", path, target.display(), data.len());
    Ok(())
}

fn copy_in<D: Device>(
    sb: &mut Superblock<D>,
    host: &Path,
    target: &str,
    options: &CopyOptions,
) -> CpmResult<()> {
    let mut data = fs::read(host)?;
    if options.text {
        data = text_to_cpm(&data);
    }

    let root = sb.root();
    match sb.unlink(&root, target) {
        Ok(()) => log::debug!("replacing {}", target),
        Err(CpmError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    let inode = sb.create(&root, target, 0o666)?;
    let mut handle = sb.open(&inode, OpenMode::Write)?;
    sb.write(&mut handle, &data)?;
    sb.close(handle)?;

    if options.preserve {
        let meta = fs::metadata(host)?;
        let atime = meta.accessed().ok().map(DateTime::<Utc>::from);
        let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
        sb.utime(&inode, atime, mtime)?;
    }
    log::debug!("copied {} to {} ({} bytes)", host.display(), target, data.len());
    Ok(())
}
