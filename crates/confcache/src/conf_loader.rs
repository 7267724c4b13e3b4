use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use md5::{Digest, Md5};

use crate::error::Error;

/// Skip lines that are empty after trimming the trailing newline.
pub const SKIP_EMPTY: u32 = 1 << 0;
/// Skip lines whose first non-whitespace byte is `#`.
pub const SKIP_COMMENTS: u32 = 1 << 1;
/// Strip the trailing `\n` (and a preceding `\r`) from returned lines.
pub const CHOMP: u32 = 1 << 2;
/// Permit embedded NUL bytes in a line instead of treating them as EOF.
pub const ALLOW_NUL: u32 = 1 << 3;

/// Device/inode/size/mtime/ctime snapshot taken at `open` time.
///
/// Cleared (both `dev` and `ino` set to 0) by `confcore::worker` on a failed
/// reload, so that a same-size, same-mtime replacement file can never mask
/// a previous failure on the next scan — see `SPEC_FULL.md` Design Notes,
/// Open Question 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Metadata produced by [`ConfLoader::done`].
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub alloc: usize,
    pub st: StatSnapshot,
    pub digest: [u8; 16],
}

enum Source {
    Plain(BufReader<File>),
    Gz(BufReader<GzDecoder<File>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Plain(r) => r.read(buf),
            Source::Gz(r) => r.read(buf),
        }
    }
}

impl BufRead for Source {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            Source::Plain(r) => r.fill_buf(),
            Source::Gz(r) => r.fill_buf(),
        }
    }
    fn consume(&mut self, amt: usize) {
        match self {
            Source::Plain(r) => r.consume(amt),
            Source::Gz(r) => r.consume(amt),
        }
    }
}

struct Backup {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

/// Transparent plain/gzip line reader that tracks byte offset and line
/// number, accumulates an MD5 digest over everything it has handed back to
/// the caller, and optionally mirrors those same bytes into a backup file
/// that is only renamed into place on success (see `done`/`reject`).
pub struct ConfLoader {
    path: PathBuf,
    source: Source,
    compressed: bool,
    md5: Md5,
    line_no: u32,
    alloc: usize,
    pending_unread: Option<String>,
    backup: Option<Backup>,
    st: StatSnapshot,
    err: Option<std::io::ErrorKind>,
    eof: bool,
}

fn stat_snapshot(meta: &fs::Metadata) -> StatSnapshot {
    use std::os::unix::fs::MetadataExt;
    StatSnapshot {
        dev: meta.dev(),
        ino: meta.ino(),
        size: meta.size(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}

impl ConfLoader {
    /// Opens `path`; if missing, also tries `path` + `.gz`. `Ok(None)` means
    /// neither exists — this is reported as EOF, not an error, exactly as
    /// the original treats a missing file.
    pub fn open(
        path: &Path,
        backup_dir: Option<&Path>,
        backup_suffix: Option<&str>,
        flags: u32,
    ) -> Result<Option<ConfLoader>, Error> {
        let _ = flags; // flags affect readline(), not opening
        let (file, real_path, compressed) = match File::open(path) {
            Ok(f) => (f, path.to_path_buf(), path.extension().map_or(false, |e| e == "gz")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let gz_path = append_ext(path, "gz");
                match File::open(&gz_path) {
                    Ok(f) => (f, gz_path, true),
                    Err(e2) if e2.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e2) => return Err(e2.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata()?;
        let st = stat_snapshot(&meta);

        let source = if compressed {
            Source::Gz(BufReader::new(GzDecoder::new(file)))
        } else {
            Source::Plain(BufReader::new(file))
        };

        let backup = match backup_dir {
            Some(dir) => Some(open_backup(path, dir, backup_suffix.unwrap_or(".last-good"))?),
            None => None,
        };

        Ok(Some(ConfLoader {
            path: real_path,
            source,
            compressed,
            md5: Md5::new(),
            line_no: 0,
            alloc: 0,
            pending_unread: None,
            backup,
            st,
            err: None,
            eof: false,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self) -> u32 {
        self.line_no
    }

    pub fn iscompressed(&self) -> bool {
        self.compressed
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn stat(&self) -> StatSnapshot {
        self.st
    }

    /// One-token pushback; calling this twice without an intervening
    /// `readline` is a programming error.
    pub fn unreadline(&mut self, line: String) {
        assert!(self.pending_unread.is_none(), "ConfLoader: double unreadline");
        self.pending_unread = Some(line);
    }

    /// Returns the next logical line, honoring `SKIP_EMPTY`/`SKIP_COMMENTS`/
    /// `CHOMP`. Every byte consumed is fed to the MD5 context and, if a
    /// backup is configured, mirrored there verbatim (pre-chomp).
    pub fn readline(&mut self, flags: u32) -> Result<Option<String>, Error> {
        loop {
            if let Some(line) = self.pending_unread.take() {
                return Ok(Some(line));
            }
            let mut raw = Vec::new();
            let n = self.source.read_until(b'\n', &mut raw)?;
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.line_no += 1;
            self.md5.update(&raw);
            if let Some(backup) = self.backup.as_mut() {
                backup.file.write_all(&raw).map_err(Error::from)?;
            }

            if flags & ALLOW_NUL == 0 && raw.contains(&0) {
                self.eof = true;
                self.err = Some(std::io::ErrorKind::InvalidData);
                return Err(Error::Corruption {
                    at: format!("{}:{}: embedded NUL byte", self.path.display(), self.line_no),
                });
            }

            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if flags & CHOMP != 0 {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
            }

            if flags & SKIP_EMPTY != 0 && line.trim_end_matches(['\r', '\n']).is_empty() {
                continue;
            }
            if flags & SKIP_COMMENTS != 0 && line.trim_start().starts_with('#') {
                continue;
            }
            return Ok(Some(line));
        }
    }

    /// Whole-file variant; stops after `maxlines` if given.
    pub fn readfile(&mut self, flags: u32, maxlines: Option<usize>) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        while maxlines.map_or(true, |m| out.len() < m) {
            match self.readline(flags)? {
                Some(l) => out.push(l),
                None => break,
            }
        }
        Ok(out)
    }

    /// Whole-file binary read, bounded by `maxsz`.
    pub fn readfile_binary(&mut self, maxsz: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let want = maxsz.saturating_sub(out.len()).min(chunk.len());
            if want == 0 {
                break;
            }
            let n = self.source.read(&mut chunk[..want])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.md5.update(&chunk[..n]);
            if let Some(backup) = self.backup.as_mut() {
                backup.file.write_all(&chunk[..n]).map_err(Error::from)?;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    /// Finalizes the MD5 digest, records the allocation delta, and — if a
    /// backup was configured — renames the temp file into its final
    /// last-good location. Must only be called after a successful parse.
    pub fn done(mut self, alloc: usize) -> Result<LoadInfo, Error> {
        self.alloc = alloc;
        let digest: [u8; 16] = self.md5.clone().finalize().into();
        if let Some(backup) = self.backup.take() {
            backup.file.sync_all().ok();
            fs::rename(&backup.tmp_path, &backup.final_path)?;
        }
        Ok(LoadInfo { alloc, st: self.st, digest })
    }

    /// Consumes the remainder of the stream (so the backup mirror is
    /// complete), then renames the temp file into `reject_dir` instead of
    /// the last-good tree.
    pub fn reject(mut self, relative_name: &str, reject_dir: &Path) -> Result<(), Error> {
        // Drain whatever remains so the backup mirror captures the whole file.
        let mut sink = [0u8; 8192];
        loop {
            let n = self.source.read(&mut sink)?;
            if n == 0 {
                break;
            }
            if let Some(backup) = self.backup.as_mut() {
                backup.file.write_all(&sink[..n]).map_err(Error::from)?;
            }
        }
        if let Some(backup) = self.backup.take() {
            backup.file.sync_all().ok();
            fs::create_dir_all(reject_dir)?;
            let dest = reject_dir.join(relative_name);
            fs::rename(&backup.tmp_path, &dest)?;
        }
        self.err = Some(std::io::ErrorKind::InvalidInput);
        Ok(())
    }
}

fn append_ext(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn open_backup(source_path: &Path, backup_dir: &Path, suffix: &str) -> Result<Backup, Error> {
    fs::create_dir_all(backup_dir)?;
    let basename = source_path.file_name().unwrap_or_default();
    let mut final_name = basename.to_owned();
    final_name.push(suffix);
    let final_path = backup_dir.join(&final_name);

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut tmp_name = basename.to_owned();
    tmp_name.push(format!(".tmp.{}", nanos));
    let tmp_path = backup_dir.join(tmp_name);

    let file = fs::OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
    lock_exclusive_nonblocking(&file)?;

    Ok(Backup { tmp_path, final_path, file })
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> Result<(), Error> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive_nonblocking(_file: &File) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile_dir();
        let got = ConfLoader::open(&dir.join("nope"), None, None, 0).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn reads_lines_with_chomp_and_skip() {
        let dir = tempfile_dir();
        let path = write_temp(&dir, "f", b"a\n\n# comment\nb\n");
        let mut cl = ConfLoader::open(&path, None, None, 0).unwrap().unwrap();
        let flags = CHOMP | SKIP_EMPTY | SKIP_COMMENTS;
        assert_eq!(cl.readline(flags).unwrap(), Some("a".to_owned()));
        assert_eq!(cl.readline(flags).unwrap(), Some("b".to_owned()));
        assert_eq!(cl.readline(flags).unwrap(), None);
    }

    #[test]
    fn unreadline_then_readline_returns_same_line() {
        let dir = tempfile_dir();
        let path = write_temp(&dir, "f", b"only\n");
        let mut cl = ConfLoader::open(&path, None, None, 0).unwrap().unwrap();
        let line = cl.readline(CHOMP).unwrap().unwrap();
        cl.unreadline(line.clone());
        assert_eq!(cl.readline(CHOMP).unwrap(), Some(line));
    }

    #[test]
    fn gz_sibling_is_used_transparently() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let dir = tempfile_dir();
        let gz_path = dir.join("f.gz");
        let mut enc = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        enc.write_all(b"hello\n").unwrap();
        enc.finish().unwrap();

        let mut cl = ConfLoader::open(&dir.join("f"), None, None, 0).unwrap().unwrap();
        assert!(cl.iscompressed());
        assert_eq!(cl.readline(CHOMP).unwrap(), Some("hello".to_owned()));
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos();
        dir.push(format!("confcache-test-{}", nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
