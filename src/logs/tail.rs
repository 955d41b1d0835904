// src/logs/tail.rs

//! Bounded tail capture.
//!
//! The file is scanned backwards in fixed-size chunks until enough line
//! breaks are seen, then read forward from that offset into a ring buffer.
//! Memory use is bounded by `max_lines` and the chunk size, not by the log.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::fs::temp_sibling;

const CHUNK: usize = 8 * 1024;

/// Last `min(max_lines, total)` lines of `path`, oldest first.
///
/// Line terminators are stripped; invalid UTF-8 is replaced lossily.
pub fn capture_tail(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    capture_tail_chunked(path, max_lines, CHUNK)
}

fn capture_tail_chunked(path: &Path, max_lines: usize, chunk: usize) -> io::Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    let start = tail_start_offset(&mut file, len, max_lines, chunk)?;
    file.seek(SeekFrom::Start(start))?;

    let mut reader = BufReader::new(file);
    let mut ring: VecDeque<String> = VecDeque::with_capacity(max_lines);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if ring.len() == max_lines {
            ring.pop_front();
        }
        ring.push_back(String::from_utf8_lossy(&line).into_owned());
    }

    Ok(ring.into())
}

/// Offset of the first byte of the `max_lines`-th line from the end.
fn tail_start_offset(file: &mut File, len: u64, max_lines: usize, chunk: usize) -> io::Result<u64> {
    // A trailing newline ends the last line; it does not start a new one.
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    let mut pos = if last[0] == b'\n' { len - 1 } else { len };

    let mut buf = vec![0u8; chunk.max(1)];
    let mut seen = 0usize;
    while pos > 0 {
        let n = pos.min(buf.len() as u64) as usize;
        pos -= n as u64;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf[..n])?;

        for i in (0..n).rev() {
            if buf[i] == b'\n' {
                seen += 1;
                if seen == max_lines {
                    return Ok(pos + i as u64 + 1);
                }
            }
        }
    }
    Ok(0)
}

/// Write captured lines to `dest` (temp file + rename).
pub fn write_tail(dest: &Path, lines: &[String]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(dest);
    let result = (|| {
        let mut out = io::BufWriter::new(File::create(&tmp)?);
        for line in lines {
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        std::fs::rename(&tmp, dest)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
