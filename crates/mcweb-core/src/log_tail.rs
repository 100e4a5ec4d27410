use std::{io, path::Path};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const INITIAL_WINDOW_BYTES: u64 = 64 * 1024;
const MAX_WINDOW_BYTES: u64 = 8 * 1024 * 1024;

/// Last `max_lines` lines of `path`, or an empty string when the file can't
/// be read.
pub async fn tail_lines(path: &Path, max_lines: usize) -> String {
    try_tail(path, max_lines).await.unwrap_or_default()
}

/// Last `max_lines` lines of `path`.
///
/// At most 8 MiB from the end of the file is ever read. Lines that don't fit
/// in that window are dropped, so a short file with giant lines comes back
/// cut down to its last complete lines.
///
/// `None` means "no update this cycle": the file is missing, mid-rotation, or
/// held by the writer. Callers keep whatever they had cached.
pub async fn try_tail(path: &Path, max_lines: usize) -> Option<String> {
    match read_tail(path, max_lines).await {
        Ok(text) => Some(text),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "log tail skipped");
            }
            None
        }
    }
}

async fn read_tail(path: &Path, max_lines: usize) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "log path is not a regular file",
        ));
    }

    let size = meta.len();
    if max_lines == 0 || size == 0 {
        return Ok(String::new());
    }

    // Read a window from the end and widen it until it holds enough lines.
    let mut window = INITIAL_WINDOW_BYTES;
    loop {
        let start = size.saturating_sub(window);
        file.seek(io::SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((size - start) as usize);
        (&mut file).take(size - start).read_to_end(&mut buf).await?;

        if let Some(offset) = tail_offset(&buf, max_lines) {
            return Ok(String::from_utf8_lossy(&buf[offset..]).into_owned());
        }
        if start == 0 {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        if window >= MAX_WINDOW_BYTES {
            // Giant lines: drop the partial first one and settle for what fits.
            let offset = buf
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            return Ok(String::from_utf8_lossy(&buf[offset..]).into_owned());
        }
        window = window.saturating_mul(2);
    }
}

/// Byte offset where the last `max_lines` lines of `buf` begin, if `buf`
/// contains that many complete lines. A trailing newline ends the last line
/// rather than starting an empty one.
fn tail_offset(buf: &[u8], max_lines: usize) -> Option<usize> {
    let body = buf.strip_suffix(b"\n").unwrap_or(buf);
    let mut seen = 0;
    for (i, b) in body.iter().enumerate().rev() {
        if *b == b'\n' {
            seen += 1;
            if seen == max_lines {
                return Some(i + 1);
            }
        }
    }
    None
}
