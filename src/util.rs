use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Replace characters that are unsafe in file names with underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// File extension without the leading dot, empty if none.
pub fn path_format(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Swap (or append) the extension of `path` for `format`.
pub fn change_path_format(path: &str, format: &str) -> String {
    match path.rfind('.') {
        Some(idx) if !path[idx + 1..].contains('/') => format!("{}.{}", &path[..idx], format),
        _ => format!("{path}.{format}"),
    }
}

/// A file counts as existing only when it has content; zero-byte leftovers
/// from aborted writes are treated as missing.
pub async fn file_exists(path: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Probe for a usable ffmpeg binary on PATH.
pub async fn ffmpeg_available() -> bool {
    tokio::process::Command::new("ffmpeg")
        .arg("-h")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Run `f` up to `attempts` times with exponential backoff between failures.
pub async fn with_retry<F, Fut, T, E>(attempts: u32, label: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                log::error!("{label} failed after {attempts} attempts: {e}");
                return Err(e);
            }
            Err(e) => {
                log::warn!("{label} attempt #{attempt} failed: {e}, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
