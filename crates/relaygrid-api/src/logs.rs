//! `/logs`: read-through of the operator log file.
//!
//! Without `?job=` only system lines (those carrying no `job=` field)
//! are shown. With it, only lines whose `job` field matches exactly.
//! Only the end of the newest log file is read.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::error;

use crate::ApiState;
use crate::handlers::error_response;

/// Lines returned per request.
pub const TAIL_LINES: usize = 1000;
/// Bytes read from the end of the log file per request.
pub const TAIL_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub job: Option<String>,
}

/// GET /logs
pub async fn view_logs(State(state): State<ApiState>, Query(query): Query<LogQuery>) -> Response {
    let job = query.job.as_deref().filter(|j| !j.is_empty());
    if let Some(name) = job {
        match state.jobs().exists(name) {
            Ok(true) => {}
            Ok(false) => {
                return error_response(&format!("job '{name}' not found"), StatusCode::NOT_FOUND)
                    .into_response();
            }
            Err(e) => {
                return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response();
            }
        }
    }

    let read = match current_log_file(&state.log_path).await {
        Ok(path) => read_tail(&path, TAIL_BYTES).await.map(|content| (path, content)),
        Err(e) => Err(e),
    };
    let (path, content) = match read {
        Ok(found) => found,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return error_response("log file not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            error!(path = %state.log_path.display(), error = %e, "failed to read log file");
            return error_response(
                &format!("error reading log file: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response();
        }
    };

    let (total, lines) = tail(&content, job, TAIL_LINES);
    let body = render(&path, job, total, &lines);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// The newest of `path` and its dated rotations `<name>.<suffix>`.
pub async fn current_log_file(path: &Path) -> std::io::Result<PathBuf> {
    let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(path.to_path_buf());
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(path.to_path_buf()),
        Err(e) => return Err(e),
    };

    let rotated = format!("{base}.");
    let mut newest: Option<String> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // ISO dates sort lexically, and any dated name sorts after `base`.
        if (name == base || name.starts_with(&rotated))
            && newest.as_deref().is_none_or(|current| name > current)
        {
            newest = Some(name.to_string());
        }
    }
    Ok(newest.map_or_else(|| path.to_path_buf(), |name| dir.join(name)))
}

/// At most the last `max_bytes` of a file, starting on a line boundary.
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::new();
    file.take(max_bytes).read_to_end(&mut buf).await?;
    if start > 0 {
        // The first line is cut.
        let cut = buf.iter().position(|b| *b == b'\n').map_or(buf.len(), |i| i + 1);
        buf.drain(..cut);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Matching line count and the last `limit` matching lines.
pub fn tail<'a>(content: &'a str, job: Option<&str>, limit: usize) -> (usize, Vec<&'a str>) {
    let matched: Vec<&str> = content
        .lines()
        .filter(|line| match job {
            Some(name) => mentions_job(line, name),
            None => !line.contains("job="),
        })
        .collect();
    let total = matched.len();
    let start = total.saturating_sub(limit);
    (total, matched[start..].to_vec())
}

/// Whether `line` carries a `job=<name>` field for exactly this name.
fn mentions_job(line: &str, name: &str) -> bool {
    let needle = format!("job={name}");
    line.match_indices(&needle).any(|(at, _)| {
        let clean_start = !line[..at].ends_with(is_name_char);
        let clean_end = !line[at + needle.len()..].starts_with(is_name_char);
        clean_start && clean_end
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn render(path: &Path, job: Option<&str>, total: usize, lines: &[&str]) -> String {
    let mut out = match job {
        Some(name) => format!("relaygrid log viewer - job: {name}\n"),
        None => "relaygrid log viewer - system\n".to_string(),
    };
    out.push_str(&format!("Total matching lines: {total}\n"));
    out.push_str(&format!("Showing last {} lines\n", lines.len()));
    out.push_str(&format!("Log file: {}\n", path.display()));
    out.push_str(&"=".repeat(80));
    out.push_str("\n\n");
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}
