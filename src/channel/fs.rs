//! Filesystem channels: `fsread1`, `fsreplace1` and `fslist1`.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{ChannelInput, ChannelIo};
use crate::json as opt;

const READ_BLOCK: usize = 16 * 1024;

fn path_option(io: &ChannelIo) -> Result<PathBuf, &'static str> {
    match opt::get_str(io.options(), "path") {
        Ok(Some(path)) if !path.is_empty() => Ok(PathBuf::from(path)),
        Ok(_) => Err("protocol-error"),
        Err(_) => Err("protocol-error"),
    }
}

/// A transaction tag for a file, stable while the file is unchanged.
fn file_tag(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("1:{}-{}", meta.len(), mtime)
}

/// `fsread1`: stream a file's contents, then close with its tag.
pub async fn read(mut io: ChannelIo) {
    let path = match path_option(&io) {
        Ok(path) => path,
        Err(problem) => return io.close(Some(problem)).await,
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // A missing file is a successful empty read with no tag.
            let _ = io.ready().await;
            let _ = io.send_done().await;
            let mut extra = Map::new();
            extra.insert("tag".into(), Value::String("-".into()));
            return io.close_with(None, extra).await;
        }
        Err(err) => {
            warn!("fsread {}: {}", path.display(), err);
            return io.close(Some("not-found")).await;
        }
    };

    if io.ready().await.is_err() {
        return io.close(Some("terminated")).await;
    }

    let tag = match file.metadata().await {
        Ok(meta) => file_tag(&meta),
        Err(_) => "-".to_string(),
    };

    let mut buf = BytesMut::with_capacity(READ_BLOCK);
    loop {
        buf.clear();
        match file.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if io.send_data(buf.clone().freeze()).await.is_err() {
                    return io.close(Some("terminated")).await;
                }
            }
            Err(err) => {
                warn!("fsread {}: {}", path.display(), err);
                return io.close(Some("internal-error")).await;
            }
        }
    }

    let _ = io.send_done().await;
    let mut extra = Map::new();
    extra.insert("tag".into(), Value::String(tag));
    io.close_with(None, extra).await;
}

/// `fsreplace1`: buffer the new contents, write them to a sibling
/// temporary file on `done`, and rename into place.
pub async fn replace(mut io: ChannelIo) {
    let path = match path_option(&io) {
        Ok(path) => path,
        Err(problem) => return io.close(Some(problem)).await,
    };

    if io.ready().await.is_err() {
        return io.close(Some("terminated")).await;
    }

    let mut content = BytesMut::new();
    let mut have_done = false;

    while let Some(input) = io.next().await {
        match input {
            ChannelInput::Data(bytes) => content.extend_from_slice(&bytes),
            ChannelInput::Done => {
                have_done = true;
                break;
            }
            ChannelInput::Control(message) => {
                debug!("fsreplace: ignoring control {}", message.command);
            }
        }
    }

    if !have_done {
        return io.close(None).await;
    }

    match write_replacement(&path, &content).await {
        Ok(tag) => {
            let _ = io.send_done().await;
            let mut extra = Map::new();
            extra.insert("tag".into(), Value::String(tag));
            io.close_with(None, extra).await;
        }
        Err(err) => {
            warn!("fsreplace {}: {}", path.display(), err);
            let problem = match err.kind() {
                std::io::ErrorKind::PermissionDenied => "access-denied",
                _ => "internal-error",
            };
            io.close(Some(problem)).await;
        }
    }
}

async fn write_replacement(path: &Path, content: &[u8]) -> std::io::Result<String> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad path"))?;

    let tmp = directory.join(format!(
        ".{}.tmp{}",
        name.to_string_lossy(),
        std::process::id()
    ));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
        result?;
    }

    let meta = tokio::fs::metadata(path).await?;
    Ok(file_tag(&meta))
}

/// `fslist1`: one `present` event per directory entry, then done.
pub async fn list(mut io: ChannelIo) {
    let path = match path_option(&io) {
        Ok(path) => path,
        Err(problem) => return io.close(Some(problem)).await,
    };

    let mut entries = match tokio::fs::read_dir(&path).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!("fslist {}: {}", path.display(), err);
            return io.close(Some("not-found")).await;
        }
    };

    if io.ready().await.is_err() {
        return io.close(Some("terminated")).await;
    }

    while let Ok(Some(entry)) = entries.next_entry().await {
        let kind = match entry.file_type().await {
            Ok(t) if t.is_dir() => "directory",
            Ok(t) if t.is_symlink() => "link",
            Ok(t) if t.is_file() => "file",
            _ => "special",
        };
        let event = json!({
            "event": "present",
            "path": entry.file_name().to_string_lossy(),
            "type": kind,
        });
        let frame = Bytes::from(serde_json::to_vec(&event).expect("event serializes"));
        if io.send_data(frame).await.is_err() {
            return io.close(Some("terminated")).await;
        }
    }

    let _ = io.send_done().await;
    io.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"contents").unwrap();

        let a = file_tag(&std::fs::metadata(&path).unwrap());
        let b = file_tag(&std::fs::metadata(&path).unwrap());
        assert_eq!(a, b);
        assert!(a.starts_with("1:8-"));
    }
}
