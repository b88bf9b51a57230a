use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::errors::ParserError;

/// Identifies the message an image was attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaKey {
    pub channel: String,
    pub message_id: i64,
}

/// Recovers `(channel, message_id)` from `<...>/<channel>/<message_id>.<ext>`.
pub fn parse_media_path(path: &Path) -> Result<MediaKey, ParserError> {
    let fail = |reason: &str| ParserError::MediaPath {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| fail("file name is missing or not UTF-8"))?;
    let message_id: i64 = stem
        .parse()
        .map_err(|_| fail("file stem is not an integer message id"))?;

    let channel = path
        .parent()
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| fail("image has no parent directory naming its channel"))?;

    Ok(MediaKey {
        channel: channel.to_string(),
        message_id,
    })
}

pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

pub fn media_file_name(message_id: i64) -> String {
    format!("{message_id}.jpg")
}

/// Normalised spelling of a path used to match manifest entries against the
/// files found on disk: `/`-separated, without `.` components.
pub fn path_key(path: &Path) -> String {
    let mut key = String::new();
    for component in path.components() {
        let part = match component {
            Component::CurDir => continue,
            Component::RootDir => {
                key.push('/');
                continue;
            }
            Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy(),
            Component::ParentDir => "..".into(),
            Component::Normal(part) => part.to_string_lossy(),
        };
        if !key.is_empty() && !key.ends_with('/') {
            key.push('/');
        }
        key.push_str(&part);
    }
    key
}
