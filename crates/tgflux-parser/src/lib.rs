pub mod channel_file;
pub mod errors;
pub mod export;
pub mod manifest;
pub mod media;
pub mod model;

pub use channel_file::{
    channel_name_from_file, channel_name_from_identifier, parse_channel_file, parse_timestamp,
    ParsedChannelFile, RecordIssue,
};
pub use errors::ParserError;
pub use export::{parse_desktop_export, ExportedMessage};
pub use manifest::{parse_manifest, ManifestIssue, MediaManifest, MediaManifestEntry};
pub use media::{has_image_extension, media_file_name, parse_media_path, path_key, MediaKey};
pub use model::{ChannelFileRecord, ChannelName, RawMessage};
