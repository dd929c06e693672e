use crate::catalog::Bitrate;

const MEDIA_EXTENSIONS: &[&str] = &["m4s", "mp4"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid segment path {path:?}: {reason}")]
    InvalidSegmentPath { path: String, reason: &'static str },
}

/// What a request path asks for, decided once at the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Manifest(String),
    Segment {
        bitrate: Bitrate,
        segment_index: i64,
    },
    /// Initialization segment of one representation, `<name>_<duration>s_init.<ext>`.
    Init { bitrate: Bitrate },
    StaticAsset(String),
}

impl RequestKind {
    /// Resolves a request path such as
    /// `media/BigBuckBunny/4sec/bunny_500000bps/BigBuckBunny_4s12.m4s`.
    pub fn resolve<S: AsRef<str>>(path: &str, manifests: &[S]) -> Result<Self, RequestError> {
        let path = path.split('?').next().unwrap_or_default();
        let path = path.strip_prefix('/').unwrap_or(path);

        if manifests.iter().any(|m| m.as_ref() == path) {
            return Ok(Self::Manifest(path.to_string()));
        }

        let is_media = path
            .rsplit_once('.')
            .is_some_and(|(_, ext)| MEDIA_EXTENSIONS.contains(&ext));
        if !is_media {
            return Ok(Self::StaticAsset(path.to_string()));
        }

        let invalid = |reason| RequestError::InvalidSegmentPath {
            path: path.to_string(),
            reason,
        };

        let mut parts = path.rsplit('/');
        let file = parts.next().ok_or_else(|| invalid("missing file name"))?;
        let dir = parts
            .next()
            .ok_or_else(|| invalid("missing representation directory"))?;

        let bitrate = dir
            .rsplit('_')
            .next()
            .and_then(|s| s.strip_suffix("bps"))
            .and_then(|s| s.parse::<Bitrate>().ok())
            .ok_or_else(|| invalid("directory does not end in _<bitrate>bps"))?;

        let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
        if stem.ends_with("_init") {
            return Ok(Self::Init { bitrate });
        }

        // <name>_<duration>s<index>.<ext>
        let segment_index = stem
            .rsplit('_')
            .next()
            .and_then(|s| s.split_once('s'))
            .map(|(_, index)| index)
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| invalid("file name does not end in _<duration>s<index>"))?;

        Ok(Self::Segment {
            bitrate,
            segment_index,
        })
    }
}
