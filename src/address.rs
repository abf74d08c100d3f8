use crate::error::FloodError;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// The identity of a staged file, independent of its current stage.
///
/// The first path segment below a stage root is the profile, the second is
/// the bucket, and everything after is the object key (which may itself be a
/// nested relative path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub profile: String,
    pub bucket: String,
    pub key: String,
}

impl RemoteAddress {
    pub fn new(
        profile: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            profile: profile.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Maps an absolute path under `stage_root` back to its identity.
    ///
    /// Fails with [`FloodError::MalformedPath`] when fewer than three
    /// segments are present below the root; the caller must log and drop
    /// such paths instead of processing them further.
    pub fn from_staged_path(stage_root: &Path, path: &Path) -> Result<Self, FloodError> {
        let relative = path
            .strip_prefix(stage_root)
            .map_err(|_| FloodError::MalformedPath(path.to_path_buf()))?;

        let mut segments = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned());

        let profile = segments.next();
        let bucket = segments.next();
        let key: Vec<String> = segments.collect();

        match (profile, bucket, key.is_empty()) {
            (Some(profile), Some(bucket), false) => {
                Ok(Self::new(profile, bucket, key.join("/")))
            }
            _ => Err(FloodError::MalformedPath(path.to_path_buf())),
        }
    }

    /// Parses a copy-mode destination of the form
    /// `s3://{profile}/{bucket}/{key...}`.
    ///
    /// Fewer than three top-level segments is a fatal input error.
    pub fn parse_uri(uri: &str) -> Result<Self, FloodError> {
        let malformed = || FloodError::Config(format!("invalid destination '{uri}', expected s3://profile/bucket/key"));

        let url = Url::parse(uri).map_err(|_| malformed())?;
        if url.scheme() != "s3" {
            return Err(malformed());
        }

        let profile = url.host_str().filter(|h| !h.is_empty()).ok_or_else(malformed)?;
        let mut segments = url.path_segments().ok_or_else(malformed)?;
        let bucket = segments.next().filter(|b| !b.is_empty()).ok_or_else(malformed)?;
        let key: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
        if key.is_empty() {
            return Err(malformed());
        }

        Ok(Self::new(profile, bucket, key.join("/")))
    }

    /// The `profile/bucket/key` path suffix shared by every stage root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.profile)
            .join(&self.bucket)
            .join(&self.key)
    }

    /// Identity joined under a deeper key, used when staging a directory
    /// tree below the destination key.
    pub fn join_key(&self, suffix: &str) -> Self {
        Self::new(
            &self.profile,
            &self.bucket,
            format!("{}/{}", self.key, suffix),
        )
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.profile, self.bucket, self.key)
    }
}
