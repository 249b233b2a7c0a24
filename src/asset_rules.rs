//! Asset Classification Module
//!
//! Maps request paths to caching policy. Rules are plain data evaluated in table
//! order; the first rule whose directory segment or file extension matches wins.
//!
//! | Priority | Asset | Directory | Key scope | 2xx TTL | Tag |
//! |---|---|---|---|---|---|
//! | 1 | video | `Video` | path | 1 year | `signed-video` |
//! | 2 | image | `Images` | path + query | 1 hour | `signed-image` |
//! | 3 | frontEnd | - | path + query | 1 hour | `signed-frontEnd` |
//! | 4 | audio | `Audio` | path | 1 year | `signed-audio` |
//! | 5 | directPlay | `Download` | path | 1 year | `signed-directPlay` |
//! | 6 | manifest | - | path | 3 seconds | `signed-manifest` |

use serde::{Deserialize, Serialize};
use std::fmt;

/// One year in seconds (365.2425 days)
pub const ONE_YEAR_SECS: u32 = 31_556_952;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetKind {
    Video,
    Image,
    FrontEnd,
    Audio,
    DirectPlay,
    Manifest,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Image => "image",
            AssetKind::FrontEnd => "frontEnd",
            AssetKind::Audio => "audio",
            AssetKind::DirectPlay => "directPlay",
            AssetKind::Manifest => "manifest",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether requests differing only by query string share a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyScope {
    Path,
    PathAndQuery,
}

/// HTTP status code hundreds-group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
}

impl StatusClass {
    /// Class of a status code, `None` outside 100-599
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(StatusClass::Informational),
            200..=299 => Some(StatusClass::Success),
            300..=399 => Some(StatusClass::Redirection),
            400..=499 => Some(StatusClass::ClientError),
            500..=599 => Some(StatusClass::ServerError),
            _ => None,
        }
    }

    /// Status range label, e.g. `"200-299"`
    pub fn range(&self) -> &'static str {
        match self {
            StatusClass::Informational => "100-199",
            StatusClass::Success => "200-299",
            StatusClass::Redirection => "300-399",
            StatusClass::ClientError => "400-499",
            StatusClass::ServerError => "500-599",
        }
    }

    pub const ALL: [StatusClass; 5] = [
        StatusClass::Informational,
        StatusClass::Success,
        StatusClass::Redirection,
        StatusClass::ClientError,
        StatusClass::ServerError,
    ];
}

/// TTL in seconds for each status class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlByStatus {
    pub info: u32,
    pub ok: u32,
    pub redirects: u32,
    pub client_error: u32,
    pub server_error: u32,
}

impl TtlByStatus {
    pub fn for_class(&self, class: StatusClass) -> u32 {
        match class {
            StatusClass::Informational => self.info,
            StatusClass::Success => self.ok,
            StatusClass::Redirection => self.redirects,
            StatusClass::ClientError => self.client_error,
            StatusClass::ServerError => self.server_error,
        }
    }

    /// TTL for a concrete status code, `None` outside 100-599
    pub fn for_status(&self, code: u16) -> Option<u32> {
        StatusClass::from_code(code).map(|class| self.for_class(class))
    }
}

/// A path pattern and the caching policy applied to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRule {
    pub asset: AssetKind,
    /// Path segment that marks the category, matched exactly
    pub directory: Option<String>,
    /// File extensions without the leading dot
    pub extensions: Vec<String>,
    pub key_scope: CacheKeyScope,
    pub ttl: TtlByStatus,
    pub cache_tag: String,
}

impl AssetRule {
    pub fn new(
        asset: AssetKind,
        directory: Option<&str>,
        extensions: &[&str],
        key_scope: CacheKeyScope,
        ttl: TtlByStatus,
    ) -> Self {
        Self {
            asset,
            directory: directory.map(str::to_string),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            key_scope,
            ttl,
            cache_tag: format!("signed-{}", asset.as_str()),
        }
    }

    fn matches(&self, path: &str, case_sensitive_extensions: bool) -> bool {
        if let Some(directory) = &self.directory {
            if path.split('/').any(|segment| segment == directory) {
                return true;
            }
        }

        match file_extension(path) {
            Some(ext) if case_sensitive_extensions => self.extensions.iter().any(|e| e == ext),
            Some(ext) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// Extension of the final path segment
fn file_extension(path: &str) -> Option<&str> {
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

/// Ordered rule list; first match wins
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<AssetRule>,
    case_sensitive_extensions: bool,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(default_rules(), false)
    }
}

impl RuleTable {
    pub fn new(rules: Vec<AssetRule>, case_sensitive_extensions: bool) -> Self {
        Self {
            rules,
            case_sensitive_extensions,
        }
    }

    /// Default table with the given extension case sensitivity
    pub fn with_case_sensitive_extensions(case_sensitive_extensions: bool) -> Self {
        Self::new(default_rules(), case_sensitive_extensions)
    }

    /// Resolve the caching policy for a request path (query string excluded)
    pub fn classify(&self, path: &str) -> Option<&AssetRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(path, self.case_sensitive_extensions))
    }

    pub fn rules(&self) -> &[AssetRule] {
        &self.rules
    }
}

fn default_rules() -> Vec<AssetRule> {
    let long_lived = TtlByStatus {
        info: 0,
        ok: ONE_YEAR_SECS,
        redirects: 30,
        client_error: 10,
        server_error: 0,
    };
    let hourly = TtlByStatus {
        ok: 3600,
        ..long_lived
    };

    vec![
        AssetRule::new(
            AssetKind::Video,
            Some("Video"),
            &[
                "m4s", "mp4", "ts", "avi", "mpeg", "mpg", "mkv", "bin", "webm", "vob", "flv",
                "m2ts", "mts", "3gp", "m4v", "wmv", "qt",
            ],
            CacheKeyScope::Path,
            long_lived,
        ),
        AssetRule::new(
            AssetKind::Image,
            Some("Images"),
            &[
                "jpg", "jpeg", "png", "bmp", "pict", "tif", "tiff", "webp", "gif", "heif", "exif",
                "bat", "bpg", "ppm", "pgn", "pbm", "pnm",
            ],
            CacheKeyScope::PathAndQuery,
            hourly,
        ),
        AssetRule::new(
            AssetKind::FrontEnd,
            None,
            &["css", "js"],
            CacheKeyScope::PathAndQuery,
            hourly,
        ),
        AssetRule::new(
            AssetKind::Audio,
            Some("Audio"),
            &[
                "flac", "aac", "mp3", "alac", "aiff", "wav", "ogg", "opus", "ape", "wma", "3gp",
            ],
            CacheKeyScope::Path,
            long_lived,
        ),
        AssetRule::new(
            AssetKind::DirectPlay,
            Some("Download"),
            &[],
            CacheKeyScope::Path,
            long_lived,
        ),
        AssetRule::new(
            AssetKind::Manifest,
            None,
            &["m3u8", "mpd"],
            CacheKeyScope::Path,
            TtlByStatus {
                info: 0,
                ok: 3,
                redirects: 2,
                client_error: 1,
                server_error: 0,
            },
        ),
    ]
}
