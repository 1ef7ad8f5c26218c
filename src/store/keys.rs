//! Object-store key layout. Stable: the worker and CDN both address these
//! paths, so changes here are wire-format changes.

/// Prefix under which all source uploads live.
pub const SOURCES_PREFIX: &str = "sources/";

/// `sources/<video_id>/original.<ext>`
pub fn source_key(video_id: &str, ext: &str) -> String {
    format!("sources/{}/original.{}", video_id, ext)
}

/// `processed/<video_id>/`
pub fn processed_prefix(video_id: &str) -> String {
    format!("processed/{}/", video_id)
}

/// `processed/<video_id>/manifest.json`
pub fn manifest_key(video_id: &str) -> String {
    format!("processed/{}/manifest.json", video_id)
}

/// Extension taken from the uploaded filename, defaulting to `bin` when the
/// name carries none.
pub fn extension_of(filename: &str) -> &str {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or("bin")
}

/// Canonical source URI: `s3://<bucket>/<key>`.
pub fn source_url(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Split a canonical `s3://bucket/key` URI back into (bucket, key).
pub fn parse_source_url(url: &str) -> Option<(&str, &str)> {
    url.strip_prefix("s3://")?.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(source_key("abc", "mp4"), "sources/abc/original.mp4");
        assert_eq!(manifest_key("abc"), "processed/abc/manifest.json");
        assert_eq!(processed_prefix("abc"), "processed/abc/");
    }

    #[test]
    fn extension_extraction() {
        assert_eq!(extension_of("movie.mp4"), "mp4");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("noext"), "bin");
        assert_eq!(extension_of("dot."), "bin");
        assert_eq!(extension_of("weird.../../x"), "bin");
    }

    #[test]
    fn source_url_round_trip() {
        let url = source_url("media", "sources/abc/original.mp4");
        assert_eq!(
            parse_source_url(&url),
            Some(("media", "sources/abc/original.mp4"))
        );
        assert_eq!(parse_source_url("http://x/y"), None);
    }
}
