//! `Upload-Metadata` parsing.
//!
//! The header is a comma separated list of `key value` pairs where the value
//! is base64. Commas and spaces cannot be escaped, so a raw value containing
//! either corrupts the pair it belongs to.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;

pub const FILENAME_KEY: &str = "filename";

#[derive(Debug, PartialEq, Eq)]
pub enum MetadataError {
    MissingFilename,
    InvalidEncoding,
    EmptyFilename,
}

/// Splits the header into a key/value map. Later duplicates win.
pub fn parse_metadata(value: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let parts: Vec<&str> = pair.split_whitespace().collect();
        let value = if parts.len() == 2 { parts[1] } else { "" };
        metadata.insert(parts[0].to_string(), value.to_string());
    }
    metadata
}

/// Returns the base64-decoded destination path.
pub fn decode_filename(metadata: &HashMap<String, String>) -> Result<String, MetadataError> {
    let encoded = metadata
        .get(FILENAME_KEY)
        .ok_or(MetadataError::MissingFilename)?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| MetadataError::InvalidEncoding)?;
    let filename = String::from_utf8(bytes).map_err(|_| MetadataError::InvalidEncoding)?;
    if filename.trim().is_empty() {
        return Err(MetadataError::EmptyFilename);
    }
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_bare_keys() {
        let metadata = parse_metadata("filename ZGlyL2EudHh0,is_confidential, type dGV4dA==");
        assert_eq!(metadata.get("filename").map(String::as_str), Some("ZGlyL2EudHh0"));
        assert_eq!(metadata.get("is_confidential").map(String::as_str), Some(""));
        assert_eq!(metadata.get("type").map(String::as_str), Some("dGV4dA=="));
    }

    #[test]
    fn last_duplicate_wins() {
        let metadata = parse_metadata("filename YQ==,filename Yg==");
        assert_eq!(metadata.get("filename").map(String::as_str), Some("Yg=="));
    }

    #[test]
    fn pair_with_extra_tokens_has_empty_value() {
        let metadata = parse_metadata("filename a b");
        assert_eq!(metadata.get("filename").map(String::as_str), Some(""));
    }

    #[test]
    fn decodes_filename() {
        let metadata = parse_metadata("filename ZGlyL2EudHh0");
        assert_eq!(decode_filename(&metadata), Ok("dir/a.txt".to_string()));
    }

    #[test]
    fn rejects_missing_or_invalid_filename() {
        assert_eq!(
            decode_filename(&parse_metadata("")),
            Err(MetadataError::MissingFilename)
        );
        assert_eq!(
            decode_filename(&parse_metadata("filename !!notbase64")),
            Err(MetadataError::InvalidEncoding)
        );
        assert_eq!(
            decode_filename(&parse_metadata("filename")),
            Err(MetadataError::EmptyFilename)
        );
    }
}
