use sha1::{Digest, Sha1};

const COORDS_PREFIX_CHARS: usize = 256;
const TOKEN_LEN: usize = 12;

/// Disambiguation token for one row: first 12 hex characters of
/// `sha1("<feature id>|<coords prefix>")`. The coords input must be the
/// compact geometry serialization BEFORE any output escaping is applied,
/// otherwise the token no longer matches the one embedded in remote
/// descriptions.
pub fn compute_token(feature_id: &str, coords_json: &str) -> String {
    let prefix: String = coords_json.chars().take(COORDS_PREFIX_CHARS).collect();
    let mut hasher = Sha1::new();
    hasher.update(feature_id.as_bytes());
    hasher.update(b"|");
    hasher.update(prefix.as_bytes());
    let mut token = hex::encode(hasher.finalize());
    token.truncate(TOKEN_LEN);
    token
}

pub fn ext_tag(token: &str) -> String {
    format!("[EXT:{token}]")
}

pub fn matches_token(description: &str, token: &str) -> bool {
    description.contains(&ext_tag(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_deterministic() {
        let coords = "[[[1.0,2.0],[3.0,4.0]]]";
        assert_eq!(compute_token("42", coords), compute_token("42", coords));
        assert_eq!(compute_token("42", coords), "c37740af2370");
        assert_eq!(compute_token("42", coords).len(), 12);
    }

    #[test]
    fn token_known_values() {
        assert_eq!(
            compute_token("tx.7", "[[[-68.1,-16.5],[-68.2,-16.6]]]"),
            "ce3ad85c9cb3"
        );
        assert_eq!(compute_token("1", ""), "dd89a2b89c62");
    }

    #[test]
    fn token_uses_coords_prefix_only() {
        let long = "a".repeat(300);
        let capped = "a".repeat(256);
        assert_eq!(compute_token("9", &long), compute_token("9", &capped));
        assert_eq!(compute_token("9", &long), "99568b9a59e5");
    }

    #[test]
    fn tag_matching() {
        let token = compute_token("42", "[[[1.0,2.0],[3.0,4.0]]]");
        let description = format!("Linea del SIN {}", ext_tag(&token));
        assert!(matches_token(&description, &token));
        assert!(!matches_token("Linea del SIN [EXT:000000000000]", &token));
        assert!(!matches_token("", &token));
    }
}
