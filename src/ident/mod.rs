//! Identifier & reference grammar (spec.md §4.1)
//!
//! Parsers and validators for account names, repository paths, manifest
//! references (tag or digest), and full image references. Parsing is
//! total: every parser returns a `Result` with a structured error
//! rather than panicking on malformed input.

mod account_name;
mod digest;
mod image_ref;
mod manifest_ref;
mod repo_path;

pub use account_name::AccountName;
pub use digest::Digest;
pub use image_ref::ImageRef;
pub use manifest_ref::ManifestRef;
pub use repo_path::RepoPath;

/// The default registry hostname substituted for image references that
/// name no host at all (Docker Hub's historical `docker.io`, generalized
/// to this deployment's own default).
pub const DEFAULT_REGISTRY_HOST: &str = "registry.example.org";

pub(crate) fn is_grammar_component(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut prev_was_separator = true; // leading separator not allowed
    for c in s.chars() {
        let is_alnum = c.is_ascii_lowercase() || c.is_ascii_digit();
        let is_separator = matches!(c, '.' | '_' | '-');
        if is_alnum {
            prev_was_separator = false;
        } else if is_separator {
            if prev_was_separator {
                return false; // no doubled / leading separators
            }
            prev_was_separator = true;
        } else {
            return false;
        }
    }
    !prev_was_separator // no trailing separator
}
