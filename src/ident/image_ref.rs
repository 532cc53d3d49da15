use super::{ManifestRef, RepoPath, DEFAULT_REGISTRY_HOST};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A fully parsed image reference: `host?/repo(:tag)?(@digest)?`
/// (spec.md §4.1).
///
/// If no host is given, or the first path component looks like neither
/// `host:port` nor contains a dot and isn't `localhost`, the host is
/// replaced by [`DEFAULT_REGISTRY_HOST`] and a single-component repo is
/// prefixed with `library/` — mirroring Docker's historical shorthand
/// (`nginx` -> `registry.example.org/library/nginx`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub host: String,
    pub repo: RepoPath,
    pub reference: Option<ManifestRef>,
}

fn looks_like_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::NameInvalid("image reference must not be empty".into()));
        }

        // Split off an @digest suffix first: it cannot contain ':' ambiguity
        // with a tag since digests always contain exactly one ':'.
        let (before_digest, digest_part) = match s.split_once('@') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };

        // The remaining string is `host?/repo(:tag)?`. We must find the
        // first `/` to decide whether a host is present, but a tag's `:`
        // must not be confused with a `host:port` `:`.
        let (maybe_host, rest) = match before_digest.split_once('/') {
            Some((h, r)) => (Some(h), r),
            None => (None, before_digest),
        };

        let (host, path_and_tag) = match maybe_host {
            Some(h) if looks_like_host(h) => (h.to_string(), rest.to_string()),
            Some(h) => (
                DEFAULT_REGISTRY_HOST.to_string(),
                format!("{}/{}", h, rest),
            ),
            None => (DEFAULT_REGISTRY_HOST.to_string(), rest.to_string()),
        };

        // Now split path_and_tag on the last ':' that isn't part of a `/`
        // separated port (there is none at this point, host already split
        // off) -- a tag is the suffix after the last ':'.
        let (repo_str, tag) = match path_and_tag.rsplit_once(':') {
            Some((r, t)) if !t.is_empty() && !t.contains('/') => (r.to_string(), Some(t.to_string())),
            _ => (path_and_tag.clone(), None),
        };

        let repo_str = if !repo_str.contains('/') {
            format!("library/{}", repo_str)
        } else {
            repo_str
        };

        let repo: RepoPath = repo_str.parse()?;

        let reference = if let Some(d) = digest_part {
            Some(ManifestRef::Digest(d.parse()?))
        } else if let Some(t) = tag {
            Some(ManifestRef::Tag(t))
        } else {
            None
        };

        Ok(ImageRef {
            host,
            repo,
            reference,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.repo)?;
        match &self.reference {
            Some(ManifestRef::Tag(t)) => write!(f, ":{}", t),
            Some(ManifestRef::Digest(d)) => write!(f, "@{}", d),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_default_host_and_library_prefix() {
        let r: ImageRef = "nginx".parse().unwrap();
        assert_eq!(r.host, DEFAULT_REGISTRY_HOST);
        assert_eq!(r.repo.as_str(), "library/nginx");
        assert!(r.reference.is_none());
    }

    #[test]
    fn bare_name_with_tag() {
        let r: ImageRef = "nginx:1.21".parse().unwrap();
        assert_eq!(r.repo.as_str(), "library/nginx");
        assert_eq!(r.reference.unwrap().as_tag(), Some("1.21"));
    }

    #[test]
    fn namespaced_name_without_host() {
        let r: ImageRef = "library/nginx:latest".parse().unwrap();
        assert_eq!(r.host, DEFAULT_REGISTRY_HOST);
        assert_eq!(r.repo.as_str(), "library/nginx");
    }

    #[test]
    fn explicit_host_with_port() {
        let r: ImageRef = "registry.local:5000/team/app:v1".parse().unwrap();
        assert_eq!(r.host, "registry.local:5000");
        assert_eq!(r.repo.as_str(), "team/app");
        assert_eq!(r.reference.unwrap().as_tag(), Some("v1"));
    }

    #[test]
    fn localhost_is_recognized_as_host() {
        let r: ImageRef = "localhost/app".parse().unwrap();
        assert_eq!(r.host, "localhost");
        assert_eq!(r.repo.as_str(), "library/app");
    }

    #[test]
    fn digest_reference() {
        let r: ImageRef = "quay.io/org/app@sha256:abcd1234".parse().unwrap();
        assert_eq!(r.host, "quay.io");
        assert_eq!(r.repo.as_str(), "org/app");
        assert!(r.reference.unwrap().as_digest().is_some());
    }

    #[test]
    fn round_trip_for_constructed_refs() {
        for s in [
            "quay.io/org/app:v1",
            "registry.local:5000/team/app@sha256:deadbeef",
            "localhost/a/b/c:latest",
        ] {
            let r: ImageRef = s.parse().unwrap();
            let r2: ImageRef = r.to_string().parse().unwrap();
            assert_eq!(r, r2);
        }
    }
}
