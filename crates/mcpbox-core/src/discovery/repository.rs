//! Repository reference parsing

use std::fmt;

use regex::Regex;

use crate::errors::DiscoveryError;

/// A repository reference reduced to host, owner and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    /// Accepts `http(s)://host/owner/repo[.git][/...]` and
    /// `git@host:owner/repo[.git]`.
    pub fn parse(url: &str) -> Result<Self, DiscoveryError> {
        let invalid = || DiscoveryError::InvalidRepository(url.to_string());
        let trimmed = url.trim();

        let (host, path) = if let Some(rest) = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
        {
            rest.split_once('/').ok_or_else(invalid)?
        } else if let Some(rest) = trimmed.strip_prefix("git@") {
            rest.split_once(':').ok_or_else(invalid)?
        } else {
            return Err(invalid());
        };

        // Drop credentials and port from the authority
        let host = host.rsplit('@').next().unwrap_or(host);
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        if host.is_empty() || !host.contains('.') && host != "localhost" {
            return Err(invalid());
        }

        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let owner = segments.next().ok_or_else(invalid)?;
        let name = segments.next().ok_or_else(invalid)?;
        let name = name.strip_suffix(".git").unwrap_or(name);

        let segment = Regex::new(r"^[A-Za-z0-9_.-]+$").map_err(|_| invalid())?;
        if !segment.is_match(owner) || !segment.is_match(name) || name == "." || name == ".." {
            return Err(invalid());
        }

        Ok(Self {
            host,
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn is_github(&self) -> bool {
        self.host == "github.com" || self.host == "www.github.com"
    }

    /// `owner/name`
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Canonical https clone URL, used as the discovery cache key.
    pub fn canonical_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_urls() {
        let repo = RepositoryRef::parse("https://github.com/githejie/mcp-server-calculator").unwrap();
        assert_eq!(repo.host, "github.com");
        assert_eq!(repo.owner, "githejie");
        assert_eq!(repo.name, "mcp-server-calculator");
        assert!(repo.is_github());
    }

    #[test]
    fn strips_git_suffix_and_trailing_path() {
        let repo = RepositoryRef::parse("https://github.com/owner/tool.git").unwrap();
        assert_eq!(repo.name, "tool");

        let repo = RepositoryRef::parse("https://github.com/owner/tool/tree/main/src").unwrap();
        assert_eq!(repo.slug(), "owner/tool");
    }

    #[test]
    fn parses_scp_style_urls() {
        let repo = RepositoryRef::parse("git@gitlab.com:group/server.git").unwrap();
        assert_eq!(repo.host, "gitlab.com");
        assert_eq!(repo.slug(), "group/server");
        assert!(!repo.is_github());
    }

    #[test]
    fn canonical_url_normalises_variants() {
        let a = RepositoryRef::parse("https://GitHub.com/owner/tool.git").unwrap();
        let b = RepositoryRef::parse("git@github.com:owner/tool").unwrap();
        assert_eq!(a.canonical_url(), b.canonical_url());
    }

    #[test]
    fn rejects_malformed_references() {
        for url in [
            "",
            "not a url",
            "ftp://github.com/owner/repo",
            "https://github.com/owner",
            "https://github.com/",
            "https:///owner/repo",
            "git@github.com/owner/repo",
            "https://github.com/own er/repo",
        ] {
            assert!(
                matches!(RepositoryRef::parse(url), Err(DiscoveryError::InvalidRepository(_))),
                "{url:?} should be rejected"
            );
        }
    }
}
