//! Maps a (tfs_url, tfs_path) pair recovered from a binding to a
//! configured `RemoteDescriptor`, with three-tier fallback plus a
//! synthetic placeholder.

use crate::types::RemoteDescriptor;

pub struct RemoteResolver<'a> {
    remotes: &'a [RemoteDescriptor],
}

impl<'a> RemoteResolver<'a> {
    pub fn new(remotes: &'a [RemoteDescriptor]) -> Self {
        RemoteResolver { remotes }
    }

    /// Resolves `(tfs_url, tfs_path)` to one configured remote. Always
    /// returns something — worst case a derived placeholder — so
    /// callers can report a meaningful error rather than handle an
    /// `Option`.
    pub fn resolve(&self, tfs_url: &str, tfs_path: &str) -> RemoteDescriptor {
        if let Some(exact) = self.exact_match(tfs_url, tfs_path) {
            return exact;
        }

        if !tfs_path.is_empty() {
            if let Some(path_only) = self.path_only_match(tfs_path) {
                log::warn!(
                    "remote '{}' matches TFVC path '{}' but its URL ('{}') differs from the binding's URL ('{}')",
                    path_only.id,
                    tfs_path,
                    path_only.tfs_url,
                    tfs_url,
                );
                return path_only;
            }
        }

        if self.remotes.len() == 1 {
            let sole = &self.remotes[0];
            log::warn!(
                "falling back to the sole configured remote '{}' (url '{}', path '{}') for a binding with url '{}', path '{}'",
                sole.id,
                sole.tfs_url,
                sole.tfs_repository_path,
                tfs_url,
                tfs_path,
            );
            return sole.clone();
        }

        RemoteDescriptor::derived_placeholder(tfs_url, tfs_path)
    }

    fn exact_match(&self, tfs_url: &str, tfs_path: &str) -> Option<RemoteDescriptor> {
        let mut matches: Vec<&RemoteDescriptor> = self
            .remotes
            .iter()
            .filter(|r| {
                let url_matches = r.tfs_url.eq_ignore_ascii_case(tfs_url)
                    || r.legacy_urls.iter().any(|u| u.eq_ignore_ascii_case(tfs_url));
                url_matches && r.tfs_repository_path.eq_ignore_ascii_case(tfs_path)
            })
            .collect();

        if matches.is_empty() {
            return None;
        }

        // Ties are broken by sorting by remote id, for determinism
        // rather than relying on unspecified iteration order.
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        if matches.len() > 1 {
            log::warn!(
                "{} remotes exactly match url '{}' path '{}'; choosing '{}'",
                matches.len(),
                tfs_url,
                tfs_path,
                matches[0].id,
            );
        }
        Some(matches[0].clone())
    }

    fn path_only_match(&self, tfs_path: &str) -> Option<RemoteDescriptor> {
        let mut matches: Vec<&RemoteDescriptor> = self
            .remotes
            .iter()
            .filter(|r| r.tfs_repository_path.eq_ignore_ascii_case(tfs_path))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|r| (*r).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: &str, url: &str, path: &str) -> RemoteDescriptor {
        RemoteDescriptor::new(id, url, path)
    }

    #[test]
    fn exact_match_wins() {
        let remotes = vec![
            remote("default", "https://tfs.example/tfs", "$/Proj/Main"),
            remote("other", "https://elsewhere/tfs", "$/Other"),
        ];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://tfs.example/tfs", "$/Proj/Main");
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let remotes = vec![remote("default", "https://TFS.example/tfs", "$/Proj/Main")];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://tfs.example/TFS", "$/proj/main");
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn exact_match_checks_legacy_urls() {
        let mut r = remote("default", "https://new.example/tfs", "$/Proj/Main");
        r.legacy_urls.push("https://old.example/tfs".to_string());
        let remotes = vec![r];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://old.example/tfs", "$/Proj/Main");
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn multiple_exact_matches_sorted_by_id() {
        let remotes = vec![
            remote("zzz", "https://tfs.example/tfs", "$/Proj/Main"),
            remote("aaa", "https://tfs.example/tfs", "$/Proj/Main"),
        ];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://tfs.example/tfs", "$/Proj/Main");
        assert_eq!(resolved.id, "aaa");
    }

    #[test]
    fn path_only_fallback_on_url_mismatch() {
        let remotes = vec![remote("default", "https://new.example/tfs", "$/Proj/Main")];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://old.example/tfs", "$/Proj/Main");
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn sole_remote_fallback_on_total_mismatch() {
        let remotes = vec![remote("default", "https://new.example/tfs", "$/Other/Path")];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://old.example/tfs", "$/Proj/Main");
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn derived_placeholder_when_multiple_remotes_mismatch() {
        let remotes = vec![
            remote("a", "https://a.example/tfs", "$/A"),
            remote("b", "https://b.example/tfs", "$/B"),
        ];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://c.example/tfs", "$/C");
        assert!(!resolved.is_resolved());
        assert_eq!(resolved.tfs_url, "https://c.example/tfs");
        assert_eq!(resolved.tfs_repository_path, "$/C");
    }

    #[test]
    fn derived_placeholder_when_no_remotes_configured() {
        let remotes: Vec<RemoteDescriptor> = vec![];
        let resolver = RemoteResolver::new(&remotes);
        let resolved = resolver.resolve("https://c.example/tfs", "$/C");
        assert!(!resolved.is_resolved());
    }
}
