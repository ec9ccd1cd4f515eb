//! Cross-archive URL resolution: rewrite an external link an
//! archive's HTML points at (`en.wikipedia.org/wiki/Foo`) into an in-archive
//! entry, if one is installed. Grounded verbatim in `_build_domain_zim_map`
//! / `_resolve_url_to_zim` from `zimi.py`.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;

use crate::pool::{ArchivePool, OpenFn};
use crate::reader::ZimReader;
use crate::registry::{ArchiveId, ArchiveRegistry};

const SPECULATIVE_TLDS: &[&str] = &["com", "org", "io", "net"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainFamily {
    Wikimedia,
    StackExchange,
    StripWikiPrefix, // rationalwiki, appropedia, explainxkcd
    WikiHow,
    General,
}

fn classify_domain(domain: &str) -> DomainFamily {
    if domain.contains("wikihow") {
        DomainFamily::WikiHow
    } else if domain.contains("stackexchange")
        || matches!(domain, "stackoverflow.com" | "askubuntu.com" | "superuser.com" | "serverfault.com")
    {
        DomainFamily::StackExchange
    } else if domain.contains("rationalwiki") || domain.contains("appropedia") || domain.contains("explainxkcd") {
        DomainFamily::StripWikiPrefix
    } else if domain.contains("wiki") {
        DomainFamily::Wikimedia
    } else {
        DomainFamily::General
    }
}

/// Leading `<domain>_` segment of a ZIM filename, e.g.
/// `wikipedia.org_en_all_nopic_2024-07.zim` → `wikipedia.org`.
fn domain_from_filename(filename: &str) -> Option<String> {
    let stem = filename.strip_suffix(".zim").unwrap_or(filename);
    let first = stem.split('_').next()?;
    if first.contains('.') {
        Some(first.to_lowercase())
    } else {
        None
    }
}

/// Best-effort host extraction from a `Source` metadata URL, without pulling
/// in a full URL-parsing crate for a single field.
fn host_from_source(source: &str) -> Option<String> {
    let without_scheme = source.split("://").nth(1).unwrap_or(source);
    let host = without_scheme.split('/').next()?;
    if host.is_empty() || !host.contains('.') {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn mobile_variant(domain: &str) -> Option<String> {
    if domain.starts_with("en.wiki") || domain.contains("wiki") {
        Some(domain.replacen("en.", "en.m.", 1))
    } else {
        Some(format!("m.{domain}"))
    }
}

/// Maps a hostname to the archive that serves it, plus a cross-archive
/// reference counter for observability.
pub struct DomainMap {
    domains: HashMap<String, ArchiveId>,
    references: DashMap<(ArchiveId, ArchiveId), u64>,
}

impl DomainMap {
    /// Build the domain map via the three auto-discovery methods, in order:
    /// filename segment, `Source` metadata host, speculative TLD guesses for
    /// archives the first two methods left unmapped.
    pub fn build(registry: &ArchiveRegistry, sources: &HashMap<ArchiveId, String>) -> Self {
        let mut domains = HashMap::new();

        for (id, info) in registry.iter() {
            let filename = info.path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
            if let Some(domain) = domain_from_filename(&filename) {
                domains.entry(domain).or_insert(id);
            }
        }

        for (id, _) in registry.iter() {
            if let Some(source) = sources.get(&id) {
                if let Some(host) = host_from_source(source) {
                    domains.entry(host).or_insert(id);
                }
            }
        }

        let mapped: std::collections::HashSet<ArchiveId> = domains.values().copied().collect();
        for (id, info) in registry.iter() {
            if mapped.contains(&id) {
                continue;
            }
            for tld in SPECULATIVE_TLDS {
                domains.entry(format!("{}.{tld}", info.short_name.to_lowercase())).or_insert(id);
            }
        }

        let mut variants = Vec::new();
        for (domain, id) in &domains {
            variants.push((format!("www.{domain}"), *id));
            if let Some(mobile) = mobile_variant(domain) {
                variants.push((mobile, *id));
            }
        }
        for (domain, id) in variants {
            domains.entry(domain).or_insert(id);
        }

        Self { domains, references: DashMap::new() }
    }

    fn lookup_host(&self, host: &str) -> Option<ArchiveId> {
        let host = host.to_lowercase();
        self.domains
            .get(&host)
            .copied()
            .or_else(|| host.strip_prefix("www.").and_then(|h| self.domains.get(h).copied()))
    }

    pub fn record_reference(&self, from: ArchiveId, to: ArchiveId) {
        *self.references.entry((from, to)).or_insert(0) += 1;
    }

    pub fn reference_count(&self, from: ArchiveId, to: ArchiveId) -> u64 {
        self.references.get(&(from, to)).map(|c| *c).unwrap_or(0)
    }
}

fn strip_wiki_prefix(path: &str) -> &str {
    path.strip_prefix("wiki/").unwrap_or(path)
}

fn strip_wikimedia_namespace(path: &str) -> Option<&str> {
    const NAMESPACES: &[&str] = &["Talk:", "User:", "User_talk:", "Category:", "Template:", "Help:", "Portal:"];
    for ns in NAMESPACES {
        if let Some(rest) = path.strip_prefix(ns) {
            return Some(rest);
        }
    }
    None
}

/// Build the ordered candidate in-archive path list for a host/path pair,
/// per domain family.
fn candidate_paths(domain: &str, raw_path: &str) -> Vec<String> {
    let path = raw_path.trim_start_matches('/');
    let family = classify_domain(domain);
    let mut out = Vec::new();
    match family {
        DomainFamily::Wikimedia => {
            let rest = strip_wiki_prefix(path);
            out.push(format!("A/{rest}"));
            out.push(rest.to_string());
            if let Some(stripped) = strip_wikimedia_namespace(rest) {
                out.push(format!("A/{stripped}"));
                out.push(stripped.to_string());
            }
        }
        DomainFamily::StackExchange => {
            out.push(format!("A/{path}"));
            out.push(path.to_string());
        }
        DomainFamily::StripWikiPrefix => {
            let rest = strip_wiki_prefix(path);
            out.push(rest.to_string());
            out.push(format!("A/{rest}"));
        }
        DomainFamily::WikiHow => {
            out.push(format!("A/{path}"));
            out.push(path.to_string());
        }
        DomainFamily::General => {
            out.push(format!("A/{path}"));
            out.push(path.to_string());
            out.push(format!("{domain}/{path}"));
        }
    }
    out
}

/// Resolve an external `(host, path)` pair to an in-archive entry path,
/// probing candidates in order against the archive's content pool and
/// returning the first one the archive actually contains. Records a
/// cross-archive reference when `from` is given and resolution succeeds.
pub async fn resolve(
    map: &DomainMap,
    registry: &ArchiveRegistry,
    content_pool: &ArchivePool,
    open: &OpenFn,
    host: &str,
    raw_path: &str,
    from: Option<ArchiveId>,
) -> Option<(ArchiveId, String)> {
    let to = map.lookup_host(host)?;
    let info = registry.get(to)?;
    let candidates = candidate_paths(host, raw_path);

    let guard = content_pool.get(to, &info.path, open).await.ok()?;
    let reader = guard.as_ref()?;
    for candidate in candidates {
        if reader.get_entry_by_path(&candidate).is_some() {
            if let Some(from) = from {
                map.record_reference(from, to);
            }
            return Some((to, candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimEntry, ZimMetadata};
    use crate::registry::ArchiveInfo;
    use std::path::PathBuf;
    use std::time::SystemTime;
    use std::sync::Arc;

    fn registry_with(short_name: &str, filename: &str) -> ArchiveRegistry {
        let mut reg = ArchiveRegistry::new();
        reg.replace(vec![ArchiveInfo {
            short_name: short_name.to_string(),
            path: PathBuf::from(format!("/zims/{filename}")),
            file_size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            title: short_name.to_string(),
            description: String::new(),
            publication_date: None,
            main_path: None,
            has_icon: false,
            entry_count: Some(1),
            category: None,
        }]);
        reg
    }

    #[test]
    fn domain_from_filename_extracts_leading_segment() {
        assert_eq!(
            domain_from_filename("wikipedia.org_en_all_nopic_2024-07.zim"),
            Some("wikipedia.org".to_string())
        );
        assert_eq!(domain_from_filename("devdocs_python_2024-08.zim"), None);
    }

    #[test]
    fn www_and_mobile_variants_are_registered() {
        let reg = registry_with("wikipedia", "wikipedia.org_en_all_nopic_2024-07.zim");
        let map = DomainMap::build(&reg, &HashMap::new());
        assert!(map.lookup_host("www.wikipedia.org").is_some());
    }

    #[test]
    fn unmapped_archive_gets_speculative_tlds() {
        let reg = registry_with("devdocs_python", "devdocs_python_2024-08.zim");
        let map = DomainMap::build(&reg, &HashMap::new());
        assert!(map.lookup_host("devdocs_python.com").is_some());
    }

    #[tokio::test]
    async fn resolve_returns_first_existing_candidate() {
        let reg = registry_with("wikipedia", "wikipedia.org_en_all_nopic_2024-07.zim");
        let map = DomainMap::build(&reg, &HashMap::new());
        let pool = ArchivePool::new("content");
        let open: OpenFn = Arc::new(|_path: &Path| {
            Ok(Box::new(MockZimReader::new(
                vec![ZimEntry {
                    path: "A/Rust_(programming_language)".into(),
                    title: "Rust (programming language)".into(),
                    mimetype: "text/html".into(),
                    content: b"hi".to_vec(),
                    redirect_target: None,
                }],
                ZimMetadata::default(),
            )) as Box<dyn ZimReader>)
        });

        let result = resolve(
            &map,
            &reg,
            &pool,
            &open,
            "wikipedia.org",
            "/wiki/Rust_(programming_language)",
            None,
        )
        .await;
        assert_eq!(result, Some((ArchiveId(0), "A/Rust_(programming_language)".to_string())));
    }

    #[tokio::test]
    async fn resolve_unknown_host_returns_none() {
        let reg = registry_with("wikipedia", "wikipedia.org_en_all_nopic_2024-07.zim");
        let map = DomainMap::build(&reg, &HashMap::new());
        let pool = ArchivePool::new("content");
        let open: OpenFn =
            Arc::new(|_path: &Path| Ok(Box::new(MockZimReader::new(vec![], ZimMetadata::default())) as Box<dyn ZimReader>));
        let result = resolve(&map, &reg, &pool, &open, "nowhere.example", "/x", None).await;
        assert_eq!(result, None);
    }
}
