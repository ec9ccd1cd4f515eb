//! Archive registry: short-name derivation, category classification, and the
//! array-backed `ArchiveId` table that every other component keys off.
//!
//! `zimi/server.py` keys its pools, caches, and title indexes off archive
//! short name directly. Here they key off `ArchiveId` (a plain index into
//! `ArchiveRegistry`'s backing `Vec`) instead, with a short-name → id table
//! only at the lookup boundary — short names can collide or be renamed,
//! `ArchiveId` can't.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// Opaque handle for an archive, stable for the lifetime of one `ArchiveRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveId(pub u32);

/// Immutable, on-disk archive description.
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub short_name: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub mtime: SystemTime,
    pub title: String,
    pub description: String,
    pub publication_date: Option<String>,
    pub main_path: Option<String>,
    pub has_icon: bool,
    pub entry_count: Option<u64>,
    pub category: Option<&'static str>,
}

/// Append-only registry of installed archives, indexed by `ArchiveId`.
#[derive(Default)]
pub struct ArchiveRegistry {
    archives: Vec<ArchiveInfo>,
    by_name: HashMap<String, ArchiveId>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole registry (used by a full library refresh).
    pub fn replace(&mut self, archives: Vec<ArchiveInfo>) {
        self.by_name.clear();
        self.archives = archives;
        for (i, a) in self.archives.iter().enumerate() {
            self.by_name.insert(a.short_name.clone(), ArchiveId(i as u32));
        }
    }

    pub fn id_of(&self, short_name: &str) -> Option<ArchiveId> {
        self.by_name.get(short_name).copied()
    }

    pub fn get(&self, id: ArchiveId) -> Option<&ArchiveInfo> {
        self.archives.get(id.0 as usize)
    }

    pub fn get_by_name(&self, short_name: &str) -> Option<&ArchiveInfo> {
        self.id_of(short_name).and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArchiveId, &ArchiveInfo)> {
        self.archives.iter().enumerate().map(|(i, a)| (ArchiveId(i as u32), a))
    }

    pub fn short_names(&self) -> Vec<String> {
        self.archives.iter().map(|a| a.short_name.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Short-name derivation
// ---------------------------------------------------------------------------

/// Derive a short, human-friendly name from a ZIM filename by stripping
/// trailing date/locale/variant segments via an ordered list of regex
/// simplifications. Grounded verbatim in `_scan_zim_files` (zimi.py).
pub fn derive_short_name(filename: &str) -> String {
    let name = filename.strip_suffix(".zim").unwrap_or(filename);
    let rules: &[(&str, &str)] = &[
        (r"\.com_en_all.*", ""),
        (r"\.stackexchange\.com_en_all.*", ""),
        (r"_en_all_maxi.*", ""),
        (r"_en_all.*", ""),
        (r"_en_maxi.*", ""),
        (r"_en_2\d{3}.*", ""),
        (r"_maxi_2\d{3}.*", ""),
        (r"_2\d{3}-\d{2}$", ""),
    ];
    let mut out = name.to_string();
    for (pattern, replacement) in rules {
        let re = regex::Regex::new(pattern).expect("static pattern");
        if re.is_match(&out) {
            out = re.replace(&out, *replacement).into_owned();
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Category classification
// ---------------------------------------------------------------------------

/// Auto-categorize an archive by short name. Ordered rules, first match wins.
/// Grounded verbatim in `_categorize_zim` (zimi.py).
pub fn categorize(short_name: &str) -> Option<&'static str> {
    let n = short_name.to_lowercase();

    if n.contains("medicine")
        || n == "wikem"
        || n.contains("ready.gov")
        || (n.starts_with("zimgit-") && ["water", "food", "disaster"].iter().any(|k| n.contains(k)))
    {
        return Some("Medical");
    }
    if matches!(n.as_str(), "stackoverflow" | "askubuntu" | "superuser" | "serverfault")
        || n.contains("stackexchange")
    {
        return Some("Stack Exchange");
    }
    if n.starts_with("devdocs_") || n == "freecodecamp" {
        return Some("Dev Docs");
    }
    if n.starts_with("ted_")
        || n.starts_with("phzh_")
        || matches!(
            n.as_str(),
            "crashcourse"
                | "phet"
                | "appropedia"
                | "artofproblemsolving"
                | "edutechwiki"
                | "explainxkcd"
                | "coreeng1"
        )
    {
        return Some("Education");
    }
    if matches!(n.as_str(), "wikihow" | "ifixit") || n.contains("off-the-grid") || n.contains("knots")
    {
        return Some("How-To");
    }
    if n.starts_with("wiki") || n.starts_with("wikt") || n == "openstreetmap-wiki" {
        return Some("Wikimedia");
    }
    if matches!(n.as_str(), "gutenberg" | "rationalwiki" | "theworldfactbook") {
        return Some("Books");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_strips_dates_and_locales() {
        assert_eq!(derive_short_name("wikipedia_en_all_nopic_2024-07.zim"), "wikipedia");
        assert_eq!(derive_short_name("devdocs_python_2024-08.zim"), "devdocs_python");
        assert_eq!(derive_short_name("stackoverflow.com_en_all_2023-11.zim"), "stackoverflow");
        assert_eq!(
            derive_short_name("ubuntu.stackexchange.com_en_all_2023-05.zim"),
            "ubuntu.stackexchange"
        );
    }

    #[test]
    fn short_name_derivation_is_deterministic() {
        let name = "wikihow_en_all_maxi_2023-09.zim";
        assert_eq!(derive_short_name(name), derive_short_name(name));
    }

    #[test]
    fn categorize_picks_first_matching_rule() {
        assert_eq!(categorize("wikipedia"), Some("Wikimedia"));
        assert_eq!(categorize("wikihow"), Some("How-To"));
        assert_eq!(categorize("stackoverflow"), Some("Stack Exchange"));
        assert_eq!(categorize("devdocs_python"), Some("Dev Docs"));
        assert_eq!(categorize("gutenberg"), Some("Books"));
        assert_eq!(categorize("something_unknown"), None);
    }

    #[test]
    fn registry_assigns_stable_ids() {
        let mut reg = ArchiveRegistry::new();
        reg.replace(vec![ArchiveInfo {
            short_name: "wikipedia".into(),
            path: PathBuf::from("/zims/wikipedia.zim"),
            file_size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            title: "Wikipedia".into(),
            description: String::new(),
            publication_date: None,
            main_path: None,
            has_icon: false,
            entry_count: Some(10),
            category: categorize("wikipedia"),
        }]);
        let id = reg.id_of("wikipedia").unwrap();
        assert_eq!(reg.get(id).unwrap().short_name, "wikipedia");
    }
}
