//! OPDS (Atom) catalog fetch and update checking. Grounded
//! verbatim in `_fetch_kiwix_catalog` / `_check_updates` / `_extract_zim_date`
//! from `zimi.py`.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use crate::error::AppError;

pub const KIWIX_OPDS_BASE: &str = "https://library.kiwix.org/catalog/search";
const CATALOG_PAGE_SIZE: u32 = 500;

/// One catalog entry as extracted from the Atom feed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub title: String,
    pub summary: String,
    pub language: String,
    pub category: String,
    pub author: String,
    /// `YYYY-MM-DD`, truncated from `dc:issued`.
    pub date: String,
    pub article_count: u64,
    pub media_count: u64,
    pub size_bytes: u64,
    pub download_url: String,
    pub icon_url: String,
    pub installed: bool,
}

/// Strip the trailing `_YYYY-MM.zim` date suffix from a filename. Returns
/// the base name and the extracted date, or the plain `.zim`-stripped name
/// and `None` if the filename carries no recognizable date.
pub fn extract_zim_date(filename: &str) -> (String, Option<String>) {
    let re = regex::Regex::new(r"_(\d{4}-\d{2})\.zim$").unwrap();
    if let Some(caps) = re.captures(filename) {
        let whole = caps.get(0).unwrap();
        let base = filename[..whole.start()].to_string();
        let date = caps.get(1).unwrap().as_str().to_string();
        (base, Some(date))
    } else {
        (filename.trim_end_matches(".zim").to_string(), None)
    }
}

/// Fetch one page of the Kiwix OPDS catalog.
pub async fn fetch_page(
    client: &reqwest::Client,
    query: &str,
    lang: &str,
    count: u32,
    start: u32,
) -> Result<(u64, Vec<CatalogEntry>), AppError> {
    let mut params = vec![("count", count.to_string()), ("start", start.to_string())];
    if !query.is_empty() {
        params.push(("q", query.to_string()));
    }
    if !lang.is_empty() {
        params.push(("lang", lang.to_string()));
    }

    let response = client
        .get(KIWIX_OPDS_BASE)
        .query(&params)
        .header(reqwest::header::USER_AGENT, "Zimi/1.0")
        .send()
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AppError::Upstream(format!("catalog fetch failed: {}", response.status())));
    }
    let body = response.bytes().await.map_err(|e| AppError::Upstream(e.to_string()))?;
    parse_atom(&body).map_err(|e| AppError::Upstream(e.to_string()))
}

/// Parse an OPDS Atom feed into `(totalResults, entries)`.
pub fn parse_atom(xml: &[u8]) -> Result<(u64, Vec<CatalogEntry>), quick_xml::Error> {
    // Text is trimmed by hand below rather than via reader config, since the
    // trim-text knob's shape has moved around across quick-xml versions.
    let mut reader = Reader::from_reader(xml);

    let mut total: u64 = 0;
    let mut entries = Vec::new();

    let mut in_entry = false;
    let mut in_author = false;
    let mut current = CatalogEntry::default();
    let mut tag_stack: Vec<String> = Vec::new();
    let mut text_buf = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if name == "entry" {
                    in_entry = true;
                    current = CatalogEntry::default();
                } else if name == "author" {
                    in_author = true;
                } else if name == "link" && in_entry {
                    let mut rel = String::new();
                    let mut href = String::new();
                    let mut ltype = String::new();
                    let mut length = 0u64;
                    for attr in e.attributes().flatten() {
                        let key = local_name(attr.key.as_ref());
                        let value = attr.decode_and_unescape_value(reader.decoder())?.into_owned();
                        match key.as_str() {
                            "rel" => rel = value,
                            "href" => href = value,
                            "type" => ltype = value,
                            "length" => length = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    if rel == "http://opds-spec.org/acquisition/open-access" && ltype == "application/x-zim" {
                        current.download_url = href;
                        current.size_bytes = length;
                    } else if rel == "http://opds-spec.org/image/thumbnail" {
                        current.icon_url =
                            if href.starts_with('/') { format!("https://library.kiwix.org{href}") } else { href };
                    }
                }
                tag_stack.push(name);
                text_buf.clear();
            }
            Event::Text(e) => {
                text_buf.push_str(&e.unescape()?);
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                let text = text_buf.trim().to_string();
                text_buf.clear();

                if in_entry && !in_author {
                    match name.as_str() {
                        "name" => current.name = text.clone(),
                        "title" => current.title = text.clone(),
                        "summary" => current.summary = text.clone(),
                        "language" => current.language = text.clone(),
                        "category" => current.category = text.clone(),
                        "articleCount" => current.article_count = text.parse().unwrap_or(0),
                        "mediaCount" => current.media_count = text.parse().unwrap_or(0),
                        "issued" => current.date = text.chars().take(10).collect(),
                        _ => {}
                    }
                }
                if in_author && name == "name" && !text.is_empty() && text != "-" {
                    current.author = text.clone();
                }
                if name == "author" {
                    in_author = false;
                }
                if name == "totalResults" {
                    total = text.parse().unwrap_or(0);
                }
                if name == "entry" {
                    in_entry = false;
                    entries.push(std::mem::take(&mut current));
                }
                tag_stack.pop();
            }
            _ => {}
        }
        buf.clear();
    }

    Ok((total, entries))
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

/// Mark each entry `installed` by comparing its download URL's date-stripped
/// filename base against the installed set.
pub fn mark_installed(entries: &mut [CatalogEntry], installed_bases: &std::collections::HashSet<String>) {
    for entry in entries.iter_mut() {
        if entry.download_url.is_empty() {
            continue;
        }
        let filename = entry.download_url.rsplit('/').next().unwrap_or("");
        let (base, _) = extract_zim_date(filename);
        entry.installed = installed_bases.contains(&base.to_lowercase());
    }
}

/// An available update for one installed archive.
#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    pub name: String,
    pub installed_file: String,
    pub installed_date: String,
    pub latest_date: String,
    pub download_url: String,
    pub title: String,
    pub size_bytes: u64,
}

struct InstalledFile {
    name: String,
    filename: String,
    filebase: String,
    date: String,
}

/// Scan the full catalog (paginated) and, for each installed archive with a
/// recognizable date, find the longest-prefix catalog entry whose name
/// prefixes the installed filename and whose date is strictly newer.
pub async fn check_updates(
    client: &reqwest::Client,
    installed: &[(String, String)], // (short_name, filename)
) -> Vec<AvailableUpdate> {
    let installed_files: Vec<InstalledFile> = installed
        .iter()
        .filter_map(|(name, filename)| {
            let (_, date) = extract_zim_date(filename);
            date.map(|date| InstalledFile {
                name: name.clone(),
                filename: filename.clone(),
                filebase: filename.trim_end_matches(".zim").to_string(),
                date,
            })
        })
        .collect();
    if installed_files.is_empty() {
        return Vec::new();
    }

    let mut all_items = Vec::new();
    let Ok((total, first)) = fetch_page(client, "", "eng", CATALOG_PAGE_SIZE, 0).await else {
        return Vec::new();
    };
    all_items.extend(first);
    while (all_items.len() as u64) < total {
        match fetch_page(client, "", "eng", CATALOG_PAGE_SIZE, all_items.len() as u32).await {
            Ok((_, more)) if !more.is_empty() => all_items.extend(more),
            _ => break,
        }
    }

    let catalog_index: Vec<(String, String, &CatalogEntry)> = all_items
        .iter()
        .filter_map(|item| {
            if item.download_url.is_empty() || item.name.is_empty() || item.date.is_empty() {
                return None;
            }
            let cat_date: String = item.date.chars().take(7).collect();
            Some((item.name.clone(), cat_date, item))
        })
        .collect();

    let mut updates = Vec::new();
    for inst in &installed_files {
        let mut best: Option<&(String, String, &CatalogEntry)> = None;
        for candidate in &catalog_index {
            let (cat_name, cat_date, _) = candidate;
            if inst.filebase.starts_with(&format!("{cat_name}_")) && cat_date.as_str() > inst.date.as_str() {
                let better = best.map(|b| cat_name.len() > b.0.len()).unwrap_or(true);
                if better {
                    best = Some(candidate);
                }
            }
        }
        if let Some((_, cat_date, item)) = best {
            updates.push(AvailableUpdate {
                name: inst.name.clone(),
                installed_file: inst.filename.clone(),
                installed_date: inst.date.clone(),
                latest_date: cat_date.clone(),
                download_url: item.download_url.clone(),
                title: item.title.clone(),
                size_bytes: item.size_bytes,
            });
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:dc="http://purl.org/dc/terms/">
  <totalResults>1</totalResults>
  <entry>
    <name>wikipedia_en_all_nopic</name>
    <title>Wikipedia</title>
    <summary>The free encyclopedia</summary>
    <language>eng</language>
    <category>wikipedia</category>
    <articleCount>1000</articleCount>
    <mediaCount>10</mediaCount>
    <author><name>Wikimedia</name></author>
    <dc:issued>2024-07-01T00:00:00Z</dc:issued>
    <link rel="http://opds-spec.org/acquisition/open-access" type="application/x-zim"
          href="https://download.kiwix.org/zim/wikipedia_en_all_nopic_2024-07.zim" length="123456"/>
    <link rel="http://opds-spec.org/image/thumbnail" href="/catalog/v2/illustration/wikipedia/48.png"/>
  </entry>
</feed>"#;

    #[test]
    fn parses_entry_fields_and_total() {
        let (total, entries) = parse_atom(SAMPLE_FEED.as_bytes()).unwrap();
        assert_eq!(total, 1);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.title, "Wikipedia");
        assert_eq!(e.author, "Wikimedia");
        assert_eq!(e.date, "2024-07-01");
        assert_eq!(e.article_count, 1000);
        assert_eq!(e.size_bytes, 123456);
        assert!(e.download_url.ends_with("wikipedia_en_all_nopic_2024-07.zim"));
        assert!(e.icon_url.starts_with("https://library.kiwix.org"));
    }

    #[test]
    fn extract_zim_date_splits_base_and_date() {
        assert_eq!(
            extract_zim_date("wikipedia_en_all_nopic_2024-07.zim"),
            ("wikipedia_en_all_nopic".to_string(), Some("2024-07".to_string()))
        );
        assert_eq!(extract_zim_date("devdocs_python.zim"), ("devdocs_python".to_string(), None));
    }

    #[test]
    fn mark_installed_matches_by_date_stripped_base() {
        let mut entries = vec![CatalogEntry {
            download_url: "https://download.kiwix.org/zim/wikipedia_en_all_nopic_2024-07.zim".into(),
            ..Default::default()
        }];
        let mut installed = std::collections::HashSet::new();
        installed.insert("wikipedia_en_all_nopic".to_string());
        mark_installed(&mut entries, &installed);
        assert!(entries[0].installed);
    }
}
