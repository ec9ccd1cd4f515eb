//! Link-preview extraction: pull a thumbnail image and a text
//! blurb out of an article's HTML, the way iMessage/Slack/Discord build link
//! previews. Grounded verbatim in `_extract_preview` / `_resolve_img_path` /
//! `strip_html` from `zimi/server.py`.

use crate::reader::{ZimEntry, ZimReader};

const SCAN_BYTES: usize = 80_000;
const FLAG_SCAN_BYTES: usize = 60_000;

/// Everything recovered from one article's HTML. Most fields are only ever
/// populated for the archive family they're named after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preview {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub blurb: Option<String>,
    pub attribution: Option<String>,
    pub speaker: Option<String>,
    pub author: Option<String>,
    pub part_of_speech: Option<String>,
    /// Wiktionary definition looked boring (an inflected form); caller may
    /// want to retry against a different entry.
    pub boring: bool,
    /// Full (non-Simple) Wiktionary page with no English section.
    pub non_english: bool,
}

/// Decode the handful of HTML entities articles actually use. Not a full
/// entity table — numeric refs and the five XML predefined entities plus
/// `&nbsp;`, which covers everything `strip_html` needs to unescape.
fn unescape_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            if let Some(end) = s[i..].find(';').filter(|&off| off <= 12) {
                let entity = &s[i + 1..i + end];
                let replacement = match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" | "#39" | "#x27" => Some('\''),
                    "nbsp" => Some('\u{00a0}'),
                    _ => entity
                        .strip_prefix("#x")
                        .or_else(|| entity.strip_prefix("#X"))
                        .and_then(|h| u32::from_str_radix(h, 16).ok())
                        .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse::<u32>().ok()))
                        .and_then(char::from_u32),
                };
                if let Some(c) = replacement {
                    out.push(c);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = s[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Strip tags (and their `<script>`/`<style>` contents) and unescape
/// entities, collapsing whitespace.
fn strip_html(text: &str) -> String {
    let no_script = regex::Regex::new(r"(?s)<script[^>]*>.*?</script>").unwrap().replace_all(text, "").into_owned();
    let no_style = regex::Regex::new(r"(?s)<style[^>]*>.*?</style>").unwrap().replace_all(&no_script, "").into_owned();
    let no_tags = regex::Regex::new(r"<[^>]+>").unwrap().replace_all(&no_style, " ").into_owned();
    let unescaped = unescape_entities(&no_tags);
    unescaped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a relative (or archive-rooted) image `src` against the entry's
/// directory, normalizing `..`/`.` segments, and confirm the archive
/// actually has an entry at that path. Tries the resolved path, then (if it
/// starts with `A/`) the bare path without the namespace prefix.
fn resolve_img_path(reader: &dyn ZimReader, path: &str, src: &str) -> Option<String> {
    let decoded = percent_decode(&percent_decode(src));
    let raw = if let Some(stripped) = decoded.strip_prefix('/') {
        stripped.to_string()
    } else {
        let mut segs: Vec<&str> = path.split('/').collect();
        segs.pop();
        let base = segs.join("/");
        if base.is_empty() { decoded } else { format!("{base}/{decoded}") }
    };

    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.replace('\\', "/").split('/') {
        if seg == ".." {
            parts.pop();
        } else if !seg.is_empty() && seg != "." {
            parts.push(seg);
        }
    }
    let resolved = parts.join("/");

    if reader.get_entry_by_path(&resolved).is_some() {
        return Some(resolved);
    }
    if let Some(bare) = resolved.strip_prefix("A/") {
        if reader.get_entry_by_path(bare).is_some() {
            return Some(bare.to_string());
        }
    }
    None
}

/// Minimal percent-decoding (the double-unquote `_resolve_img_path` does to
/// handle doubly-encoded links some ZIM generators produce).
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Byte-prefix of `s` no longer than `max_bytes`, floored to the nearest
/// char boundary so multi-byte UTF-8 text never gets sliced mid-character.
fn byte_prefix(s: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Nearest char boundary at or after `idx`, for slicing `s[idx..]` safely
/// when `idx` comes from arithmetic rather than a regex match.
fn char_boundary_ceil(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn follow_redirect(reader: &dyn ZimReader, path: &str) -> Option<ZimEntry> {
    let entry = reader.get_entry_by_path(path)?;
    if let Some(target) = &entry.redirect_target {
        reader.get_entry_by_path(target)
    } else {
        Some(entry)
    }
}

/// Plain-text rendering of an entry's HTML body (tags stripped, entities
/// unescaped, whitespace collapsed), truncated to `max_length` characters
/// if given. `None` if the entry (or its redirect target) doesn't exist.
pub fn plain_text(reader: &dyn ZimReader, path: &str, max_length: Option<usize>) -> Option<String> {
    let entry = follow_redirect(reader, path)?;
    let text = strip_html(&String::from_utf8_lossy(&entry.content));
    Some(match max_length {
        Some(n) => text.chars().take(n).collect(),
        None => text,
    })
}

/// Extract a thumbnail and blurb for `path` inside `zim_name`. Returns a
/// default (all-`None`) preview if the entry doesn't exist or isn't text.
pub fn extract_preview(reader: &dyn ZimReader, zim_name: &str, path: &str) -> Preview {
    let mut result = Preview::default();
    let Some(entry) = follow_redirect(reader, path) else { return result };
    let full = String::from_utf8_lossy(&entry.content);
    let html_str: String = full.chars().take(SCAN_BYTES).collect();
    let zim_lower = zim_name.to_lowercase();

    extract_title(&html_str, &entry.title, &mut result);

    if zim_lower.contains("wikiquote") {
        extract_wikiquote(&html_str, &entry.title, &mut result);
    }
    if zim_lower.contains("ted") {
        extract_ted(reader, &html_str, path, zim_name, &mut result);
    }
    if zim_lower.contains("theworldfactbook") && result.thumbnail.is_none() {
        extract_factbook_flag(reader, &html_str, path, zim_name, &mut result);
    }
    if zim_lower.contains("theworldfactbook") && result.thumbnail.is_none() {
        extract_factbook_locator(reader, &html_str, path, zim_name, &mut result);
    }
    if zim_lower.contains("xkcd") && result.blurb.is_none() {
        extract_xkcd_blurb(&html_str, &mut result);
    }
    if zim_lower.contains("gutenberg") {
        extract_gutenberg_author(&html_str, &mut result);
    }
    if zim_lower.contains("wiktionary") {
        extract_wiktionary(&html_str, &zim_lower, &mut result);
    }

    if result.blurb.is_none() {
        extract_blurb_meta(&html_str, &mut result);
    }
    if result.blurb.is_none() {
        extract_blurb_fallback(&html_str, &mut result);
    }

    if result.thumbnail.is_some() {
        return result;
    }
    if extract_thumbnail_meta(reader, &html_str, path, zim_name, &mut result) {
        return result;
    }
    result.thumbnail = extract_thumbnail_scored(reader, &html_str, path, zim_name);
    result
}

/// `<title>`/`og:title` recovery for slug-style entry titles (a dash, no
/// spaces), with site-suffix and Factbook region-prefix stripping.
fn extract_title(html_str: &str, entry_title: &str, result: &mut Preview) {
    if !(entry_title.contains('-') && !entry_title.contains(' ')) {
        return;
    }
    const PATTERNS: &[&str] = &[
        r#"(?is)<meta\s+property=["']og:title["']\s+content=["']([^"']+)["']"#,
        r#"(?is)<meta\s+content=["']([^"']+)["']\s+property=["']og:title["']"#,
        r#"(?is)<title[^>]*>([^<]+)</title>"#,
        r#"(?is)<p\s+class=["']title\s+lang-default["'][^>]*>(.*?)</p>"#,
        r#"(?is)<p\s+class=["']title["'][^>]*>(.*?)</p>"#,
        r#"(?is)<h1[^>]*>(.*?)</h1>"#,
    ];
    for pattern in PATTERNS {
        let re = regex::Regex::new(pattern).unwrap();
        let Some(caps) = re.captures(html_str) else { continue };
        let raw = caps.get(1).unwrap().as_str().trim();
        let mut clean = strip_html(&unescape_entities(raw));
        clean = regex::Regex::new(r"(?i)\s*[|–—]\s*(TED\s*Talk|TED|Wikipedia|The World Factbook).*$")
            .unwrap()
            .replace(&clean, "")
            .into_owned();
        clean = regex::Regex::new(r"^[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\s*::\s*").unwrap().replace(&clean, "").into_owned();
        if clean.chars().count() > 3 && clean != entry_title {
            result.title = Some(clean.chars().take(200).collect());
            return;
        }
    }
    let slug = entry_title.replace(['-', '_'], " ");
    result.title = Some(title_case(&slug).chars().take(200).collect::<String>());
}

/// Approximates Python's `str.title()`: uppercase the first letter of each
/// whitespace-separated word, lowercase the rest.
fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wikiquote's `<ul><li>quote<ul><li>attribution</li></ul></li></ul>`
/// nesting: scan balanced top-level `<ul>` blocks looking for one with a
/// nested `<ul>` (the attribution line).
fn extract_wikiquote(html_str: &str, entry_title: &str, result: &mut Preview) {
    for ul_start in find_all(html_str, "<ul>") {
        let mut depth = 1i32;
        let mut pos = ul_start + "<ul>".len();
        let scan_limit = (ul_start + 5000).min(html_str.len());
        while depth > 0 && pos < html_str.len() && pos < scan_limit {
            let next_open = html_str[pos..].find("<ul").map(|o| pos + o);
            let next_close = html_str[pos..].find("</ul>").map(|o| pos + o);
            let Some(next_close) = next_close else { break };
            match next_open {
                Some(no) if no < next_close => {
                    depth += 1;
                    pos = no + 3;
                }
                _ => {
                    depth -= 1;
                    pos = next_close + 5;
                }
            }
        }
        if depth != 0 {
            continue;
        }
        let block = &html_str[ul_start..pos];
        if block.matches("<ul").count() < 2 {
            continue;
        }
        let Some(inner_ul_rel) = block[4..].find("<ul").map(|o| o + 4) else { continue };
        let mut quote_html = &block[4..inner_ul_rel];
        quote_html = regex::Regex::new(r"^\s*<li[^>]*>").unwrap().splitn(quote_html, 2).last().unwrap_or(quote_html);
        let text = strip_html(quote_html).trim().to_string();
        if text.len() > 20
            && text.len() < 400
            && text.split_whitespace().count() > 4
            && !(text.starts_with("Category:")
                || text.starts_with("See also")
                || text.starts_with("External links")
                || text.starts_with("Retrieved"))
        {
            result.blurb = Some(format!("\u{201c}{}\u{201d}", &text.chars().take(250).collect::<String>()));
            let inner_block = &block[inner_ul_rel..];
            let attr_raw = strip_html(inner_block).trim().to_string();
            let attr_raw = regex::Regex::new(r"^[—–\-~]+\s*").unwrap().replace(&attr_raw, "").trim().to_string();
            let attr_raw = attr_raw.split('\n').next().unwrap_or("").trim().to_string();
            let mut author = result.title.clone().unwrap_or_else(|| entry_title.to_string());
            if attr_raw.len() > 3
                && attr_raw.len() < 200
                && !regex::Regex::new(r"(?i)[\[\]{}]|https?:|www\.|^\d").unwrap().is_match(&attr_raw)
            {
                let mut name_part = attr_raw.split([',', '(']).next().unwrap_or("").trim().to_string();
                if !name_part.is_empty() && attr_raw.contains(',') {
                    let parts: Vec<&str> = attr_raw.split(',').map(|p| p.trim()).collect();
                    let last_is_single_cap = parts.first().map(|p| regex::Regex::new(r"^[A-Z][a-z]+$").unwrap().is_match(p)).unwrap_or(false);
                    let second_is_name = parts.get(1).map(|p| regex::Regex::new(r"^(Jr\.|Sr\.|[A-Z])").unwrap().is_match(p)).unwrap_or(false);
                    if parts.len() >= 2 && last_is_single_cap && second_is_name {
                        if matches!(parts[1], "Jr." | "Sr." | "III" | "II" | "IV") && parts.len() >= 3 {
                            name_part = format!("{} {}, {}", parts[2], parts[0], parts[1]);
                        } else if regex::Regex::new(r"^[A-Z][a-z]").unwrap().is_match(parts[1])
                            && parts[1].split_whitespace().count() <= 3
                        {
                            name_part = format!("{} {}", parts[1], parts[0]);
                        }
                    }
                }
                if name_part.chars().count() > 2
                    && name_part.chars().count() < 60
                    && name_part.starts_with(|c: char| c.is_ascii_uppercase())
                    && !regex::Regex::new(r"(?i)^(p\.|ch\.|vol\.|see |ibid)").unwrap().is_match(&name_part)
                {
                    author = name_part;
                }
            }
            result.attribution = Some(author.chars().take(100).collect());
            return;
        }
    }
}

fn find_all(haystack: &str, needle: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(i) = haystack[start..].find(needle) {
        out.push(start + i);
        start += i + 1;
    }
    out
}

/// TED Talks: `<p id="speaker">` carries the last name; cross-reference
/// `<p id="speaker_desc">` prose for the first name, then resolve the
/// speaker photo.
fn extract_ted(reader: &dyn ZimReader, html_str: &str, path: &str, zim_name: &str, result: &mut Preview) {
    let sp_re = regex::Regex::new(r#"(?is)<p\s+id=["']speaker["'][^>]*>(.*?)</p>"#).unwrap();
    let mut speaker: Option<String> = None;
    let mut last_name: Option<String> = None;
    if let Some(caps) = sp_re.captures(html_str) {
        let name = regex::Regex::new(r"\s+").unwrap().replace_all(&strip_html(&caps[1]), " ").trim().to_string();
        if name.contains(' ') {
            speaker = Some(name.clone());
        }
        last_name = Some(name);
    }
    if speaker.is_none() {
        if let Some(last) = &last_name {
            let desc_re = regex::Regex::new(r#"(?is)<p\s+id=["']speaker_desc["'][^>]*>(.*?)</p>"#).unwrap();
            if let Some(caps) = desc_re.captures(html_str) {
                let desc_text = regex::Regex::new(r"\s+").unwrap().replace_all(&strip_html(&caps[1]), " ").trim().to_string();
                let pattern = format!(
                    r"((?:(?:[A-Z][\w.'’-]*|el|de|van|von|al)\s+){{0,3}}){}\b",
                    regex::escape(last)
                );
                if let Some(name_m) = regex::Regex::new(&pattern).unwrap().captures(&desc_text) {
                    let prefix = name_m.get(1).unwrap().as_str().trim();
                    speaker = Some(if prefix.is_empty() { last.clone() } else { format!("{prefix} {last}") });
                }
            }
        }
    }
    let speaker = speaker.or(last_name);
    if let Some(s) = &speaker {
        if s.chars().count() > 1 {
            result.speaker = Some(s.chars().take(100).collect());
        }
    }

    let img_re1 = regex::Regex::new(r#"(?i)<img\s+id=["']speaker_img["'][^>]*src=["']([^"']+)["']"#).unwrap();
    let img_re2 = regex::Regex::new(r#"(?i)<img[^>]*id=["']speaker_img["'][^>]*src=["']([^"']+)["']"#).unwrap();
    let src = img_re1.captures(html_str).or_else(|| img_re2.captures(html_str)).map(|c| c[1].to_string());
    if let Some(src) = src {
        if !src.starts_with("http") && !src.starts_with("//") && !src.starts_with("data:") {
            if let Some(resolved) = resolve_img_path(reader, path, &src) {
                result.thumbnail = Some(format!("/w/{zim_name}/{resolved}"));
            }
        }
    }
}

fn extract_factbook_flag(reader: &dyn ZimReader, html_str: &str, path: &str, zim_name: &str, result: &mut Preview) {
    let scan = byte_prefix(html_str, FLAG_SCAN_BYTES);
    let img_re = regex::Regex::new(r"(?i)<img\b([^>]*)>").unwrap();
    let alt_re = regex::Regex::new(r#"(?i)alt=["']([^"']*)["']"#).unwrap();
    let src_re = regex::Regex::new(r#"(?i)src=["']([^"']+)["']"#).unwrap();
    for caps in img_re.captures_iter(scan) {
        let attrs = &caps[1];
        let Some(src_caps) = src_re.captures(attrs) else { continue };
        let src = &src_caps[1];
        let is_flag = alt_re.captures(attrs).map(|a| a[1].to_lowercase().contains("flag")).unwrap_or(false)
            || src.to_lowercase().contains("flag");
        if is_flag && !src.starts_with("http") && !src.starts_with("//") && !src.starts_with("data:") {
            if let Some(resolved) = resolve_img_path(reader, path, src) {
                result.thumbnail = Some(format!("/w/{zim_name}/{resolved}"));
                return;
            }
        }
    }
}

fn extract_factbook_locator(reader: &dyn ZimReader, html_str: &str, path: &str, zim_name: &str, result: &mut Preview) {
    let scan = byte_prefix(html_str, FLAG_SCAN_BYTES);
    let img_re = regex::Regex::new(r"(?i)<img\b([^>]*)>").unwrap();
    let src_re = regex::Regex::new(r#"(?i)src=["']([^"']+)["']"#).unwrap();
    for caps in img_re.captures_iter(scan) {
        let Some(src_caps) = src_re.captures(&caps[1]) else { continue };
        let src = &src_caps[1];
        if src.to_lowercase().contains("locator-map") && !src.starts_with("http") && !src.starts_with("//") && !src.starts_with("data:") {
            if let Some(resolved) = resolve_img_path(reader, path, src) {
                result.thumbnail = Some(format!("/w/{zim_name}/{resolved}"));
                return;
            }
        }
    }
}

fn extract_xkcd_blurb(html_str: &str, result: &mut Preview) {
    let img_re = regex::Regex::new(r"(?i)<img\b([^>]*)>").unwrap();
    let title_re = regex::Regex::new(r#"(?i)title=["']([^"']+)["']"#).unwrap();
    for caps in img_re.captures_iter(html_str) {
        let attrs = &caps[1];
        let Some(title_caps) = title_re.captures(attrs) else { continue };
        let raw = title_caps[1].trim();
        if raw.chars().count() > 20 {
            let text = unescape_entities(raw);
            if !text.to_lowercase().contains("license") && !text.to_lowercase().contains("creative commons") {
                result.blurb = Some(text.chars().take(200).collect());
                return;
            }
        }
    }
}

fn extract_gutenberg_author(html_str: &str, result: &mut Preview) {
    let scan = byte_prefix(html_str, 8000);
    let re1 = regex::Regex::new(r#"(?i)<meta\s+content="([^"]+)"\s+name="dc\.creator""#).unwrap();
    let re2 = regex::Regex::new(r#"(?i)<meta\s+name="dc\.creator"\s+content="([^"]+)""#).unwrap();
    let Some(raw) = re1.captures(scan).or_else(|| re2.captures(scan)).map(|c| c[1].trim().to_string()) else { return };
    let mut author = raw;
    if author.contains(',') {
        let parts: Vec<&str> = author.split(',').collect();
        let last = parts[0].trim().to_string();
        let first = parts.get(1).map(|p| p.trim().to_string()).unwrap_or_default();
        author = if !first.is_empty() && !first.starts_with(|c: char| c.is_ascii_digit()) {
            format!("{first} {last}")
        } else {
            last
        };
    }
    if !author.is_empty() && author.to_lowercase() != "various" {
        result.author = Some(author.chars().take(100).collect());
    }
}

const POS_WORDS: &[&str] = &[
    "noun", "verb", "adjective", "adverb", "pronoun", "preposition", "conjunction", "interjection", "determiner",
    "particle", "prefix", "suffix",
];

fn boring_definition_re() -> regex::Regex {
    regex::Regex::new(
        r"(?i)^(plural of |third-person |simple past |past participle |present participle |alternative |archaic |obsolete |misspelling |eye dialect |nonstandard )",
    )
    .unwrap()
}

fn extract_pos_and_definition(section: &str, result: &mut Preview) {
    let pos_re = regex::Regex::new(r"(?is)<h[34][^>]*>(.*?)</h").unwrap();
    for caps in pos_re.captures_iter(section) {
        let text = strip_html(&caps[1]).to_lowercase();
        if POS_WORDS.contains(&text.as_str()) {
            result.part_of_speech = Some(text);
            break;
        }
    }
    let boring = boring_definition_re();
    let def_re = regex::Regex::new(r"(?s)<ol[^>]*>\s*<li[^>]*>(.*?)</li>").unwrap();
    for caps in def_re.captures_iter(section) {
        let def_text = strip_html(&caps[1]);
        let def_text = def_text.split('\n').next().unwrap_or("").trim().to_string();
        if def_text.len() > 5 && !def_text.starts_with("Category:") && !def_text.starts_with("See also") {
            if boring.is_match(&def_text) {
                result.boring = true;
            } else {
                result.blurb = Some(def_text.chars().take(200).collect());
            }
            break;
        }
    }
}

/// English-only Wiktionary definition/part-of-speech extraction, including
/// Simple Wiktionary's flat (no per-language `<h2>`) layout.
fn extract_wiktionary(html_str: &str, zim_lower: &str, result: &mut Preview) {
    let scan = byte_prefix(html_str, 30_000);
    let eng_re = regex::Regex::new(r#"(?i)<h2[^>]*id=["']English["']"#).unwrap();
    if let Some(eng_m) = eng_re.find(scan) {
        let eng_start = eng_m.start();
        let after = char_boundary_ceil(scan, eng_start + 50);
        let tail = &scan[after..];
        let next_h2 = regex::Regex::new(r#"(?i)<h2[^>]*id="#).unwrap().find(tail);
        let eng_end = next_h2.map(|m| after + m.start()).unwrap_or(scan.len());
        let section = &scan[eng_start..eng_end];
        extract_pos_and_definition(section, result);
    } else if zim_lower.contains("simple") {
        let section = scan;
        let pos_re = regex::Regex::new(r"(?is)<h[234][^>]*>(.*?)</h").unwrap();
        for caps in pos_re.captures_iter(section) {
            let text = strip_html(&caps[1]).to_lowercase();
            if POS_WORDS.contains(&text.as_str()) {
                result.part_of_speech = Some(text);
                break;
            }
        }
        if result.part_of_speech.is_none() {
            let inline = regex::Regex::new(r"\((\w+)\)").unwrap();
            let head = byte_prefix(section, 3000);
            if let Some(caps) = inline.captures(head) {
                let word = caps[1].to_lowercase();
                if matches!(word.as_str(), "noun" | "verb" | "adjective" | "adverb") {
                    let mut c = word.chars();
                    result.part_of_speech = c.next().map(|f| f.to_uppercase().collect::<String>() + c.as_str());
                }
            }
        }
        let boring = boring_definition_re();
        let def_re = regex::Regex::new(r"(?s)<ol[^>]*>\s*<li[^>]*>(.*?)</li>").unwrap();
        for caps in def_re.captures_iter(section) {
            let def_text = strip_html(&caps[1]);
            let def_text = def_text.split('\n').next().unwrap_or("").trim().to_string();
            if def_text.len() > 5 && !def_text.starts_with("Category:") && !def_text.starts_with("See also") {
                if boring.is_match(&def_text) {
                    result.boring = true;
                } else {
                    result.blurb = Some(def_text.chars().take(200).collect());
                }
                break;
            }
        }
    } else {
        result.non_english = true;
    }
}

fn extract_blurb_meta(html_str: &str, result: &mut Preview) {
    const PATTERNS: &[&str] = &[
        r#"(?i)<meta\s+property=["']og:description["']\s+content=["']([^"']+)["']"#,
        r#"(?i)<meta\s+content=["']([^"']+)["']\s+property=["']og:description["']"#,
        r#"(?i)<meta\s+name=["']description["']\s+content=["']([^"']+)["']"#,
        r#"(?i)<meta\s+content=["']([^"']+)["']\s+name=["']description["']"#,
    ];
    for pattern in PATTERNS {
        if let Some(caps) = regex::Regex::new(pattern).unwrap().captures(html_str) {
            let text = caps[1].trim();
            if text.chars().count() > 20 {
                result.blurb = Some(unescape_entities(text).chars().take(200).collect());
                return;
            }
        }
    }
}

fn extract_blurb_fallback(html_str: &str, result: &mut Preview) {
    let skip = regex::Regex::new(
        r"(?i)(Creative Commons|This work is licensed|free to copy and share|All rights reserved|Copyright \d|DMCA)",
    )
    .unwrap();
    let p_re = regex::Regex::new(r"(?is)<p\b[^>]*>(.*?)</p>").unwrap();
    for caps in p_re.captures_iter(html_str) {
        let text = strip_html(&caps[1]);
        if text.len() > 40 && !skip.is_match(&text) {
            result.blurb = Some(text.chars().take(200).collect());
            return;
        }
    }
}

fn extract_thumbnail_meta(reader: &dyn ZimReader, html_str: &str, path: &str, zim_name: &str, result: &mut Preview) -> bool {
    const PATTERNS: &[&str] = &[
        r#"(?i)<meta\s+property=["']og:image["']\s+content=["']([^"']+)["']"#,
        r#"(?i)<meta\s+content=["']([^"']+)["']\s+property=["']og:image["']"#,
        r#"(?i)<meta\s+name=["']twitter:image["']\s+content=["']([^"']+)["']"#,
        r#"(?i)<meta\s+content=["']([^"']+)["']\s+name=["']twitter:image["']"#,
    ];
    for pattern in PATTERNS {
        let Some(caps) = regex::Regex::new(pattern).unwrap().captures(html_str) else { continue };
        let src = &caps[1];
        if src.starts_with("http://") || src.starts_with("https://") || src.starts_with("//") {
            continue;
        }
        if !src.to_lowercase().ends_with(".svg") {
            if let Some(resolved) = resolve_img_path(reader, path, src) {
                result.thumbnail = Some(format!("/w/{zim_name}/{resolved}"));
                return true;
            }
        }
    }
    false
}

const CHROME_IMAGE_BASENAMES: &[&str] = &[
    "home_on.png",
    "home_off.png",
    "banner_ext2.png",
    "photo_on.gif",
    "one-page-summary.png",
    "travel-facts.png",
];

/// Score every candidate content `<img>` by pixel area, penalizing banner
/// aspect ratios and rewarding meaningful alt text, and return the winner.
fn extract_thumbnail_scored(reader: &dyn ZimReader, html_str: &str, path: &str, zim_name: &str) -> Option<String> {
    let img_re = regex::Regex::new(r"(?i)<img\b([^>]*)>").unwrap();
    let src_re = regex::Regex::new(r#"src=["']([^"']+)["']"#).unwrap();
    let w_re = regex::Regex::new(r#"width=["']?(\d+)"#).unwrap();
    let h_re = regex::Regex::new(r#"height=["']?(\d+)"#).unwrap();
    let alt_re = regex::Regex::new(r#"alt=["']([^"']+)["']"#).unwrap();
    let chrome_tag_re = regex::Regex::new(r"(?i)<(header|nav|footer)\b").unwrap();
    let chrome_close_re = regex::Regex::new(r"(?i)</(header|nav|footer)>").unwrap();

    let mut best_img: Option<String> = None;
    let mut best_score = 0.0f64;
    for caps in img_re.captures_iter(html_str) {
        let attrs = &caps[1];
        let Some(src_caps) = src_re.captures(attrs) else { continue };
        let src = &src_caps[1];
        if src.starts_with("data:") || src.starts_with("http") || src.starts_with("//") {
            continue;
        }
        let lower = src.to_lowercase();
        if lower.ends_with(".svg") || lower.ends_with(".svg.png") {
            continue;
        }
        let base = src.rsplit('/').next().unwrap_or(src).to_lowercase();
        if CHROME_IMAGE_BASENAMES.contains(&base.as_str()) {
            continue;
        }
        let w_m = w_re.captures(attrs);
        let h_m = h_re.captures(attrs);
        let has_dims = w_m.is_some() || h_m.is_some();
        let w: u64 = w_m.and_then(|c| c[1].parse().ok()).unwrap_or(400);
        let h: u64 = h_m.and_then(|c| c[1].parse().ok()).unwrap_or(300);
        if w < 50 || h < 50 {
            continue;
        }

        let whole = caps.get(0).unwrap();
        let ctx_start = char_boundary_ceil(html_str, whole.start().saturating_sub(300));
        let ctx = &html_str[ctx_start..whole.start()].to_lowercase();
        if chrome_tag_re.is_match(ctx) && !chrome_close_re.is_match(ctx) {
            continue;
        }

        let area = (w * h) as f64;
        let ratio = w.max(h) as f64 / w.min(h).max(1) as f64;
        let mut score = area;
        if ratio > 4.0 {
            score *= 0.2;
        }
        if let Some(alt_caps) = alt_re.captures(attrs) {
            let alt = &alt_caps[1];
            if alt.len() > 3 && !matches!(alt.to_lowercase().as_str(), "logo" | "icon" | "banner" | "spacer") {
                score *= 1.5;
            }
        }
        if !has_dims {
            score *= 1.3;
        }
        if score > best_score {
            if let Some(resolved) = resolve_img_path(reader, path, src) {
                best_img = Some(format!("/w/{zim_name}/{resolved}"));
                best_score = score;
            }
        }
    }
    best_img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MockZimReader, ZimEntry, ZimMetadata};

    fn reader_with(path: &str, title: &str, content: &str) -> MockZimReader {
        MockZimReader::new(
            vec![ZimEntry {
                path: path.to_string(),
                title: title.to_string(),
                mimetype: "text/html".into(),
                content: content.as_bytes().to_vec(),
                redirect_target: None,
            }],
            ZimMetadata::default(),
        )
    }

    #[test]
    fn og_description_wins_over_first_paragraph() {
        let html = r#"<html><head>
            <meta property="og:description" content="A proper summary of the article, long enough.">
        </head><body><p>Some unrelated boilerplate paragraph that is long enough to qualify.</p></body></html>"#;
        let reader = reader_with("A/Foo", "Foo", html);
        let preview = extract_preview(&reader, "some_zim", "A/Foo");
        assert_eq!(preview.blurb.as_deref(), Some("A proper summary of the article, long enough."));
    }

    #[test]
    fn falls_back_to_first_substantial_paragraph() {
        let html = r#"<html><body><p>Tiny.</p><p>This paragraph is long enough to count as the blurb for this article.</p></body></html>"#;
        let reader = reader_with("A/Foo", "Foo", html);
        let preview = extract_preview(&reader, "some_zim", "A/Foo");
        assert_eq!(preview.blurb.as_deref(), Some("This paragraph is long enough to count as the blurb for this article."));
    }

    #[test]
    fn skips_license_boilerplate_paragraphs() {
        let html = r#"<html><body>
            <p>This work is licensed under the Creative Commons Attribution-ShareAlike License.</p>
            <p>A real paragraph describing the subject in reasonable detail here.</p>
        </body></html>"#;
        let reader = reader_with("A/Foo", "Foo", html);
        let preview = extract_preview(&reader, "some_zim", "A/Foo");
        assert_eq!(preview.blurb.as_deref(), Some("A real paragraph describing the subject in reasonable detail here."));
    }

    #[test]
    fn og_image_resolves_against_entry_directory() {
        let html = r#"<meta property="og:image" content="img/thumb.png">"#;
        let mut entries = vec![
            ZimEntry { path: "A/dir/Foo".into(), title: "Foo".into(), mimetype: "text/html".into(), content: html.as_bytes().to_vec(), redirect_target: None },
            ZimEntry { path: "A/dir/img/thumb.png".into(), title: "thumb".into(), mimetype: "image/png".into(), content: vec![], redirect_target: None },
        ];
        let reader = MockZimReader::new(std::mem::take(&mut entries), ZimMetadata::default());
        let preview = extract_preview(&reader, "some_zim", "A/dir/Foo");
        assert_eq!(preview.thumbnail.as_deref(), Some("/w/some_zim/A/dir/img/thumb.png"));
    }

    #[test]
    fn xkcd_uses_alt_text_as_blurb() {
        let html = r#"<img src="comic.png" title="This is a sufficiently long alt text for the comic panel">"#;
        let reader = reader_with("A/1", "1", html);
        let preview = extract_preview(&reader, "xkcd_en_all", "A/1");
        assert_eq!(preview.blurb.as_deref(), Some("This is a sufficiently long alt text for the comic panel"));
    }

    #[test]
    fn gutenberg_author_reordered_last_first() {
        let html = r#"<meta content="Adams, Henry, 1838-1918" name="dc.creator">"#;
        let reader = reader_with("A/1", "1", html);
        let preview = extract_preview(&reader, "gutenberg_en_all", "A/1");
        assert_eq!(preview.author.as_deref(), Some("Henry Adams"));
    }

    #[test]
    fn wiktionary_picks_up_part_of_speech_and_definition() {
        let html = r#"<h2 id="English">English</h2><h3>Noun</h3><ol><li>A domesticated carnivorous mammal.</li></ol>"#;
        let reader = reader_with("A/dog", "dog", html);
        let preview = extract_preview(&reader, "wiktionary_en_all", "A/dog");
        assert_eq!(preview.part_of_speech.as_deref(), Some("noun"));
        assert_eq!(preview.blurb.as_deref(), Some("A domesticated carnivorous mammal."));
    }

    #[test]
    fn wiktionary_boring_definition_is_flagged_not_used_as_blurb() {
        let html = r#"<h2 id="English">English</h2><h3>Verb</h3><ol><li>plural of cat</li></ol>"#;
        let reader = reader_with("A/cats", "cats", html);
        let preview = extract_preview(&reader, "wiktionary_en_all", "A/cats");
        assert!(preview.boring);
        assert!(preview.blurb.is_none());
    }

    #[test]
    fn non_english_full_wiktionary_is_flagged() {
        let html = r#"<h2 id="French">French</h2><ol><li>chien</li></ol>"#;
        let reader = reader_with("A/chien", "chien", html);
        let preview = extract_preview(&reader, "wiktionary_fr_all", "A/chien");
        assert!(preview.non_english);
    }

    #[test]
    fn scored_img_prefers_larger_non_banner_image_with_alt_text() {
        let html = r#"
            <img src="banner.jpg" width="2000" height="200">
            <img src="content.jpg" width="600" height="400" alt="A descriptive photo of the subject">
        "#;
        let mut entries = vec![
            ZimEntry { path: "A/Foo".into(), title: "Foo".into(), mimetype: "text/html".into(), content: html.as_bytes().to_vec(), redirect_target: None },
            ZimEntry { path: "A/banner.jpg".into(), title: "b".into(), mimetype: "image/jpeg".into(), content: vec![], redirect_target: None },
            ZimEntry { path: "A/content.jpg".into(), title: "c".into(), mimetype: "image/jpeg".into(), content: vec![], redirect_target: None },
        ];
        let reader = MockZimReader::new(std::mem::take(&mut entries), ZimMetadata::default());
        let preview = extract_preview(&reader, "some_zim", "A/Foo");
        assert_eq!(preview.thumbnail.as_deref(), Some("/w/some_zim/A/content.jpg"));
    }

    #[test]
    fn redirect_entries_are_followed_before_extraction() {
        let html = r#"<p>This paragraph is long enough to count as the blurb for this redirected article.</p>"#;
        let entries = vec![
            ZimEntry { path: "A/Alias".into(), title: "Alias".into(), mimetype: "text/html".into(), content: vec![], redirect_target: Some("A/Real".into()) },
            ZimEntry { path: "A/Real".into(), title: "Real".into(), mimetype: "text/html".into(), content: html.as_bytes().to_vec(), redirect_target: None },
        ];
        let reader = MockZimReader::new(entries, ZimMetadata::default());
        let preview = extract_preview(&reader, "some_zim", "A/Alias");
        assert!(preview.blurb.is_some());
    }

    #[test]
    fn missing_entry_returns_default_preview() {
        let reader = reader_with("A/Foo", "Foo", "<p>content</p>");
        let preview = extract_preview(&reader, "some_zim", "A/Missing");
        assert_eq!(preview, Preview::default());
    }

    #[test]
    fn plain_text_strips_tags_and_collapses_whitespace() {
        let reader = reader_with("A/Foo", "Foo", "<p>Hello   <b>world</b></p>\n<p>Second paragraph.</p>");
        let text = plain_text(&reader, "A/Foo", None).unwrap();
        assert_eq!(text, "Hello world Second paragraph.");
    }

    #[test]
    fn plain_text_truncates_to_max_length() {
        let reader = reader_with("A/Foo", "Foo", "<p>Hello world</p>");
        let text = plain_text(&reader, "A/Foo", Some(5)).unwrap();
        assert_eq!(text, "Hello");
    }

    #[test]
    fn plain_text_missing_entry_returns_none() {
        let reader = reader_with("A/Foo", "Foo", "<p>content</p>");
        assert!(plain_text(&reader, "A/Missing", None).is_none());
    }
}
