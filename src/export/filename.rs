//! Artifact file names.

use crate::model::ItemRecord;
use std::path::Path;

/// Maximum file name length in characters, extension included.
pub const MAX_NAME_CHARS: usize = 100;
pub const EXTENSION: &str = "pdf";

/// Titles the feed shows for articles without a real title.
const PLACEHOLDER_TITLES: [&str; 2] = ["未命名文章", "untitled"];
const RESERVED: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replace reserved and control characters with `_` and trim whitespace, dots and underscores
/// from both ends.
pub fn sanitize(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| {
            if c.is_control() || RESERVED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    trim_name(&replaced).to_string()
}

fn trim_name(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || c == '.' || c == '_')
}

fn is_placeholder(title: &str) -> bool {
    title.is_empty()
        || PLACEHOLDER_TITLES
            .iter()
            .any(|p| title.eq_ignore_ascii_case(p))
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// File name for `record`: `<free|paid>-<id>-<title>.pdf` when the link carries a stable id,
/// else `<title>.pdf`. `ordinal` (1-based position in the batch) names untitled articles.
pub fn target_name(record: &ItemRecord, ordinal: usize) -> String {
    let title = sanitize(&record.title);
    let title = if is_placeholder(&title) {
        format!("item_{}", ordinal)
    } else {
        title
    };
    let stem = match record.stable_id().map(|id| sanitize(&id)).filter(|id| !id.is_empty()) {
        Some(id) => format!("{}-{}-{}", record.access_tag(), id, title),
        None => title,
    };
    with_extension(&stem, ordinal)
}

fn with_extension(stem: &str, ordinal: usize) -> String {
    let budget = MAX_NAME_CHARS - EXTENSION.len() - 1;
    let stem = trim_name(truncate_chars(stem, budget));
    if stem.is_empty() {
        format!("item_{}.{}", ordinal, EXTENSION)
    } else {
        format!("{}.{}", stem, EXTENSION)
    }
}

/// `name` if nothing by that name exists in `dir`, otherwise the first free `<stem> (n).<ext>`,
/// still within [MAX_NAME_CHARS].
pub fn unique_target(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(EXTENSION);
    let mut n = 1usize;
    loop {
        let suffix = format!(" ({}).{}", n, ext);
        let room = MAX_NAME_CHARS.saturating_sub(suffix.chars().count());
        let candidate = format!("{}{}", truncate_chars(stem, room), suffix);
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::record;

    #[test]
    fn reserved_characters_replaced() {
        assert_eq!(sanitize("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize("x<y>z\"w|v?u\\t"), "x_y_z_w_v_u_t");
        assert_eq!(sanitize("tab\there\nnewline"), "tab_here_newline");
    }

    #[test]
    fn edges_trimmed() {
        assert_eq!(sanitize("  ..title__ "), "title");
        assert_eq!(sanitize("???"), "");
    }

    #[test]
    fn name_has_access_tag_and_id() {
        let mut r = record("https://mp.weixin.qq.com/s?__biz=X&mid=2247&idx=2&sn=a", "a/b:c*d", "");
        assert_eq!(target_name(&r, 1), "free-2247_2-a_b_c_d.pdf");
        r.is_free = false;
        assert_eq!(target_name(&r, 1), "paid-2247_2-a_b_c_d.pdf");
    }

    #[test]
    fn name_without_id_is_title_only() {
        let r = record("https://mp.weixin.qq.com/s", "Plain", "");
        assert_eq!(target_name(&r, 4), "Plain.pdf");
    }

    #[test]
    fn empty_or_placeholder_title_gets_synthetic_name() {
        for title in ["", "  ", "///", "未命名文章", "Untitled"] {
            let r = record("https://mp.weixin.qq.com/s", title, "");
            assert_eq!(target_name(&r, 7), "item_7.pdf", "title {:?}", title);
        }
        let with_id = record("https://mp.weixin.qq.com/s/tok123", "", "");
        assert_eq!(target_name(&with_id, 2), "free-tok123-item_2.pdf");
    }

    #[test]
    fn long_titles_capped_including_extension() {
        let r = record("https://mp.weixin.qq.com/s?mid=1&idx=1", &"长".repeat(300), "");
        let name = target_name(&r, 1);
        assert_eq!(name.chars().count(), MAX_NAME_CHARS);
        assert!(name.ends_with(".pdf"));
        assert!(!name.chars().any(|c| RESERVED.contains(&c)));
    }

    #[test]
    fn collision_gets_numbered_suffix() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(unique_target(dir.path(), "a.pdf"), "a.pdf");
        std::fs::write(dir.path().join("a.pdf"), b"x")?;
        assert_eq!(unique_target(dir.path(), "a.pdf"), "a (1).pdf");
        std::fs::write(dir.path().join("a (1).pdf"), b"x")?;
        assert_eq!(unique_target(dir.path(), "a.pdf"), "a (2).pdf");

        let long = format!("{}.pdf", "x".repeat(96));
        std::fs::write(dir.path().join(&long), b"x")?;
        let next = unique_target(dir.path(), &long);
        assert!(next.ends_with(" (1).pdf"));
        assert_eq!(next.chars().count(), MAX_NAME_CHARS);
        Ok(())
    }
}
