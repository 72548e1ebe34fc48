use once_cell::sync::Lazy;
use regex::Regex;

static RE_INLINE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("inline image pattern"));

static RE_IMG_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<img[^>]*>").expect("img tag pattern"));

/// Removes image references from converted Markdown. The external converter
/// emits links into its own asset store, which are dead weight inside the
/// knowledge base.
pub fn strip_image_references(markdown: &str) -> String {
    let without_inline = RE_INLINE_IMAGE.replace_all(markdown, "");
    RE_IMG_TAG.replace_all(&without_inline, "").into_owned()
}
