//! Image references in graph descriptions
//!
//! Infrastructure diagrams are DOT text whose nodes point at icon files with
//! `image="..."` attributes. Before a diagram is rendered elsewhere those
//! paths need to be listed (to ship the files) or rewritten.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn image_attr() -> Option<&'static Regex> {
    static IMAGE_ATTR: OnceLock<Option<Regex>> = OnceLock::new();
    IMAGE_ATTR
        .get_or_init(|| Regex::new(r#"image="(.*?)""#).ok())
        .as_ref()
}

/// Every image path referenced by a diagram, in order of appearance
pub fn image_paths(diagram: &str) -> Vec<&str> {
    let Some(re) = image_attr() else {
        return Vec::new();
    };
    re.captures_iter(diagram)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Replace every image path with `rewrite(path)`
pub fn rewrite_images<F>(diagram: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> String,
{
    let Some(re) = image_attr() else {
        return diagram.to_string();
    };
    re.replace_all(diagram, |caps: &Captures<'_>| {
        let path = caps.get(1).map_or("", |m| m.as_str());
        format!("image=\"{}\"", rewrite(path))
    })
    .into_owned()
}
