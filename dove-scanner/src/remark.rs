// Label rewriting for redistributed links

use crate::link::Scheme;
use rand::Rng;

pub const EMBLEM: &str = "🕊️";
pub const LABEL_TAG: &str = "freedom";

/// A fresh label: emblem, tag and a number drawn uniformly from 1000..=9999.
pub fn new_label<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{} {}-{}", EMBLEM, LABEL_TAG, rng.gen_range(1000..=9999))
}

pub fn rewrite_remark<R: Rng + ?Sized>(raw: &str, scheme: Scheme, rng: &mut R) -> String {
    rewrite_with_label(raw, scheme, &new_label(rng))
}

/// Replace the human-readable label of a link.
///
/// An existing fragment is replaced; otherwise a `remark=` query value is
/// rewritten for the schemes that use one; otherwise the label is appended as
/// a fragment. Host, port, identity and transport parameters are untouched.
pub fn rewrite_with_label(raw: &str, scheme: Scheme, label: &str) -> String {
    if let Some((base, _)) = raw.split_once('#') {
        return format!("{}#{}", base, label);
    }

    if scheme.supports_remark_query()
        && let Some(rewritten) = replace_remark_query(raw, label)
    {
        return rewritten;
    }

    format!("{}#{}", raw, label)
}

fn replace_remark_query(raw: &str, label: &str) -> Option<String> {
    let (base, query) = raw.split_once('?')?;
    let mut found = false;

    let pairs: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some(("remark", _)) => {
                found = true;
                format!("remark={}", label)
            }
            _ => pair.to_string(),
        })
        .collect();

    found.then(|| format!("{}?{}", base, pairs.join("&")))
}
