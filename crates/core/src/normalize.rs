//! Name normalization and the overlap scores shared by the matcher and merger.

use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::model::Attributes;

/// Canonical form of an entity name used for exact matching.
///
/// `"Smith, John"` becomes `"john smith"`, `"Zoë O'Brien-Hall"` becomes
/// `"zoe o brien hall"`: comma-swap, accents stripped, lowercased,
/// punctuation turned into spaces and runs of whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    let swapped = swap_comma_order(name.trim());
    let folded: String = swapped
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"Last, First Middle"` → `"First Middle Last"`. Names with zero or several
/// commas are returned unchanged.
fn swap_comma_order(name: &str) -> String {
    let mut parts = name.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(last), Some(first), None) if !last.trim().is_empty() && !first.trim().is_empty() => {
            format!("{} {}", first.trim(), last.trim())
        }
        _ => name.to_string(),
    }
}

/// Normalized tokens of `name`.
pub fn name_tokens(name: &str) -> Vec<String> {
    normalize_name(name)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// The normalized name plus the alternative forms a person is commonly
/// written in: middle initials dropped, first + last only, and surname first.
///
/// The first element is always the plain normalized name.
pub fn name_variants(name: &str) -> Vec<String> {
    let normalized = normalize_name(name);
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    let mut variants = vec![normalized.clone()];

    let mut push = |candidate: String| {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    if tokens.len() >= 3 {
        let last = tokens.len() - 1;
        let without_initials: Vec<&str> = tokens
            .iter()
            .enumerate()
            .filter(|(i, t)| *i == 0 || *i == last || t.chars().count() > 1)
            .map(|(_, t)| *t)
            .collect();
        push(without_initials.join(" "));
        push(format!("{} {}", tokens[0], tokens[last]));
        push(format!("{} {}", tokens[last], tokens[0]));
    }
    if tokens.len() >= 2 {
        let (last, rest) = tokens.split_last().map(|(l, r)| (*l, r.join(" "))).unwrap_or_default();
        push(format!("{last} {rest}"));
    }

    variants
}

/// Jaccard overlap of the normalized token sets of two names, in `[0, 1]`.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let a: BTreeSet<String> = name_tokens(a).into_iter().collect();
    let b: BTreeSet<String> = name_tokens(b).into_iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Share of keys, out of the union of both key sets, that carry the same
/// value on both sides. `None` when either side has no attributes.
pub fn attribute_overlap(a: &Attributes, b: &Attributes) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let union = a.keys().chain(b.keys()).collect::<BTreeSet<_>>().len();
    let agreeing = a
        .iter()
        .filter(|(k, v)| b.get(k.as_str()) == Some(*v))
        .count();
    Some(agreeing as f64 / union as f64)
}
