//! Raw field name normalization and collision resolution.
//!
//! `normalize` turns an arbitrary human-authored field name into a candidate
//! identifier matching `^[a-zA-Z][a-zA-Z0-9]*$` (except the deliberate
//! fallback branch, which is still a valid identifier). `CollisionResolver`
//! turns a candidate into a safe name that is unique within one table's
//! namespace. The persisted `(table, raw, safe)` triple — not this algorithm
//! — is the source of truth for names that have been resolved before; see
//! [`crate::registry::SchemaRegistry::resolve_field`].

use std::collections::HashSet;
use std::fmt::Write as _;

use heck::ToLowerCamelCase;
use sha2::{Digest, Sha256};

/// Portable identifier ceiling across common storage engines.
pub const MAX_IDENTIFIER_LEN: usize = 63;
/// Trailing bytes reserved for the numeric uniqueness suffix.
pub const SUFFIX_HEADROOM: usize = 8;
/// Prefix of the deterministic fallback identifier.
pub const FALLBACK_PREFIX: &str = "field_";

const RESERVED_SUFFIX: &str = "Field";

/// Lowercased identifiers that may not be used verbatim as column names:
/// SQL keywords, the literal `id`, and the standard column set every synced
/// table carries.
const RESERVED_WORDS: &[&str] = &[
    "add", "all", "alter", "and", "as", "asc", "between", "by", "case", "check", "column",
    "commit", "constraint", "create", "cross", "current", "default", "delete", "desc",
    "distinct", "drop", "else", "end", "escape", "except", "exists", "foreign", "from", "full",
    "group", "having", "id", "in", "index", "inner", "insert", "intersect", "into", "is",
    "join", "key", "left", "like", "limit", "not", "null", "offset", "on", "or", "order",
    "outer", "primary", "references", "right", "rollback", "row", "rows", "select", "set",
    "table", "then", "to", "transaction", "union", "unique", "update", "user", "values",
    "when", "where",
    // standard columns, reserved at the namespace level
    "externalid", "createdat", "updatedat", "isdeleted",
];

/// Normalizes a raw field name into a candidate identifier. Never fails and
/// always returns a non-empty string.
pub fn normalize(raw: &str) -> String {
    if raw.trim().is_empty() {
        return fallback_token(raw);
    }
    let folded = fold_to_ascii(raw);
    let collapsed = collapse_whitespace(&folded);
    if collapsed.is_empty() {
        return fallback_token(raw);
    }
    let mut candidate = collapsed.to_lower_camel_case();
    if candidate.is_empty() {
        return fallback_token(raw);
    }
    if candidate.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        candidate.insert(0, 'f');
    }
    candidate
}

/// Deterministic fallback identifier for names that normalize to nothing:
/// `field_` plus the first six bytes of the SHA-256 of the raw name. Hashing
/// instead of random bytes keeps repeat discovery runs reproducible.
pub fn fallback_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut token = String::with_capacity(FALLBACK_PREFIX.len() + 12);
    token.push_str(FALLBACK_PREFIX);
    for byte in &digest[..6] {
        let _ = write!(token, "{byte:02x}");
    }
    token
}

fn fold_to_ascii(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push(' ');
        } else if let Some(folded) = fold_diacritic(ch) {
            out.push_str(folded);
        }
        // anything else (punctuation, symbols, unfoldable non-ASCII) drops
    }
    out
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folds precomposed Latin letters to their base ASCII form.
fn fold_diacritic(ch: char) -> Option<&'static str> {
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'ç' | 'ć' | 'č' => "c",
        'Ç' | 'Ć' | 'Č' => "C",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' => "I",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' => "Y",
        'š' | 'ś' => "s",
        'Š' | 'Ś' => "S",
        'ž' | 'ź' | 'ż' => "z",
        'Ž' | 'Ź' | 'Ż' => "Z",
        'đ' => "d",
        'Đ' => "D",
        'ł' => "l",
        'Ł' => "L",
        'ß' => "ss",
        'æ' => "ae",
        'Æ' => "AE",
        'œ' => "oe",
        'Œ' => "OE",
        'þ' => "th",
        'ð' => "d",
        _ => return None,
    };
    Some(folded)
}

/// Resolves candidate identifiers against the set of safe names already
/// taken in one table's namespace.
#[derive(Debug)]
pub struct CollisionResolver<'a> {
    taken: &'a HashSet<String>,
}

impl<'a> CollisionResolver<'a> {
    pub fn new(taken: &'a HashSet<String>) -> Self {
        Self { taken }
    }

    /// Produces a safe name for `candidate`: reserved-word suffix first, then
    /// length truncation leaving suffix headroom, then a monotonically
    /// increasing numeric suffix until the name is free.
    pub fn resolve(&self, candidate: &str) -> String {
        let mut safe = if is_reserved(candidate) {
            format!("{candidate}{RESERVED_SUFFIX}")
        } else {
            candidate.to_string()
        };
        let max_len = MAX_IDENTIFIER_LEN - SUFFIX_HEADROOM;
        if safe.len() > max_len {
            // candidates are ASCII by construction, so byte truncation is safe
            safe.truncate(max_len);
        }
        if !self.taken.contains(&safe) {
            return safe;
        }
        let mut suffix = 1u64;
        loop {
            let attempt = format!("{safe}{suffix}");
            if !self.taken.contains(&attempt) {
                return attempt;
            }
            suffix += 1;
        }
    }
}

fn is_reserved(candidate: &str) -> bool {
    let lowered = candidate.to_ascii_lowercase();
    RESERVED_WORDS.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_fresh(candidate: &str) -> String {
        let taken = HashSet::new();
        CollisionResolver::new(&taken).resolve(candidate)
    }

    #[test]
    fn normalize_camel_cases_and_fixes_leading_digit() {
        assert_eq!(normalize("2nd Payment %"), "f2ndPayment");
        assert_eq!(normalize("Order ID"), "orderId");
        assert_eq!(normalize("  total   amount  "), "totalAmount");
    }

    #[test]
    fn normalize_folds_diacritics_and_drops_other_non_ascii() {
        assert_eq!(normalize("Prénom"), "prenom");
        assert_eq!(normalize("Straße"), "strasse");
        assert_eq!(normalize("日本語 label"), "label");
    }

    #[test]
    fn normalize_strips_punctuation_without_splitting_tokens() {
        assert_eq!(normalize("e-mail"), "email");
        assert_eq!(normalize("_id"), "id");
    }

    #[test]
    fn degenerate_names_get_a_deterministic_fallback() {
        let first = normalize("%%%");
        let second = normalize("%%%");
        assert_eq!(first, second);
        assert!(first.starts_with(FALLBACK_PREFIX));
        assert_eq!(first.len(), FALLBACK_PREFIX.len() + 12);
        assert_ne!(normalize("%%%"), normalize("$$$"));
        assert!(normalize("").starts_with(FALLBACK_PREFIX));
        assert!(normalize("   ").starts_with(FALLBACK_PREFIX));
    }

    #[test]
    fn reserved_words_get_the_field_suffix() {
        assert_eq!(resolve_fresh("id"), "idField");
        assert_eq!(resolve_fresh("select"), "selectField");
        assert_eq!(resolve_fresh("externalId"), "externalIdField");
        assert_eq!(resolve_fresh("status"), "status");
    }

    #[test]
    fn collisions_walk_a_numeric_suffix() {
        let mut taken = HashSet::new();
        taken.insert("status".to_string());
        taken.insert("status1".to_string());
        let resolver = CollisionResolver::new(&taken);
        assert_eq!(resolver.resolve("status"), "status2");
    }

    #[test]
    fn long_candidates_leave_room_for_the_suffix() {
        let long = "x".repeat(100);
        let safe = resolve_fresh(&long);
        assert_eq!(safe.len(), MAX_IDENTIFIER_LEN - SUFFIX_HEADROOM);

        let mut taken = HashSet::new();
        taken.insert(safe.clone());
        let next = CollisionResolver::new(&taken).resolve(&long);
        assert!(next.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(next, safe);
    }
}
