//! Text normalisation used for fuzzy lookups of human-entered names and
//! addresses.

/// Tokens that mark a customer name as a person rather than a company.
const HONORIFICS: &[&str] = &[
    "herr", "herrn", "frau", "familie", "fam", "dr", "prof", "mr", "mrs", "ms",
];

/// Trim, collapse inner whitespace and case-fold.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split an address hint such as `"Hauptstraße 10, Hamburg"` into normalised
/// fragments that must all be contained in a stored address.
pub fn address_fragments(hint: &str) -> Vec<String> {
    hint.split(',')
        .map(normalize)
        .filter(|f| !f.is_empty())
        .collect()
}

/// Compose the stored address text from its parts, skipping empty ones.
pub fn compose_address(street: &str, zip_code: Option<&str>, city: &str) -> String {
    let locality = match zip_code.map(str::trim).filter(|z| !z.is_empty()) {
        Some(zip) => format!("{} {}", zip, city.trim()),
        None => city.trim().to_string(),
    };
    [street.trim(), locality.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_honorific(token: &str) -> bool {
    let bare = token.trim_end_matches('.').to_lowercase();
    HONORIFICS.contains(&bare.as_str())
}

/// If `name` looks like a person ("Herrn Müller", "Fam. Schulz"), return the
/// name with honorifics removed. Company-style names return `None`.
pub fn person_name(name: &str) -> Option<String> {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    if !tokens.iter().any(|t| is_honorific(t)) {
        return None;
    }
    let rest: Vec<&str> = tokens.into_iter().filter(|t| !is_honorific(t)).collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    }
}
