//! Key normalization per field family
//!
//! Each normalizer returns `None` when the raw value yields no usable key.

/// Leading run of identifier characters, separators removed
fn identifier_chars(raw: &str) -> String {
    raw.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x' || *c == '-')
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn ean13_check_digit(digits: &str) -> Option<char> {
    let mut sum = 0;
    for (i, c) in digits.chars().enumerate() {
        let d = c.to_digit(10)?;
        sum += if i % 2 == 0 { d } else { d * 3 };
    }
    char::from_digit((10 - sum % 10) % 10, 10)
}

/// ISBN-13 form of an ISBN-10 or ISBN-13, qualifiers like "(pbk.)" ignored
pub fn isbn(raw: &str) -> Option<String> {
    let chars = identifier_chars(raw);
    match chars.len() {
        13 if chars.chars().all(|c| c.is_ascii_digit()) => Some(chars),
        10 => {
            let body = &chars[..9];
            if !body.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let stem = format!("978{}", body);
            let check = ean13_check_digit(&stem)?;
            Some(format!("{}{}", stem, check))
        }
        _ => None,
    }
}

/// `NNNN-NNNN`, with an uppercase `X` check character
pub fn issn(raw: &str) -> Option<String> {
    let chars = identifier_chars(raw);
    if chars.len() != 8 || !chars[..7].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}-{}", &chars[..4], &chars[4..]))
}

/// Library of Congress normalization: blanks removed, revision suffix dropped, serial
/// part zero-padded to six digits
pub fn lccn(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.split('/').next().unwrap_or_default();

    let normalized = match compact.split_once('-') {
        Some((prefix, serial)) if !serial.is_empty() && serial.chars().all(|c| c.is_ascii_digit()) => {
            format!("{}{:0>6}", prefix, serial)
        }
        Some((prefix, serial)) => format!("{}{}", prefix, serial),
        None => compact.to_string(),
    };

    let normalized = normalized.to_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// `(PREFIX)number`, OCLC `ocm`/`ocn`/`on` markers and leading zeros stripped
///
/// Values without a parenthesized source prefix cannot be compared and yield `None`.
pub fn system_control_number(raw: &str) -> Option<String> {
    let rest = raw.trim().strip_prefix('(')?;
    let (prefix, number) = rest.split_once(')')?;
    let prefix = prefix.trim().to_uppercase();
    if prefix.is_empty() {
        return None;
    }

    let mut number = number.trim();
    for marker in ["ocm", "ocn", "on"] {
        if number
            .get(..marker.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(marker))
        {
            number = number[marker.len()..].trim_start();
            break;
        }
    }
    let number = number.trim_start_matches('0');
    if number.is_empty() {
        return None;
    }
    Some(format!("({}){}", prefix, number))
}

/// Lowercased words, punctuation treated as whitespace
pub fn text(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    (!words.is_empty()).then(|| words.join(" "))
}
