//! Deterministic Thai romanization.
//!
//! A simplified RTGS table, character by character. Leading vowels are
//! written before their consonant but pronounced after it, so they are
//! emitted after the consonant that follows them. Characters outside the
//! table are dropped; ASCII letters and digits pass through.

fn consonant(ch: char) -> Option<&'static str> {
    let romanized = match ch {
        'ก' => "k",
        'ข' | 'ฃ' | 'ค' | 'ฅ' | 'ฆ' => "kh",
        'ง' => "ng",
        'จ' | 'ฉ' | 'ช' | 'ฌ' => "ch",
        'ซ' | 'ศ' | 'ษ' | 'ส' => "s",
        'ญ' | 'ย' => "y",
        'ฎ' | 'ด' => "d",
        'ฏ' | 'ต' => "t",
        'ฐ' | 'ฑ' | 'ฒ' | 'ถ' | 'ท' | 'ธ' => "th",
        'ณ' | 'น' => "n",
        'บ' => "b",
        'ป' => "p",
        'ผ' | 'พ' | 'ภ' => "ph",
        'ฝ' | 'ฟ' => "f",
        'ม' => "m",
        'ร' => "r",
        'ฤ' => "rue",
        'ล' | 'ฬ' => "l",
        'ฦ' => "lue",
        'ว' => "w",
        'ห' | 'ฮ' => "h",
        'อ' => "o",
        _ => return None,
    };
    Some(romanized)
}

fn vowel(ch: char) -> Option<&'static str> {
    let romanized = match ch {
        'ะ' | 'ั' | 'า' => "a",
        'ำ' => "am",
        'ิ' | 'ี' => "i",
        'ึ' | 'ื' => "ue",
        'ุ' | 'ู' => "u",
        'เ' => "e",
        'แ' => "ae",
        'โ' => "o",
        'ใ' | 'ไ' => "ai",
        _ => return None,
    };
    Some(romanized)
}

fn is_leading_vowel(ch: char) -> bool {
    matches!(ch, 'เ' | 'แ' | 'โ' | 'ใ' | 'ไ')
}

fn thai_digit(ch: char) -> Option<char> {
    let offset = u32::from(ch).checked_sub(u32::from('๐'))?;
    (offset < 10).then(|| char::from_digit(offset, 10)).flatten()
}

/// Romanizes `text`. Words are separated by `_`; the result may be empty.
#[must_use]
pub fn transliterate(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if is_leading_vowel(ch) {
            if let Some(next) = chars.get(i + 1).copied().and_then(consonant) {
                out.push_str(next);
                out.push_str(vowel(ch).unwrap_or_default());
                i += 2;
                continue;
            }
        }

        if let Some(romanized) = consonant(ch).or_else(|| vowel(ch)) {
            out.push_str(romanized);
        } else if let Some(digit) = thai_digit(ch) {
            out.push(digit);
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if ch.is_whitespace() || ch.is_ascii_punctuation() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }
        // Tone marks, thanthakhat and other signs are silent.
        i += 1;
    }

    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_words() {
        assert_eq!(transliterate("นา"), "na");
        assert_eq!(transliterate("ไก่"), "kai");
        assert_eq!(transliterate("เวลา"), "wela");
    }

    #[test]
    fn test_spaces_become_separators() {
        assert_eq!(transliterate("มา ดู"), "ma_du");
        assert_eq!(transliterate("  นา  "), "na");
    }

    #[test]
    fn test_digits_and_ascii_pass_through() {
        assert_eq!(transliterate("นา๒"), "na2");
        assert_eq!(transliterate("Box ๑"), "box_1");
    }

    #[test]
    fn test_is_deterministic() {
        let title = "ชื่อเล่นสัตว์เลี้ยง";
        assert_eq!(transliterate(title), transliterate(title));
        assert!(!transliterate(title).is_empty());
        assert!(transliterate(title).is_ascii());
    }

    #[test]
    fn test_unknown_script_yields_empty() {
        assert_eq!(transliterate("日本"), "");
    }
}
