//! Offline phrase dictionary.
//!
//! Matches whole titles first, then replaces known phrases left to right,
//! longest phrase first. Thai script has no word spacing, so greedy
//! longest-match is what splits a title into words.

use std::collections::{BTreeMap, HashMap};

/// Built-in vocabulary of common form titles.
const BUILTIN: &[(&str, &str)] = &[
    ("ชื่อ-นามสกุล", "full_name"),
    ("ชื่อเต็ม", "full_name"),
    ("ชื่อ", "name"),
    ("นามสกุล", "surname"),
    ("เบอร์โทรศัพท์", "phone_number"),
    ("เบอร์โทร", "phone"),
    ("โทรศัพท์", "telephone"),
    ("อีเมล", "email"),
    ("อีเมล์", "email"),
    ("ที่อยู่", "address"),
    ("วันที่", "date"),
    ("เวลา", "time"),
    ("วันเกิด", "birth_date"),
    ("อายุ", "age"),
    ("เพศ", "gender"),
    ("จังหวัด", "province"),
    ("อำเภอ", "district"),
    ("ตำบล", "subdistrict"),
    ("รหัสไปรษณีย์", "postal_code"),
    ("แบบฟอร์ม", "form"),
    ("ฟอร์ม", "form"),
    ("บันทึก", "record"),
    ("ข้อมูล", "data"),
    ("ติดต่อ", "contact"),
    ("ลูกค้า", "customer"),
    ("พนักงาน", "employee"),
    ("แผนก", "department"),
    ("ตำแหน่งที่ตั้ง", "location"),
    ("ตำแหน่ง", "position"),
    ("บริษัท", "company"),
    ("โรงงาน", "factory"),
    ("สินค้า", "product"),
    ("จำนวน", "quantity"),
    ("ราคา", "price"),
    ("หมายเหตุ", "note"),
    ("รายละเอียด", "details"),
    ("รูปภาพ", "image"),
    ("ไฟล์", "file"),
    ("เอกสาร", "document"),
    ("สถานะ", "status"),
    ("คะแนน", "score"),
    ("ความคิดเห็น", "comment"),
    ("ความพึงพอใจ", "satisfaction"),
    ("ประเภท", "type"),
    ("เลขที่", "number"),
    ("รหัส", "code"),
    ("พิกัด", "coordinates"),
    ("การตรวจสอบ", "inspection"),
    ("ตรวจสอบ", "inspect"),
    ("ผู้ตรวจ", "inspector"),
    ("คุณภาพ", "quality"),
    ("และ", "and"),
];

/// Phrase to identifier lookup table.
#[derive(Debug, Clone)]
pub struct Dictionary {
    exact: HashMap<String, String>,
    // Longest phrase first, for greedy partial matching.
    phrases: Vec<(String, String)>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Dictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            phrases: Vec::new(),
        }
    }

    /// Creates the built-in dictionary.
    #[must_use]
    pub fn builtin() -> Self {
        let mut dictionary = Self::empty();
        for (phrase, name) in BUILTIN {
            dictionary.insert(*phrase, *name);
        }
        dictionary
    }

    /// Adds configured entries on top of the current ones.
    #[must_use]
    pub fn with_entries(mut self, entries: &BTreeMap<String, String>) -> Self {
        for (phrase, name) in entries {
            self.insert(phrase.as_str(), name.as_str());
        }
        self
    }

    /// Adds or replaces one entry.
    pub fn insert(&mut self, phrase: impl Into<String>, name: impl Into<String>) {
        let phrase = phrase.into().trim().to_lowercase();
        let name = name.into();
        if phrase.is_empty() {
            return;
        }
        self.phrases.retain(|(p, _)| *p != phrase);
        self.phrases.push((phrase.clone(), name.clone()));
        self.phrases
            .sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then(a.0.cmp(&b.0)));
        self.exact.insert(phrase, name);
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len()
    }

    /// Returns true if the dictionary has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Looks up a title.
    ///
    /// Returns words joined by `_`, or `None` if any non-ASCII text is left
    /// unmatched.
    #[must_use]
    pub fn lookup(&self, title: &str) -> Option<String> {
        let title = title.trim().to_lowercase();
        if let Some(name) = self.exact.get(&title) {
            return Some(name.clone());
        }

        let mut words: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut rest = title.as_str();

        while let Some(ch) = rest.chars().next() {
            if let Some((phrase, name)) = self
                .phrases
                .iter()
                .find(|(phrase, _)| rest.starts_with(phrase.as_str()))
            {
                flush(&mut current, &mut words);
                words.push(name.clone());
                rest = &rest[phrase.len()..];
                continue;
            }

            if ch.is_ascii_alphanumeric() {
                current.push(ch);
            } else if ch.is_ascii() || ch.is_whitespace() {
                flush(&mut current, &mut words);
            } else {
                return None;
            }
            rest = &rest[ch.len_utf8()..];
        }
        flush(&mut current, &mut words);

        if words.is_empty() {
            None
        } else {
            Some(words.join("_"))
        }
    }
}

fn flush(current: &mut String, words: &mut Vec<String>) {
    if !current.is_empty() {
        words.push(std::mem::take(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let dictionary = Dictionary::builtin();
        assert_eq!(dictionary.lookup("อีเมล").as_deref(), Some("email"));
        assert_eq!(dictionary.lookup("  ชื่อเต็ม ").as_deref(), Some("full_name"));
    }

    #[test]
    fn test_longest_phrase_wins() {
        let dictionary = Dictionary::builtin();
        assert_eq!(
            dictionary.lookup("แบบฟอร์มติดต่อลูกค้า").as_deref(),
            Some("form_contact_customer")
        );
        assert_eq!(
            dictionary.lookup("เบอร์โทรศัพท์ลูกค้า").as_deref(),
            Some("phone_number_customer")
        );
    }

    #[test]
    fn test_mixed_script() {
        let dictionary = Dictionary::builtin();
        assert_eq!(
            dictionary.lookup("อีเมล 2").as_deref(),
            Some("email_2")
        );
    }

    #[test]
    fn test_unmatched_thai_fails() {
        let dictionary = Dictionary::builtin();
        assert_eq!(dictionary.lookup("ชื่อเล่นสัตว์เลี้ยง"), None);
    }

    #[test]
    fn test_configured_entries_override() {
        let mut extra = BTreeMap::new();
        extra.insert("อีเมล".to_string(), "email_address".to_string());
        extra.insert("สัตว์เลี้ยง".to_string(), "pet".to_string());
        let dictionary = Dictionary::builtin().with_entries(&extra);
        assert_eq!(dictionary.lookup("อีเมล").as_deref(), Some("email_address"));
        assert_eq!(dictionary.lookup("ชื่อสัตว์เลี้ยง").as_deref(), Some("name_pet"));
    }
}
