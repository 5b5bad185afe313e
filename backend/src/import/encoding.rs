use crate::error::ImportError;

/// Text encodings an upload may be declared in. Lines are decoded one at a
/// time, so the reader always knows the exact byte offset it has reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Windows1251,
    Latin1,
    Ascii,
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Result<Self, ImportError> {
        match label.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "cp1251" | "windows-1251" | "win-1251" => Ok(TextEncoding::Windows1251),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            _ => Err(ImportError::UnsupportedEncoding(label.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Windows1251 => "cp1251",
            TextEncoding::Latin1 => "latin1",
            TextEncoding::Ascii => "ascii",
        }
    }

    /// Decodes one line. Undecodable input is replaced with U+FFFD instead of
    /// failing the row.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                String::from_utf8_lossy(bytes).into_owned()
            }
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
            TextEncoding::Windows1251 => bytes.iter().map(|&b| cp1251_char(b)).collect(),
        }
    }
}

const CP1251_HIGH: [char; 64] = [
    'Ђ', 'Ѓ', '‚', 'ѓ', '„', '…', '†', '‡', '€', '‰', 'Љ', '‹', 'Њ', 'Ќ', 'Ћ', 'Џ',
    'ђ', '‘', '’', '“', '”', '•', '–', '—', '\u{FFFD}', '™', 'љ', '›', 'њ', 'ќ', 'ћ', 'џ',
    '\u{A0}', 'Ў', 'ў', 'Ј', '¤', 'Ґ', '¦', '§', 'Ё', '©', 'Є', '«', '¬', '\u{AD}', '®', 'Ї',
    '°', '±', 'І', 'і', 'ґ', 'µ', '¶', '·', 'ё', '№', 'є', '»', 'ј', 'Ѕ', 'ѕ', 'ї',
];

fn cp1251_char(b: u8) -> char {
    match b {
        0x00..=0x7F => b as char,
        0x80..=0xBF => CP1251_HIGH[(b - 0x80) as usize],
        // 0xC0..=0xFF is the contiguous А..я block.
        _ => char::from_u32(0x0410 + (b - 0xC0) as u32).unwrap_or('\u{FFFD}'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_normalised() {
        assert_eq!(TextEncoding::from_label("UTF-8").unwrap(), TextEncoding::Utf8);
        assert_eq!(
            TextEncoding::from_label("windows_1251").unwrap(),
            TextEncoding::Windows1251
        );
        assert_eq!(TextEncoding::from_label("ISO-8859-1").unwrap(), TextEncoding::Latin1);
        assert!(matches!(
            TextEncoding::from_label("koi8-r"),
            Err(ImportError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn cp1251_cyrillic_round() {
        // "Иванов Ёж" in windows-1251
        let bytes = [0xC8, 0xE2, 0xE0, 0xED, 0xEE, 0xE2, 0x20, 0xA8, 0xE6];
        assert_eq!(TextEncoding::Windows1251.decode(&bytes), "Иванов Ёж");
        assert_eq!(TextEncoding::Windows1251.decode(&[0xB9]), "№");
    }

    #[test]
    fn utf8_strips_bom_and_replaces_garbage() {
        assert_eq!(TextEncoding::Utf8.decode(b"\xEF\xBB\xBF1,2"), "1,2");
        assert_eq!(TextEncoding::Utf8.decode(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn latin1_maps_bytes_directly() {
        assert_eq!(TextEncoding::Latin1.decode(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(TextEncoding::Ascii.decode(&[0x61, 0xE9]), "a\u{FFFD}");
    }
}
