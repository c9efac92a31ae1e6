//! Charset detection and candidate decoding
//!
//! Two jobs live here:
//!
//! - decoding raw text blobs (CUE sheets) whose encoding is not declared
//! - recovering tag text that was already decoded once with the wrong
//!   single-byte charset, the classic way legacy CJK ID3 tags turn into
//!   `ÖÐÎÄ`-style mojibake
//!
//! Nothing in this module returns an error. Unsupported charsets and
//! undecodable byte sequences produce placeholder strings instead.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::collections::BTreeMap;

/// Bytes fed to the detector; enough for any tag or sheet header
pub const DETECTION_PREFIX_LEN: usize = 8 * 1024;

/// Charsets tried when diagnosing mojibake
pub const DEFAULT_CANDIDATES: &[&str] = &[
    "GBK",
    "GB2312",
    "Big5",
    "UTF-8",
    "EUC-KR",
    "Shift_JIS",
    "windows-1252",
];

/// Single-byte charset a string was wrongly decoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleByte {
    /// ISO-8859-1: every code point below U+0100 is its own byte
    Latin1,
    /// Windows-1252: Latin-1 plus typographic characters in 0x80..0x9F
    Windows1252,
}

impl SingleByte {
    /// Charset label
    pub fn label(self) -> &'static str {
        match self {
            Self::Latin1 => "ISO-8859-1",
            Self::Windows1252 => "windows-1252",
        }
    }
}

/// Guess the encoding of `bytes`
///
/// A byte order mark always wins. Input that is valid UTF-8 (ignoring a
/// sequence truncated by the prefix cut) is UTF-8; everything else goes to
/// the statistical detector.
pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }

    let prefix = &bytes[..bytes.len().min(DETECTION_PREFIX_LEN)];
    let truncated = prefix.len() < bytes.len();
    match std::str::from_utf8(prefix) {
        Ok(_) => return UTF_8,
        Err(e) if truncated && e.error_len().is_none() => return UTF_8,
        Err(_) => {}
    }

    let mut detector = EncodingDetector::new();
    detector.feed(prefix, !truncated);
    detector.guess(None, true)
}

/// Name of the charset [`detect_encoding`] picks
pub fn detect(bytes: &[u8]) -> &'static str {
    detect_encoding(bytes).name()
}

/// Decode `bytes` with the detected charset, stripping any BOM
///
/// Falls back to lossy UTF-8 if the detected charset cannot decode the
/// input cleanly.
pub fn decode(bytes: &[u8]) -> String {
    let encoding = detect_encoding(bytes);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors && encoding != UTF_8 {
        tracing::debug!(
            "Detected charset {} failed to decode cleanly, falling back to UTF-8",
            encoding.name()
        );
        return UTF_8.decode(bytes).0.into_owned();
    }
    text.into_owned()
}

/// Decode `bytes` once per candidate charset
///
/// Keys are the candidate labels as given. A label encoding_rs does not know
/// and a byte sequence that is invalid in a charset both yield a
/// placeholder value rather than an error.
pub fn decode_candidates(bytes: &[u8], candidates: &[&str]) -> BTreeMap<String, String> {
    candidates
        .iter()
        .map(|label| ((*label).to_string(), decode_as(bytes, label)))
        .collect()
}

fn decode_as(bytes: &[u8], label: &str) -> String {
    let Some(encoding) = Encoding::for_label(label.as_bytes()) else {
        return format!("<unsupported charset {label}>");
    };
    match encoding.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => text.into_owned(),
        None => format!("<invalid {} byte sequence>", encoding.name()),
    }
}

/// Undo a wrong single-byte decode, recovering the original bytes
///
/// Returns `None` when `text` holds a character the charset cannot encode,
/// meaning it was never decoded that way.
pub fn recover_bytes(text: &str, via: SingleByte) -> Option<Vec<u8>> {
    match via {
        SingleByte::Latin1 => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect(),
        SingleByte::Windows1252 => {
            let (bytes, _, unmappable) = WINDOWS_1252.encode(text);
            (!unmappable).then(|| bytes.into_owned())
        }
    }
}

/// Mojibake recovery: re-encode with `via`, then decode under every candidate
pub fn mojibake_candidates(
    text: &str,
    via: SingleByte,
    candidates: &[&str],
) -> BTreeMap<String, String> {
    match recover_bytes(text, via) {
        Some(bytes) => decode_candidates(&bytes, candidates),
        None => candidates
            .iter()
            .map(|label| {
                (
                    (*label).to_string(),
                    format!("<text is not representable in {}>", via.label()),
                )
            })
            .collect(),
    }
}

/// Whether tag text looks like a legacy charset read as Latin-1
///
/// True when the text has non-ASCII characters and all of them fit in a
/// single-byte Western charset.
pub fn looks_suspicious(text: &str) -> bool {
    !text.is_ascii()
        && (recover_bytes(text, SingleByte::Latin1).is_some()
            || recover_bytes(text, SingleByte::Windows1252).is_some())
}

/// Best-effort repair of mojibake tag text
///
/// Returns the re-decoded text only when the detector finds a charset that
/// decodes the recovered bytes cleanly into something beyond Latin script;
/// genuine accented Western text is left alone.
pub fn repair_tag_text(text: &str) -> Option<String> {
    if !looks_suspicious(text) {
        return None;
    }

    let bytes = recover_bytes(text, SingleByte::Latin1)
        .or_else(|| recover_bytes(text, SingleByte::Windows1252))?;

    let encoding = detect_encoding(&bytes);
    let decoded = encoding
        .decode_without_bom_handling_and_without_replacement(&bytes)?
        .into_owned();

    let beyond_latin = decoded.chars().any(|c| u32::from(c) > 0x02FF);
    (beyond_latin && decoded != text).then_some(decoded)
}

/// Space-separated upper-case hex dump
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
