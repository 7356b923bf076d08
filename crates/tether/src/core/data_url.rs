//! `data:` URL decoding (RFC 2397).

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use url::Url;

/// Media type assumed when the URL names none.
pub const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded payload of a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub body: Bytes,
}

/// Decode a `data:` URL, or `None` when it is malformed.
///
/// # Examples
///
/// ```
/// use tether::core::decode_data_url;
/// use url::Url;
///
/// let url = Url::parse("data:text/plain;base64,aGVsbG8=").unwrap();
/// let data = decode_data_url(&url).unwrap();
/// assert_eq!(data.media_type, "text/plain");
/// assert_eq!(&data.body[..], b"hello");
/// ```
pub fn decode_data_url(url: &Url) -> Option<DataUrl> {
    if !url.scheme().eq_ignore_ascii_case("data") {
        return None;
    }
    let rest = &url.as_str()[url.scheme().len() + 1..];
    let (header, payload) = rest.split_once(',')?;

    let mut header = percent_decode_str(header).decode_utf8().ok()?.trim().to_owned();
    let is_base64 = header
        .len()
        .checked_sub(7)
        .and_then(|at| header.get(at..))
        .is_some_and(|suffix| suffix.eq_ignore_ascii_case(";base64"));
    if is_base64 {
        header.truncate(header.len() - 7);
    }

    let media_type = if header.is_empty() {
        DEFAULT_MEDIA_TYPE.to_owned()
    } else if header.starts_with(';') {
        format!("text/plain{header}")
    } else {
        header
    };

    let raw: Vec<u8> = percent_decode_str(payload).collect();
    let body = if is_base64 {
        let compact: Vec<u8> = raw.into_iter().filter(|b| !b.is_ascii_whitespace()).collect();
        LENIENT.decode(compact).ok()?
    } else {
        raw
    };

    Some(DataUrl {
        media_type,
        body: Bytes::from(body),
    })
}
