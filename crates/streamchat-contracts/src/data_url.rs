use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Encoded portion of a data URL: everything after the first `,`.
///
/// A string without a separator is treated as bare encoded data.
pub fn data_url_payload(data_url: &str) -> &str {
    match data_url.split_once(',') {
        Some((_, payload)) => payload,
        None => data_url,
    }
}

/// Byte length of the binary payload carried by a base64 data URL,
/// computed from the encoded length without decoding.
pub fn estimate_data_url_bytes(data_url: &str) -> u64 {
    let payload = data_url_payload(data_url);
    let encoded_len = payload.len() as u64;
    let padding = if payload.ends_with("==") {
        2
    } else if payload.ends_with('=') {
        1
    } else {
        0
    };
    (encoded_len * 3 / 4).saturating_sub(padding)
}

pub fn data_url_mime(data_url: &str) -> Option<&str> {
    let header = data_url.strip_prefix("data:")?.split_once(',')?.0;
    let mime = header.split(';').next().unwrap_or_default().trim();
    (!mime.is_empty()).then_some(mime)
}

pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>)> {
    let Some(rest) = data_url.strip_prefix("data:") else {
        bail!("not a data URL");
    };
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("data URL is missing its payload separator");
    };
    if !header.ends_with(";base64") {
        bail!("only base64 data URLs are supported");
    }
    let bytes = BASE64
        .decode(payload.as_bytes())
        .context("data URL base64 decode failed")?;
    let mime = data_url_mime(data_url)
        .unwrap_or("application/octet-stream")
        .to_string();
    Ok((mime, bytes))
}
