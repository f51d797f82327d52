use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::core::error::{AugurError, TransportError};

/// Transport timeout for image downloads
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Is this a URL we can pass through as-is? (http, https or an already-inlined data: URL)
pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("data:")
}

fn mime_from_path(path: &Path) -> Result<&'static str, AugurError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "gif" => Ok("image/gif"),
        "webp" => Ok("image/webp"),
        _ => Err(AugurError::Image(format!(
            "Cannot derive image mime type from '{}'",
            path.display()
        ))),
    }
}

/// Load a local image file into a self-contained base64 data: URL.
pub fn load_image_as_data_url(path: impl AsRef<Path>) -> Result<String, AugurError> {
    let path = path.as_ref();
    let mime = mime_from_path(path)?;
    let bytes = std::fs::read(path)?;
    Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
}

/// Split a data: URL into (mime type, base64 payload).
pub fn split_data_url(url: &str) -> Result<(String, String), AugurError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| AugurError::Image(format!("Not a data: URL: '{:.16}'", url)))?;
    let (mime, payload) = rest
        .split_once(';')
        .ok_or_else(|| AugurError::Image(format!("Error decoding image data: '{:.16}'", url)))?;
    let (enc, b64) = payload
        .split_once(',')
        .ok_or_else(|| AugurError::Image(format!("Error decoding image data: '{:.32}'", url)))?;
    if !enc.eq_ignore_ascii_case("base64") {
        return Err(AugurError::Image(format!(
            "Expecting base64 image data, found '{}'",
            enc
        )));
    }
    Ok((mime.to_string(), b64.to_string()))
}

fn data_url_from_response(url: &str, mime: Option<String>, bytes: &[u8]) -> String {
    let mime = mime.unwrap_or_else(|| {
        // last resort: guess from the URL path
        mime_from_path(Path::new(url))
            .unwrap_or("image/jpeg")
            .to_string()
    });
    format!("data:{};base64,{}", mime, BASE64.encode(bytes))
}

/// Download a remote image into a base64 data: URL.
pub fn download_as_data_url(url: &str) -> Result<String, AugurError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| TransportError::Network {
            message: format!("Failed to create HTTP client: {}", e),
        })?;
    let resp = client
        .get(url)
        .send()
        .map_err(|e| TransportError::Network {
            message: format!("Image download error: {}", e),
        })?;
    if !resp.status().is_success() {
        return Err(AugurError::Image(format!(
            "Image download failed with status {} for '{}'",
            resp.status(),
            url
        )));
    }
    let mime = content_type(resp.headers());
    let bytes = resp.bytes().map_err(|e| TransportError::Network {
        message: format!("Image download read error: {}", e),
    })?;
    Ok(data_url_from_response(url, mime, &bytes))
}

/// Async variant of [`download_as_data_url`].
pub async fn download_as_data_url_async(url: &str) -> Result<String, AugurError> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| TransportError::Network {
            message: format!("Failed to create HTTP client: {}", e),
        })?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| TransportError::Network {
            message: format!("Image download error: {}", e),
        })?;
    if !resp.status().is_success() {
        return Err(AugurError::Image(format!(
            "Image download failed with status {} for '{}'",
            resp.status(),
            url
        )));
    }
    let mime = content_type(resp.headers());
    let bytes = resp.bytes().await.map_err(|e| TransportError::Network {
        message: format!("Image download read error: {}", e),
    })?;
    Ok(data_url_from_response(url, mime, &bytes))
}

fn content_type(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| v.starts_with("image/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/cat.png"));
        assert!(is_url("data:image/png;base64,AAAA"));
        assert!(!is_url("./photos/cat.png"));
    }

    #[test]
    fn test_split_data_url() {
        let (mime, b64) = split_data_url("data:image/png;base64,AAAA").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(b64, "AAAA");

        assert!(split_data_url("https://example.com/x.png").is_err());
        assert!(split_data_url("data:image/png;hex,AAAA").is_err());
    }
}
