//! `multipart/form-data` body parsing for the single-image endpoint.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Extract the boundary from a `multipart/form-data; boundary=...` content type.
pub fn boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next()?;
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut cursor = find(body, &delimiter, 0)
        .ok_or_else(|| anyhow!("multipart body has no opening boundary"))?
        + delimiter.len();

    loop {
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        let rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| anyhow!("malformed multipart boundary line"))?;
        let part_start = body.len() - rest.len();
        let header_end = find(body, b"\r\n\r\n", part_start)
            .ok_or_else(|| anyhow!("multipart part is missing headers"))?;
        let headers = String::from_utf8_lossy(&body[part_start..header_end]).to_string();
        let data_start = header_end + 4;

        let mut closing = b"\r\n".to_vec();
        closing.extend_from_slice(&delimiter);
        let data_end = find(body, &closing, data_start)
            .ok_or_else(|| anyhow!("multipart part is not terminated"))?;

        let (name, filename) = disposition(&headers)?;
        parts.push(Part {
            name,
            filename,
            data: body[data_start..data_end].to_vec(),
        });
        cursor = data_end + closing.len();
    }
}

fn disposition(headers: &str) -> Result<(String, Option<String>)> {
    let line = headers
        .split("\r\n")
        .find(|line| {
            line.to_ascii_lowercase()
                .starts_with("content-disposition:")
        })
        .ok_or_else(|| anyhow!("multipart part has no content-disposition"))?;
    let mut name = None;
    let mut filename = None;
    for param in line.split(';').skip(1) {
        if let Some((key, value)) = param.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }
    }
    let name = name.ok_or_else(|| anyhow!("multipart part has no name"))?;
    Ok((name, filename))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_boundary() {
        assert_eq!(
            boundary("multipart/form-data; boundary=----abc123").as_deref(),
            Some("----abc123")
        );
        assert_eq!(
            boundary("multipart/form-data; boundary=\"quoted\"").as_deref(),
            Some("quoted")
        );
        assert!(boundary("application/json").is_none());
    }

    #[test]
    fn parses_file_and_field() -> Result<()> {
        let body = b"--XYZ\r\n\
Content-Disposition: form-data; name=\"lot_id\"\r\n\r\n\
7\r\n\
--XYZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"lot.jpg\"\r\n\
Content-Type: image/jpeg\r\n\r\n\
\xFF\xD8\r\nbinary\xFF\xD9\r\n\
--XYZ--\r\n";
        let parts = parse(body, "XYZ")?;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "lot_id");
        assert_eq!(parts[0].data, b"7");
        assert_eq!(parts[1].filename.as_deref(), Some("lot.jpg"));
        assert_eq!(parts[1].data, b"\xFF\xD8\r\nbinary\xFF\xD9");
        Ok(())
    }

    #[test]
    fn unterminated_body_is_an_error() {
        let body = b"--XYZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue";
        assert!(parse(body, "XYZ").is_err());
    }
}
