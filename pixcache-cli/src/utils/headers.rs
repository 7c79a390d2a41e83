use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

/// Parse one `Name: Value` header; malformed input is logged and skipped
fn parse_header(header_str: &str) -> Option<(HeaderName, HeaderValue)> {
    let Some((name, value)) = header_str.split_once(':') else {
        warn!(header = header_str, "Invalid header format, expected 'Name: Value'");
        return None;
    };
    let (name, value) = (name.trim(), value.trim());

    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        warn!(name, "Invalid header name");
        return None;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        warn!(name, "Invalid header value");
        return None;
    };

    debug!(name, "Adding custom header");
    Some((header_name, header_value))
}

/// Parse a collection of header strings into a HeaderMap
pub fn parse_headers(header_strings: &[String]) -> HeaderMap {
    header_strings
        .iter()
        .filter_map(|header| parse_header(header))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers_skips_invalid() {
        let headers = parse_headers(&[
            "Referer: https://example.com/".to_string(),
            "no-colon".to_string(),
            "bad name: x".to_string(),
            "X-Token:  abc ".to_string(),
        ]);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("referer").unwrap(), "https://example.com/");
        assert_eq!(headers.get("x-token").unwrap(), "abc");
    }
}
