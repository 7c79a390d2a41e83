use crate::error::AppError;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Parse a byte size such as `50MB`, `1.5g` or `4096`
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_ascii_lowercase();
    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid size: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size_str.len());
    let (number, unit) = size_str.split_at(split);

    let multiplier = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KB,
        "m" | "mb" | "mib" => MB,
        "g" | "gb" | "gib" => GB,
        "t" | "tb" | "tib" => TB,
        other => {
            return Err(AppError::ParseError(format!(
                "Invalid size unit '{other}' in '{size_str}'"
            )));
        }
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| AppError::ParseError(format!("Size '{size_str}' is too large")));
    }

    let value = number
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid size number '{number}'")))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(AppError::ParseError(format!("Size '{size_str}' is too large")));
    }
    Ok(bytes as u64)
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("50MB").unwrap(), 50 * MB);
        assert_eq!(parse_size(" 16 mb ").unwrap(), 16 * MB);
        assert_eq!(parse_size("1.5g").unwrap(), GB + GB / 2);
        assert_eq!(parse_size("2KiB").unwrap(), 2 * KB);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("10 parsecs").is_err());
        assert!(parse_size("MB").is_err());
        assert!(parse_size("99999999999999999999TB").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(50 * MB), "50.00 MB");
    }
}
