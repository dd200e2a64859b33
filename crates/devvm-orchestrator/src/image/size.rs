use devvm_common::{DevVmError, Result};

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

fn invalid_size(input: &str) -> DevVmError {
    DevVmError::validation(
        format!("Invalid size: {input:?}"),
        "Use a number with an optional K, M, G or T suffix, e.g. 8G, 512M or 16GB",
    )
}

/// Parse `<number>[K|M|G|T][B]` (case-insensitive, binary multiples) into bytes.
pub fn parse_size_string(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();
    let without_b = upper.strip_suffix('B').unwrap_or(&upper);

    let (number, exponent) = match without_b.chars().last() {
        Some('K') => (&without_b[..without_b.len() - 1], 1),
        Some('M') => (&without_b[..without_b.len() - 1], 2),
        Some('G') => (&without_b[..without_b.len() - 1], 3),
        Some('T') => (&without_b[..without_b.len() - 1], 4),
        _ => (without_b, 0),
    };

    let number = number.trim();
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(invalid_size(input));
    }
    let multiplier = 1024u64.pow(exponent);

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| invalid_size(input));
    }
    let value: f64 = number.parse().map_err(|_| invalid_size(input))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid_size(input));
    }
    Ok(bytes as u64)
}

/// Render a byte count in binary units, e.g. `8.0 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_size_string("8G").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(
            parse_size_string("16GB").unwrap(),
            parse_size_string("16G").unwrap()
        );
        assert_eq!(parse_size_string("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size_string("1kb").unwrap(), 1024);
        assert_eq!(parse_size_string("2T").unwrap(), 2 * 1024u64.pow(4));
        assert_eq!(parse_size_string("4096").unwrap(), 4096);
        assert_eq!(parse_size_string("100B").unwrap(), 100);
        assert_eq!(parse_size_string("1.5G").unwrap(), 3 * 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["abc", "", "G", "8X", "-1G", "1.2.3G", "8GG"] {
            assert!(parse_size_string(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GiB");
        assert_eq!(format_bytes(1536 * 1024), "1.5 MiB");
    }
}
