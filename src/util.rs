use crate::error::PvmError;

/// Parse a volume size option into whole gigabytes, rounding up.
///
/// Accepts the cluster's formats like `"8G"`, `"512M"`, `"1T"`, `"4096K"`
/// and bare byte counts. Binary units (1G = 1024M).
pub fn parse_size_gb(s: &str) -> Result<u64, PvmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PvmError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| PvmError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    // Everything is expressed in KiB, then rounded up to GiB.
    let kib = match suffix.as_str() {
        "" => num.div_ceil(1024),
        "K" => num,
        "M" => num.saturating_mul(1024),
        "G" => return Ok(num),
        "T" => return Ok(num.saturating_mul(1024)),
        _ => {
            return Err(PvmError::Validation {
                message: format!("unknown size suffix: '{suffix}'"),
            });
        }
    };

    Ok(kib.div_ceil(1024 * 1024))
}
