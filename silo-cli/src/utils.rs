use silo_core::{Result, SiloError};

/// Parse a volume size like `4G`, `512M`, `1048576K` or plain kibibytes
/// into kibibytes.
pub fn parse_size_kb(size: &str) -> Result<u64> {
    let size = size.trim().to_uppercase();
    let (number, multiplier) = if let Some(number) = size.strip_suffix('T') {
        (number, 1024 * 1024 * 1024)
    } else if let Some(number) = size.strip_suffix('G') {
        (number, 1024 * 1024)
    } else if let Some(number) = size.strip_suffix('M') {
        (number, 1024)
    } else if let Some(number) = size.strip_suffix('K') {
        (number, 1)
    } else {
        (size.as_str(), 1)
    };
    let value: u64 = number
        .parse()
        .map_err(|_| SiloError::Config(format!("invalid size '{size}'")))?;
    Ok(value * multiplier)
}
