//! Shared helpers for the sdblk commands: size and time formatting,
//! size parsing, and error exit.

use sheepdog_block::{DriverConfig, DriverResult, SheepdogDevice};

/// Open `location` or exit.
pub async fn open_or_exit(location: &str, config: &DriverConfig) -> SheepdogDevice {
    match SheepdogDevice::open(location, config.clone()).await {
        Ok(dev) => dev,
        Err(e) => exit_error(&format!("cannot open {}: {}", location, e)),
    }
}

/// Close `dev`, then exit on `res` failure.
pub async fn finish<T>(dev: SheepdogDevice, res: DriverResult<T>, what: &str) -> T {
    let location = dev.location().vdi.clone();
    if let Err(e) = dev.close().await {
        eprintln!("Warning: cannot release {}: {}", location, e);
    }
    match res {
        Ok(v) => v,
        Err(e) => exit_error(&format!("{} failed on {}: {}", what, location, e)),
    }
}

/// Format a byte count as a human-readable size string.
///
/// Examples: "1.0 GB", "512.0 MB", "4.0 TB"
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Format a snapshot timestamp (seconds since the epoch, UTC).
pub fn format_time(epoch_secs: u64) -> String {
    if epoch_secs == 0 {
        return "-".to_string();
    }
    let days = epoch_secs / 86_400;
    let secs = epoch_secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        secs / 3600,
        secs % 3600 / 60,
        secs % 60
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

/// Parse a size with an optional K/M/G/T suffix (powers of 1024).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last() {
        None => return Err("empty size".to_string()),
        Some(b'K' | b'k') => (&s[..s.len() - 1], 10),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 20),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 30),
        Some(b'T' | b't') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let num: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    num.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}
