//! Human-readable formatting for sizes, rates and durations.

/// Format a byte count with 1024-based units, e.g. `7.5 GB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut n = bytes as f64;
    for unit in UNITS {
        if n < 1024.0 {
            return if unit == "B" {
                format!("{bytes} B")
            } else {
                format!("{n:.1} {unit}")
            };
        }
        n /= 1024.0;
    }
    format!("{n:.1} PB")
}

/// Format a transfer rate in bytes per second, e.g. `12.3 MB/s`.
pub fn human_speed(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{bps:.0} B/s")
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else if bps < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bps / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB/s", bps / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a remaining-time estimate as `m:ss` or `h:mm:ss`; `--:--` when
/// there is no estimate.
pub fn human_eta(secs: f64) -> String {
    if secs <= 0.0 {
        return "--:--".to_string();
    }
    let total = secs as u64;
    let (m, s) = (total / 60, total % 60);
    let (h, m) = (m / 60, m % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(7_600_000_000), "7.1 GB");
        assert_eq!(human_size(2_199_023_255_552), "2.0 TB");
    }

    #[test]
    fn speeds() {
        assert_eq!(human_speed(512.0), "512 B/s");
        assert_eq!(human_speed(10.0 * 1024.0 * 1024.0), "10.0 MB/s");
        assert_eq!(human_speed(1.5 * 1024.0 * 1024.0 * 1024.0), "1.50 GB/s");
    }

    #[test]
    fn etas() {
        assert_eq!(human_eta(0.0), "--:--");
        assert_eq!(human_eta(-3.0), "--:--");
        assert_eq!(human_eta(42.0), "0:42");
        assert_eq!(human_eta(95.0), "1:35");
        assert_eq!(human_eta(3700.0), "1:01:40");
    }
}
