//! # Utility Functions and Helper Module
//!
//! Helpers shared across the measurement engine: statistics over small
//! sample sets, human-readable formatting for logs, and validation of
//! configuration values.
//!
//! ## Key Functionality Categories
//!
//! - **Statistics**: mean/min/max/stddev, interpolated percentiles, jitter
//! - **Formatting**: durations, byte counts and bit rates for log output
//! - **Validation**: configuration checks with clear error messages
//! - **System Information**: CPU core detection
//!
//! ## Usage Examples
//!
//! ```rust
//! use speedtest_server::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bitrate(8_000_000.0), "8.00 Mbit/s");
//!
//! validate_port(8080)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;

/// Format a duration in a human-readable way
///
/// Picks the largest unit that keeps the value readable:
/// nanoseconds, microseconds, milliseconds, then seconds.
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let ns = duration.as_nanos();
    if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        format!("{:.2}μs", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// Format a byte count with binary units
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::format_bytes;
/// assert_eq!(format_bytes(500), "500 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a bit rate with decimal units, the way link speeds are quoted
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::format_bitrate;
/// assert_eq!(format_bitrate(950.0), "950 bit/s");
/// assert_eq!(format_bitrate(1_500_000_000.0), "1.50 Gbit/s");
/// ```
pub fn format_bitrate(bits_per_second: f64) -> String {
    if bits_per_second < 1_000.0 {
        format!("{:.0} bit/s", bits_per_second)
    } else if bits_per_second < 1_000_000.0 {
        format!("{:.2} kbit/s", bits_per_second / 1_000.0)
    } else if bits_per_second < 1_000_000_000.0 {
        format!("{:.2} Mbit/s", bits_per_second / 1_000_000.0)
    } else {
        format!("{:.2} Gbit/s", bits_per_second / 1_000_000_000.0)
    }
}

/// Calculate statistics from a vector of values
///
/// ## Returns
/// Tuple of (mean, min, max, standard_deviation). An empty slice yields
/// all zeros.
///
/// ## Standard Deviation Calculation
///
/// Uses the population standard deviation formula:
/// σ = √(Σ(x - μ)² / N)
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::calculate_stats;
/// let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
/// let (mean, min, max, _std_dev) = calculate_stats(&values);
/// assert_eq!(mean, 3.0);
/// assert_eq!(min, 1.0);
/// assert_eq!(max, 5.0);
/// ```
pub fn calculate_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;

    (mean, min, max, variance.sqrt())
}

/// Calculate percentiles from a vector of values
///
/// Uses linear interpolation between the two nearest ranks, so the 50th
/// percentile of an even-sized set is the mean of the two middle values.
///
/// ## Algorithm Details
///
/// 1. **Sort**: Data is sorted in ascending order
/// 2. **Index Calculation**: For percentile P, index = (P/100) * (N-1)
/// 3. **Interpolation**: If index is fractional, interpolate between adjacent values
///
/// An empty slice yields the requested percentile levels paired with 0.0.
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::calculate_percentiles;
/// let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
/// let percentiles = calculate_percentiles(&values, &[50.0, 95.0]);
/// assert_eq!(percentiles[0], (50.0, 3.0));
/// ```
pub fn calculate_percentiles(values: &[f64], percentiles: &[f64]) -> Vec<(f64, f64)> {
    if values.is_empty() {
        return percentiles.iter().map(|&p| (p, 0.0)).collect();
    }

    let mut sorted_values = values.to_vec();
    sorted_values.sort_by(|a, b| a.total_cmp(b));

    percentiles
        .iter()
        .map(|&p| {
            let index = (p.clamp(0.0, 100.0) / 100.0) * (sorted_values.len() - 1) as f64;
            let lower_index = index.floor() as usize;
            let upper_index = index.ceil() as usize;

            if lower_index == upper_index {
                (p, sorted_values[lower_index])
            } else {
                let lower_value = sorted_values[lower_index];
                let upper_value = sorted_values[upper_index];
                let weight = index - lower_index as f64;
                (p, lower_value + weight * (upper_value - lower_value))
            }
        })
        .collect()
}

/// Median of a set of values, `None` when the set is empty
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    calculate_percentiles(values, &[50.0]).first().map(|&(_, v)| v)
}

/// Mean absolute difference between consecutive values
///
/// This is the jitter definition used for latency samples: order matters,
/// and fewer than two values give 0.0.
///
/// ## Examples
///
/// ```rust
/// # use speedtest_server::utils::mean_successive_difference;
/// assert_eq!(mean_successive_difference(&[10.0, 12.0, 11.0]), 1.5);
/// assert_eq!(mean_successive_difference(&[10.0]), 0.0);
/// ```
pub fn mean_successive_difference(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let total: f64 = values.windows(2).map(|pair| (pair[1] - pair[0]).abs()).sum();
    total / (values.len() - 1) as f64
}

/// Validate that a port number can be bound without privileges
///
/// Port 0 is accepted and asks the OS for an ephemeral port.
pub fn validate_port(port: u16) -> Result<()> {
    if port != 0 && port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Validate the download chunk size against the payload pool
///
/// ## Validation Rules
///
/// - **Minimum**: 1 KB, smaller chunks turn the download into a syscall benchmark
/// - **Maximum**: 16 MB, and never larger than the payload pool itself
pub fn validate_chunk_size(chunk_size: usize, pool_size: usize) -> Result<()> {
    if chunk_size < 1024 {
        anyhow::bail!("Chunk size {} is too small (minimum 1024 bytes)", chunk_size);
    }
    if chunk_size > 16 * 1024 * 1024 {
        anyhow::bail!("Chunk size {} is too large (maximum 16 MB)", chunk_size);
    }
    if chunk_size > pool_size {
        anyhow::bail!(
            "Chunk size {} exceeds the payload pool size {}",
            chunk_size,
            pool_size
        );
    }
    Ok(())
}

/// Validate that a duration setting is non-zero
pub fn validate_non_zero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(())
}

/// Get the number of CPU cores available to this process
pub fn get_cpu_cores() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1572864), "1.50 MB");
        assert_eq!(format_bytes(1610612736), "1.50 GB");
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(500.0), "500 bit/s");
        assert_eq!(format_bitrate(1500.0), "1.50 kbit/s");
        assert_eq!(format_bitrate(8_000_000.0), "8.00 Mbit/s");
        assert_eq!(format_bitrate(2_500_000_000.0), "2.50 Gbit/s");
    }

    #[test]
    fn test_calculate_stats() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let (mean, min, max, std_dev) = calculate_stats(&values);

        assert_eq!(mean, 3.0);
        assert_eq!(min, 1.0);
        assert_eq!(max, 5.0);
        assert!((std_dev - 1.4142135623730951).abs() < 0.001);
        assert_eq!(calculate_stats(&[]), (0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_calculate_percentiles() {
        let values = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let percentiles = calculate_percentiles(&values, &[50.0, 95.0]);

        assert_eq!(percentiles.len(), 2);
        assert_eq!(percentiles[0], (50.0, 3.0));
        assert!((percentiles[1].1 - 4.8).abs() < 1e-9);
    }

    #[test]
    fn test_median_of_even_set_interpolates() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[7.0]), Some(7.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_mean_successive_difference() {
        assert_eq!(mean_successive_difference(&[]), 0.0);
        assert_eq!(mean_successive_difference(&[3.0, 3.0, 3.0]), 0.0);
        assert_eq!(mean_successive_difference(&[1.0, 3.0, 1.0, 3.0]), 2.0);
    }

    #[test]
    fn test_validate_port() {
        assert!(validate_port(0).is_ok());
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(8080).is_ok());
        assert!(validate_port(80).is_err());
    }

    #[test]
    fn test_validate_chunk_size() {
        assert!(validate_chunk_size(64 * 1024, 4 * 1024 * 1024).is_ok());
        assert!(validate_chunk_size(512, 4 * 1024 * 1024).is_err());
        assert!(validate_chunk_size(2 * 1024 * 1024, 1024 * 1024).is_err());
        assert!(validate_chunk_size(32 * 1024 * 1024, 64 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_get_cpu_cores() {
        assert!(get_cpu_cores() > 0);
    }
}
