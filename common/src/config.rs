//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Directive handed to the env filter when `RUST_LOG` is not set
    pub fn default_directive(&self) -> &'static str {
        if self.quiet && self.verbose == 0 {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Tracing configuration for debugging
#[derive(Debug, Default, Clone)]
pub struct TracingConfig {
    /// Debug log file path, when set all tracing output goes there instead of stderr
    pub debug_log_file: Option<String>,
}

/// Bandwidth limit applied to data transfers
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitConfig {
    /// Megabytes per second (None = unlimited)
    pub megabytes_per_second: Option<f32>,
}

impl RateLimitConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        match self.megabytes_per_second {
            Some(rate) if !(0.1..=100.0).contains(&rate) => Err(format!(
                "rate-limiting must be between 0.1 and 100 MB/s, got {rate}"
            )),
            _ => Ok(()),
        }
    }

    pub fn bytes_per_second(&self) -> Option<u64> {
        self.megabytes_per_second
            .map(|rate| (f64::from(rate) * 1024.0 * 1024.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_directive() {
        let mut output = OutputConfig::default();
        assert_eq!(output.default_directive(), "error");
        output.verbose = 2;
        assert_eq!(output.default_directive(), "debug");
        output.verbose = 7;
        assert_eq!(output.default_directive(), "trace");
        output.verbose = 0;
        output.quiet = true;
        assert_eq!(output.default_directive(), "off");
    }

    #[test]
    fn rate_limit_bounds() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let ok = RateLimitConfig {
            megabytes_per_second: Some(1.5),
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.bytes_per_second(), Some(1572864));
        let too_fast = RateLimitConfig {
            megabytes_per_second: Some(500.0),
        };
        assert!(too_fast.validate().is_err());
    }
}
