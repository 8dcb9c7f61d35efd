//! Process Resource Usage
//!
//! Memory figures reported by the health endpoint. On Linux they come from
//! `/proc/self/statm`; elsewhere they are reported as zero.

use serde::Serialize;

/// Page size assumed when converting `statm` page counts to bytes.
const PAGE_SIZE: u64 = 4096;

/// Memory usage of the running process, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub rss: u64,
    #[serde(rename = "virtual")]
    pub virtual_size: u64,
}

impl MemoryUsage {
    /// Sample the current process.
    pub fn sample() -> Self {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/self/statm") {
                Ok(statm) => Self::from_statm(&statm).unwrap_or_default(),
                Err(e) => {
                    tracing::debug!(error = %e, "Unable to read /proc/self/statm");
                    Self::default()
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::default()
        }
    }

    /// Parse the first two fields of `statm`: total program size and resident set, in pages.
    pub fn from_statm(statm: &str) -> Option<Self> {
        let mut fields = statm.split_whitespace().map(str::parse::<u64>);
        let size = fields.next()?.ok()?;
        let resident = fields.next()?.ok()?;
        Some(Self {
            rss: resident * PAGE_SIZE,
            virtual_size: size * PAGE_SIZE,
        })
    }
}
