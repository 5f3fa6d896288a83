use std::fs;

use crate::error::{IoResultExt, Result};

/// parsed kernel release, for the multi-lower capability gate
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct KernelVersion {
    pub kernel: u32,
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub const fn new(kernel: u32, major: u32, minor: u32) -> Self {
        Self {
            kernel,
            major,
            minor,
        }
    }

    /// parse a release string like `4.15.0-112-generic`
    pub fn parse(release: &str) -> Option<Self> {
        let numeric: String = release
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.');
        let kernel = parts.next()?.parse().ok()?;
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self {
            kernel,
            major,
            minor,
        })
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.kernel, self.major, self.minor)
    }
}

const OSRELEASE: &str = "/proc/sys/kernel/osrelease";

/// running kernel version from procfs
pub fn get_kernel_version() -> Result<Option<KernelVersion>> {
    let release = fs::read_to_string(OSRELEASE).with_path(OSRELEASE)?;
    Ok(KernelVersion::parse(release.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_forms() {
        assert_eq!(
            KernelVersion::parse("4.15.0-112-generic"),
            Some(KernelVersion::new(4, 15, 0))
        );
        assert_eq!(
            KernelVersion::parse("3.19.8"),
            Some(KernelVersion::new(3, 19, 8))
        );
        assert_eq!(
            KernelVersion::parse("6.1"),
            Some(KernelVersion::new(6, 1, 0))
        );
        assert_eq!(KernelVersion::parse("garbage"), None);
    }

    #[test]
    fn test_ordering_gates_multi_lower() {
        let gate = KernelVersion::new(4, 0, 0);
        assert!(KernelVersion::new(4, 15, 0) >= gate);
        assert!(KernelVersion::new(4, 0, 0) >= gate);
        assert!(KernelVersion::new(3, 19, 8) < gate);
    }
}
