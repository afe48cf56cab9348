//! Kernel configuration.
//!
//! Built-in defaults come from Cargo features; the bootloader command line
//! can override them at boot. Unknown or malformed tokens are logged and
//! ignored so a typo never stops the machine from booting.

use klog::Level;

pub use crate::memory::fault::CowOomPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub log_level: Level,
    pub cow_oom: CowOomPolicy,
    /// Fill every kernel root slot of the master directory at boot.
    pub preallocate_kernel_tables: bool,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        log_level: Level::Info,
        cow_oom: if cfg!(feature = "cow-oom-kill") { CowOomPolicy::KillTask } else { CowOomPolicy::Halt },
        preallocate_kernel_tables: cfg!(feature = "prealloc-kernel-tables"),
    };

    /// Applies `key=value` tokens from a whitespace-separated command line
    /// on top of [`KernelConfig::DEFAULT`].
    ///
    /// Recognised keys: `loglevel=trace|debug|info|warn|error`,
    /// `cow_oom=halt|kill`, `prealloc_kernel=0|1`.
    pub fn parse_cmdline(cmdline: &str) -> Self {
        let mut cfg = Self::DEFAULT;
        for token in cmdline.split_whitespace() {
            if !cfg.apply(token) {
                klog::warn!("config: ignoring command line token '{}'", token);
            }
        }
        cfg
    }

    fn apply(&mut self, token: &str) -> bool {
        let Some((key, value)) = token.split_once('=') else {
            return false;
        };
        match key {
            "loglevel" => Level::parse(value).map(|l| self.log_level = l).is_some(),
            "cow_oom" => CowOomPolicy::parse(value).map(|p| self.cow_oom = p).is_some(),
            "prealloc_kernel" => match value {
                "0" => {
                    self.preallocate_kernel_tables = false;
                    true
                }
                "1" => {
                    self.preallocate_kernel_tables = true;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_keeps_defaults() {
        assert_eq!(KernelConfig::parse_cmdline(""), KernelConfig::DEFAULT);
        assert_eq!(KernelConfig::default().log_level, Level::Info);
    }

    #[test]
    fn known_keys_override_defaults() {
        let cfg = KernelConfig::parse_cmdline("quiet loglevel=debug  cow_oom=kill prealloc_kernel=1");
        assert_eq!(cfg.log_level, Level::Debug);
        assert_eq!(cfg.cow_oom, CowOomPolicy::KillTask);
        assert!(cfg.preallocate_kernel_tables);

        let cfg = KernelConfig::parse_cmdline("cow_oom=halt prealloc_kernel=0");
        assert_eq!(cfg.cow_oom, CowOomPolicy::Halt);
        assert!(!cfg.preallocate_kernel_tables);
    }

    #[test]
    fn malformed_values_are_ignored() {
        let cfg = KernelConfig::parse_cmdline("loglevel=loud cow_oom=panic prealloc_kernel=yes root=/dev/sda");
        assert_eq!(cfg, KernelConfig::DEFAULT);
    }
}
