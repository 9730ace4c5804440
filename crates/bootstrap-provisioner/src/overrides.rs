//! Host overrides
//!
//! Test harnesses and constrained hosts cannot always run a stock KVM guest.
//! The overrides are read from the environment once, at process start, and
//! handed to the domain builder explicitly.

/// Environment variable selecting the domain type (`kvm`, `qemu`)
pub const MACHINE_TYPE_ENV: &str = "TERRAFORM_LIBVIRT_TEST_DOMAIN_TYPE";

/// Environment variable selecting the host entropy source for the RNG device
pub const RNG_DEVICE_ENV: &str = "TF_LIBVIRT_RNG_DEV";

pub const DEFAULT_MACHINE_TYPE: &str = "kvm";
pub const DEFAULT_RNG_DEVICE: &str = "/dev/urandom";

/// Host-specific settings for the bootstrap domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOverrides {
    /// Domain type attribute
    pub machine_type: String,
    /// Backend device of the virtio RNG
    pub rng_device: String,
}

impl Default for HostOverrides {
    fn default() -> Self {
        Self {
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            rng_device: DEFAULT_RNG_DEVICE.to_string(),
        }
    }
}

impl HostOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through a variable lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, default: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            machine_type: read(MACHINE_TYPE_ENV, DEFAULT_MACHINE_TYPE),
            rng_device: read(RNG_DEVICE_ENV, DEFAULT_RNG_DEVICE),
        }
    }
}
