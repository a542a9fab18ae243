//! Target platforms (`os/arch[/variant]`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

const DEFAULT_OS: &str = "linux";

/// A build target platform such as `linux/amd64` or `linux/arm/v7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: String,
    variant: Option<String>,
}

impl Platform {
    /// Parse a platform identifier.
    ///
    /// Accepts `os/arch`, `os/arch/variant`, or a bare architecture which
    /// implies `linux`. Architecture aliases are normalised, so `x86_64`
    /// becomes `amd64` and `aarch64` becomes `arm64`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let parts: Vec<&str> = input.split('/').collect();

        let (os, arch, variant) = match parts.as_slice() {
            [arch] => (DEFAULT_OS, *arch, None),
            [os, arch] => (*os, *arch, None),
            [os, arch, variant] => (*os, *arch, Some(*variant)),
            _ => {
                return Err(Error::Configuration(format!(
                    "invalid platform '{}': expected os/arch[/variant]",
                    input
                )));
            }
        };

        for (field, value) in [("os", Some(os)), ("arch", Some(arch)), ("variant", variant)] {
            if let Some(value) = value {
                if !is_valid_component(value) {
                    return Err(Error::Configuration(format!(
                        "invalid platform '{}': bad {} component '{}'",
                        input, field, value
                    )));
                }
            }
        }

        Ok(Self {
            os: os.to_ascii_lowercase(),
            arch: normalize_arch(arch),
            variant: variant.map(|v| v.to_ascii_lowercase()),
        })
    }

    /// The platform of the machine running kiln.
    pub fn host() -> Self {
        Self {
            os: DEFAULT_OS.to_string(),
            arch: normalize_arch(std::env::consts::ARCH),
            variant: None,
        }
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Filesystem- and key-safe form, e.g. `linux-arm64`.
    pub fn slug(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}-{}-{}", self.os, self.arch, variant),
            None => format!("{}-{}", self.os, self.arch),
        }
    }

    /// Whether building this platform on `host` requires CPU emulation.
    pub fn needs_emulation_on(&self, host: &Platform) -> bool {
        self.arch != host.arch
    }
}

fn is_valid_component(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Map kernel/toolchain architecture names onto OCI architecture names.
pub fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "x86_64" | "x86-64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "armv7l" | "armhf" | "arm" => "arm".to_string(),
        "i386" | "i686" | "x86" | "386" => "386".to_string(),
        "powerpc64le" | "ppc64le" => "ppc64le".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Platform {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> Self {
        platform.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_arch() {
        let p = Platform::parse("linux/arm64").unwrap();
        assert_eq!(p.os(), "linux");
        assert_eq!(p.arch(), "arm64");
        assert_eq!(p.variant(), None);
        assert_eq!(p.to_string(), "linux/arm64");
    }

    #[test]
    fn test_parse_with_variant() {
        let p = Platform::parse("linux/arm/v7").unwrap();
        assert_eq!(p.variant(), Some("v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");
        assert_eq!(p.slug(), "linux-arm-v7");
    }

    #[test]
    fn test_bare_arch_and_aliases() {
        assert_eq!(Platform::parse("x86_64").unwrap().to_string(), "linux/amd64");
        assert_eq!(
            Platform::parse("linux/aarch64").unwrap().to_string(),
            "linux/arm64"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Platform::parse("").is_err());
        assert!(Platform::parse("linux/").is_err());
        assert!(Platform::parse("linux/arm/v7/extra").is_err());
        assert!(Platform::parse("linux/ar m").is_err());
    }

    #[test]
    fn test_needs_emulation() {
        let amd64 = Platform::parse("linux/amd64").unwrap();
        let arm64 = Platform::parse("linux/arm64").unwrap();
        assert!(arm64.needs_emulation_on(&amd64));
        assert!(!amd64.needs_emulation_on(&amd64));
    }

    #[test]
    fn test_serde_as_string() {
        let p = Platform::parse("linux/arm64").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"linux/arm64\"");
        let back: Platform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
