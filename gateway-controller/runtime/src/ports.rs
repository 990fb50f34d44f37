use anyhow::{bail, Context, Result};
use std::{collections::HashSet, hash::BuildHasherDefault, num::NonZeroU16, str::FromStr};

/// External ports that are never handed out by port discovery (e.g. ports the gateway hosts
/// listen on themselves).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservedPorts(HashSet<NonZeroU16, BuildHasherDefault<PortHasher>>);

/// Ports are small integers, so they are used as their own hash.
#[derive(Debug, Default)]
pub struct PortHasher(u16);

// === impl ReservedPorts ===

impl ReservedPorts {
    pub fn contains(&self, port: u16) -> bool {
        NonZeroU16::new(port).is_some_and(|p| self.0.contains(&p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parses a comma-separated list of ports and inclusive port ranges, e.g. `80,443,8000-8100`.
impl FromStr for ReservedPorts {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut ports = HashSet::default();
        for spec in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match spec.split_once('-') {
                None => {
                    let port = spec
                        .parse::<NonZeroU16>()
                        .with_context(|| format!("parsing port {spec:?}"))?;
                    ports.insert(port);
                }
                Some((floor, ceil)) => {
                    let floor = floor
                        .trim()
                        .parse::<NonZeroU16>()
                        .with_context(|| format!("parsing port range {spec:?}"))?;
                    let ceil = ceil
                        .trim()
                        .parse::<NonZeroU16>()
                        .with_context(|| format!("parsing port range {spec:?}"))?;
                    if floor > ceil {
                        bail!("port range {spec:?} must be increasing");
                    }
                    ports.extend((floor.get()..=ceil.get()).filter_map(NonZeroU16::new));
                }
            }
        }
        Ok(Self(ports))
    }
}

// === impl PortHasher ===

impl std::hash::Hasher for PortHasher {
    fn write(&mut self, _: &[u8]) {
        unreachable!("hashing a `u16` calls `write_u16`");
    }

    #[inline]
    fn write_u16(&mut self, port: u16) {
        self.0 = port;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<ReservedPorts> {
        s.parse()
    }

    #[test]
    fn parses_ports_and_ranges() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse(" , ").unwrap().is_empty());

        let ports = parse("4, 10-12").unwrap();
        assert_eq!(ports.len(), 4);
        for port in [4, 10, 11, 12] {
            assert!(ports.contains(port), "{port}");
        }
        assert!(!ports.contains(5));
        assert!(!ports.contains(0));
    }

    #[test]
    fn rejects_invalid_specs() {
        for invalid in ["0", "12-10", "2-", "65536", "http"] {
            assert!(parse(invalid).is_err(), "{invalid:?}");
        }
    }
}
