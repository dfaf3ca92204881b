//! Target descriptor parsing.
//!
//! A target string names the backend followed by options:
//! `native [-option[=value]]...`. `-system-lib` marks a statically
//! initialized module; `-mcpu`, `-mattr` and `-target` carry codegen
//! options. Unrecognized options are preserved in the raw string.

use std::fmt;

use anyhow::{bail, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub backend: String,
    pub mcpu: Option<String>,
    pub mattr: Option<String>,
    /// Explicit target triple; absent means the host.
    pub triple: Option<String>,
    pub system_lib: bool,
    raw: String,
}

impl Target {
    pub fn parse(s: &str) -> Result<Target> {
        let mut parts = s.split_whitespace();
        let backend = match parts.next() {
            Some(b) if !b.starts_with('-') => b.to_string(),
            _ => bail!("target string has no backend: {:?}", s),
        };

        let mut target = Target {
            backend,
            mcpu: None,
            mattr: None,
            triple: None,
            system_lib: false,
            raw: s.trim().to_string(),
        };

        for opt in parts {
            if !opt.starts_with('-') {
                bail!("malformed target option {:?} in {:?}", opt, s);
            }
            let body = &opt[1..];
            let (key, value) = match body.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (body, None),
            };
            match (key, value) {
                ("system-lib", None) => target.system_lib = true,
                ("mcpu", Some(v)) => target.mcpu = Some(v.to_string()),
                ("mattr", Some(v)) => target.mattr = Some(v.to_string()),
                ("target", Some(v)) => target.triple = Some(v.to_string()),
                // unknown options ride along in the raw string
                _ => log::debug!("ignoring target option {:?}", opt),
            }
        }
        Ok(target)
    }

    /// The host JIT target.
    pub fn native() -> Target {
        Target::parse("native").unwrap()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_and_flags() {
        let t = Target::parse("native -mcpu=skylake -system-lib").unwrap();
        assert_eq!(t.backend, "native");
        assert_eq!(t.mcpu.as_deref(), Some("skylake"));
        assert!(t.system_lib);
        assert_eq!(t.to_string(), "native -mcpu=skylake -system-lib");
    }

    #[test]
    fn parses_triple() {
        let t = Target::parse("native -target=x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(t.triple.as_deref(), Some("x86_64-unknown-linux-gnu"));
        assert!(!t.system_lib);
    }

    #[test]
    fn rejects_missing_backend() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("-system-lib").is_err());
    }
}
