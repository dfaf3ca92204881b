//! Ambient service registry.
//!
//! Named entry points for the surrounding plugin system, collected through
//! a distributed slice so downstream crates can contribute services
//! without a central table.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use linkme::distributed_slice;

use crate::kernel::Kernel;
use crate::module::{build, NativeModule};
use crate::target::Target;

pub enum ServiceFn {
    /// Assemble kernels into a native module for a target string.
    Build(fn(&[Arc<Kernel>], &str) -> Result<NativeModule>),
    /// Load a textual-IR file.
    LoadIr(fn(&Path) -> Result<NativeModule>),
    /// Whether a target string names a usable backend.
    TargetEnabled(fn(&str) -> bool),
    /// Major version of the backing code generator.
    VersionMajor(fn() -> u32),
}

pub struct Service {
    pub name: &'static str,
    pub func: ServiceFn,
}

#[distributed_slice]
pub static SERVICES: [Service];

pub fn lookup(name: &str) -> Option<&'static Service> {
    SERVICES.iter().find(|s| s.name == name)
}

fn build_native(kernels: &[Arc<Kernel>], target: &str) -> Result<NativeModule> {
    let target = Target::parse(target)?;
    build(kernels, &target)
}

#[distributed_slice(SERVICES)]
static BUILD_NATIVE: Service =
    Service { name: "codegen.build_native", func: ServiceFn::Build(build_native) };

fn loadfile_clif(path: &Path) -> Result<NativeModule> {
    NativeModule::load_ir(path)
}

#[distributed_slice(SERVICES)]
static LOADFILE_CLIF: Service =
    Service { name: "module.loadfile_clif", func: ServiceFn::LoadIr(loadfile_clif) };

fn target_enabled(target: &str) -> bool {
    matches!(Target::parse(target), Ok(t) if t.backend == "native")
}

#[distributed_slice(SERVICES)]
static TARGET_ENABLED: Service = Service {
    name: "codegen.native_target_enabled",
    func: ServiceFn::TargetEnabled(target_enabled),
};

fn version_major() -> u32 {
    cranelift_codegen::VERSION
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[distributed_slice(SERVICES)]
static VERSION_MAJOR: Service = Service {
    name: "codegen.native_version_major",
    func: ServiceFn::VersionMajor(version_major),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_services_are_registered() {
        for name in [
            "codegen.build_native",
            "module.loadfile_clif",
            "codegen.native_target_enabled",
            "codegen.native_version_major",
        ] {
            assert!(lookup(name).is_some(), "missing service {}", name);
        }
        assert!(lookup("codegen.no_such_service").is_none());
    }

    #[test]
    fn target_enabled_checks_backend() {
        let service = lookup("codegen.native_target_enabled").unwrap();
        let ServiceFn::TargetEnabled(f) = &service.func else { panic!("wrong service kind") };
        assert!(f("native -system-lib"));
        assert!(!f("cuda"));
        assert!(!f(""));
    }
}
