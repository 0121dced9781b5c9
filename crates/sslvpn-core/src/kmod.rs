//! Kernel module presence checks.

use crate::command::{args, CommandRunner};
use std::path::{Path, PathBuf};

/// Default sysfs directory listing loaded modules.
pub const SYS_MODULE_DIR: &str = "/sys/module";

/// Ensures kernel modules are loaded, loading them with `modprobe` if needed.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    sys_module_dir: PathBuf,
}

impl ModuleLoader {
    /// Loader inspecting the given sysfs module directory.
    pub fn new(sys_module_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_module_dir: sys_module_dir.into(),
        }
    }

    /// Returns true if `name` is loaded (or built in).
    pub fn is_loaded(&self, name: &str) -> bool {
        module_present(&self.sys_module_dir, name)
    }

    /// Make sure `name` is loaded, running `modprobe` when it is not.
    ///
    /// Returns whether the module is available afterwards. Failures are
    /// logged; the caller's next use of the subsystem reports the real error.
    pub async fn ensure<R: CommandRunner>(&self, runner: &R, name: &str) -> bool {
        if self.is_loaded(name) {
            return true;
        }

        log::info!("Kernel module {} not loaded, running modprobe", name);
        match runner.run("modprobe", &args([name])).await {
            Ok(output) if output.success => true,
            Ok(output) => {
                log::error!("modprobe {} failed: {}", name, output.stderr.trim());
                false
            }
            Err(e) => {
                log::error!("modprobe {} failed: {}", name, e);
                false
            }
        }
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new(SYS_MODULE_DIR)
    }
}

fn module_present(dir: &Path, name: &str) -> bool {
    // sysfs always uses underscores, modprobe accepts either form.
    dir.join(name.replace('-', "_")).exists()
}
