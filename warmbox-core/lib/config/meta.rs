use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Resource and startup requirements of a sandbox.
///
/// The pool does not interpret `installs` and `imports` beyond writing them into the
/// sandbox's bootstrap script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct SandboxMeta {
    /// Memory limit in MiB. Zero means "use the pool's default".
    #[builder(default)]
    #[serde(default)]
    pub mem_limit_mb: u64,

    /// Installed packages whose files are appended to the module search path.
    #[builder(default, setter(into))]
    #[serde(default)]
    pub installs: Vec<String>,

    /// Modules imported before the sandbox starts serving.
    #[builder(default, setter(into))]
    #[serde(default)]
    pub imports: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxMeta {
    /// Fills in unset values from the pool's defaults.
    pub fn fill_defaults(mut self, default_mem_limit_mb: u64) -> Self {
        if self.mem_limit_mb == 0 {
            self.mem_limit_mb = default_mem_limit_mb;
        }
        self
    }

    /// Renders the bootstrap script: package paths, imports, then the entry point.
    ///
    /// Leaves serve user code with `web_server()`; zygotes run the generic `fork_server()`.
    pub fn bootstrap_script(&self, is_leaf: bool) -> String {
        let mut lines = Vec::with_capacity(self.installs.len() + self.imports.len() + 1);

        for pkg in &self.installs {
            lines.push(format!("sys.path.append('/packages/{}/files')", pkg));
        }

        for module in &self.imports {
            lines.push(format!("import {}", module));
        }

        lines.push(if is_leaf { "web_server()" } else { "fork_server()" }.to_string());

        lines.join("\n")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_defaults_only_replaces_zero() {
        let meta = SandboxMeta::default().fill_defaults(128);
        assert_eq!(meta.mem_limit_mb, 128);

        let meta = SandboxMeta::builder()
            .mem_limit_mb(300)
            .build()
            .fill_defaults(128);
        assert_eq!(meta.mem_limit_mb, 300);
    }

    #[test]
    fn test_bootstrap_script_leaf_and_zygote() {
        let meta = SandboxMeta::builder()
            .installs(vec!["requests".to_string()])
            .imports(vec!["json".to_string(), "requests".to_string()])
            .build();

        assert_eq!(
            meta.bootstrap_script(true),
            "sys.path.append('/packages/requests/files')\nimport json\nimport requests\nweb_server()"
        );
        assert!(meta.bootstrap_script(false).ends_with("\nfork_server()"));
        assert_eq!(SandboxMeta::default().bootstrap_script(false), "fork_server()");
    }
}
