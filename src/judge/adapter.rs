use crate::core::types::ExecutionProfile;
use crate::harness::HarnessTemplate;
use crate::safety::workspace::Workspace;

/// Language adapter contract for the compile/run stages.
///
/// The pipeline stays language-agnostic: an adapter supplies the harness
/// template, the compile-time screen, the resource envelopes and the
/// concrete commands. Every command is built from workspace paths only.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> &'static str;
    /// File name the wrapped source is written to
    fn source_file_name(&self) -> &'static str;
    fn template(&self) -> HarnessTemplate;
    /// Reject user text that reaches outside the workspace at compile time.
    /// Returns the offending construct.
    fn screen(&self, user_code: &str) -> Option<String>;
    fn compile_profile(&self) -> ExecutionProfile;
    fn run_profile(&self) -> ExecutionProfile;
    fn compile_command(&self, workspace: &Workspace) -> Vec<String>;
    fn run_command(&self, workspace: &Workspace) -> Vec<String>;
    /// Command printing the toolchain version, used by `check-deps`
    fn version_command(&self) -> Vec<String>;
}
