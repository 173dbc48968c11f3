//! Kernel error types.
//!
//! All kernel subsystems surface failures through [`KernelError`], the single
//! error type returned by every fallible API in this crate.  Each error maps
//! onto a coarse [`ErrorCategory`] plus a numeric sub-code so that callers
//! (and the shell on the far side of the IPC boundary) can classify failures
//! without parsing message strings.

use std::path::PathBuf;

use hearth_ipc::IpcError;

/// Coarse classification of a kernel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Kernel,
    Module,
    Ipc,
    Llm,
    Config,
    Permission,
    Io,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Kernel => "kernel",
            Self::Module => "module",
            Self::Ipc => "ipc",
            Self::Llm => "llm",
            Self::Config => "config",
            Self::Permission => "permission",
            Self::Io => "io",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Unified error type for the Hearth micro-kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Config errors ------------------------------------------------------
    /// The configuration file could not be opened.
    #[error("failed to open config file {}: {source}", path.display())]
    ConfigOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML.
    #[error("failed to parse config file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// The configuration root is not a mapping of sections.
    #[error("config file {} must contain a top-level mapping", path.display())]
    ConfigNotAMapping { path: PathBuf },

    // -- Module errors ------------------------------------------------------
    /// A module with the same name is already registered.
    #[error("module '{name}' already registered")]
    ModuleAlreadyRegistered { name: String },

    /// The referenced module is not in the registry.
    #[error("module '{name}' not found")]
    ModuleNotFound { name: String },

    /// A declared dependency has never been registered.
    #[error("dependency '{name}' not registered")]
    DependencyNotRegistered { name: String },

    /// A declared dependency is registered but not in a loaded state.
    #[error("Dependency '{name}' not loaded")]
    DependencyNotLoaded { name: String },

    /// The module is not in the state required for the requested transition.
    #[error("module '{name}' must be loaded before enabling (state: {state})")]
    ModuleNotLoadedYet { name: String, state: crate::module::ModuleState },

    /// A module listed itself among its own dependencies.
    #[error("module '{name}' cannot depend on itself")]
    SelfDependency { name: String },

    /// A module's own load/enable/disable/shutdown hook failed.
    #[error("module '{name}' {stage} failed: {reason}")]
    ModuleHookFailed {
        name: String,
        stage: &'static str,
        reason: String,
    },

    // -- LLM errors ---------------------------------------------------------
    /// Weights and context are already resident in this slot.
    #[error("model already loaded")]
    ModelAlreadyLoaded,

    /// The model file does not exist on disk.
    #[error("model file not found: {}", path.display())]
    ModelNotFound { path: PathBuf },

    /// The runtime failed to instantiate a weights handle.
    #[error("failed to load model: {reason}")]
    ModelLoadFailed { reason: String },

    /// The runtime failed to create an inference context.
    #[error("failed to create context: {reason}")]
    ContextCreateFailed { reason: String },

    /// Generation was requested against an empty slot.
    #[error("model not loaded")]
    ModelNotLoaded,

    /// The prompt could not be tokenized.
    #[error("failed to tokenize prompt")]
    TokenizeFailed,

    /// The tokenized prompt does not fit the context window.
    #[error("prompt too long for context ({tokens} tokens, limit {limit})")]
    PromptTooLong { tokens: usize, limit: usize },

    /// Batch evaluation of the prompt failed inside the runtime.
    #[error("failed to evaluate prompt: {reason}")]
    PromptEvalFailed { reason: String },

    /// A sampled token could not be decoded to text.
    #[error("failed to decode token {token}")]
    DecodeFailed { token: i32 },

    /// Single-token evaluation failed mid-generation.
    #[error("failed during token generation: {reason}")]
    GenerationFailed { reason: String },

    // -- Permission errors --------------------------------------------------
    /// The calling module does not hold the required permission bit.
    #[error("module '{module}' denied {permission} permission")]
    PermissionDenied {
        module: String,
        permission: crate::permission::Permission,
    },

    // -- IPC / IO -----------------------------------------------------------
    /// A failure inside the boundary transport.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// An operating-system level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// The coarse category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigOpen { .. } | Self::ConfigParse { .. } | Self::ConfigNotAMapping { .. } => {
                ErrorCategory::Config
            }
            Self::ModuleAlreadyRegistered { .. }
            | Self::ModuleNotFound { .. }
            | Self::DependencyNotRegistered { .. }
            | Self::DependencyNotLoaded { .. }
            | Self::ModuleNotLoadedYet { .. }
            | Self::SelfDependency { .. }
            | Self::ModuleHookFailed { .. } => ErrorCategory::Module,
            Self::ModelAlreadyLoaded
            | Self::ModelNotFound { .. }
            | Self::ModelLoadFailed { .. }
            | Self::ContextCreateFailed { .. }
            | Self::ModelNotLoaded
            | Self::TokenizeFailed
            | Self::PromptTooLong { .. }
            | Self::PromptEvalFailed { .. }
            | Self::DecodeFailed { .. }
            | Self::GenerationFailed { .. } => ErrorCategory::Llm,
            Self::PermissionDenied { .. } => ErrorCategory::Permission,
            Self::Ipc(_) => ErrorCategory::Ipc,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Numeric sub-code within the category.
    pub fn code(&self) -> u16 {
        match self {
            Self::ConfigOpen { .. } => 1,
            Self::ConfigParse { .. } => 2,
            Self::ConfigNotAMapping { .. } => 3,

            Self::ModuleAlreadyRegistered { .. } => 1,
            Self::ModuleNotFound { .. } => 2,
            Self::DependencyNotRegistered { .. } => 3,
            Self::DependencyNotLoaded { .. } => 4,
            Self::ModuleNotLoadedYet { .. } => 5,
            Self::SelfDependency { .. } => 6,
            Self::ModuleHookFailed { .. } => 7,

            Self::ModelAlreadyLoaded => 1,
            Self::ModelNotFound { .. } => 2,
            Self::ModelLoadFailed { .. } => 3,
            Self::ContextCreateFailed { .. } => 4,
            Self::ModelNotLoaded => 10,
            Self::TokenizeFailed => 11,
            Self::PromptTooLong { .. } => 12,
            Self::PromptEvalFailed { .. } => 13,
            Self::DecodeFailed { .. } | Self::GenerationFailed { .. } => 14,

            Self::PermissionDenied { .. } => 1,
            Self::Ipc(_) => 1,
            Self::Io(_) => 1,
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_and_codes() {
        let err = KernelError::PromptTooLong {
            tokens: 600,
            limit: 508,
        };
        assert_eq!(err.category(), ErrorCategory::Llm);
        assert_eq!(err.code(), 12);

        let err = KernelError::DependencyNotLoaded {
            name: "calendar".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Module);
        assert_eq!(err.code(), 4);
        assert_eq!(err.to_string(), "Dependency 'calendar' not loaded");
    }

    #[test]
    fn category_display() {
        assert_eq!(ErrorCategory::Llm.to_string(), "llm");
        assert_eq!(ErrorCategory::Permission.to_string(), "permission");
    }
}
