//! LLM inference engine.
//!
//! Models are loaded once and kept resident; generation streams tokens
//! through an optional per-token observer and honors a cooperative cancel
//! flag between tokens.  The engine owns a single-worker task queue, so
//! asynchronous requests are strictly FIFO and inference never runs
//! concurrently with itself -- the second serialization layer on top of
//! each model slot's exclusive lock.

pub mod model;
pub mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ConfigSection;
use crate::error::{KernelError, Result};
use crate::scheduler::TaskQueue;
use crate::task::{TaskHandle, TaskPriority};

pub use model::{EngineSettings, Model, ModelInfo, ModelManager};
pub use runtime::{Runtime, SamplerSpec, SamplerStage, TokenId};

/// Stop set applied when a request provides no stop sequences of its own.
pub const DEFAULT_STOP_SEQUENCES: [&str; 5] =
    ["</s>", "[/INST]", "<|end|>", "<|endoftext|>", "<|im_end|>"];

/// The model slot selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmMode {
    /// Small model for quick responses.
    Fast,
    /// Large model for complex reasoning.
    Deep,
}

impl LlmMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Deep => "deep",
        }
    }

    /// Configuration and wire spelling: "deep" selects `Deep`, everything
    /// else falls back to `Fast`.
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("deep") {
            Self::Deep
        } else {
            Self::Fast
        }
    }
}

impl std::fmt::Display for LlmMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surprise-controlled sampling selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mirostat {
    Disabled,
    V1 { tau: f32, eta: f32 },
    V2 { tau: f32, eta: f32 },
}

impl Mirostat {
    /// Mirostat v1 with the default target cross-entropy and learning rate.
    pub fn v1() -> Self {
        Self::V1 { tau: 5.0, eta: 0.1 }
    }

    /// Mirostat v2 with the default target cross-entropy and learning rate.
    pub fn v2() -> Self {
        Self::V2 { tau: 5.0, eta: 0.1 }
    }
}

/// Streaming token observer; returning `false` requests immediate stop.
pub type TokenCallback = Box<dyn FnMut(&str) -> bool + Send>;

/// Invoked once with the final result of an asynchronous request.
pub type CompletionCallback = Box<dyn FnOnce(Result<String>) + Send>;

/// Parameters for one generation request.
pub struct InferenceRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub mirostat: Mirostat,
    pub stop_sequences: Vec<String>,
    pub on_token: Option<TokenCallback>,
    pub on_complete: Option<CompletionCallback>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for InferenceRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 128,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            mirostat: Mirostat::Disabled,
            stop_sequences: Vec::new(),
            on_token: None,
            on_complete: None,
            cancel: None,
        }
    }
}

impl InferenceRequest {
    /// Build the declarative sampler chain for this request: a repeat
    /// penalty stage (window 64) when the penalty is not 1, then either a
    /// mirostat stage or the standard top-k -> top-p -> temperature ->
    /// distribution chain.
    pub fn sampler_spec(&self) -> SamplerSpec {
        let mut stages = Vec::new();

        if (self.repeat_penalty - 1.0).abs() > f32::EPSILON {
            stages.push(SamplerStage::Penalties {
                window: 64,
                repeat: self.repeat_penalty,
                frequency: 0.0,
                presence: 0.0,
            });
        }

        match self.mirostat {
            Mirostat::V1 { tau, eta } => {
                stages.push(SamplerStage::MirostatV1 { tau, eta, m: 100 });
            }
            Mirostat::V2 { tau, eta } => {
                stages.push(SamplerStage::MirostatV2 { tau, eta });
            }
            Mirostat::Disabled => {
                stages.push(SamplerStage::TopK(self.top_k));
                stages.push(SamplerStage::TopP(self.top_p));
                stages.push(SamplerStage::Temperature(self.temperature));
                stages.push(SamplerStage::Dist);
            }
        }

        SamplerSpec { stages }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Asynchronous inference engine over the model manager.
pub struct InferenceEngine {
    manager: Arc<ModelManager>,
    /// Exactly one worker: ready inference jobs run FIFO, one at a time.
    queue: TaskQueue,
    initialized: AtomicBool,
}

impl InferenceEngine {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            manager: Arc::new(ModelManager::new(runtime)),
            queue: TaskQueue::new(1),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the model manager from the `llm.local` configuration
    /// section and start the engine's queue.
    pub fn initialize(&self, config: &ConfigSection) -> Result<()> {
        self.manager.initialize(config)?;
        self.queue.start();
        self.initialized.store(true, Ordering::Release);
        tracing::info!("inference engine initialized");
        Ok(())
    }

    /// Submit a request for asynchronous generation.  The completion
    /// callback (if any) runs on the engine worker with the final result.
    ///
    /// When the engine is not ready the request fails fast: the callback
    /// receives an error and the returned handle is already `Failed`.
    pub fn submit(&self, mut request: InferenceRequest) -> TaskHandle {
        if !self.is_ready() {
            if let Some(on_complete) = request.on_complete.take() {
                on_complete(Err(KernelError::ModelNotLoaded));
            }
            return TaskHandle::failed(0);
        }

        let manager = Arc::clone(&self.manager);
        let on_complete = request.on_complete.take();
        self.queue.submit(
            move || {
                let result = manager.generate(&mut request);
                if let Some(on_complete) = on_complete {
                    on_complete(result);
                }
            },
            TaskPriority::Normal,
        )
    }

    /// Generate synchronously on the calling thread.
    ///
    /// Must not be called from inside a per-token observer: the observer
    /// runs while the active model's exclusive lock is held, and
    /// re-entering generation on that model deadlocks.  Nested work belongs
    /// on [`submit`](Self::submit).
    pub fn generate_sync(&self, mut request: InferenceRequest) -> Result<String> {
        self.manager.generate(&mut request)
    }

    /// Switch the active model mode, loading the target slot on demand.
    pub fn switch_mode(&self, mode: LlmMode) -> Result<()> {
        self.manager.switch_mode(mode)
    }

    pub fn current_mode(&self) -> LlmMode {
        self.manager.current_mode()
    }

    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Stop the queue, then unload both model slots.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.queue.stop();
        self.manager.shutdown();
        tracing::info!("inference engine shut down");
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
