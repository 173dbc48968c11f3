//! Opaque inference-runtime boundary.
//!
//! The kernel never links the model runtime directly; the engine is written
//! against the object-safe traits below, which mirror the operations a
//! llama-style backend exposes: one-time backend init, weights loading,
//! context creation (the context owns the KV cache), tokenization, batch
//! evaluation, sampler construction, and token decoding.
//!
//! Two implementations ship with the crate: [`disabled`], whose loads
//! always fail so the engine comes up not-ready, and [`ScriptedRuntime`],
//! which replays a fixed token stream and exists to exercise the generation
//! loop without any model on disk.

use std::path::Path;
use std::sync::Arc;

use crate::error::{KernelError, Result};

/// Runtime token identifier.
pub type TokenId = i32;

/// Parameters for instantiating a weights handle.
#[derive(Debug, Clone, Copy)]
pub struct ModelParams {
    /// Layers offloaded to the GPU; 0 keeps everything on the CPU.
    pub gpu_layers: i32,
}

/// Parameters for creating an inference context.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    pub context_length: usize,
    pub batch_size: usize,
    pub threads: usize,
    pub flash_attention: bool,
}

/// One stage of a sampler chain, in application order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    /// Multiplicative repetition penalty over a trailing token window.
    Penalties {
        window: usize,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    TopK(i32),
    TopP(f32),
    Temperature(f32),
    /// Final draw from the remaining distribution.
    Dist,
    MirostatV1 { tau: f32, eta: f32, m: i32 },
    MirostatV2 { tau: f32, eta: f32 },
}

/// A declarative sampler chain, interpreted by the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplerSpec {
    pub stages: Vec<SamplerStage>,
}

/// Stateful sampler bound to one generation.
pub trait Sampler: Send {
    /// Draw the next token from the context's current logits.
    fn sample(&mut self, ctx: &mut dyn Context) -> TokenId;
}

/// An inference context; owns the KV cache.
pub trait Context: Send + Sync {
    /// Clear the KV cache for a fresh conversational context.
    fn clear_cache(&mut self);

    /// Evaluate the full prompt in one batch, requesting logits only for
    /// the final token.
    fn eval_prompt(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Evaluate a single generated token at `pos`.
    fn eval_token(&mut self, token: TokenId, pos: usize) -> Result<()>;

    /// Build a sampler for this context from a declarative chain.
    fn new_sampler(&self, spec: &SamplerSpec) -> Box<dyn Sampler>;
}

/// Loaded model weights.
pub trait Weights: Send + Sync + std::fmt::Debug {
    /// Create an inference context over these weights.
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn Context>>;

    /// Tokenize text; `parse_special` enables special-token parsing.
    fn tokenize(&self, text: &str, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Decode one token to its text fragment.
    fn token_piece(&self, token: TokenId) -> Result<String>;

    /// Whether the runtime reports this token as end-of-generation.
    fn is_eog(&self, token: TokenId) -> bool;

    /// Vocabulary cardinality.
    fn vocab_len(&self) -> usize;
}

/// The runtime backend itself.
pub trait Runtime: Send + Sync {
    /// One-time process-wide backend initialization.  The engine guards
    /// this with a `Once`; implementations may assume a single call.
    fn init_backend(&self);

    /// Instantiate a weights handle from a model file.
    fn load_weights(&self, path: &Path, params: &ModelParams) -> Result<Box<dyn Weights>>;
}

// ---------------------------------------------------------------------------
// Disabled runtime
// ---------------------------------------------------------------------------

struct DisabledRuntime;

impl Runtime for DisabledRuntime {
    fn init_backend(&self) {}

    fn load_weights(&self, path: &Path, _params: &ModelParams) -> Result<Box<dyn Weights>> {
        tracing::debug!(path = %path.display(), "no inference runtime linked into this build");
        Err(KernelError::ModelLoadFailed {
            reason: "no inference runtime linked into this build".to_string(),
        })
    }
}

/// A runtime whose loads always fail.  The engine initialized against it
/// comes up not-ready and every request fails fast.
pub fn disabled() -> Arc<dyn Runtime> {
    Arc::new(DisabledRuntime)
}

// ---------------------------------------------------------------------------
// Scripted runtime
// ---------------------------------------------------------------------------

/// First token id handed out for generated pieces; prompt tokens sit below.
const SCRIPT_BASE: TokenId = 1 << 20;

/// Replays a fixed sequence of text fragments, one per sampled token, then
/// reports end-of-generation.  Tokenization is whitespace word splitting.
pub struct ScriptedRuntime {
    pieces: Vec<String>,
}

impl ScriptedRuntime {
    /// A runtime that generates exactly `pieces`, in order.
    pub fn with_output<S: Into<String>>(pieces: impl IntoIterator<Item = S>) -> Arc<dyn Runtime> {
        Arc::new(Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
        })
    }
}

impl Runtime for ScriptedRuntime {
    fn init_backend(&self) {}

    fn load_weights(&self, _path: &Path, _params: &ModelParams) -> Result<Box<dyn Weights>> {
        Ok(Box::new(ScriptedWeights {
            pieces: self.pieces.clone(),
        }))
    }
}

#[derive(Debug)]
struct ScriptedWeights {
    pieces: Vec<String>,
}

impl Weights for ScriptedWeights {
    fn new_context(&self, _params: &ContextParams) -> Result<Box<dyn Context>> {
        Ok(Box::new(ScriptedContext {
            script_len: self.pieces.len(),
            position: 0,
        }))
    }

    fn tokenize(&self, text: &str, _parse_special: bool) -> Result<Vec<TokenId>> {
        Ok(text
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| i as TokenId)
            .collect())
    }

    fn token_piece(&self, token: TokenId) -> Result<String> {
        let index = (token - SCRIPT_BASE) as usize;
        self.pieces
            .get(index)
            .cloned()
            .ok_or(KernelError::DecodeFailed { token })
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == SCRIPT_BASE + self.pieces.len() as TokenId
    }

    fn vocab_len(&self) -> usize {
        SCRIPT_BASE as usize + self.pieces.len() + 1
    }
}

struct ScriptedContext {
    script_len: usize,
    position: usize,
}

impl Context for ScriptedContext {
    fn clear_cache(&mut self) {
        self.position = 0;
    }

    fn eval_prompt(&mut self, tokens: &[TokenId]) -> Result<()> {
        self.position = tokens.len();
        Ok(())
    }

    fn eval_token(&mut self, _token: TokenId, pos: usize) -> Result<()> {
        self.position = pos + 1;
        Ok(())
    }

    fn new_sampler(&self, _spec: &SamplerSpec) -> Box<dyn Sampler> {
        Box::new(ScriptedSampler {
            next: 0,
            script_len: self.script_len,
        })
    }
}

struct ScriptedSampler {
    next: usize,
    script_len: usize,
}

impl Sampler for ScriptedSampler {
    fn sample(&mut self, _ctx: &mut dyn Context) -> TokenId {
        let token = SCRIPT_BASE + self.next.min(self.script_len) as TokenId;
        if self.next < self.script_len {
            self.next += 1;
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_runtime_refuses_to_load() {
        let runtime = disabled();
        let err = runtime
            .load_weights(Path::new("models/fast.gguf"), &ModelParams { gpu_layers: 0 })
            .unwrap_err();
        assert!(matches!(err, KernelError::ModelLoadFailed { .. }));
    }

    #[test]
    fn scripted_runtime_replays_pieces() {
        let runtime = ScriptedRuntime::with_output(["Hello", ",", " world"]);
        let weights = runtime
            .load_weights(Path::new("unused"), &ModelParams { gpu_layers: 0 })
            .unwrap();
        let mut ctx = weights
            .new_context(&ContextParams {
                context_length: 512,
                batch_size: 512,
                threads: 1,
                flash_attention: true,
            })
            .unwrap();

        let prompt = weights.tokenize("one two three", true).unwrap();
        assert_eq!(prompt.len(), 3);
        ctx.eval_prompt(&prompt).unwrap();

        let mut sampler = ctx.new_sampler(&SamplerSpec::default());
        let mut out = String::new();
        loop {
            let token = sampler.sample(ctx.as_mut());
            if weights.is_eog(token) {
                break;
            }
            out.push_str(&weights.token_piece(token).unwrap());
        }
        assert_eq!(out, "Hello, world");
    }
}
