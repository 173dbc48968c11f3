//! Persistent model slots and the streaming generation loop.
//!
//! A [`Model`] pairs a weights handle with an inference context (which owns
//! the KV cache); both are present or both absent, and unload releases the
//! context before the weights.  The whole of [`Model::generate`] runs under
//! the slot's exclusive lock, so concurrent requests against one model are
//! serialized and the lock is the only writer to KV-cache state.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Once;
use std::time::Instant;

use parking_lot::RwLock;

use crate::config::ConfigSection;
use crate::engine::runtime::{Context, ContextParams, ModelParams, Runtime, Weights};
use crate::engine::{InferenceRequest, LlmMode, DEFAULT_STOP_SEQUENCES};
use crate::error::{KernelError, Result};

/// Engine settings resolved from the `llm.local` configuration section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model_dir: PathBuf,
    pub fast_model: String,
    pub deep_model: String,
    pub default_mode: LlmMode,
    pub use_gpu: bool,
    pub gpu_layers: i32,
    pub context_length: usize,
    pub batch_size: usize,
    pub threads: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/llm/"),
            fast_model: "Phi-3-mini-4k-instruct-q4.gguf".to_string(),
            deep_model: "mistral-7b-instruct-v0.2.Q4_K_M.gguf".to_string(),
            default_mode: LlmMode::Fast,
            use_gpu: true,
            gpu_layers: 35,
            context_length: 512,
            batch_size: 512,
            threads: 4,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &ConfigSection) -> Self {
        let defaults = Self::default();
        Self {
            model_dir: PathBuf::from(
                config.get_str_or("model_path", &defaults.model_dir.to_string_lossy()),
            ),
            fast_model: config.get_str_or("fast_model", &defaults.fast_model),
            deep_model: config.get_str_or("deep_model", &defaults.deep_model),
            default_mode: LlmMode::from_config(config.get_str("mode").unwrap_or("fast")),
            use_gpu: config.get_bool_or("use_gpu", defaults.use_gpu),
            gpu_layers: config.get_i64_or("gpu_layers", defaults.gpu_layers as i64) as i32,
            context_length: config.get_i64_or("context_length", defaults.context_length as i64)
                as usize,
            batch_size: config.get_i64_or("n_batch", defaults.batch_size as i64) as usize,
            threads: config.get_i64_or("n_threads", defaults.threads as i64) as usize,
        }
    }

    fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: if self.use_gpu { self.gpu_layers } else { 0 },
        }
    }

    fn context_params(&self) -> ContextParams {
        ContextParams {
            context_length: self.context_length,
            batch_size: self.batch_size,
            threads: self.threads,
            flash_attention: true,
        }
    }

    fn model_file(&self, mode: LlmMode) -> PathBuf {
        let filename = match mode {
            LlmMode::Fast => &self.fast_model,
            LlmMode::Deep => &self.deep_model,
        };
        self.model_dir.join(filename)
    }
}

/// Model metadata.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub name: String,
    pub mode: LlmMode,
    pub size_bytes: u64,
    pub context_length: usize,
    pub vocab_size: usize,
    pub loaded: bool,
}

impl ModelInfo {
    fn empty(mode: LlmMode) -> Self {
        Self {
            path: PathBuf::new(),
            name: String::new(),
            mode,
            size_bytes: 0,
            context_length: 0,
            vocab_size: 0,
            loaded: false,
        }
    }
}

/// Weights + context pair.  Field order matters: the context (and its KV
/// cache) is released before the weights.
struct LoadedModel {
    context: Box<dyn Context>,
    weights: Box<dyn Weights>,
}

struct ModelState {
    info: ModelInfo,
    loaded: Option<LoadedModel>,
}

/// One persistent model slot.
pub struct Model {
    mode: LlmMode,
    state: RwLock<ModelState>,
}

impl Model {
    pub fn new(mode: LlmMode) -> Self {
        Self {
            mode,
            state: RwLock::new(ModelState {
                info: ModelInfo::empty(mode),
                loaded: None,
            }),
        }
    }

    /// Load weights and context from a model file.
    pub fn load(
        &self,
        runtime: &dyn Runtime,
        path: &Path,
        settings: &EngineSettings,
    ) -> Result<()> {
        let mut state = self.state.write();

        if state.loaded.is_some() {
            return Err(KernelError::ModelAlreadyLoaded);
        }
        if !path.exists() {
            return Err(KernelError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        tracing::info!(path = %path.display(), mode = %self.mode, "loading model");
        let start = Instant::now();

        let weights = runtime.load_weights(path, &settings.model_params())?;
        // If context creation fails the weights drop here, unwinding the
        // partial load.
        let context = weights.new_context(&settings.context_params())?;

        state.info = ModelInfo {
            path: path.to_path_buf(),
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mode: self.mode,
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            context_length: settings.context_length,
            vocab_size: weights.vocab_len(),
            loaded: true,
        };
        state.loaded = Some(LoadedModel { context, weights });

        tracing::info!(
            model = %state.info.name,
            vocab = state.info.vocab_size,
            ctx = state.info.context_length,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(())
    }

    /// Release the context, then the weights.
    pub fn unload(&self) {
        let mut state = self.state.write();
        if let Some(LoadedModel { context, weights }) = state.loaded.take() {
            drop(context);
            drop(weights);
            state.info.loaded = false;
            tracing::info!(model = %state.info.name, "model unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().loaded.is_some()
    }

    pub fn info(&self) -> ModelInfo {
        self.state.read().info.clone()
    }

    /// Run the streaming generation loop.
    ///
    /// Holds the slot's exclusive lock for the entire critical section.
    /// The per-token observer is invoked on the calling thread while that
    /// lock is held; an observer that re-enters generation on the same
    /// model would deadlock -- schedule nested work through the engine's
    /// queue instead.
    pub fn generate(&self, request: &mut InferenceRequest) -> Result<String> {
        let mut state = self.state.write();
        let ModelState { info, loaded } = &mut *state;
        let loaded = loaded.as_mut().ok_or(KernelError::ModelNotLoaded)?;

        let start = Instant::now();

        let tokens = loaded.weights.tokenize(&request.prompt, true)?;
        tracing::debug!(tokens = tokens.len(), "prompt tokenized");

        let limit = info.context_length.saturating_sub(4);
        if tokens.len() > limit {
            return Err(KernelError::PromptTooLong {
                tokens: tokens.len(),
                limit,
            });
        }

        // Fresh conversational context per request.
        loaded.context.clear_cache();
        loaded.context.eval_prompt(&tokens)?;

        let spec = request.sampler_spec();
        let mut sampler = loaded.context.new_sampler(&spec);

        let stop_sequences: Vec<String> = if request.stop_sequences.is_empty() {
            DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
        } else {
            request.stop_sequences.clone()
        };

        let mut output = String::new();
        let mut generated = 0usize;
        let mut pos = tokens.len();

        while generated < request.max_tokens {
            if let Some(cancel) = &request.cancel {
                if cancel.load(Ordering::Acquire) {
                    tracing::debug!(generated, "generation cancelled");
                    break;
                }
            }

            let token = sampler.sample(loaded.context.as_mut());
            if loaded.weights.is_eog(token) {
                tracing::debug!(generated, "end of generation token");
                break;
            }

            let piece = loaded.weights.token_piece(token)?;
            output.push_str(&piece);
            generated += 1;

            if let Some(on_token) = request.on_token.as_mut() {
                if !on_token(&piece) {
                    tracing::debug!(generated, "generation stopped by observer");
                    break;
                }
            }

            if let Some(stop) = stop_sequences.iter().find(|s| output.ends_with(s.as_str())) {
                output.truncate(output.len() - stop.len());
                break;
            }

            loaded
                .context
                .eval_token(token, pos)
                .map_err(|err| KernelError::GenerationFailed {
                    reason: err.to_string(),
                })?;
            pos += 1;
        }

        let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
        let tokens_per_sec = generated as f64 * 1000.0 / elapsed_ms as f64;
        tracing::info!(generated, elapsed_ms, tokens_per_sec, "generation finished");

        Ok(output.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// Model manager
// ---------------------------------------------------------------------------

static BACKEND_INIT: Once = Once::new();

/// Fixed-cardinality set of model slots, one per mode, with a designated
/// active mode.
pub struct ModelManager {
    runtime: std::sync::Arc<dyn Runtime>,
    settings: RwLock<EngineSettings>,
    mode: RwLock<LlmMode>,
    fast: Model,
    deep: Model,
}

impl ModelManager {
    pub fn new(runtime: std::sync::Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            settings: RwLock::new(EngineSettings::default()),
            mode: RwLock::new(LlmMode::Fast),
            fast: Model::new(LlmMode::Fast),
            deep: Model::new(LlmMode::Deep),
        }
    }

    /// Resolve settings from configuration, initialize the backend exactly
    /// once per process, and load the default slot.  The other slot is
    /// loaded lazily on the first switch to it.
    pub fn initialize(&self, config: &ConfigSection) -> Result<()> {
        let settings = EngineSettings::from_config(config);
        let default_mode = settings.default_mode;
        *self.settings.write() = settings;

        BACKEND_INIT.call_once(|| {
            self.runtime.init_backend();
            tracing::info!("inference backend initialized");
        });

        self.load_model(default_mode)
    }

    /// Load the slot for `mode` and make it active.
    pub fn load_model(&self, mode: LlmMode) -> Result<()> {
        let settings = self.settings.read().clone();
        let path = settings.model_file(mode);
        self.slot(mode).load(self.runtime.as_ref(), &path, &settings)?;
        *self.mode.write() = mode;
        tracing::info!(mode = %mode, "model manager: mode active");
        Ok(())
    }

    /// Switch the active mode, loading the target slot on demand.  The
    /// previously active slot is not evicted.
    pub fn switch_mode(&self, mode: LlmMode) -> Result<()> {
        if mode == self.current_mode() && self.slot(mode).is_loaded() {
            return Ok(());
        }

        if !self.slot(mode).is_loaded() {
            self.load_model(mode)?;
        }

        *self.mode.write() = mode;
        tracing::info!(mode = %mode, "switched mode");
        Ok(())
    }

    pub fn current_mode(&self) -> LlmMode {
        *self.mode.read()
    }

    pub fn active_model(&self) -> &Model {
        self.slot(self.current_mode())
    }

    /// Generate with the active model.
    pub fn generate(&self, request: &mut InferenceRequest) -> Result<String> {
        self.active_model().generate(request)
    }

    /// Unload both slots.
    pub fn shutdown(&self) {
        self.fast.unload();
        self.deep.unload();
        tracing::info!("model manager shut down");
    }

    fn slot(&self, mode: LlmMode) -> &Model {
        match mode {
            LlmMode::Fast => &self.fast,
            LlmMode::Deep => &self.deep,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runtime::ScriptedRuntime;
    use crate::engine::Mirostat;
    use std::io::Write as _;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Model directory with empty stand-in files for both modes.
    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["fast.gguf", "deep.gguf"] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(b"gguf").unwrap();
        }
        dir
    }

    fn settings(dir: &tempfile::TempDir) -> EngineSettings {
        EngineSettings {
            model_dir: dir.path().to_path_buf(),
            fast_model: "fast.gguf".to_string(),
            deep_model: "deep.gguf".to_string(),
            ..EngineSettings::default()
        }
    }

    fn loaded_model(pieces: &[&str]) -> (tempfile::TempDir, Model) {
        let dir = model_dir();
        let runtime = ScriptedRuntime::with_output(pieces.to_vec());
        let model = Model::new(LlmMode::Fast);
        model
            .load(runtime.as_ref(), &dir.path().join("fast.gguf"), &settings(&dir))
            .unwrap();
        (dir, model)
    }

    #[test]
    fn load_populates_info_and_unload_clears() {
        let (_dir, model) = loaded_model(&["hi"]);
        assert!(model.is_loaded());

        let info = model.info();
        assert!(info.loaded);
        assert_eq!(info.name, "fast");
        assert_eq!(info.context_length, 512);
        assert!(info.vocab_size > 0);
        assert_eq!(info.size_bytes, 4);

        model.unload();
        assert!(!model.is_loaded());
        assert!(!model.info().loaded);
    }

    #[test]
    fn double_load_is_rejected() {
        let dir = model_dir();
        let runtime = ScriptedRuntime::with_output(["x"]);
        let model = Model::new(LlmMode::Fast);
        let cfg = settings(&dir);
        model
            .load(runtime.as_ref(), &dir.path().join("fast.gguf"), &cfg)
            .unwrap();
        let err = model
            .load(runtime.as_ref(), &dir.path().join("fast.gguf"), &cfg)
            .unwrap_err();
        assert!(matches!(err, KernelError::ModelAlreadyLoaded));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = model_dir();
        let runtime = ScriptedRuntime::with_output(["x"]);
        let model = Model::new(LlmMode::Fast);
        let err = model
            .load(runtime.as_ref(), &dir.path().join("ghost.gguf"), &settings(&dir))
            .unwrap_err();
        assert!(matches!(err, KernelError::ModelNotFound { .. }));
    }

    #[test]
    fn generate_concatenates_pieces() {
        let (_dir, model) = loaded_model(&["The", " answer", " is", " 4", "."]);
        let mut request = InferenceRequest {
            prompt: "What is 2+2?".to_string(),
            ..InferenceRequest::default()
        };
        let output = model.generate(&mut request).unwrap();
        assert_eq!(output, "The answer is 4.");
    }

    #[test]
    fn generate_respects_max_tokens() {
        let (_dir, model) = loaded_model(&["a", "b", "c", "d", "e"]);
        let mut request = InferenceRequest {
            prompt: "p".to_string(),
            max_tokens: 3,
            ..InferenceRequest::default()
        };
        assert_eq!(model.generate(&mut request).unwrap(), "abc");
    }

    #[test]
    fn default_stop_sequence_is_stripped() {
        let (_dir, model) = loaded_model(&["fine", ", thanks", "</s>", "IGNORED"]);
        let mut request = InferenceRequest {
            prompt: "How are you?".to_string(),
            ..InferenceRequest::default()
        };
        assert_eq!(model.generate(&mut request).unwrap(), "fine, thanks");
    }

    #[test]
    fn caller_stop_sequences_override_defaults() {
        let (_dir, model) = loaded_model(&["one", "STOP", "two"]);
        let mut request = InferenceRequest {
            prompt: "p".to_string(),
            stop_sequences: vec!["STOP".to_string()],
            ..InferenceRequest::default()
        };
        assert_eq!(model.generate(&mut request).unwrap(), "one");
    }

    #[test]
    fn prompt_too_long_is_rejected() {
        let dir = model_dir();
        let runtime = ScriptedRuntime::with_output(["x"]);
        let model = Model::new(LlmMode::Fast);
        let cfg = EngineSettings {
            context_length: 8,
            ..settings(&dir)
        };
        model
            .load(runtime.as_ref(), &dir.path().join("fast.gguf"), &cfg)
            .unwrap();

        let mut request = InferenceRequest {
            prompt: "one two three four five six seven eight nine ten".to_string(),
            ..InferenceRequest::default()
        };
        let err = model.generate(&mut request).unwrap_err();
        assert!(matches!(err, KernelError::PromptTooLong { tokens: 10, limit: 4 }));
    }

    #[test]
    fn cancel_flag_stops_between_tokens() {
        let (_dir, model) = loaded_model(&["a", "b", "c", "d"]);
        let cancel = Arc::new(AtomicBool::new(false));

        // The observer trips the flag after the second piece; the loop must
        // stop within one additional token.
        let c = Arc::clone(&cancel);
        let mut count = 0usize;
        let mut request = InferenceRequest {
            prompt: "p".to_string(),
            cancel: Some(Arc::clone(&cancel)),
            on_token: Some(Box::new(move |_piece| {
                count += 1;
                if count == 2 {
                    c.store(true, Ordering::Release);
                }
                true
            })),
            ..InferenceRequest::default()
        };

        let output = model.generate(&mut request).unwrap();
        assert_eq!(output, "ab");
    }

    #[test]
    fn pre_set_cancel_flag_yields_empty_output() {
        let (_dir, model) = loaded_model(&["never"]);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut request = InferenceRequest {
            prompt: "p".to_string(),
            cancel: Some(cancel),
            ..InferenceRequest::default()
        };
        assert_eq!(model.generate(&mut request).unwrap(), "");
    }

    #[test]
    fn observer_false_stops_generation() {
        let (_dir, model) = loaded_model(&["one", "two", "three"]);
        let mut request = InferenceRequest {
            prompt: "p".to_string(),
            on_token: Some(Box::new(|piece| piece != "two")),
            ..InferenceRequest::default()
        };
        assert_eq!(model.generate(&mut request).unwrap(), "onetwo");
    }

    #[test]
    fn generate_against_empty_slot_fails() {
        let model = Model::new(LlmMode::Fast);
        let mut request = InferenceRequest::default();
        assert!(matches!(
            model.generate(&mut request).unwrap_err(),
            KernelError::ModelNotLoaded
        ));
    }

    #[test]
    fn manager_switch_mode_keeps_previous_slot_loaded() {
        let dir = model_dir();
        let runtime = ScriptedRuntime::with_output(["x"]);
        let manager = ModelManager::new(runtime);

        let config = crate::config::Config::from_str(&format!(
            "model_path: {}\nfast_model: fast.gguf\ndeep_model: deep.gguf\nmode: fast\n",
            dir.path().display()
        ))
        .unwrap();
        manager.initialize(config.root()).unwrap();

        assert_eq!(manager.current_mode(), LlmMode::Fast);
        assert!(manager.slot(LlmMode::Fast).is_loaded());
        assert!(!manager.slot(LlmMode::Deep).is_loaded());

        manager.switch_mode(LlmMode::Deep).unwrap();
        assert_eq!(manager.current_mode(), LlmMode::Deep);
        assert!(manager.slot(LlmMode::Deep).is_loaded());
        // The fast slot stays resident.
        assert!(manager.slot(LlmMode::Fast).is_loaded());

        manager.switch_mode(LlmMode::Fast).unwrap();
        assert_eq!(manager.current_mode(), LlmMode::Fast);

        manager.shutdown();
        assert!(!manager.slot(LlmMode::Fast).is_loaded());
        assert!(!manager.slot(LlmMode::Deep).is_loaded());
    }

    #[test]
    fn manager_initialize_missing_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ScriptedRuntime::with_output(["x"]);
        let manager = ModelManager::new(runtime);
        let config = crate::config::Config::from_str(&format!(
            "model_path: {}\n",
            dir.path().display()
        ))
        .unwrap();
        let err = manager.initialize(config.root()).unwrap_err();
        assert!(matches!(err, KernelError::ModelNotFound { .. }));
    }

    #[test]
    fn sampler_spec_reflects_mirostat_mode() {
        use crate::engine::runtime::SamplerStage;

        let request = InferenceRequest {
            mirostat: Mirostat::v2(),
            ..InferenceRequest::default()
        };
        let spec = request.sampler_spec();
        // Default repeat penalty of 1.1 prepends a penalty stage.
        assert!(matches!(
            spec.stages[0],
            SamplerStage::Penalties { window: 64, .. }
        ));
        assert!(matches!(spec.stages[1], SamplerStage::MirostatV2 { .. }));

        let request = InferenceRequest {
            repeat_penalty: 1.0,
            ..InferenceRequest::default()
        };
        let spec = request.sampler_spec();
        assert_eq!(
            spec.stages,
            vec![
                SamplerStage::TopK(40),
                SamplerStage::TopP(0.9),
                SamplerStage::Temperature(0.7),
                SamplerStage::Dist,
            ]
        );
    }
}
