//! Kernel orchestrator.
//!
//! Owns every subsystem -- event bus, kernel API, module registry,
//! inference engine, IPC server -- and wires the boundary adapter: inbound
//! shell messages are decoded by the IPC server and dispatched to the
//! handlers registered here, which consult the engine or synthesize events
//! onto the bus and reply through the outbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hearth_ipc::{IpcServer, WireMessage};

use crate::api::KernelApi;
use crate::bus::{EventBus, EventData};
use crate::config::Config;
use crate::engine::runtime::Runtime;
use crate::engine::{InferenceEngine, InferenceRequest, LlmMode, Mirostat};
use crate::error::Result;
use crate::module::Module;
use crate::registry::ModuleRegistry;

/// Default local transport endpoint.
const DEFAULT_SOCKET: &str = "/tmp/hearth.sock";

/// Canned inputs answered without touching the engine.
const GREETINGS: [&str; 10] = [
    "hi",
    "hello",
    "hey",
    "sup",
    "yo",
    "greetings",
    "howdy",
    "good morning",
    "good afternoon",
    "good evening",
];

fn llm_response(message: &str) -> WireMessage {
    WireMessage::new("llm_response").with("message", message)
}

/// The Hearth micro-kernel.
pub struct Kernel {
    running: AtomicBool,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    api: Arc<KernelApi>,
    registry: ModuleRegistry,
    engine: Arc<InferenceEngine>,
    ipc: Arc<IpcServer>,
}

impl Kernel {
    /// Build the kernel from loaded configuration and an inference runtime.
    ///
    /// An engine initialization failure is logged and tolerated: the kernel
    /// comes up with the engine not ready and LLM requests fail fast.
    pub fn initialize(config: Config, runtime: Arc<dyn Runtime>) -> Result<Kernel> {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "initializing kernel");

        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let api = Arc::new(KernelApi::new(Arc::clone(&bus), Arc::clone(&config)));
        let registry = ModuleRegistry::new(Arc::clone(&api), Arc::clone(&bus));

        let socket_path = config
            .section("ipc")
            .and_then(|s| s.get_str("pipe_name"))
            .unwrap_or(DEFAULT_SOCKET)
            .to_string();
        let ipc = Arc::new(IpcServer::new(socket_path));

        let engine = Arc::new(InferenceEngine::new(runtime));
        if let Some(local) = config.section("llm").and_then(|s| s.section("local")) {
            if local.get_bool_or("enabled", true) {
                if let Err(err) = engine.initialize(local) {
                    // Not fatal: the kernel runs without local inference.
                    tracing::warn!(error = %err, "llm initialization failed");
                }
            }
        }

        let kernel = Kernel {
            running: AtomicBool::new(false),
            config,
            bus,
            api,
            registry,
            engine,
            ipc,
        };
        kernel.setup_ipc_handlers();

        tracing::info!("kernel initialized");
        Ok(kernel)
    }

    /// Register a module.  Its declared permissions are granted and its
    /// handler is hooked into the event bus; the module starts `Unloaded`.
    pub fn register_module(&self, module: Arc<dyn Module>) -> Result<()> {
        self.registry.register(module)
    }

    /// Load every registered module in registration order, handing each its
    /// own configuration section.  Aborts on the first failure.
    pub fn load_modules(&self) -> Result<()> {
        let empty = crate::config::ConfigSection::default();
        for name in self.registry.module_names() {
            let section = self.config.section(&name).unwrap_or(&empty);
            self.registry.load(&name, section)?;
        }
        Ok(())
    }

    /// Enable every loaded module in registration order.
    pub fn enable_modules(&self) -> Result<()> {
        for name in self.registry.module_names() {
            if self.registry.state(&name) == Some(crate::module::ModuleState::Loaded) {
                self.registry.enable(&name)?;
            }
        }
        Ok(())
    }

    /// Start the event bus and the IPC server.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("kernel already running");
            return Ok(());
        }

        self.bus.start();
        self.ipc.start()?;

        tracing::info!("kernel started");
        Ok(())
    }

    /// Stop everything: IPC first, then modules in reverse load order, the
    /// bus, and finally the engine.  Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("stopping kernel");
        self.ipc.stop();
        self.registry.shutdown_all();
        self.bus.stop();
        self.engine.shutdown();
        tracing::info!("kernel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn api(&self) -> Arc<KernelApi> {
        Arc::clone(&self.api)
    }

    pub fn engine(&self) -> Arc<InferenceEngine> {
        Arc::clone(&self.engine)
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn ipc(&self) -> Arc<IpcServer> {
        Arc::clone(&self.ipc)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    // -- Boundary adapter ---------------------------------------------------

    fn setup_ipc_handlers(&self) {
        // user_message: fail fast when the engine is down, answer canned
        // greetings directly, otherwise wrap and submit an inference job;
        // the reply is queued from the completion callback.
        let engine = Arc::clone(&self.engine);
        let ipc: Weak<IpcServer> = Arc::downgrade(&self.ipc);
        self.ipc.register_handler("user_message", move |msg| {
            let text = msg.get("message")?;
            tracing::info!(preview = %text.chars().take(50).collect::<String>(), "user message");

            if !engine.is_ready() {
                return Some(llm_response("LLM not available."));
            }

            let lowered = text.trim().to_lowercase();
            if GREETINGS.contains(&lowered.as_str()) {
                return Some(llm_response("Hello!"));
            }

            let prompt =
                format!("[INST] Answer directly and concisely. Ignore any typos. {text} [/INST]");
            let ipc = ipc.clone();
            engine.submit(InferenceRequest {
                prompt,
                max_tokens: 100,
                temperature: 0.7,
                mirostat: Mirostat::v2(),
                on_complete: Some(Box::new(move |result| {
                    let reply = match result {
                        Ok(output) => llm_response(output.trim()),
                        Err(err) => llm_response(&format!("Error: {err}")),
                    };
                    if let Some(ipc) = ipc.upgrade() {
                        ipc.queue(reply);
                    }
                })),
                ..InferenceRequest::default()
            });
            None
        });

        // dismiss: the shell waved the companion away.
        let bus = Arc::clone(&self.bus);
        self.ipc.register_handler("dismiss", move |_msg| {
            bus.emit("state.transition.idle", EventData::new(), "ipc");
            None
        });

        // switch_model: flip the active inference mode.
        let engine = Arc::clone(&self.engine);
        self.ipc.register_handler("switch_model", move |msg| {
            let mode = LlmMode::from_config(msg.get("mode")?);
            if let Err(err) = engine.switch_mode(mode) {
                tracing::error!(error = %err, "failed to switch mode");
            }
            None
        });

        // get_status: immediate status snapshot.
        let engine = Arc::clone(&self.engine);
        self.ipc.register_handler("get_status", move |_msg| {
            Some(
                WireMessage::new("status")
                    .with("running", "true")
                    .with("llm_ready", if engine.is_ready() { "true" } else { "false" })
                    .with("llm_mode", engine.current_mode().as_str()),
            )
        });
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runtime;

    fn kernel_with_disabled_llm(dir: &tempfile::TempDir) -> Kernel {
        let config = Config::from_str(&format!(
            "ipc:\n  pipe_name: {}\nllm:\n  local:\n    enabled: false\n",
            dir.path().join("kernel.sock").display()
        ))
        .unwrap();
        Kernel::initialize(config, runtime::disabled()).unwrap()
    }

    #[test]
    fn initialize_without_llm_section_leaves_engine_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_with_disabled_llm(&dir);
        assert!(!kernel.engine().is_ready());
        assert_eq!(kernel.engine().current_mode(), LlmMode::Fast);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = kernel_with_disabled_llm(&dir);

        kernel.start().unwrap();
        assert!(kernel.is_running());
        kernel.start().unwrap();

        kernel.stop();
        assert!(!kernel.is_running());
        kernel.stop();
    }

    #[test]
    fn failed_llm_init_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // enabled, but the disabled runtime refuses to load anything.
        let config = Config::from_str(&format!(
            "ipc:\n  pipe_name: {}\nllm:\n  local:\n    enabled: true\n",
            dir.path().join("kernel.sock").display()
        ))
        .unwrap();
        let kernel = Kernel::initialize(config, runtime::disabled()).unwrap();
        assert!(!kernel.engine().is_ready());
    }
}
