//! Rule-script engine seam.
//!
//! The embedded scripting language lives outside the core; the daemon
//! only needs a veto hook per command, ratio adjustments per transfer and
//! an event tap. The handle holds the current engine behind a lock so a
//! wrapper can swap in a freshly loaded engine atomically at a safe point
//! (between commands, never during one).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::credit::RuleAdjust;
use crate::events::Event;

/// Verdict of the script layer for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptDecision {
    Continue,
    Deny(String),
}

/// What the engine sees about a command under evaluation.
#[derive(Debug, Clone)]
pub struct ScriptCommand {
    pub verb: String,
    pub argument: String,
    pub username: Option<String>,
    pub path: Option<String>,
    pub section: Option<String>,
}

/// The scripting seam implemented by the external interpreter.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// May veto a command before it executes.
    async fn authorize(&self, _cmd: &ScriptCommand) -> ScriptDecision {
        ScriptDecision::Continue
    }

    /// Multiplicative ratio adjustments for a user in a section.
    async fn ratio_overrides(&self, _username: &str, _section: &str) -> RuleAdjust {
        RuleAdjust::default()
    }

    /// Observes published events.
    async fn on_event(&self, _event: &Event) {}
}

/// Engine that allows everything; the default when no interpreter is
/// attached.
pub struct NullScriptEngine;

#[async_trait]
impl ScriptEngine for NullScriptEngine {}

/// Swappable handle to the current engine.
pub struct ScriptHandle {
    engine: RwLock<Arc<dyn ScriptEngine>>,
}

impl Default for ScriptHandle {
    fn default() -> Self {
        ScriptHandle::new(Arc::new(NullScriptEngine))
    }
}

impl ScriptHandle {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        ScriptHandle { engine: RwLock::new(engine) }
    }

    /// The engine to use for the current command. The clone keeps the
    /// engine alive across a concurrent swap.
    pub fn current(&self) -> Arc<dyn ScriptEngine> {
        self.engine.read().expect("script handle lock poisoned").clone()
    }

    /// Replaces the engine. Sessions pick the new one up at their next
    /// command boundary.
    pub fn swap(&self, engine: Arc<dyn ScriptEngine>) {
        *self.engine.write().expect("script handle lock poisoned") = engine;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyStor;

    #[async_trait]
    impl ScriptEngine for DenyStor {
        async fn authorize(&self, cmd: &ScriptCommand) -> ScriptDecision {
            if cmd.verb.eq_ignore_ascii_case("STOR") {
                ScriptDecision::Deny("uploads closed".to_string())
            } else {
                ScriptDecision::Continue
            }
        }
    }

    fn cmd(verb: &str) -> ScriptCommand {
        ScriptCommand {
            verb: verb.to_string(),
            argument: String::new(),
            username: None,
            path: None,
            section: None,
        }
    }

    #[tokio::test]
    async fn null_engine_allows() {
        let handle = ScriptHandle::default();
        assert_eq!(handle.current().authorize(&cmd("STOR")).await, ScriptDecision::Continue);
    }

    #[tokio::test]
    async fn swap_takes_effect_at_next_lookup() {
        let handle = ScriptHandle::default();
        let before = handle.current();
        handle.swap(Arc::new(DenyStor));
        // The old engine instance still answers for in-flight commands.
        assert_eq!(before.authorize(&cmd("STOR")).await, ScriptDecision::Continue);
        assert_eq!(
            handle.current().authorize(&cmd("STOR")).await,
            ScriptDecision::Deny("uploads closed".to_string())
        );
    }
}
