//! Debounces final intents and routes them to registered handlers.
//!
//! Two pieces of state guard against double-firing: a per-subtype
//! cooldown (`last_fired`) and a single pending slot used for
//! last-wins conflict resolution within a short window. Both are
//! mutex-guarded because intents can arrive from the synchronous
//! heuristic path and the asynchronous LLM path concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use utterance_events::{ActionEvent, DetectedIntent, IntentSubtype, IntentType};

/// A registered action handler. Errors are logged and otherwise ignored;
/// a panic inside a handler is caught so one broken handler cannot take
/// down the router.
pub type ActionHandler = Arc<dyn Fn(&DetectedIntent) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ActionRouterConfig {
    pub conflict_window: Duration,
    pub cooldowns: HashMap<IntentSubtype, Duration>,
}

impl Default for ActionRouterConfig {
    fn default() -> Self {
        let mut cooldowns = HashMap::new();
        cooldowns.insert(IntentSubtype::Stop, Duration::milliseconds(0));
        cooldowns.insert(IntentSubtype::Repeat, Duration::milliseconds(1500));
        cooldowns.insert(IntentSubtype::Continue, Duration::milliseconds(1500));
        cooldowns.insert(IntentSubtype::StartOver, Duration::milliseconds(1500));
        cooldowns.insert(IntentSubtype::Generate, Duration::milliseconds(5000));
        Self {
            conflict_window: Duration::milliseconds(1500),
            cooldowns,
        }
    }
}

struct PendingAction {
    subtype: IntentSubtype,
    intent: DetectedIntent,
    queued_at: DateTime<Utc>,
}

pub struct ActionRouter {
    config: ActionRouterConfig,
    handlers: Mutex<HashMap<IntentSubtype, ActionHandler>>,
    last_fired: Mutex<HashMap<IntentSubtype, DateTime<Utc>>>,
    pending: Mutex<Option<PendingAction>>,
}

impl ActionRouter {
    pub fn new(config: ActionRouterConfig) -> Self {
        Self {
            config,
            handlers: Mutex::new(HashMap::new()),
            last_fired: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn register_action_handler(&self, subtype: IntentSubtype, handler: ActionHandler) {
        self.handlers
            .lock()
            .expect("handlers mutex poisoned")
            .insert(subtype, handler);
    }

    fn cooldown_for(&self, subtype: IntentSubtype) -> Duration {
        *self
            .config
            .cooldowns
            .get(&subtype)
            .unwrap_or(&self.config.conflict_window)
    }

    /// Feed a final, non-candidate intent. Only imperative intents are
    /// routed; anything else is a no-op. Returns an immediate
    /// `ActionEvent{was_debounced: true}` if the subtype's cooldown has
    /// not elapsed, otherwise queues the intent and returns `None` — the
    /// caller must drive [`Self::check_conflict_window`] to fire it.
    pub fn process_final_intent(&self, intent: DetectedIntent, now: DateTime<Utc>) -> Option<ActionEvent> {
        if intent.kind != IntentType::Imperative {
            return None;
        }
        let subtype = intent.subtype?;
        let cooldown = self.cooldown_for(subtype);
        let utterance_id = intent.utterance_id.clone().unwrap_or_default();

        let blocked = {
            let last_fired = self.last_fired.lock().expect("last_fired mutex poisoned");
            last_fired
                .get(&subtype)
                .map(|last| now - *last < cooldown)
                .unwrap_or(false)
        };

        if blocked {
            return Some(ActionEvent {
                action_name: action_name_for(subtype).to_string(),
                intent,
                utterance_id,
                timestamp: now,
                was_debounced: true,
            });
        }

        *self.pending.lock().expect("pending mutex poisoned") = Some(PendingAction {
            subtype,
            intent,
            queued_at: now,
        });
        None
    }

    /// Periodic tick: fires the pending action once the conflict window
    /// has elapsed since it was queued.
    pub fn check_conflict_window(&self, now: DateTime<Utc>) -> Option<ActionEvent> {
        let ready = {
            let guard = self.pending.lock().expect("pending mutex poisoned");
            guard
                .as_ref()
                .map(|p| now - p.queued_at >= self.config.conflict_window)
                .unwrap_or(false)
        };
        if !ready {
            return None;
        }

        let pending = self.pending.lock().expect("pending mutex poisoned").take()?;
        self.last_fired
            .lock()
            .expect("last_fired mutex poisoned")
            .insert(pending.subtype, now);

        self.invoke_handler(&pending.subtype, &pending.intent);

        Some(ActionEvent {
            action_name: action_name_for(pending.subtype).to_string(),
            intent: pending.intent.clone(),
            utterance_id: pending.intent.utterance_id.clone().unwrap_or_default(),
            timestamp: now,
            was_debounced: false,
        })
    }

    fn invoke_handler(&self, subtype: &IntentSubtype, intent: &DetectedIntent) {
        let handler = {
            let handlers = self.handlers.lock().expect("handlers mutex poisoned");
            handlers.get(subtype).cloned()
        };
        let Some(handler) = handler else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(intent)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(?subtype, error = %err, "action handler returned an error");
            }
            Err(_) => {
                tracing::warn!(?subtype, "action handler panicked");
            }
        }
    }
}

fn action_name_for(subtype: IntentSubtype) -> &'static str {
    match subtype {
        IntentSubtype::Stop => "stop",
        IntentSubtype::Repeat => "repeat",
        IntentSubtype::Continue => "continue",
        IntentSubtype::StartOver => "start_over",
        IntentSubtype::Generate => "generate",
        _ => "unknown",
    }
}
