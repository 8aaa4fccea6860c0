//! The production-rule surface: [`Rule`], [`EnrichmentLoader`],
//! [`NotificationReceiver`] and their supporting types.
//!
//! These are the **plug-in seams** of the system. Rules decide what to
//! do with a cookie, enrichment loaders fetch further knowledge when no
//! rule has terminated processing, and notification receivers consume
//! the notifications rules emit. Implementations arrive either
//! programmatically (tests, embedding applications) or from shared
//! objects discovered in the plug-in directories.
//!
//! # Type erasure
//! The registries and the processor only ever see the handle aliases
//! ([`RuleHandle`], [`LoaderHandle`], [`ReceiverHandle`]); concrete
//! implementations stay private to the plug-in that registered them.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cookie::{Cookie, Enrichment};

/// Reserved enrichment source recording rule firings.
///
/// Each time a rule fires against a cookie, an enrichment with this
/// source is appended to the cookie's log. Its metadata carries the
/// rule id and whether the firing terminated the pass.
pub const RULE_APPLICATION: &str = "RULE_APPLICATION";

/// A message broadcast to every registered [`NotificationReceiver`]
/// when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// What the notification is about.
    pub topic: String,

    /// Free-form JSON payload.
    pub payload: Value,

    /// Name of the rule or subsystem that emitted it.
    pub sender: String,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: Value, sender: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sender: sender.into(),
        }
    }
}

/// The result of firing a rule against a cookie.
#[derive(Debug, Default)]
pub struct RuleAction {
    /// Notifications to broadcast, in order.
    pub notifications: Vec<Notification>,

    /// When `true`, rule evaluation halts for this pass and the cookie
    /// is considered processed. Otherwise evaluation continues through
    /// lower-priority rules.
    pub terminate: bool,
}

impl RuleAction {
    pub fn terminate(notifications: Vec<Notification>) -> Self {
        Self {
            notifications,
            terminate: true,
        }
    }

    pub fn proceed(notifications: Vec<Notification>) -> Self {
        Self {
            notifications,
            terminate: false,
        }
    }
}

/// One unit of the production system: a guarded action with a priority.
///
/// Rules are evaluated in descending priority order; errors raised by
/// `matches` or `apply` are isolated by the processor (the rule is
/// skipped for that cookie, with a logged error).
pub trait Rule: Send + Sync {
    /// Identifier, unique within the source file that registered it.
    fn id(&self) -> &str;

    /// Evaluation priority; higher runs earlier.
    fn priority(&self) -> i32;

    /// Whether this rule applies to `cookie`.
    fn matches(&self, cookie: &Cookie) -> Result<bool>;

    /// Computes the action for a matching `cookie`.
    fn apply(&self, cookie: &Cookie) -> Result<RuleAction>;
}

/// Producer of fresh knowledge when no rule has terminated a pass.
pub trait EnrichmentLoader: Send + Sync {
    /// Identifier, unique within the source file that registered it.
    fn id(&self) -> &str;

    /// Consultation priority; higher is consulted earlier.
    fn priority(&self) -> i32;

    /// Whether this loader can currently add knowledge to `cookie`.
    ///
    /// Loaders are expected to answer `false` once their enrichment is
    /// already present, otherwise the cookie never settles.
    fn can_enrich(&self, cookie: &Cookie) -> Result<bool>;

    /// Fetches the enrichment. Only called after `can_enrich` returned
    /// `true` for the same snapshot of the cookie.
    fn load(&self, cookie: &Cookie) -> Result<Enrichment>;
}

/// A sink for rule-emitted notifications. Registered by identity; no id
/// or priority is required.
pub trait NotificationReceiver: Send + Sync {
    fn receive(&self, notification: &Notification);
}

/// Shared handle to a type-erased [`Rule`].
pub type RuleHandle = Arc<dyn Rule>;

/// Shared handle to a type-erased [`EnrichmentLoader`].
pub type LoaderHandle = Arc<dyn EnrichmentLoader>;

/// Shared handle to a type-erased [`NotificationReceiver`].
pub type ReceiverHandle = Arc<dyn NotificationReceiver>;

/// Builds the [`RULE_APPLICATION`] enrichment recorded after `rule_id`
/// fired, stamped with the current instant.
pub fn rule_application_log(rule_id: &str, terminated: bool) -> Enrichment {
    let mut metadata = Map::new();
    metadata.insert("rule_id".into(), Value::String(rule_id.to_string()));
    metadata.insert("terminated".into(), Value::Bool(terminated));
    Enrichment::now(RULE_APPLICATION, metadata)
}
