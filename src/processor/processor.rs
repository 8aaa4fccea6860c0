//! One processing pass over one cookie.
//!
//! [`process`] is a stateless function: given a cookie and point-in-time
//! snapshots of the rule and loader registries, it evaluates rules in
//! priority order, dispatches the notifications of matching rules, and
//! — when no rule terminated the pass — asks the loaders for further
//! knowledge.
//!
//! Plug-in failures (an error or panic inside a predicate, action, or
//! loader) are isolated: the offending item is skipped for this cookie
//! with a logged error and evaluation continues. Only jar/store errors
//! abort the pass; the worker then requeues the cookie.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::anyhow;
use log::{debug, error};

use crate::cookie::Cookie;
use crate::errors::JarError;
use crate::jar::CookieJar;
use crate::notifier::Notifier;
use crate::registry::Snapshot;
use crate::rules::{rule_application_log, EnrichmentLoader, Rule};

/// How a processing pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A rule terminated the pass (or the cookie vanished mid-pass);
    /// the cookie needs no further attention until new knowledge
    /// arrives.
    Completed,

    /// The named loader appended fresh knowledge; the append re-dirtied
    /// the cookie, so it will re-enter processing.
    NeedsEnrichment(String),

    /// No rule terminated and no loader could add anything.
    Unprocessable,
}

/// Runs plug-in code, converting a panic into an error so one bad item
/// cannot take the worker down.
fn shielded<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => Err(anyhow!("panicked")),
    }
}

/// Evaluates one pass over `cookie`.
///
/// Rule applications are recorded on the cookie's durable log via the
/// jar (without re-dirtying); loader output goes through
/// [`CookieJar::enrich`] and therefore re-dirties the object.
pub fn process(
    jar: &CookieJar,
    cookie: &Cookie,
    rules: &Snapshot<dyn Rule>,
    loaders: &Snapshot<dyn EnrichmentLoader>,
    notifier: &Notifier,
) -> Result<Outcome, JarError> {
    // Local working copy: later rules see the knowledge recorded by
    // earlier firings in the same pass.
    let mut cookie = cookie.clone();

    for rule in rules.iter() {
        let matched = match shielded(|| rule.matches(&cookie)) {
            Ok(matched) => matched,
            Err(e) => {
                error!("rule {:?}: predicate failed on {:?}: {e:#}", rule.id(), cookie.id);
                continue;
            }
        };
        if !matched {
            continue;
        }

        let action = match shielded(|| rule.apply(&cookie)) {
            Ok(action) => action,
            Err(e) => {
                error!("rule {:?}: action failed on {:?}: {e:#}", rule.id(), cookie.id);
                continue;
            }
        };

        debug!(
            "rule {:?} fired on {:?} (terminate: {})",
            rule.id(),
            cookie.id,
            action.terminate
        );

        for notification in &action.notifications {
            notifier.broadcast(notification);
        }

        let log_entry = rule_application_log(rule.id(), action.terminate);
        match jar.annotate(&cookie.id, log_entry.clone()) {
            Ok(()) => cookie.enrichments.push(log_entry),
            // Deleted while in flight: the object is gone, stop here.
            Err(JarError::NotFound) => return Ok(Outcome::Completed),
            Err(e) => return Err(e),
        }

        if action.terminate {
            return Ok(Outcome::Completed);
        }
    }

    for loader in loaders.iter() {
        let applicable = match shielded(|| loader.can_enrich(&cookie)) {
            Ok(applicable) => applicable,
            Err(e) => {
                error!("loader {:?}: can_enrich failed on {:?}: {e:#}", loader.id(), cookie.id);
                continue;
            }
        };
        if !applicable {
            continue;
        }

        let enrichment = match shielded(|| loader.load(&cookie)) {
            Ok(enrichment) => enrichment,
            Err(e) => {
                error!("loader {:?}: load failed on {:?}: {e:#}", loader.id(), cookie.id);
                continue;
            }
        };

        jar.enrich(&cookie.id, enrichment)?;
        return Ok(Outcome::NeedsEnrichment(loader.id().to_string()));
    }

    Ok(Outcome::Unprocessable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Enrichment;
    use crate::jar::{CookieJarHandle, InMemoryDocumentStore, RetryPolicy};
    use crate::registry::{LoaderRegistry, ReceiverRegistry, RuleRegistry};
    use crate::rules::{
        Notification, NotificationReceiver, RuleAction, RULE_APPLICATION,
    };
    use anyhow::Result;
    use serde_json::{json, Map};
    use std::sync::{Arc, Mutex};

    struct FnRule<M, A> {
        id: String,
        priority: i32,
        matches: M,
        apply: A,
    }

    impl<M, A> Rule for FnRule<M, A>
    where
        M: Fn(&Cookie) -> Result<bool> + Send + Sync,
        A: Fn(&Cookie) -> Result<RuleAction> + Send + Sync,
    {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn matches(&self, cookie: &Cookie) -> Result<bool> {
            (self.matches)(cookie)
        }

        fn apply(&self, cookie: &Cookie) -> Result<RuleAction> {
            (self.apply)(cookie)
        }
    }

    fn rule(
        id: &str,
        priority: i32,
        matches: impl Fn(&Cookie) -> Result<bool> + Send + Sync + 'static,
        apply: impl Fn(&Cookie) -> Result<RuleAction> + Send + Sync + 'static,
    ) -> Arc<dyn Rule> {
        Arc::new(FnRule {
            id: id.to_string(),
            priority,
            matches,
            apply,
        })
    }

    struct FnLoader<C, L> {
        id: String,
        priority: i32,
        can_enrich: C,
        load: L,
    }

    impl<C, L> EnrichmentLoader for FnLoader<C, L>
    where
        C: Fn(&Cookie) -> Result<bool> + Send + Sync,
        L: Fn(&Cookie) -> Result<Enrichment> + Send + Sync,
    {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn can_enrich(&self, cookie: &Cookie) -> Result<bool> {
            (self.can_enrich)(cookie)
        }

        fn load(&self, cookie: &Cookie) -> Result<Enrichment> {
            (self.load)(cookie)
        }
    }

    struct Recorder(Arc<Mutex<Vec<Notification>>>);

    impl NotificationReceiver for Recorder {
        fn receive(&self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
    }

    struct Fixture {
        jar: CookieJarHandle,
        rules: Arc<RuleRegistry>,
        loaders: Arc<LoaderRegistry>,
        notifier: Notifier,
        seen: Arc<Mutex<Vec<Notification>>>,
    }

    fn fixture() -> Fixture {
        let jar = CookieJar::open(
            Arc::new(InMemoryDocumentStore::new()),
            RetryPolicy::disabled(),
        )
        .unwrap();
        let receivers = ReceiverRegistry::new("receivers");
        let seen = Arc::new(Mutex::new(Vec::new()));
        receivers.register(Arc::new(Recorder(seen.clone())));

        Fixture {
            jar,
            rules: RuleRegistry::new("rules"),
            loaders: LoaderRegistry::new("loaders"),
            notifier: Notifier::new(receivers),
            seen,
        }
    }

    fn seeded_cookie(f: &Fixture, id: &str) -> Cookie {
        f.jar.enrich(id, Enrichment::now("seed", Map::new())).unwrap();
        f.jar.fetch(id).unwrap().unwrap()
    }

    fn run(f: &Fixture, cookie: &Cookie) -> Outcome {
        process(
            &f.jar,
            cookie,
            &f.rules.snapshot(),
            &f.loaders.snapshot(),
            &f.notifier,
        )
        .unwrap()
    }

    #[test]
    fn terminating_rule_completes_the_pass() {
        let f = fixture();
        f.rules.register(rule(
            "r1",
            100,
            |c| Ok(c.id.contains('x')),
            |_| Ok(RuleAction::terminate(vec![Notification::new(
                "seen",
                json!({}),
                "r1",
            )])),
        ));

        let cookie = seeded_cookie(&f, "x/1");
        assert_eq!(run(&f, &cookie), Outcome::Completed);

        let seen = f.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "seen");

        // Log gained exactly one rule-application entry.
        let stored = f.jar.fetch("x/1").unwrap().unwrap();
        assert_eq!(stored.enrichments.len(), 2);
        let last = stored.enrichments.last().unwrap();
        assert_eq!(last.source, RULE_APPLICATION);
        assert_eq!(last.metadata["rule_id"], json!("r1"));
        assert_eq!(last.metadata["terminated"], json!(true));
    }

    #[test]
    fn non_terminating_rules_cascade_in_priority_order() {
        let f = fixture();
        f.rules.register(rule(
            "r2",
            50,
            |_| Ok(true),
            |_| Ok(RuleAction::terminate(vec![Notification::new("n2", json!({}), "r2")])),
        ));
        f.rules.register(rule(
            "r1",
            100,
            |_| Ok(true),
            |_| Ok(RuleAction::proceed(vec![Notification::new("n1", json!({}), "r1")])),
        ));

        let cookie = seeded_cookie(&f, "y");
        assert_eq!(run(&f, &cookie), Outcome::Completed);

        let topics: Vec<_> = f.seen.lock().unwrap().iter().map(|n| n.topic.clone()).collect();
        assert_eq!(topics, vec!["n1", "n2"]);

        let stored = f.jar.fetch("y").unwrap().unwrap();
        let logged: Vec<_> = stored
            .enrichments
            .from_source(RULE_APPLICATION)
            .map(|e| e.metadata["rule_id"].clone())
            .collect();
        assert_eq!(logged, vec![json!("r1"), json!("r2")]);
    }

    #[test]
    fn a_failing_rule_is_skipped() {
        let f = fixture();
        f.rules.register(rule(
            "broken",
            100,
            |_| anyhow::bail!("predicate exploded"),
            |_| Ok(RuleAction::default()),
        ));
        f.rules.register(rule(
            "panicky",
            90,
            |_| Ok(true),
            |_| panic!("action exploded"),
        ));
        f.rules.register(rule(
            "sound",
            50,
            |_| Ok(true),
            |_| Ok(RuleAction::terminate(vec![])),
        ));

        let cookie = seeded_cookie(&f, "z");
        assert_eq!(run(&f, &cookie), Outcome::Completed);

        let stored = f.jar.fetch("z").unwrap().unwrap();
        let logged: Vec<_> = stored
            .enrichments
            .from_source(RULE_APPLICATION)
            .map(|e| e.metadata["rule_id"].clone())
            .collect();
        assert_eq!(logged, vec![json!("sound")]);
    }

    #[test]
    fn later_rules_see_earlier_firings() {
        let f = fixture();
        f.rules.register(rule("first", 100, |_| Ok(true), |_| Ok(RuleAction::proceed(vec![]))));
        f.rules.register(rule(
            "after",
            50,
            |c| Ok(c.enrichments.from_source(RULE_APPLICATION).count() == 1),
            |_| Ok(RuleAction::terminate(vec![Notification::new("chained", json!({}), "after")])),
        ));

        let cookie = seeded_cookie(&f, "w");
        assert_eq!(run(&f, &cookie), Outcome::Completed);
        assert_eq!(f.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn first_applicable_loader_wins_and_redirties() {
        let f = fixture();
        f.loaders.register(Arc::new(FnLoader {
            id: "never".to_string(),
            priority: 100,
            can_enrich: |_: &Cookie| Ok(false),
            load: |_: &Cookie| unreachable!("can_enrich said no"),
        }));
        f.loaders.register(Arc::new(FnLoader {
            id: "l1".to_string(),
            priority: 50,
            can_enrich: |c: &Cookie| Ok(c.most_recent_from_source("l1").is_none()),
            load: |_: &Cookie| {
                let mut meta = Map::new();
                meta.insert("k".into(), 1.into());
                Ok(Enrichment::now("l1", meta))
            },
        }));

        let cookie = seeded_cookie(&f, "z");
        let id = f.jar.next_for_processing(None).unwrap(); // reserve, as a worker would
        assert_eq!(id, "z");

        assert_eq!(run(&f, &cookie), Outcome::NeedsEnrichment("l1".to_string()));

        // The loader's append re-dirtied the in-flight cookie; release
        // moves it back into the queue.
        f.jar.mark_complete(&id).unwrap();
        assert_eq!(f.jar.length().dirty, 1);

        let stored = f.jar.fetch("z").unwrap().unwrap();
        assert_eq!(stored.enrichments.len(), 2);
        assert_eq!(stored.enrichments.last().unwrap().source, "l1");
    }

    #[test]
    fn no_rule_and_no_loader_is_unprocessable() {
        let f = fixture();
        let cookie = seeded_cookie(&f, "inert");
        assert_eq!(run(&f, &cookie), Outcome::Unprocessable);
        assert!(f.seen.lock().unwrap().is_empty());
    }
}
