//! Client-side variant selection.
//!
//! The selector walks a rendered [`Page`], picks one variant per test
//! container (sticky via a persisted assignment, random on first contact),
//! strips the losing variants out of the page, and reports view/conversion
//! events through a fire-and-forget [`EventSink`].
//!
//! Selection is a pure decision ([`select_variant`]) and application a pure
//! effect ([`apply_variant`]), so the bucketing algorithm is testable without
//! any rendering environment.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::Rng;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::{now_utc, StatsError, TrackingEvent};

/// Prefix for persisted assignment keys.
pub const ASSIGNMENT_KEY_PREFIX: &str = "ab_test_";

/// Assignments stick for 30 days from the moment they are written.
pub const ASSIGNMENT_TTL: Duration = Duration::days(30);

#[must_use]
pub fn assignment_key(test_name: &str) -> String {
    format!("{ASSIGNMENT_KEY_PREFIX}{test_name}")
}

/// A persisted test-to-variant assignment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Assignment {
    pub test_name: String,
    pub variant: String,
}

/// Client-side string key-value store with per-key expiry.
pub trait AssignmentStore {
    /// Returns the live value for `key`, treating expired entries as absent.
    fn get(&self, key: &str) -> Option<String>;

    /// Writes `value` under `key`, expiring `ttl` from now.
    fn put(&mut self, key: &str, value: &str, ttl: Duration);
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: String,
    expires_at: OffsetDateTime,
}

/// In-memory [`AssignmentStore`] honoring per-key expiry.
#[derive(Debug, Default)]
pub struct MemoryAssignmentStore {
    entries: BTreeMap<String, StoredEntry>,
}

impl MemoryAssignmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStore for MemoryAssignmentStore {
    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= now_utc() {
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&mut self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                expires_at: now_utc() + ttl,
            },
        );
    }
}

/// One named alternative of a test, carrying its rendered content.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VariantBlock {
    pub name: String,
    pub content: String,
}

/// A test container: a named experiment enclosing its variant blocks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestContainer {
    pub test_name: String,
    pub variants: Vec<VariantBlock>,
}

/// A conversion trigger targeting one test by name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConversionTrigger {
    pub test_name: String,
}

/// The page as the selector sees it: test containers plus conversion
/// triggers.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Page {
    pub containers: Vec<TestContainer>,
    pub triggers: Vec<ConversionTrigger>,
}

/// Per-page-evaluation record of which variant each test showed.
///
/// Conversions are attributable only to a variant actually shown during the
/// current page evaluation, so triggers consult this context instead of the
/// persisted assignment store.
#[derive(Debug, Default)]
pub struct PageContext {
    active: BTreeMap<String, String>,
}

impl PageContext {
    #[must_use]
    pub fn active_variant(&self, test_name: &str) -> Option<&str> {
        self.active.get(test_name).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn assignments(&self) -> impl Iterator<Item = Assignment> + '_ {
        self.active.iter().map(|(test_name, variant)| Assignment {
            test_name: test_name.clone(),
            variant: variant.clone(),
        })
    }
}

/// Fire-and-forget transport for tracking events.
pub trait EventSink {
    /// Submits one event. Callers on the page path swallow failures.
    ///
    /// # Errors
    /// Returns [`StatsError::StorageFailure`] when the transport rejects the
    /// event.
    fn submit(&self, event: TrackingEvent) -> Result<(), StatsError>;
}

/// [`EventSink`] over a bounded channel; a full or disconnected channel
/// drops the event.
pub struct ChannelEventSink {
    sender: Sender<TrackingEvent>,
}

impl ChannelEventSink {
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<TrackingEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn submit(&self, event: TrackingEvent) -> Result<(), StatsError> {
        self.sender.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => {
                StatsError::StorageFailure("tracking channel is full".to_string())
            }
            TrySendError::Disconnected(_) => {
                StatsError::StorageFailure("tracking channel is disconnected".to_string())
            }
        })
    }
}

/// Collecting [`EventSink`] for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<TrackingEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TrackingEvent> {
        self.events
            .lock()
            .map_or_else(|_| Vec::new(), |guard| guard.clone())
    }
}

impl EventSink for MemoryEventSink {
    fn submit(&self, event: TrackingEvent) -> Result<(), StatsError> {
        let mut guard = self
            .events
            .lock()
            .map_err(|_| StatsError::StorageFailure("sink mutex poisoned".to_string()))?;
        guard.push(event);
        Ok(())
    }
}

/// Picks the variant to show for one test.
///
/// A persisted assignment wins as long as its variant is still among the
/// candidates, regardless of candidate order or later additions. Otherwise
/// one candidate is drawn uniformly at random and persisted with
/// [`ASSIGNMENT_TTL`].
///
/// # Errors
/// Returns [`StatsError::InvalidInput`] when `candidates` is empty.
pub fn select_variant<S, R>(
    test_name: &str,
    candidates: &[String],
    assignments: &mut S,
    rng: &mut R,
) -> Result<String, StatsError>
where
    S: AssignmentStore + ?Sized,
    R: Rng + ?Sized,
{
    if candidates.is_empty() {
        return Err(StatsError::InvalidInput(format!(
            "test {test_name} has no candidate variants"
        )));
    }

    let key = assignment_key(test_name);
    if let Some(existing) = assignments.get(&key) {
        if candidates.iter().any(|candidate| *candidate == existing) {
            return Ok(existing);
        }
    }

    let index = rng.gen_range(0..candidates.len());
    let chosen = candidates[index].clone();
    assignments.put(&key, &chosen, ASSIGNMENT_TTL);
    Ok(chosen)
}

/// Removes every variant block except the chosen one from the container.
///
/// Removal is permanent: the losing blocks are gone from the page value, not
/// hidden behind an attribute.
pub fn apply_variant(container: &mut TestContainer, chosen: &str) {
    container.variants.retain(|block| block.name == chosen);
}

/// Runs discovery, selection and application over the whole page, then
/// reports one view per applied test.
///
/// Containers without a test name or without any named variant block are
/// skipped with a diagnostic; they never abort the remaining containers.
/// All content mutation completes before the first event is submitted, and
/// submission failures are logged and discarded.
pub fn run_page<S, R>(
    page: &mut Page,
    assignments: &mut S,
    rng: &mut R,
    sink: &dyn EventSink,
) -> PageContext
where
    S: AssignmentStore + ?Sized,
    R: Rng + ?Sized,
{
    let mut context = PageContext::default();

    for container in &mut page.containers {
        if container.test_name.trim().is_empty() {
            warn!("skipping test container without a test name");
            continue;
        }

        let candidates: Vec<String> = container
            .variants
            .iter()
            .filter_map(|block| {
                if block.name.trim().is_empty() {
                    warn!(test = %container.test_name, "skipping variant block without a name");
                    None
                } else {
                    Some(block.name.clone())
                }
            })
            .collect();

        if candidates.is_empty() {
            warn!(test = %container.test_name, "no valid variants found, skipping test");
            continue;
        }

        let chosen = match select_variant(&container.test_name, &candidates, assignments, rng) {
            Ok(value) => value,
            Err(err) => {
                warn!(test = %container.test_name, %err, "variant selection failed, skipping test");
                continue;
            }
        };

        apply_variant(container, &chosen);
        context.active.insert(container.test_name.clone(), chosen);
    }

    for assignment in context.assignments() {
        dispatch(
            sink,
            TrackingEvent::view(assignment.test_name, assignment.variant),
        );
    }

    context
}

/// Triggers on the page whose target test selected a variant this page
/// view. Interactions on any other trigger are inert.
#[must_use]
pub fn armed_triggers<'a>(page: &'a Page, context: &PageContext) -> Vec<&'a ConversionTrigger> {
    page.triggers
        .iter()
        .filter(|trigger| context.active_variant(&trigger.test_name).is_some())
        .collect()
}

/// Fires a conversion for `test_name` iff this page evaluation selected a
/// variant for it. Returns whether a notification was submitted; an inert
/// trigger returns `false` and sends nothing.
pub fn fire_conversion(context: &PageContext, test_name: &str, sink: &dyn EventSink) -> bool {
    let Some(variant) = context.active_variant(test_name) else {
        return false;
    };

    dispatch(sink, TrackingEvent::conversion(test_name, variant));
    true
}

fn dispatch(sink: &dyn EventSink, event: TrackingEvent) {
    if let Err(err) = sink.submit(event.clone()) {
        warn!(
            test = %event.test_name,
            variant = %event.variant,
            kind = event.kind.as_str(),
            %err,
            "dropping tracking event"
        );
    }
}
