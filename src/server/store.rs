use crate::{
    common::data::{
        Action, ActiveExpectation, ExpectationDefinition, HttpRequest, NottableString,
        RequestTemplate, TimeToLive, Times,
    },
    server::matchers,
};
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("expectation does not contain a request template")]
    MissingRequestTemplate,
}

/// A live expectation slot. The match budget is an atomic so concurrent dispatches
/// claim matches without holding the store lock.
pub struct Expectation {
    pub id: usize,
    seq: u64,
    pub priority: i32,
    pub request: RequestTemplate,
    pub action: Action,
    times: Times,
    time_to_live: TimeToLive,
    budget: Option<AtomicI64>,
    deadline: Option<Instant>,
}

impl Expectation {
    fn new(id: usize, seq: u64, definition: ExpectationDefinition, request: RequestTemplate) -> Self {
        let budget = if definition.times.unlimited {
            None
        } else {
            Some(AtomicI64::new(definition.times.remaining as i64))
        };

        let deadline = definition
            .time_to_live
            .duration()
            .map(|ttl| Instant::now() + ttl);

        Self {
            id,
            seq,
            priority: definition.priority,
            request,
            action: definition.action,
            times: definition.times,
            time_to_live: definition.time_to_live,
            budget,
            deadline,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }

    fn is_exhausted(&self) -> bool {
        self.budget
            .as_ref()
            .map_or(false, |budget| budget.load(Ordering::SeqCst) <= 0)
    }

    /// Claims one match from the budget. The compare-and-swap loop makes concurrent
    /// claims linearizable: a budget of n yields exactly n successful claims.
    fn try_claim(&self) -> bool {
        match &self.budget {
            None => true,
            Some(budget) => budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    if remaining > 0 {
                        Some(remaining - 1)
                    } else {
                        None
                    }
                })
                .is_ok(),
        }
    }

    pub fn snapshot(&self) -> ActiveExpectation {
        ActiveExpectation {
            id: self.id,
            priority: self.priority,
            request: self.request.clone(),
            action: self.action.clone(),
            times: self.times,
            time_to_live: self.time_to_live,
            remaining: self
                .budget
                .as_ref()
                .map(|budget| budget.load(Ordering::SeqCst).max(0) as u64),
        }
    }
}

struct Inner {
    slots: Vec<Arc<Expectation>>,
    next_id: usize,
    next_seq: u64,
}

/// Holds active expectations ordered by priority (descending) and insertion
/// sequence (ascending). Expired and exhausted slots are purged lazily at lookup.
pub struct ExpectationStore {
    max_expectations: usize,
    state: Mutex<Inner>,
}

impl ExpectationStore {
    pub fn new(max_expectations: usize) -> Self {
        Self {
            max_expectations,
            state: Mutex::new(Inner {
                slots: Vec::new(),
                next_id: 0,
                next_seq: 0,
            }),
        }
    }

    /// Adds an expectation, or replaces one in place when the definition carries an
    /// id that is already present. Replacement keeps the original insertion sequence
    /// so upserts do not reorder equal-priority expectations.
    pub fn add(&self, definition: ExpectationDefinition) -> Result<ActiveExpectation, Error> {
        let request = definition
            .request
            .clone()
            .ok_or(Error::MissingRequestTemplate)?;

        let mut state = self.state.lock().unwrap();

        if let Some(id) = definition.id {
            if let Some(pos) = state.slots.iter().position(|slot| slot.id == id) {
                let seq = state.slots[pos].seq;
                let slot = Arc::new(Expectation::new(id, seq, definition, request));
                tracing::debug!(id, "replacing expectation");
                state.slots[pos] = slot.clone();
                sort_slots(&mut state.slots);
                return Ok(slot.snapshot());
            }
        }

        let id = match definition.id {
            Some(id) => {
                state.next_id = state.next_id.max(id + 1);
                id
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        let slot = Arc::new(Expectation::new(id, seq, definition, request));
        tracing::debug!(id, "adding expectation");
        state.slots.push(slot.clone());
        sort_slots(&mut state.slots);

        if state.slots.len() > self.max_expectations {
            if let Some(pos) = state
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(pos, _)| pos)
            {
                let evicted = state.slots.remove(pos);
                tracing::debug!(id = evicted.id, "store is full, evicting oldest expectation");
            }
        }

        Ok(slot.snapshot())
    }

    pub fn remove(&self, id: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.slots.len();
        state.slots.retain(|slot| slot.id != id);
        let removed = state.slots.len() != before;
        if removed {
            tracing::debug!(id, "removed expectation");
        }
        removed
    }

    /// Removes expectations selected by the filter template, or all of them when no
    /// filter is given. Only the filter's method and path matchers are consulted,
    /// applied to the candidates' literal template values; header, query and body
    /// matchers on the filter are ignored.
    pub fn clear(&self, filter: Option<&RequestTemplate>) {
        let mut state = self.state.lock().unwrap();
        match filter {
            None => state.slots.clear(),
            Some(filter) => state
                .slots
                .retain(|slot| !template_selects(filter, &slot.request)),
        }
        tracing::debug!("cleared expectations");
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.slots.clear();
    }

    /// Finds the first live expectation matching the request and claims one match
    /// from its budget. The scan iterates over a snapshot so matching runs without
    /// the store lock; dead slots are purged afterwards.
    pub fn first_match(&self, req: &HttpRequest) -> Option<Arc<Expectation>> {
        let snapshot: Vec<Arc<Expectation>> = self.state.lock().unwrap().slots.clone();

        let mut matched = None;
        for slot in &snapshot {
            if slot.is_expired() {
                continue;
            }
            if !matchers::request_matches(&slot.request, req) {
                continue;
            }
            // A concurrent dispatch may have drained the budget since the scan began.
            if slot.try_claim() {
                matched = Some(slot.clone());
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        state
            .slots
            .retain(|slot| !slot.is_expired() && !slot.is_exhausted());

        matched
    }

    /// Snapshots the currently active expectations, optionally narrowed by a filter
    /// template matched against the expectations' own method and path values.
    pub fn active(&self, filter: Option<&RequestTemplate>) -> Vec<ActiveExpectation> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .iter()
            .filter(|slot| !slot.is_expired() && !slot.is_exhausted())
            .filter(|slot| filter.map_or(true, |f| template_selects(f, &slot.request)))
            .map(|slot| slot.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_slots(slots: &mut [Arc<Expectation>]) {
    slots.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
}

/// Whether a filter template selects an expectation's request template. The filter's
/// method and path matchers are applied to the candidate's literal values.
fn template_selects(filter: &RequestTemplate, candidate: &RequestTemplate) -> bool {
    field_selects(&filter.method, &candidate.method) && field_selects(&filter.path, &candidate.path)
}

fn field_selects(filter: &Option<NottableString>, candidate: &Option<NottableString>) -> bool {
    match filter {
        None => true,
        Some(filter) => candidate
            .as_ref()
            .map_or(false, |candidate| filter.matches(&candidate.value)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{
        data::{HttpResponse, TimeUnit},
        util::BodyBytes,
    };

    fn definition(path: &str) -> ExpectationDefinition {
        ExpectationDefinition::new(
            RequestTemplate {
                path: Some(path.into()),
                ..Default::default()
            },
            Action::Respond {
                response: HttpResponse {
                    status: Some(200),
                    ..Default::default()
                },
            },
        )
    }

    fn request(path: &str) -> HttpRequest {
        HttpRequest::new(
            "http".to_string(),
            path.to_string(),
            "GET".to_string(),
            Vec::new(),
            BodyBytes::default(),
        )
    }

    #[test]
    fn missing_request_template_test() {
        let store = ExpectationStore::new(100);
        let mut def = definition("/a");
        def.request = None;

        let result = store.add(def);
        assert!(matches!(result, Err(Error::MissingRequestTemplate)));
    }

    #[test]
    fn budget_is_exact_under_concurrency_test() {
        let store = Arc::new(ExpectationStore::new(100));
        let mut def = definition("/limited");
        def.times = Times::exactly(50);
        store.add(def).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut claims = 0;
                for _ in 0..20 {
                    if store.first_match(&request("/limited")).is_some() {
                        claims += 1;
                    }
                }
                claims
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn zero_budget_never_matches_test() {
        let store = ExpectationStore::new(100);
        let mut def = definition("/never");
        def.times = Times::exactly(0);
        store.add(def).unwrap();

        assert!(store.first_match(&request("/never")).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn ttl_expiry_test() {
        let store = ExpectationStore::new(100);
        let mut def = definition("/ephemeral");
        def.time_to_live = TimeToLive::exactly(TimeUnit::Milliseconds, 30);
        store.add(def).unwrap();

        assert!(store.first_match(&request("/ephemeral")).is_some());
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert!(store.first_match(&request("/ephemeral")).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn priority_beats_insertion_order_test() {
        let store = ExpectationStore::new(100);
        let first = store.add(definition("/same")).unwrap();
        let mut high = definition("/same");
        high.priority = 10;
        let second = store.add(high).unwrap();

        let matched = store.first_match(&request("/same")).unwrap();
        assert_eq!(matched.id, second.id);
        assert_ne!(matched.id, first.id);
    }

    #[test]
    fn equal_priority_uses_insertion_order_test() {
        let store = ExpectationStore::new(100);
        let first = store.add(definition("/same")).unwrap();
        store.add(definition("/same")).unwrap();

        let matched = store.first_match(&request("/same")).unwrap();
        assert_eq!(matched.id, first.id);
    }

    #[test]
    fn upsert_preserves_position_test() {
        let store = ExpectationStore::new(100);
        let first = store.add(definition("/a")).unwrap();
        store.add(definition("/a")).unwrap();

        // Replacing the first expectation must keep it ahead of the second.
        let mut replacement = definition("/a");
        replacement.id = Some(first.id);
        replacement.action = Action::Respond {
            response: HttpResponse {
                status: Some(201),
                ..Default::default()
            },
        };
        store.add(replacement).unwrap();

        let matched = store.first_match(&request("/a")).unwrap();
        assert_eq!(matched.id, first.id);
        match &matched.action {
            Action::Respond { response } => assert_eq!(response.status, Some(201)),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn capacity_eviction_test() {
        let store = ExpectationStore::new(2);
        let oldest = store.add(definition("/0")).unwrap();
        store.add(definition("/1")).unwrap();
        store.add(definition("/2")).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.active(None).iter().all(|e| e.id != oldest.id));
    }

    #[test]
    fn active_filter_test() {
        let store = ExpectationStore::new(100);
        store.add(definition("/users")).unwrap();
        store.add(definition("/orders")).unwrap();

        let filter = RequestTemplate {
            path: Some("/users".into()),
            ..Default::default()
        };

        let active = store.active(Some(&filter));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].request.path, Some("/users".into()));
    }
}
