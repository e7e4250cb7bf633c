//! Generic upgrade state machine engine.
//!
//! A `Machine` is a table of state label to async transition function,
//! built once per controller. The engine is stateless: the current state
//! lives on the watched custom resource, read at the start of a tick by the
//! reconciler and written back only when a transition changed it. One
//! `execute` call runs exactly one transition; "waiting" is expressed by a
//! transition returning its own input state, so the external level-triggered
//! scheduler re-enters later.
//!
//! The engine performs no concurrency control of its own: the kube runtime
//! guarantees at most one reconciliation in flight per resource instance.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info};

use super::error::Error;

/// An opaque state label naming a node in a transition graph.
///
/// The empty label is a valid state: it is what an uninitialized resource
/// carries before its first transition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct State(Cow<'static, str>);

impl State {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static str> for State {
    fn from(s: &'static str) -> Self {
        State(Cow::Borrowed(s))
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        State(Cow::Owned(s))
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Future returned by a transition function.
pub type TransitionFuture<'a> = Pin<Box<dyn Future<Output = Result<State, Error>> + Send + 'a>>;

/// A transition function: given the collaborators, the resource being
/// reconciled and the current state, compute the next state. Returning the
/// input state unchanged means "hold, retry next tick".
pub type TransitionFn<C, T> =
    Box<dyn for<'a> Fn(&'a C, &'a T, &'a State) -> TransitionFuture<'a> + Send + Sync>;

/// A state machine: an immutable transition table plus a name for logging.
///
/// Generic over the collaborator bag `C` and the resource type `T`, so
/// transition functions receive their concrete resource without downcasts.
pub struct Machine<C, T> {
    name: &'static str,
    transitions: BTreeMap<State, TransitionFn<C, T>>,
}

impl<C, T> Machine<C, T> {
    /// Create an empty machine. Transitions are added with
    /// [`Machine::transition`].
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            transitions: BTreeMap::new(),
        }
    }

    /// Register the transition function for one state.
    pub fn transition<S, F>(mut self, state: S, f: F) -> Self
    where
        S: Into<State>,
        F: for<'a> Fn(&'a C, &'a T, &'a State) -> TransitionFuture<'a> + Send + Sync + 'static,
    {
        self.transitions.insert(state.into(), Box::new(f));
        self
    }

    /// Machine name, used in logs and error values.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a state is part of the graph.
    pub fn contains(&self, state: &State) -> bool {
        self.transitions.contains_key(state)
    }

    /// All states of the graph, in label order.
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.transitions.keys()
    }

    /// Execute exactly one transition from `current`.
    ///
    /// Fails with [`Error::UnknownState`] when `current` is not a key of the
    /// table (bad external input: a foreign or corrupted persisted value) and
    /// with [`Error::ExecutionFailed`] when the transition function returned
    /// a state that is not a key (internal inconsistency in the graph; must
    /// never be persisted or silently retried as normal flow). A transition
    /// error is propagated wrapped; the next state is then indeterminate and
    /// the caller must not persist anything.
    pub async fn execute(&self, collab: &C, obj: &T, current: &State) -> Result<State, Error> {
        let transition = self
            .transitions
            .get(current)
            .ok_or_else(|| Error::UnknownState {
                machine: self.name.to_string(),
                state: current.as_str().to_string(),
            })?;

        let next = transition(collab, obj, current).await?;

        if !self.contains(&next) {
            return Err(Error::ExecutionFailed {
                machine: self.name.to_string(),
                from: current.as_str().to_string(),
                returned: next.as_str().to_string(),
            });
        }

        if next == *current {
            debug!(machine = self.name, state = %current, "Holding state");
        } else {
            info!(machine = self.name, from = %current, to = %next, "State transition");
        }

        Ok(next)
    }
}
