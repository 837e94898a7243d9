//! Scheduling rules and the resource handle shared with the wait graph.
//!
//! A scheduling rule is an abstract resource that participates in
//! deadlock detection exactly like a lock, but whose ownership the
//! coordinator cannot revoke: rules typically stand for external state
//! (a file subtree, a device) that cannot be handed to another thread
//! mid-operation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::lock::OrderedLock;

/// A resource identity with containment and conflict predicates.
///
/// # Contract
///
/// - `contains` and `conflicts_with` are reflexive: both return `true`
///   when `other` is `self`.
/// - `conflicts_with` is symmetric.
///
/// Implementations compare against arbitrary rules; downcast through
/// [`as_any`](Self::as_any) to recognize rules of the same type:
///
/// ```
/// use ordlock::SchedulingRule;
/// use std::any::Any;
///
/// #[derive(Debug)]
/// struct PathRule(&'static str);
///
/// impl SchedulingRule for PathRule {
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
///     fn contains(&self, other: &dyn SchedulingRule) -> bool {
///         other
///             .as_any()
///             .downcast_ref::<Self>()
///             .is_some_and(|o| o.0.starts_with(self.0))
///     }
///     fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool {
///         other
///             .as_any()
///             .downcast_ref::<Self>()
///             .is_some_and(|o| o.0.starts_with(self.0) || self.0.starts_with(o.0))
///     }
/// }
/// ```
pub trait SchedulingRule: Any + Send + Sync + fmt::Debug {
    /// Returns `self` for downcasting in predicate implementations.
    fn as_any(&self) -> &dyn Any;

    /// Returns true if acquiring `self` already covers acquiring `other`.
    fn contains(&self, other: &dyn SchedulingRule) -> bool;

    /// Returns true if `self` and `other` must not be held by different
    /// threads at the same time.
    fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool;
}

/// Key identifying a resource inside the wait graph. Derived from the
/// referent address, so two handles to the same lock or rule collapse
/// onto one graph column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceKey(usize);

/// A clonable handle to a resource tracked by the wait graph.
///
/// The kind distinction carries suspendability: deadlock resolution can
/// force a [`Resource::Lock`] to change hands, but never a
/// [`Resource::Rule`].
#[derive(Debug, Clone)]
pub enum Resource {
    /// An [`OrderedLock`] created by the manager.
    Lock(Arc<OrderedLock>),
    /// A user-defined scheduling rule.
    Rule(Arc<dyn SchedulingRule>),
}

impl Resource {
    /// Wraps a user rule.
    pub fn rule(rule: Arc<dyn SchedulingRule>) -> Self {
        Self::Rule(rule)
    }

    fn as_rule(&self) -> &dyn SchedulingRule {
        match self {
            Self::Lock(lock) => lock.as_ref(),
            Self::Rule(rule) => rule.as_ref(),
        }
    }

    /// Containment predicate, delegated to the underlying resource.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.as_rule().contains(other.as_rule())
    }

    /// Conflict predicate, delegated to the underlying resource.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.as_rule().conflicts_with(other.as_rule())
    }

    /// Returns the lock behind this handle, if it is one.
    pub(crate) fn as_lock(&self) -> Option<&Arc<OrderedLock>> {
        match self {
            Self::Lock(lock) => Some(lock),
            Self::Rule(_) => None,
        }
    }

    /// Stable identity of the referent while any handle is alive.
    pub(crate) fn key(&self) -> ResourceKey {
        let addr = match self {
            Self::Lock(lock) => Arc::as_ptr(lock) as *const () as usize,
            Self::Rule(rule) => Arc::as_ptr(rule) as *const () as usize,
        };
        ResourceKey(addr)
    }
}

impl fmt::Display for Resource {
    /// Resources render through their `Debug` form; locks carry their
    /// number, rules whatever the implementor derives.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(lock) => write!(f, "{lock:?}"),
            Self::Rule(rule) => write!(f, "{rule:?}"),
        }
    }
}

impl From<Arc<OrderedLock>> for Resource {
    fn from(lock: Arc<OrderedLock>) -> Self {
        Self::Lock(lock)
    }
}

impl From<Arc<dyn SchedulingRule>> for Resource {
    fn from(rule: Arc<dyn SchedulingRule>) -> Self {
        Self::Rule(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PathRule(&'static str);

    impl SchedulingRule for PathRule {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn contains(&self, other: &dyn SchedulingRule) -> bool {
            other
                .as_any()
                .downcast_ref::<Self>()
                .is_some_and(|o| o.0.starts_with(self.0))
        }
        fn conflicts_with(&self, other: &dyn SchedulingRule) -> bool {
            other
                .as_any()
                .downcast_ref::<Self>()
                .is_some_and(|o| o.0.starts_with(self.0) || self.0.starts_with(o.0))
        }
    }

    #[test]
    fn rule_predicates_are_reflexive() {
        let rule: Arc<dyn SchedulingRule> = Arc::new(PathRule("/a"));
        let resource = Resource::rule(rule);
        assert!(resource.contains(&resource.clone()));
        assert!(resource.conflicts_with(&resource.clone()));
    }

    #[test]
    fn nested_paths_conflict_and_contain() {
        let parent = Resource::rule(Arc::new(PathRule("/a")) as Arc<dyn SchedulingRule>);
        let child = Resource::rule(Arc::new(PathRule("/a/b")) as Arc<dyn SchedulingRule>);
        let sibling = Resource::rule(Arc::new(PathRule("/c")) as Arc<dyn SchedulingRule>);

        assert!(parent.contains(&child));
        assert!(!child.contains(&parent));
        assert!(parent.conflicts_with(&child));
        assert!(child.conflicts_with(&parent));
        assert!(!parent.conflicts_with(&sibling));
    }

    #[test]
    fn key_is_per_referent_not_per_handle() {
        let rule: Arc<dyn SchedulingRule> = Arc::new(PathRule("/a"));
        let a = Resource::rule(Arc::clone(&rule));
        let b = Resource::rule(rule);
        let other = Resource::rule(Arc::new(PathRule("/a")) as Arc<dyn SchedulingRule>);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), other.key());
    }
}
