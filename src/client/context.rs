// Dynamically scoped context for log enrichment
//
// Two context channels feed every record the client emits:
// - the *request context*, set once per request by web-framework middleware
//   (path, method, ip, ...), replaced wholesale on each request;
// - the *user context*, a stack of immutable maps entered and exited with
//   scope discipline (user_id, trace_id, session_id, tenant_id, ...).
//
// Both are thread-local. Scopes merge with their enclosing scope, inner wins
// on key collision, and the previous state is restored when the guard drops.
// Snapshots carry the current state across task or thread boundaries.

use serde_json::{Map, Value};
use std::cell::RefCell;
use std::sync::Arc;

type Fields = Map<String, Value>;

thread_local! {
    static REQUEST_CONTEXT: RefCell<Option<Arc<Fields>>> = const { RefCell::new(None) };
    static USER_CONTEXT: RefCell<Vec<Arc<Fields>>> = const { RefCell::new(Vec::new()) };
}

/// Set the request context for the current thread, replacing any previous one
pub fn set_request_context(fields: Fields) {
    REQUEST_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(Arc::new(fields)));
}

/// Clear the request context for the current thread
pub fn clear_request_context() {
    REQUEST_CONTEXT.with(|ctx| *ctx.borrow_mut() = None);
}

/// Read the current request context
pub fn request_context() -> Option<Arc<Fields>> {
    REQUEST_CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Read the current (innermost) user context
pub fn user_context() -> Option<Arc<Fields>> {
    USER_CONTEXT.with(|stack| stack.borrow().last().cloned())
}

/// Enter a user-context scope.
///
/// The new scope is the enclosing scope merged with `fields` (new keys win).
/// Dropping the returned guard restores the enclosing scope, so nested scopes
/// unwind in order even when guards are held across other calls.
#[must_use = "the scope ends when this guard is dropped"]
pub fn user_scope(fields: Fields) -> ContextScope {
    USER_CONTEXT.with(|stack| {
        let mut stack = stack.borrow_mut();
        let merged = match stack.last() {
            Some(outer) => {
                let mut merged = (**outer).clone();
                merged.extend(fields);
                merged
            }
            None => fields,
        };
        stack.push(Arc::new(merged));
    });
    ContextScope { _private: () }
}

/// Guard for a user-context scope; pops the scope on drop
pub struct ContextScope {
    _private: (),
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        USER_CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Immutable capture of both contexts, cheap to clone and Send
///
/// Spawned tasks and threads do not inherit thread-locals; take a snapshot
/// before spawning and install it inside:
///
/// ```ignore
/// let snapshot = ContextSnapshot::capture();
/// std::thread::spawn(move || {
///     let _ctx = snapshot.install();
///     client.info("inherits user_id and trace_id");
/// });
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    request: Option<Arc<Fields>>,
    user: Option<Arc<Fields>>,
}

impl ContextSnapshot {
    /// Capture the current thread's context state
    pub fn capture() -> Self {
        Self {
            request: request_context(),
            user: user_context(),
        }
    }

    /// Install this snapshot on the current thread until the guard drops
    #[must_use = "the snapshot is uninstalled when this guard is dropped"]
    pub fn install(self) -> SnapshotGuard {
        let previous_request =
            REQUEST_CONTEXT.with(|ctx| ctx.borrow_mut().replace(Arc::new(Fields::new())));
        REQUEST_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.request);
        let pushed_user = self.user.is_some();
        if let Some(user) = self.user {
            USER_CONTEXT.with(|stack| stack.borrow_mut().push(user));
        }
        SnapshotGuard {
            previous_request,
            pushed_user,
        }
    }
}

/// Guard returned by [`ContextSnapshot::install`]
pub struct SnapshotGuard {
    previous_request: Option<Arc<Fields>>,
    pushed_user: bool,
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        REQUEST_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous_request.take());
        if self.pushed_user {
            USER_CONTEXT.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn request_context_set_and_clear() {
        set_request_context(fields(&[("path", "/checkout"), ("method", "POST")]));
        let ctx = request_context().unwrap();
        assert_eq!(ctx["path"], "/checkout");

        clear_request_context();
        assert!(request_context().is_none());
    }

    #[test]
    fn nested_scopes_merge_inner_wins() {
        let _outer = user_scope(fields(&[("tenant_id", "t-1"), ("user_id", "outer")]));
        {
            let _inner = user_scope(fields(&[("user_id", "inner")]));
            let ctx = user_context().unwrap();
            assert_eq!(ctx["user_id"], "inner");
            assert_eq!(ctx["tenant_id"], "t-1", "outer keys visible inside");
        }
        // Inner scope exited: outer value restored
        let ctx = user_context().unwrap();
        assert_eq!(ctx["user_id"], "outer");
    }

    #[test]
    fn scope_exit_restores_empty_state() {
        assert!(user_context().is_none());
        {
            let _scope = user_scope(fields(&[("user_id", "u-1")]));
            assert!(user_context().is_some());
        }
        assert!(user_context().is_none());
    }

    #[test]
    fn snapshot_carries_context_to_another_thread() {
        let _scope = user_scope(fields(&[("trace_id", "tr-42")]));
        set_request_context(fields(&[("path", "/pay")]));

        let snapshot = ContextSnapshot::capture();
        let handle = std::thread::spawn(move || {
            assert!(user_context().is_none(), "fresh thread starts empty");
            let _guard = snapshot.install();
            let user = user_context().unwrap();
            let request = request_context().unwrap();
            (user["trace_id"].clone(), request["path"].clone())
        });
        let (trace, path) = handle.join().unwrap();
        assert_eq!(trace, "tr-42");
        assert_eq!(path, "/pay");

        clear_request_context();
    }
}
