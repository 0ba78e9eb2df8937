//! Handler registry: the seam between the channel core and the
//! business-logic layer. The core only resolves names and passes
//! envelopes through.

use std::collections::HashMap;
use std::sync::Arc;

use patchbay_wire::ResultEnvelope;

pub type Handler = Arc<dyn Fn(serde_json::Value) -> ResultEnvelope + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> ResultEnvelope + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_invoke() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |args| ResultEnvelope::text(args.to_string()));

        let handler = registry.lookup("echo").unwrap();
        let result = handler(json!({"x": 1}));
        assert!(!result.is_error);
        assert_eq!(result.text_joined(), r#"{"x":1}"#);
    }

    #[test]
    fn unknown_name_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register("v", |_| ResultEnvelope::text("one"));
        registry.register("v", |_| ResultEnvelope::text("two"));

        let handler = registry.lookup("v").unwrap();
        assert_eq!(handler(json!(null)).text_joined(), "two");
        assert_eq!(registry.len(), 1);
    }
}
