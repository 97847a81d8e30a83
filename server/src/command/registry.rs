use super::CommandHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Command handlers by command name.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRequest, CommandResult, CommandStyle};

    fn request(name: &str) -> CommandRequest {
        CommandRequest {
            client_id: 1,
            uid: 1,
            name: name.to_string(),
            device_name: "CMD".to_string(),
            content: String::new(),
            style: CommandStyle::Legacy,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CommandRegistry::new();
        registry
            .register("Echo", |r: &CommandRequest| CommandResult::success(r.name.clone()))
            .register("Fail", |_: &CommandRequest| CommandResult::failure("nope"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["Echo", "Fail"]);

        let echo = registry.get("Echo").unwrap();
        assert_eq!(echo.execute(&request("Echo")).message, "Echo");
        assert!(registry.get("Reconstruct").is_none());
    }
}
