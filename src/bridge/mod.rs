//! Bridge Module
//!
//! Glue between the chat front-end and the assistant: resolves the user's
//! session, runs the prompt through the invoker, classifies the output and
//! records the interaction. `execute` never fails; errors come back as
//! unsuccessful results.

pub mod status;
pub mod types;

pub use status::{project_status, ProjectStatus, ServiceStatus};
pub use types::ExecutionResult;

use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::backend::Invoker;
use crate::classifier::OutputClassifier;
use crate::session::{SessionKey, SessionRegistry};

pub struct Bridge {
    registry: Arc<SessionRegistry>,
    invoker: Invoker,
}

impl Bridge {
    pub fn new(registry: Arc<SessionRegistry>, invoker: Invoker) -> Self {
        Self { registry, invoker }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Directory a context name maps to
    pub fn working_dir(&self, context: &str) -> &Path {
        self.registry.contexts().resolve(context)
    }

    /// Run `prompt` for `user_id` in `context`
    pub async fn execute(&self, user_id: i64, prompt: &str, context: &str) -> ExecutionResult {
        let key = SessionKey::new(user_id, context);
        let session = self.registry.get_or_create(&key);
        session.touch();

        let preview: String = prompt.chars().take(50).collect();
        info!(
            "Executing command for user {} in context {}: {}...",
            user_id, context, preview
        );

        let working_dir = session.working_dir().to_path_buf();

        let result = match self.invoker.invoke(prompt, &working_dir).await {
            Ok(invocation) => {
                let classification =
                    OutputClassifier::classify_off_thread(&invocation.text, &working_dir).await;
                ExecutionResult::from_output(
                    invocation.text,
                    classification,
                    &working_dir,
                    invocation.kind,
                )
            }
            Err(e) => {
                error!("Error executing command for {}: {}", key.id(), e);
                ExecutionResult::failure(&e.to_string(), &working_dir)
            }
        };

        session.record(prompt, result.clone());
        result
    }

    pub async fn status(&self, context: &str) -> ProjectStatus {
        project_status(self.working_dir(context)).await
    }
}
