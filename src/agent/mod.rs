// Text-to-SQL workflow
//
// The stage graph is data: a `Node` enum, one async method per node, and a
// pure routing function for the conditional edges. The runner walks the
// graph, appends every node event to the state, and reports progress through
// a callback - streaming and synchronous surfaces differ only in what they
// do with that callback.
//
// ```text
// resolve_context -> extract_filters -> clarifier
//   clarifier: [needs clarification] -> END
//              [no clarification]    -> retrieve_schema
// retrieve_schema -> generate_sql -> validate_sql
//   validate_sql: [invalid, retries < 3]  -> generate_sql
//                 [invalid, retries >= 3] -> END (fail)
//                 [valid]                 -> execute_query
// execute_query: [success] -> generate_insight
//                [failure] -> END (fail)
// generate_insight -> END
// ```

mod clarifier;
mod context;
mod filters;
mod nodes;
pub mod prompts;
pub mod sqlcheck;
pub mod state;

pub use state::AgentState;

use crate::analysis::events::StreamEvent;
use crate::conversation::ConversationStore;
use crate::llm::ChatModel;
use crate::storage::repository::{QueryRepository, SchemaRepository};
use serde_json::Value;
use std::sync::Arc;

/// The workflow stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    ResolveContext,
    ExtractFilters,
    Clarifier,
    RetrieveSchema,
    GenerateSql,
    ValidateSql,
    ExecuteQuery,
    GenerateInsight,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::ResolveContext => "resolve_context",
            Node::ExtractFilters => "extract_filters",
            Node::Clarifier => "clarifier",
            Node::RetrieveSchema => "retrieve_schema",
            Node::GenerateSql => "generate_sql",
            Node::ValidateSql => "validate_sql",
            Node::ExecuteQuery => "execute_query",
            Node::GenerateInsight => "generate_insight",
        }
    }
}

/// Maximum regeneration attempts after validation failures
pub const MAX_SQL_RETRIES: u32 = 3;

/// The conditional edges, as a pure function of (node, state)
pub fn next_node(current: Node, state: &AgentState) -> Option<Node> {
    match current {
        Node::ResolveContext => Some(Node::ExtractFilters),
        Node::ExtractFilters => Some(Node::Clarifier),
        Node::Clarifier => {
            if state.clarifications_needed.is_empty() {
                Some(Node::RetrieveSchema)
            } else {
                None // wait for the caller to resubmit with answers
            }
        }
        Node::RetrieveSchema => {
            if state.error_message.is_some() {
                None
            } else {
                Some(Node::GenerateSql)
            }
        }
        Node::GenerateSql => {
            if state.error_message.is_some() {
                None
            } else {
                Some(Node::ValidateSql)
            }
        }
        Node::ValidateSql => match &state.validation_error {
            Some(_) if state.retry_count < MAX_SQL_RETRIES => Some(Node::GenerateSql),
            Some(_) => None,
            None => Some(Node::ExecuteQuery),
        },
        Node::ExecuteQuery => {
            if state.error_message.is_some() {
                None
            } else {
                Some(Node::GenerateInsight)
            }
        }
        Node::GenerateInsight => None,
    }
}

/// The workflow with its injected collaborators
pub struct SqlAgent {
    pub(crate) llm: Arc<dyn ChatModel>,
    pub(crate) schema_repo: SchemaRepository,
    pub(crate) query_repo: QueryRepository,
    pub(crate) conversations: Arc<ConversationStore>,
}

impl SqlAgent {
    pub fn new(
        llm: Arc<dyn ChatModel>,
        schema_repo: SchemaRepository,
        query_repo: QueryRepository,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        Self {
            llm,
            schema_repo,
            query_repo,
            conversations,
        }
    }

    /// Walk the graph to completion, mutating `state` and reporting every
    /// event through `on_event` in stage-visit order.
    ///
    /// Cancellation happens at the awaits between and inside stages: aborting
    /// the task running this future stops the workflow at the next boundary.
    pub async fn run<F>(&self, state: &mut AgentState, mut on_event: F)
    where
        F: FnMut(StreamEvent),
    {
        let mut current = Node::ResolveContext;
        loop {
            on_event(StreamEvent::NodeStart {
                node: current.name(),
            });

            let events = match current {
                Node::ResolveContext => self.resolve_context(state).await,
                Node::ExtractFilters => self.extract_filters(state).await,
                Node::Clarifier => self.clarify(state).await,
                Node::RetrieveSchema => self.retrieve_schema(state).await,
                Node::GenerateSql => self.generate_sql(state).await,
                Node::ValidateSql => self.validate_sql(state),
                Node::ExecuteQuery => self.execute_query(state).await,
                Node::GenerateInsight => self.generate_insight(state).await,
            };

            let last_data = events.last().map(StreamEvent::data).unwrap_or(Value::Null);
            for event in events {
                state.events.push(event.clone());
                on_event(event);
            }

            on_event(StreamEvent::NodeEnd {
                node: current.name(),
                data: last_data,
            });

            match next_node(current, state) {
                Some(next) => current = next,
                None => break,
            }
        }
    }
}

/// Find the outermost JSON object embedded in free-form model output
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted ChatModel and lazy fixtures for workflow tests

    use crate::conversation::ConversationStore;
    use crate::llm::{ChatModel, LlmError};
    use crate::storage::repository::{QueryRepository, SchemaRepository};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A pool that never connects; stages under test must not touch the DB
    pub fn lazy_pool() -> deadpool_postgres::Pool {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some("localhost".to_string());
        cfg.user = Some("postgres".to_string());
        cfg.password = Some("password".to_string());
        cfg.dbname = Some("logs_db".to_string());
        cfg.create_pool(
            Some(deadpool_postgres::Runtime::Tokio1),
            tokio_postgres::NoTls,
        )
        .expect("lazy pool config")
    }

    /// An agent whose LLM is scripted and whose repositories are lazy
    pub fn scripted_agent(responses: Vec<Result<String, LlmError>>) -> super::SqlAgent {
        let pool = lazy_pool();
        super::SqlAgent::new(
            Arc::new(ScriptedModel::new(responses)),
            SchemaRepository::new(pool.clone()),
            QueryRepository::new(pool),
            Arc::new(ConversationStore::new()),
        )
    }

    pub struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Other("script exhausted".to_string())))
        }
    }
}
