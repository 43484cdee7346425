use async_trait::async_trait;

/// A long-running or one-shot action tied to an entity ("this entity can be
/// tasked"). Adapters register taskables for entities they own; `RunTask`
/// dispatches by entity id.
#[async_trait]
pub trait Taskable: Send + Sync {
    /// Runs the task and returns a human-readable status.
    async fn run(&self) -> anyhow::Result<String>;
}
