//! Runtime wiring helpers for gateway usage.

use std::sync::Arc;

use gchat::{ChatGateway, StaticPromptSource};
use gmemory::InMemoryThreadStore;
use gobserve::{SafeGatewayHooks, TracingGatewayHooks, TracingKeyStatusSink};
use gprovider::adapters::{AnthropicBinder, OpenAiCompatBinder};
use gprovider::{KeyResolver, ProviderRegistry};
use reqwest::Client;

use crate::{PromptSource, ThreadStore};

#[derive(Clone)]
pub struct RuntimeBundle {
    pub gateway: ChatGateway,
    pub store: Arc<dyn ThreadStore>,
}

pub fn in_memory_store() -> Arc<dyn ThreadStore> {
    Arc::new(InMemoryThreadStore::new())
}

/// A registry with both HTTP-backed vendor families registered.
pub fn default_registry(client: Client) -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(OpenAiCompatBinder::over_http(client.clone()));
    registry.register(AnthropicBinder::over_http(client));
    Arc::new(registry)
}

pub fn build_runtime(keys: Arc<dyn KeyResolver>) -> RuntimeBundle {
    build_runtime_with(
        default_registry(Client::new()),
        keys,
        in_memory_store(),
        None,
    )
}

pub fn build_runtime_with(
    registry: Arc<ProviderRegistry>,
    keys: Arc<dyn KeyResolver>,
    store: Arc<dyn ThreadStore>,
    prompts: Option<Arc<dyn PromptSource>>,
) -> RuntimeBundle {
    let prompts = prompts.unwrap_or_else(|| Arc::new(StaticPromptSource::empty()));

    let gateway = ChatGateway::builder(registry, keys, Arc::clone(&store))
        .prompts(prompts)
        .key_status(Arc::new(TracingKeyStatusSink))
        .hooks(Arc::new(SafeGatewayHooks::new(TracingGatewayHooks)))
        .build();

    RuntimeBundle { gateway, store }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gchat::SessionPhase;
    use gprovider::{ModelConfig, ProviderKind, StaticKeyResolver};

    use crate::ThreadBinding;

    use super::build_runtime;

    #[tokio::test]
    async fn build_runtime_wires_a_usable_gateway() {
        let keys = Arc::new(StaticKeyResolver::new());
        keys.insert("key-1", "gpt-4o-mini", "sk-live-123")
            .expect("key should insert");

        let runtime = build_runtime(keys);
        let session = runtime.gateway.session(ThreadBinding::new(
            "thread-1",
            ProviderKind::OpenAi,
            "key-1",
            ModelConfig::new("gpt-4o-mini", 4096),
        ));

        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(session.thread_id().as_str(), "thread-1");
    }
}
