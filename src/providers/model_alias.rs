//! Model-alias resolution: the operator-defined `ModelAlias` table is
//! consulted first, then a built-in per-provider mapping table. This merges
//! a store-backed catalog with a static fallback so requests for unaliased
//! model names still resolve.

use std::sync::Arc;

use crate::settings::GlobalSettings;
use crate::store::{ModelAlias, Provider, Store};

/// `(model -> provider)` routing: an explicit override
/// in [`GlobalSettings::model_routing`] wins; otherwise a name-prefix
/// heuristic picks Gemini for `gemini*` models and Kiro (CodeWhisperer
/// Claude) for everything else, since that's the provider pair actually
/// wired up for both Claude- and Gemini-shaped requests.
pub fn resolve_provider(settings: &GlobalSettings, requested_model: &str) -> Provider {
    if let Some(provider) = settings.model_routing.get(requested_model) {
        return *provider;
    }
    if requested_model.starts_with("gemini") {
        Provider::Gemini
    } else {
        Provider::Kiro
    }
}

/// Resolves a client-facing model name to the concrete upstream model id
/// for a provider. `ModelAlias` rows (sorted by priority, highest first)
/// win over the built-in table; an unmatched name passes through unchanged
/// so newly released upstream model ids keep working without a deploy.
pub async fn resolve_model(
    store: &Arc<dyn Store>,
    provider: Provider,
    requested_model: &str,
) -> anyhow::Result<String> {
    let aliases = store.list_model_aliases(requested_model, provider).await?;
    if let Some(hit) = aliases.first() {
        return Ok(hit.target_model.clone());
    }

    Ok(built_in_mapping(provider, requested_model)
        .unwrap_or(requested_model)
        .to_string())
}

/// Static fallback table: maps a handful of well-known client-facing
/// aliases to each provider's concrete model id. Anything not listed here
/// passes through as given.
fn built_in_mapping(provider: Provider, requested_model: &str) -> Option<&'static str> {
    match (provider, requested_model) {
        (Provider::Kiro | Provider::Vertex, "claude-3-5-sonnet") => Some("CLAUDE_3_5_SONNET_20241022_V2_0"),
        (Provider::Kiro | Provider::Vertex, "claude-3-7-sonnet") => Some("CLAUDE_3_7_SONNET_20250219_V1_0"),
        (Provider::Gemini, "gemini-pro") => Some("gemini-1.5-pro"),
        (Provider::Gemini, "gemini-flash") => Some("gemini-1.5-flash"),
        _ => None,
    }
}

/// Lists the client-facing aliases known to the built-in table for
/// `GET /v1/models`. The `Store` trait only supports alias
/// lookup by `(alias, provider)`, not an unbounded scan, so the dynamic
/// per-operator aliases an admin has configured aren't enumerable here;
/// they still take priority in [`resolve_model`] once a client asks for
/// them by name.
pub fn built_in_catalog() -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for provider in Provider::ALL {
        for name in ["claude-3-5-sonnet", "claude-3-7-sonnet", "gemini-pro", "gemini-flash"] {
            if built_in_mapping(provider, name).is_some() && seen.insert(name.to_string()) {
                ids.push(name.to_string());
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn falls_back_to_built_in_table() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let resolved = resolve_model(&store, Provider::Kiro, "claude-3-5-sonnet").await.unwrap();
        assert_eq!(resolved, "CLAUDE_3_5_SONNET_20241022_V2_0");
    }

    #[tokio::test]
    async fn passes_through_unknown_model() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let resolved = resolve_model(&store, Provider::Kiro, "some-new-model").await.unwrap();
        assert_eq!(resolved, "some-new-model");
    }

    #[tokio::test]
    async fn stored_alias_wins_over_built_in() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        store
            .upsert_model_alias(ModelAlias {
                alias: "claude-3-5-sonnet".to_string(),
                provider: Provider::Kiro,
                target_model: "custom-target".to_string(),
                priority: 10,
                active: true,
            })
            .await
            .unwrap();
        let resolved = resolve_model(&store, Provider::Kiro, "claude-3-5-sonnet").await.unwrap();
        assert_eq!(resolved, "custom-target");
    }

    #[test]
    fn built_in_catalog_dedupes_across_providers() {
        let ids = built_in_catalog();
        assert_eq!(ids.iter().filter(|id| *id == "claude-3-5-sonnet").count(), 1);
    }

    #[test]
    fn gemini_prefixed_model_routes_to_gemini_by_default() {
        let settings = GlobalSettings::default();
        assert_eq!(resolve_provider(&settings, "gemini-pro"), Provider::Gemini);
        assert_eq!(resolve_provider(&settings, "claude-3-5-sonnet"), Provider::Kiro);
    }

    #[test]
    fn explicit_override_wins_over_heuristic() {
        let mut settings = GlobalSettings::default();
        settings.model_routing.insert("claude-3-5-sonnet".to_string(), Provider::Bedrock);
        assert_eq!(resolve_provider(&settings, "claude-3-5-sonnet"), Provider::Bedrock);
    }
}
