/// Canonical model table and request-model resolution.
///
/// External clients send a wide variety of model spellings; everything is
/// normalized (lowercase, `-thinking` suffix stripped) and then matched by
/// family substring onto a canonical model name plus the upstream modelId.

pub const CANONICAL_MODEL_SONNET_45: &str = "claude-sonnet-4-5-20250929";
pub const CANONICAL_MODEL_OPUS_45: &str = "claude-opus-4-5-20251101";
pub const CANONICAL_MODEL_OPUS_46: &str = "claude-opus-4-6";
pub const CANONICAL_MODEL_HAIKU_45: &str = "claude-haiku-4-5-20251001";

/// Models advertised on `/v1/models`.
const PUBLIC_REQUEST_MODELS: &[&str] = &[
    CANONICAL_MODEL_SONNET_45,
    CANONICAL_MODEL_OPUS_45,
    CANONICAL_MODEL_OPUS_46,
    CANONICAL_MODEL_HAIKU_45,
];

/// Lowercase, trim, and strip the `-thinking` alias suffix.
pub fn normalize_model_name(model: &str) -> String {
    let normalized = model.trim().to_lowercase();
    normalized
        .strip_suffix("-thinking")
        .unwrap_or(&normalized)
        .to_string()
}

/// True when the client asked for the `-thinking` alias of a model.
pub fn has_thinking_suffix(model: &str) -> bool {
    model.trim().to_lowercase().ends_with("-thinking")
}

/// Resolved request model: canonical name + upstream modelId.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub canonical: String,
    pub model_id: String,
}

/// Map an external model name onto the canonical set.
///
/// - `sonnet*` → claude-sonnet-4.5
/// - `opus*` containing `4-5`/`4.5` → claude-opus-4.5, otherwise claude-opus-4.6
/// - `haiku*` → claude-haiku-4.5
///
/// Unknown families resolve to `None`; callers surface `ModelNotFound`.
pub fn resolve_model_id(model: &str) -> Option<ResolvedModel> {
    let normalized = normalize_model_name(model);
    if normalized.is_empty() {
        return None;
    }

    if normalized.contains("sonnet") {
        return Some(ResolvedModel {
            canonical: CANONICAL_MODEL_SONNET_45.to_string(),
            model_id: "claude-sonnet-4.5".to_string(),
        });
    }
    if normalized.contains("opus") {
        if normalized.contains("4-5") || normalized.contains("4.5") {
            return Some(ResolvedModel {
                canonical: CANONICAL_MODEL_OPUS_45.to_string(),
                model_id: "claude-opus-4.5".to_string(),
            });
        }
        return Some(ResolvedModel {
            canonical: CANONICAL_MODEL_OPUS_46.to_string(),
            model_id: "claude-opus-4.6".to_string(),
        });
    }
    if normalized.contains("haiku") {
        return Some(ResolvedModel {
            canonical: CANONICAL_MODEL_HAIKU_45.to_string(),
            model_id: "claude-haiku-4.5".to_string(),
        });
    }

    None
}

/// Public request-model list, deduplicated and lowercase.
pub fn list_request_models() -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut models = Vec::with_capacity(PUBLIC_REQUEST_MODELS.len());
    for model in PUBLIC_REQUEST_MODELS {
        let name = model.trim().to_lowercase();
        if !name.is_empty() && seen.insert(name.clone()) {
            models.push(name);
        }
    }
    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_thinking_suffix() {
        assert_eq!(
            normalize_model_name("claude-sonnet-4-5-thinking"),
            "claude-sonnet-4-5"
        );
        assert_eq!(normalize_model_name("  Claude-Opus-4-6 "), "claude-opus-4-6");
        assert!(has_thinking_suffix("claude-opus-4-6-thinking"));
        assert!(!has_thinking_suffix("claude-opus-4-6"));
    }

    #[test]
    fn sonnet_family_resolves() {
        for name in [
            "claude-sonnet-4-5-20250929",
            "claude-sonnet-4-5",
            "claude-3-7-sonnet",
            "sonnet",
        ] {
            let r = resolve_model_id(name).unwrap();
            assert_eq!(r.canonical, CANONICAL_MODEL_SONNET_45);
            assert_eq!(r.model_id, "claude-sonnet-4.5");
        }
    }

    #[test]
    fn opus_family_splits_on_minor_version() {
        let r45 = resolve_model_id("claude-opus-4-5-20251101").unwrap();
        assert_eq!(r45.canonical, CANONICAL_MODEL_OPUS_45);
        assert_eq!(r45.model_id, "claude-opus-4.5");

        let r46 = resolve_model_id("claude-opus-4-6").unwrap();
        assert_eq!(r46.canonical, CANONICAL_MODEL_OPUS_46);
        assert_eq!(r46.model_id, "claude-opus-4.6");

        // 裸 opus 默认最新
        assert_eq!(
            resolve_model_id("opus").unwrap().canonical,
            CANONICAL_MODEL_OPUS_46
        );
    }

    #[test]
    fn haiku_family_resolves() {
        let r = resolve_model_id("claude-haiku-4-5-thinking").unwrap();
        assert_eq!(r.canonical, CANONICAL_MODEL_HAIKU_45);
        assert_eq!(r.model_id, "claude-haiku-4.5");
    }

    #[test]
    fn unknown_model_is_none() {
        assert!(resolve_model_id("gpt-4o").is_none());
        assert!(resolve_model_id("").is_none());
        assert!(resolve_model_id("   ").is_none());
    }

    #[test]
    fn request_model_list_is_deduped() {
        let models = list_request_models();
        assert_eq!(models.len(), 4);
        assert!(models.contains(&CANONICAL_MODEL_SONNET_45.to_string()));
        let unique: std::collections::HashSet<_> = models.iter().collect();
        assert_eq!(unique.len(), models.len());
    }
}
