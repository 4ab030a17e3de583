//! Static table of models the proxy fronts, with per-family knobs and the
//! cross-family fallback mapping.

use ccproxy_transform::RequestOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub family: ModelFamily,
    pub thinking: bool,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub fallback: Option<&'static str>,
}

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "claude-sonnet-4-5",
        display_name: "Claude Sonnet 4.5",
        family: ModelFamily::Claude,
        thinking: false,
        context_window: 200_000,
        max_output_tokens: 64_000,
        fallback: Some("gemini-2.5-pro"),
    },
    ModelSpec {
        id: "claude-sonnet-4-5-thinking",
        display_name: "Claude Sonnet 4.5 (Thinking)",
        family: ModelFamily::Claude,
        thinking: true,
        context_window: 200_000,
        max_output_tokens: 64_000,
        fallback: Some("gemini-2.5-pro"),
    },
    ModelSpec {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        family: ModelFamily::Gemini,
        thinking: true,
        context_window: 1_048_576,
        max_output_tokens: 16_384,
        fallback: Some("claude-sonnet-4-5"),
    },
    ModelSpec {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        family: ModelFamily::Gemini,
        thinking: false,
        context_window: 1_048_576,
        max_output_tokens: 16_384,
        fallback: Some("claude-sonnet-4-5"),
    },
];

pub fn find(model: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|spec| spec.id == model)
}

/// Unlisted model ids still dispatch; the family falls out of the prefix.
pub fn family_of(model: &str) -> ModelFamily {
    match find(model) {
        Some(spec) => spec.family,
        None if model.starts_with("claude") => ModelFamily::Claude,
        None => ModelFamily::Gemini,
    }
}

pub fn is_thinking(model: &str) -> bool {
    match find(model) {
        Some(spec) => spec.thinking,
        None => model.ends_with("-thinking"),
    }
}

pub fn fallback_for(model: &str) -> Option<&'static str> {
    find(model).and_then(|spec| spec.fallback)
}

/// Codec knobs for a model, given the configured Gemini output ceiling.
pub fn request_options(model: &str, gemini_max_output_tokens: u32) -> RequestOptions {
    RequestOptions {
        max_output_cap: match family_of(model) {
            ModelFamily::Gemini => Some(gemini_max_output_tokens),
            ModelFamily::Claude => None,
        },
        include_thoughts: is_thinking(model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallbacks_cross_family() {
        for spec in MODELS {
            let Some(fallback) = spec.fallback else { continue };
            let fallback_spec = find(fallback).expect("fallback must be listed");
            assert_ne!(spec.family, fallback_spec.family, "{}", spec.id);
        }
    }

    #[test]
    fn unknown_models_classified_by_prefix() {
        assert_eq!(family_of("claude-opus-4-5"), ModelFamily::Claude);
        assert_eq!(family_of("gemini-3-pro"), ModelFamily::Gemini);
        assert!(is_thinking("claude-opus-4-5-thinking"));
    }

    #[test]
    fn gemini_requests_get_output_cap() {
        let options = request_options("gemini-2.5-pro", 16_384);
        assert_eq!(options.max_output_cap, Some(16_384));
        assert!(options.include_thoughts);
        let options = request_options("claude-sonnet-4-5", 16_384);
        assert_eq!(options.max_output_cap, None);
        assert!(!options.include_thoughts);
    }
}
