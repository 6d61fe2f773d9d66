pub mod endpoints;
pub mod model_resolver;
pub mod tuning;

pub use model_resolver::{
    has_thinking_suffix, list_request_models, normalize_model_name, resolve_model_id, ResolvedModel,
};
pub use tuning::Tuning;
