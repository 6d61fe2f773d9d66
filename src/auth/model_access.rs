// 账号等级与模型访问门控
//
// 等级从上游订阅元数据的子串推断，决定该凭据可服务哪些 canonical 模型。

use serde::{Deserialize, Serialize};

use crate::config::model_resolver::{
    self, CANONICAL_MODEL_HAIKU_45, CANONICAL_MODEL_OPUS_45, CANONICAL_MODEL_OPUS_46,
    CANONICAL_MODEL_SONNET_45,
};
use crate::models::usage::UsageLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountLevel {
    Unknown,
    Free,
    Pro,
    Enterprise,
}

impl Default for AccountLevel {
    fn default() -> Self {
        Self::Unknown
    }
}

/// 订阅元数据子串 → 等级。
pub fn detect_account_level(usage: &UsageLimits) -> AccountLevel {
    let sub = &usage.subscription_info;
    let raw = format!(
        "{} {} {} {} {}",
        sub.type_,
        sub.subscription_title,
        sub.overage_capability,
        sub.upgrade_capability,
        sub.subscription_management_target
    )
    .to_lowercase();

    if raw.contains("enterprise") || raw.contains("business") {
        AccountLevel::Enterprise
    } else if raw.contains("team") || raw.contains("pro") || raw.contains("paid") {
        AccountLevel::Pro
    } else if raw.contains("free") || raw.contains("trial") || raw.contains("basic") {
        AccountLevel::Free
    } else {
        AccountLevel::Unknown
    }
}

/// 该等级允许的 canonical 模型（Unknown 放行全部）。
pub fn allowed_models_for_level(level: AccountLevel) -> Vec<String> {
    let raw: &[&str] = match level {
        AccountLevel::Free => &[CANONICAL_MODEL_SONNET_45, CANONICAL_MODEL_HAIKU_45],
        AccountLevel::Pro => &[
            CANONICAL_MODEL_SONNET_45,
            CANONICAL_MODEL_HAIKU_45,
            CANONICAL_MODEL_OPUS_45,
        ],
        AccountLevel::Enterprise => &[
            CANONICAL_MODEL_SONNET_45,
            CANONICAL_MODEL_HAIKU_45,
            CANONICAL_MODEL_OPUS_45,
            CANONICAL_MODEL_OPUS_46,
        ],
        AccountLevel::Unknown => return model_resolver::list_request_models(),
    };
    raw.iter().map(|m| m.to_lowercase()).collect()
}

/// 等级是否允许请求该模型。
///
/// `unknown_allowed` 为 false 时，未知等级按最低权限（Free）处理。
pub fn is_model_allowed_for_level(
    level: AccountLevel,
    requested_model: &str,
    access_control_enabled: bool,
    unknown_allowed: bool,
) -> bool {
    if !access_control_enabled {
        return true;
    }
    let requested_model = requested_model.trim();
    if requested_model.is_empty() {
        return true;
    }

    let Some(resolved) = model_resolver::resolve_model_id(requested_model) else {
        // 未识别模型交给后续标准校验逻辑处理
        return true;
    };

    let effective_level = match level {
        AccountLevel::Unknown if unknown_allowed => return true,
        AccountLevel::Unknown => AccountLevel::Free,
        other => other,
    };

    allowed_models_for_level(effective_level)
        .iter()
        .any(|allowed| allowed == &resolved.canonical)
}
