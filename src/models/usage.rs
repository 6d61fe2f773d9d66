// 上游 getUsageLimits 响应模型

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    #[serde(default)]
    pub subscription_info: SubscriptionInfo,
    #[serde(default)]
    pub user_info: UserInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String, // "CREDIT"
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_trial_info: Option<FreeTrialInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus_info: Option<BonusInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: String, // "ACTIVE" | ...
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusInfo {
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub subscription_title: String,
    #[serde(default)]
    pub overage_capability: String,
    #[serde(default)]
    pub upgrade_capability: String,
    #[serde(default)]
    pub subscription_management_target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,
}

impl UsageLimits {
    /// 可用次数 = 基础余量 + 生效中的试用余量 + bonus 余量（下限 0）。
    pub fn available_count(&self) -> f64 {
        for breakdown in &self.usage_breakdown_list {
            if breakdown.resource_type == "CREDIT" {
                let mut total =
                    breakdown.usage_limit_with_precision - breakdown.current_usage_with_precision;

                if let Some(trial) = &breakdown.free_trial_info {
                    if trial.free_trial_status == "ACTIVE" {
                        total += trial.usage_limit_with_precision - trial.current_usage_with_precision;
                    }
                }

                if let Some(bonus) = &breakdown.bonus_info {
                    total += bonus.usage_limit_with_precision - bonus.current_usage_with_precision;
                }

                return total.max(0.0);
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credit_breakdown(limit: f64, used: f64) -> UsageBreakdown {
        UsageBreakdown {
            resource_type: "CREDIT".into(),
            usage_limit_with_precision: limit,
            current_usage_with_precision: used,
            free_trial_info: None,
            bonus_info: None,
        }
    }

    #[test]
    fn available_count_base_only() {
        let usage = UsageLimits {
            usage_breakdown_list: vec![credit_breakdown(100.0, 30.0)],
            ..Default::default()
        };
        assert_eq!(usage.available_count(), 70.0);
    }

    #[test]
    fn available_count_adds_active_trial_and_bonus() {
        let mut breakdown = credit_breakdown(100.0, 100.0);
        breakdown.free_trial_info = Some(FreeTrialInfo {
            free_trial_status: "ACTIVE".into(),
            usage_limit_with_precision: 50.0,
            current_usage_with_precision: 10.0,
        });
        breakdown.bonus_info = Some(BonusInfo {
            usage_limit_with_precision: 5.0,
            current_usage_with_precision: 0.0,
        });
        let usage = UsageLimits {
            usage_breakdown_list: vec![breakdown],
            ..Default::default()
        };
        assert_eq!(usage.available_count(), 45.0);
    }

    #[test]
    fn available_count_ignores_inactive_trial() {
        let mut breakdown = credit_breakdown(10.0, 0.0);
        breakdown.free_trial_info = Some(FreeTrialInfo {
            free_trial_status: "EXPIRED".into(),
            usage_limit_with_precision: 50.0,
            current_usage_with_precision: 0.0,
        });
        let usage = UsageLimits {
            usage_breakdown_list: vec![breakdown],
            ..Default::default()
        };
        assert_eq!(usage.available_count(), 10.0);
    }

    #[test]
    fn available_count_clamps_negative() {
        let usage = UsageLimits {
            usage_breakdown_list: vec![credit_breakdown(10.0, 25.0)],
            ..Default::default()
        };
        assert_eq!(usage.available_count(), 0.0);
    }

    #[test]
    fn parses_upstream_shape() {
        let usage: UsageLimits = serde_json::from_value(json!({
            "usageBreakdownList": [{
                "resourceType": "CREDIT",
                "usageLimitWithPrecision": 500.0,
                "currentUsageWithPrecision": 12.5
            }],
            "subscriptionInfo": {"subscriptionTitle": "Kiro Pro"},
            "userInfo": {"email": "dev@example.com"}
        }))
        .unwrap();
        assert_eq!(usage.available_count(), 487.5);
        assert_eq!(usage.user_info.email, "dev@example.com");
    }
}
