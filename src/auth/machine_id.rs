// 机器码绑定存储
//
// binding_key -> machine_id 的 JSON 文件持久化。机器码要么是用户显式
// 绑定的（UUID 或 64 位 HEX），要么由 profile_arn / refresh_token 种子
// 确定性派生。写文件在锁内串行。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

static HEX64_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-fA-F]{64}$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineIdBinding {
    pub machine_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MachineIdBindingData {
    #[serde(default)]
    bindings: HashMap<String, MachineIdBinding>,
}

/// 机器码绑定管理器。
pub struct MachineIdStore {
    inner: Mutex<MachineIdBindingData>,
    file_path: Option<PathBuf>,
}

impl MachineIdStore {
    /// 从文件加载；文件不存在时从空绑定开始。
    pub fn load(file_path: Option<PathBuf>) -> Self {
        let data = match &file_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<MachineIdBindingData>(&content) {
                    Ok(data) => {
                        info!(count = data.bindings.len(), "加载机器码绑定成功");
                        data
                    }
                    Err(e) => {
                        warn!(error = %e, "机器码绑定文件解析失败，使用空绑定");
                        MachineIdBindingData::default()
                    }
                },
                Err(_) => MachineIdBindingData::default(),
            },
            None => MachineIdBindingData::default(),
        };
        Self {
            inner: Mutex::new(data),
            file_path,
        }
    }

    /// 内存模式（测试用）。
    pub fn in_memory() -> Self {
        Self::load(None)
    }

    pub fn get_machine_id(&self, binding_key: &str) -> Option<String> {
        if binding_key.is_empty() {
            return None;
        }
        let data = self.inner.lock().unwrap();
        data.bindings.get(binding_key).map(|b| b.machine_id.clone())
    }

    /// 设置或更新绑定，成功后立即持久化。
    pub fn set_binding(&self, binding_key: &str, machine_id: &str) -> Result<(), String> {
        let Some(normalized) = normalize_machine_id(machine_id) else {
            return Err(format!("无效的机器码格式: {}", machine_id));
        };
        if binding_key.is_empty() {
            return Ok(());
        }

        let mut data = self.inner.lock().unwrap();
        let now = Utc::now();
        data.bindings
            .entry(binding_key.to_string())
            .and_modify(|b| {
                b.machine_id = normalized.clone();
                b.updated_at = now;
            })
            .or_insert_with(|| MachineIdBinding {
                machine_id: normalized.clone(),
                created_at: now,
                updated_at: now,
            });
        self.save_locked(&data)
    }

    pub fn delete_binding(&self, binding_key: &str) -> Result<(), String> {
        let mut data = self.inner.lock().unwrap();
        data.bindings.remove(binding_key);
        self.save_locked(&data)
    }

    /// 全部绑定的副本（管理接口用）。
    pub fn list_bindings(&self) -> Vec<(String, MachineIdBinding)> {
        let data = self.inner.lock().unwrap();
        let mut entries: Vec<(String, MachineIdBinding)> = data
            .bindings
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// 若无绑定，由种子（优先 profile_arn，否则 refresh_token）派生并落盘。
    /// 返回 (machine_id, 是否新建)。
    pub fn ensure_auto_binding(
        &self,
        binding_key: &str,
        profile_arn: Option<&str>,
        refresh_token: &str,
    ) -> Option<(String, bool)> {
        if binding_key.is_empty() {
            return None;
        }
        if let Some(existing) = self.get_machine_id(binding_key) {
            return Some((existing, false));
        }

        let seed = profile_arn
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| refresh_token.trim());
        if seed.is_empty() {
            return None;
        }

        let machine_id = stable_machine_id_from_seed(seed);
        if let Err(e) = self.set_binding(binding_key, &machine_id) {
            warn!(binding_key, error = %e, "自动绑定机器码失败");
            return None;
        }
        info!(
            binding_key,
            machine_id_prefix = &machine_id[..8],
            "自动生成机器码绑定"
        );
        Some((machine_id, true))
    }

    fn save_locked(&self, data: &MachineIdBindingData) -> Result<(), String> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| format!("序列化机器码绑定失败: {}", e))?;
        std::fs::write(path, content).map_err(|e| format!("写入机器码绑定失败: {}", e))
    }
}

/// 标准化机器码：UUID（转小写标准形）或 64 位 HEX（转小写）。
pub fn normalize_machine_id(machine_id: &str) -> Option<String> {
    let trimmed = machine_id.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
        return Some(parsed.to_string());
    }
    if HEX64_RE.is_match(trimmed) {
        return Some(trimmed.to_lowercase());
    }
    None
}

/// 由固定种子派生稳定机器码（64 位 HEX）。
pub fn stable_machine_id_from_seed(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_uuid_and_hex64() {
        let uuid = "550E8400-E29B-41D4-A716-446655440000";
        assert_eq!(
            normalize_machine_id(uuid).unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );

        let hex = "A".repeat(64);
        assert_eq!(normalize_machine_id(&hex).unwrap(), "a".repeat(64));

        assert!(normalize_machine_id("not-a-machine-id").is_none());
        assert!(normalize_machine_id("").is_none());
        assert!(normalize_machine_id(&"a".repeat(63)).is_none());
    }

    #[test]
    fn seed_derivation_is_stable() {
        let a = stable_machine_id_from_seed("arn:aws:profile/x");
        let b = stable_machine_id_from_seed("arn:aws:profile/x");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, stable_machine_id_from_seed("arn:aws:profile/y"));
    }

    #[test]
    fn set_and_get_binding() {
        let store = MachineIdStore::in_memory();
        let hex = "b".repeat(64);
        store.set_binding("refresh:abc", &hex).unwrap();
        assert_eq!(store.get_machine_id("refresh:abc").unwrap(), hex);
        assert!(store.get_machine_id("refresh:other").is_none());

        store.delete_binding("refresh:abc").unwrap();
        assert!(store.get_machine_id("refresh:abc").is_none());
    }

    #[test]
    fn set_binding_rejects_invalid_id() {
        let store = MachineIdStore::in_memory();
        assert!(store.set_binding("refresh:abc", "short").is_err());
    }

    #[test]
    fn auto_binding_prefers_profile_arn_seed() {
        let store = MachineIdStore::in_memory();
        let (id, created) = store
            .ensure_auto_binding("refresh:k", Some("arn:p"), "rt")
            .unwrap();
        assert!(created);
        assert_eq!(id, stable_machine_id_from_seed("arn:p"));

        // 第二次命中已有绑定
        let (id2, created2) = store
            .ensure_auto_binding("refresh:k", Some("arn:other"), "rt")
            .unwrap();
        assert!(!created2);
        assert_eq!(id2, id);
    }

    #[test]
    fn auto_binding_falls_back_to_refresh_token() {
        let store = MachineIdStore::in_memory();
        let (id, _) = store.ensure_auto_binding("refresh:k", None, "rt-seed").unwrap();
        assert_eq!(id, stable_machine_id_from_seed("rt-seed"));
    }

    #[test]
    fn auto_binding_requires_some_seed() {
        let store = MachineIdStore::in_memory();
        assert!(store.ensure_auto_binding("refresh:k", None, "  ").is_none());
        assert!(store.ensure_auto_binding("", Some("arn"), "rt").is_none());
    }
}
