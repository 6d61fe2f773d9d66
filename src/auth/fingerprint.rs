// 每凭据请求指纹
//
// 指纹由绑定键确定性派生：同一凭据在进程重启后拿到同一套
// UA / locale / SDK 版本，避免上游看到同一账号频繁换机器。

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::machine_id::{stable_machine_id_from_seed, MachineIdStore};

/// 固定候选目录。下标由绑定键哈希选出。
const OS_CATALOG: &[(&str, &str)] = &[
    ("win32", "10.0.19044"),
    ("win32", "10.0.22631"),
    ("darwin", "23.6.0"),
    ("darwin", "24.6.0"),
    ("linux", "6.8.0"),
];

const LOCALE_CATALOG: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "zh-CN,zh;q=0.9,en;q=0.8",
    "ja-JP,ja;q=0.9,en;q=0.8",
    "de-DE,de;q=0.9,en;q=0.8",
];

const SDK_CATALOG: &[&str] = &["0.7.45", "0.8.12", "0.9.2"];

const NODE_VERSION: &str = "22.21.1";
const SDK_JS_VERSION: &str = "1.0.27";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub os_type: String,
    pub os_version: String,
    pub locale: String,
    pub sdk_version: String,
    pub machine_id: String,
}

impl Fingerprint {
    pub fn user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{sdk} ua/2.1 os/{os}#{osv} lang/js md/nodejs#{node} api/codewhispererstreaming#{sdk} m/E KiroIDE-{ver}-{mid}",
            sdk = SDK_JS_VERSION,
            os = self.os_type,
            osv = self.os_version,
            node = NODE_VERSION,
            ver = self.sdk_version,
            mid = self.machine_id,
        )
    }

    pub fn amz_user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{} KiroIDE-{}-{}",
            SDK_JS_VERSION, self.sdk_version, self.machine_id
        )
    }

    /// 把指纹头部应用到上游请求。
    pub fn apply_to_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .header("x-amz-user-agent", self.amz_user_agent())
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.locale)
            .header(reqwest::header::ACCEPT_ENCODING, "gzip, deflate, br")
    }
}

/// 指纹管理器：绑定键 → 指纹，机器码查自 [`MachineIdStore`]。
pub struct FingerprintManager {
    machine_ids: Arc<MachineIdStore>,
}

impl FingerprintManager {
    pub fn new(machine_ids: Arc<MachineIdStore>) -> Self {
        Self { machine_ids }
    }

    /// 由绑定键确定性生成指纹。
    ///
    /// 机器码优先取显式绑定；否则用绑定键本身作种子派生。
    pub fn fingerprint_for_binding_key(&self, binding_key: &str) -> Fingerprint {
        let digest = Sha256::digest(binding_key.as_bytes());
        // 取 digest 不同字节选目录项，保证各维度独立
        let os_idx = digest[0] as usize % OS_CATALOG.len();
        let locale_idx = digest[1] as usize % LOCALE_CATALOG.len();
        let sdk_idx = digest[2] as usize % SDK_CATALOG.len();

        let machine_id = self
            .machine_ids
            .get_machine_id(binding_key)
            .unwrap_or_else(|| stable_machine_id_from_seed(binding_key));

        let (os_type, os_version) = OS_CATALOG[os_idx];
        Fingerprint {
            os_type: os_type.to_string(),
            os_version: os_version.to_string(),
            locale: LOCALE_CATALOG[locale_idx].to_string(),
            sdk_version: SDK_CATALOG[sdk_idx].to_string(),
            machine_id,
        }
    }
}
