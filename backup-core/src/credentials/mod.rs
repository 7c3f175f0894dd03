//! 仓库密码缓存
//!
//! 每个条目只记录过期时间，读取时惰性检查，另有一个周期任务统一清理，
//! 清理或读取时发现过期都会发布 [`CoreEvent::CredentialExpired`]。

mod crypto;

pub use crypto::{SecretCipher, random_salt};

use crate::clock::Clock;
use crate::config::CredentialsConfig;
use crate::constants::credentials as consts;
use crate::error::{BackupError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::store::TaskStore;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 密码保存方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageMode {
    /// 只在内存中保存，进程退出即清空，不过期
    #[serde(rename = "ephemeral")]
    Ephemeral,
    /// 内存中保存，按超时时间过期
    #[default]
    #[serde(rename = "session")]
    SessionCache,
    /// 加密后持久化，首次使用时解密到内存
    #[serde(rename = "encrypted")]
    EncryptedStorage,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Ephemeral => "ephemeral",
            StorageMode::SessionCache => "session",
            StorageMode::EncryptedStorage => "encrypted",
        }
    }
}

impl FromStr for StorageMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ephemeral" => Ok(StorageMode::Ephemeral),
            "session" => Ok(StorageMode::SessionCache),
            "encrypted" => Ok(StorageMode::EncryptedStorage),
            other => Err(BackupError::invalid_input(format!(
                "未知的密码保存方式: {other}"
            ))),
        }
    }
}

struct CachedCredential {
    secret: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedCredential {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct CredentialState {
    mode: StorageMode,
    /// 0 表示永不过期
    timeout: Duration,
    entries: HashMap<i64, CachedCredential>,
    cipher: Option<SecretCipher>,
}

impl CredentialState {
    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.mode == StorageMode::Ephemeral || self.timeout.is_zero() {
            None
        } else {
            Some(now + self.timeout)
        }
    }

    fn rebase_expiries(&mut self, now: DateTime<Utc>) {
        let expires_at = self.expiry_from(now);
        for entry in self.entries.values_mut() {
            entry.expires_at = expires_at;
        }
    }
}

pub struct CredentialCache {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    kdf_iterations: u32,
    state: Mutex<CredentialState>,
}

impl CredentialCache {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        mode: StorageMode,
        timeout_minutes: u64,
        kdf_iterations: u32,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            kdf_iterations,
            state: Mutex::new(CredentialState {
                mode,
                timeout: Duration::minutes(timeout_minutes as i64),
                entries: HashMap::new(),
                cipher: None,
            }),
        }
    }

    pub fn from_config(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: &CredentialsConfig,
    ) -> Self {
        Self::new(
            store,
            clock,
            events,
            config.storage_mode,
            config.timeout_minutes,
            config.kdf_iterations,
        )
    }

    fn state(&self) -> MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> StorageMode {
        self.state().mode
    }

    pub fn timeout_minutes(&self) -> u64 {
        self.state().timeout.num_minutes() as u64
    }

    pub fn is_unlocked(&self) -> bool {
        self.state().cipher.is_some()
    }

    /// 内存中是否有未过期的密码
    pub fn has(&self, repository_id: i64) -> bool {
        let now = self.clock.now();
        self.state()
            .entries
            .get(&repository_id)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// 读取密码并刷新过期时间
    pub async fn get(&self, repository_id: i64) -> Result<Option<SecretString>> {
        let now = self.clock.now();
        let mut expired = false;
        let (mode, cipher) = {
            let mut state = self.state();
            let expires_at = state.expiry_from(now);
            if state
                .entries
                .get(&repository_id)
                .is_some_and(|entry| entry.is_expired(now))
            {
                state.entries.remove(&repository_id);
                expired = true;
            } else if let Some(entry) = state.entries.get_mut(&repository_id) {
                entry.expires_at = expires_at;
                return Ok(Some(entry.secret.clone()));
            }
            (state.mode, state.cipher.clone())
        };

        if expired {
            debug!("仓库 {} 的缓存密码已过期", repository_id);
            self.events
                .publish(CoreEvent::CredentialExpired { repository_id });
        }

        if mode != StorageMode::EncryptedStorage {
            return Ok(None);
        }

        let Some(blob) = self.store.load_credential(repository_id).await? else {
            return Ok(None);
        };
        let cipher = cipher.ok_or(BackupError::MasterKeyRequired)?;
        let secret = cipher.decrypt_secret(&blob)?;

        let mut state = self.state();
        let expires_at = state.expiry_from(self.clock.now());
        state.entries.insert(
            repository_id,
            CachedCredential {
                secret: secret.clone(),
                expires_at,
            },
        );
        Ok(Some(secret))
    }

    /// 保存密码；加密存储模式下同时写入数据库
    pub async fn set(&self, repository_id: i64, secret: SecretString) -> Result<()> {
        let (mode, cipher) = {
            let state = self.state();
            (state.mode, state.cipher.clone())
        };

        if mode == StorageMode::EncryptedStorage {
            let cipher = cipher.ok_or(BackupError::MasterKeyRequired)?;
            let blob = cipher.encrypt_secret(&secret)?;
            self.store.store_credential(repository_id, &blob).await?;
        }

        let mut state = self.state();
        let expires_at = state.expiry_from(self.clock.now());
        state.entries.insert(
            repository_id,
            CachedCredential { secret, expires_at },
        );
        Ok(())
    }

    /// 从内存和数据库中删除密码
    pub async fn remove(&self, repository_id: i64) -> Result<()> {
        self.state().entries.remove(&repository_id);
        self.store.delete_credential(repository_id).await
    }

    /// 清空内存中的密码，不影响已持久化的数据
    pub fn clear(&self) {
        self.state().entries.clear();
    }

    /// 进程退出前调用
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.cipher = None;
    }

    /// 切换保存方式；离开加密存储时清除全部已持久化的密码
    pub async fn set_mode(&self, mode: StorageMode) -> Result<()> {
        let now = self.clock.now();
        let (previous, to_persist, cipher) = {
            let mut state = self.state();
            let previous = state.mode;
            state.mode = mode;
            state.rebase_expiries(now);
            let to_persist: Vec<(i64, SecretString)> = if mode == StorageMode::EncryptedStorage
                && previous != StorageMode::EncryptedStorage
            {
                state
                    .entries
                    .iter()
                    .map(|(id, entry)| (*id, entry.secret.clone()))
                    .collect()
            } else {
                Vec::new()
            };
            (previous, to_persist, state.cipher.clone())
        };

        if previous == mode {
            return Ok(());
        }
        info!("密码保存方式: {} -> {}", previous.as_str(), mode.as_str());

        if previous == StorageMode::EncryptedStorage {
            self.store.delete_all_credentials().await?;
            self.state().cipher = None;
        }

        if !to_persist.is_empty() {
            match cipher {
                Some(cipher) => {
                    for (repository_id, secret) in to_persist {
                        let blob = cipher.encrypt_secret(&secret)?;
                        self.store.store_credential(repository_id, &blob).await?;
                    }
                }
                None => warn!("主密码未解锁，已缓存的密码暂不写入加密存储"),
            }
        }

        self.store
            .set_setting(consts::SETTING_STORAGE_MODE, mode.as_str())
            .await
    }

    /// 修改超时时间，并以当前时刻重新计算已缓存条目的过期时间
    pub async fn set_timeout(&self, timeout_minutes: u64) -> Result<()> {
        {
            let now = self.clock.now();
            let mut state = self.state();
            state.timeout = Duration::minutes(timeout_minutes as i64);
            state.rebase_expiries(now);
        }
        self.store
            .set_setting(
                consts::SETTING_TIMEOUT_MINUTES,
                &timeout_minutes.to_string(),
            )
            .await
    }

    /// 从设置表恢复上次保存的方式和超时时间
    pub async fn restore_preferences(&self) -> Result<()> {
        let mode = self.store.get_setting(consts::SETTING_STORAGE_MODE).await?;
        let timeout = self
            .store
            .get_setting(consts::SETTING_TIMEOUT_MINUTES)
            .await?;

        let now = self.clock.now();
        let mut state = self.state();
        if let Some(mode) = mode {
            match mode.parse::<StorageMode>() {
                Ok(mode) => state.mode = mode,
                Err(e) => warn!("忽略无效的密码保存方式设置: {}", e),
            }
        }
        if let Some(timeout) = timeout {
            match timeout.parse::<i64>() {
                Ok(minutes) if minutes >= 0 => state.timeout = Duration::minutes(minutes),
                _ => warn!("忽略无效的密码超时设置: {}", timeout),
            }
        }
        state.rebase_expiries(now);
        Ok(())
    }

    /// 用主密码解锁加密存储，首次解锁时生成盐和校验数据
    pub async fn unlock(&self, master: &SecretString) -> Result<()> {
        let salt = match self.load_hex(consts::SETTING_MASTER_SALT).await? {
            Some(salt) => salt,
            None => {
                let salt = random_salt().to_vec();
                self.store
                    .set_setting(consts::SETTING_MASTER_SALT, &hex::encode(&salt))
                    .await?;
                salt
            }
        };

        let cipher = self.derive(master, salt).await?;
        match self.load_hex(consts::SETTING_MASTER_VERIFIER).await? {
            Some(verifier) => verify(&cipher, &verifier)?,
            None => {
                let blob = cipher.encrypt(consts::VERIFIER_PLAINTEXT)?;
                self.store
                    .set_setting(consts::SETTING_MASTER_VERIFIER, &hex::encode(blob))
                    .await?;
                info!("已设置主密码");
            }
        }

        self.state().cipher = Some(cipher);
        Ok(())
    }

    /// 更换主密码
    ///
    /// 用旧密钥解密全部已保存的密码，再以新的盐和密钥重新加密。
    /// 写入中途失败时恢复原有数据，旧主密码继续有效。
    pub async fn change_master_password(
        &self,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<()> {
        let salt = self.load_hex(consts::SETTING_MASTER_SALT).await?;
        let verifier = self.load_hex(consts::SETTING_MASTER_VERIFIER).await?;
        let (Some(salt), Some(verifier)) = (salt, verifier) else {
            return Err(BackupError::MasterKeyRequired);
        };

        let old_cipher = self.derive(old, salt.clone()).await?;
        verify(&old_cipher, &verifier)?;

        let new_salt = random_salt().to_vec();
        let new_cipher = self.derive(new, new_salt.clone()).await?;
        let new_verifier = new_cipher.encrypt(consts::VERIFIER_PLAINTEXT)?;

        // 先在内存中完成全部重新加密，解密失败时不做任何写入
        let previous = self.store.list_credentials().await?;
        let mut reencrypted = Vec::with_capacity(previous.len());
        for (repository_id, blob) in &previous {
            let secret = old_cipher.decrypt_secret(blob)?;
            reencrypted.push((*repository_id, new_cipher.encrypt_secret(&secret)?));
        }

        if let Err(e) = self
            .write_master(&reencrypted, &new_salt, &new_verifier)
            .await
        {
            warn!("更换主密码失败，恢复原有数据: {}", e);
            if let Err(rollback) = self.write_master(&previous, &salt, &verifier).await {
                warn!("恢复原有加密数据失败: {}", rollback);
            }
            return Err(e);
        }

        self.state().cipher = Some(new_cipher);
        info!("主密码已更换，重新加密了 {} 个仓库密码", reencrypted.len());
        Ok(())
    }

    async fn write_master(
        &self,
        blobs: &[(i64, Vec<u8>)],
        salt: &[u8],
        verifier: &[u8],
    ) -> Result<()> {
        for (repository_id, blob) in blobs {
            self.store.store_credential(*repository_id, blob).await?;
        }
        self.store
            .set_setting(consts::SETTING_MASTER_SALT, &hex::encode(salt))
            .await?;
        self.store
            .set_setting(consts::SETTING_MASTER_VERIFIER, &hex::encode(verifier))
            .await
    }

    async fn load_hex(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store
            .get_setting(key)
            .await?
            .map(|value| {
                hex::decode(&value)
                    .map_err(|e| BackupError::crypto(format!("{key} 格式错误: {e}")))
            })
            .transpose()
    }

    /// 密钥派生比较耗时，放到阻塞线程池
    async fn derive(&self, master: &SecretString, salt: Vec<u8>) -> Result<SecretCipher> {
        let iterations = self.kdf_iterations;
        let master = master.clone();
        Ok(tokio::task::spawn_blocking(move || {
            SecretCipher::derive(&master, &salt, iterations)
        })
        .await?)
    }

    pub fn lock(&self) {
        self.state().cipher = None;
    }

    /// 清理过期条目并发布过期事件
    pub fn sweep(&self) -> Vec<i64> {
        let now = self.clock.now();
        let expired: Vec<i64> = {
            let mut state = self.state();
            let ids: Vec<i64> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                state.entries.remove(id);
            }
            ids
        };

        for repository_id in &expired {
            debug!("仓库 {} 的缓存密码已过期", repository_id);
            self.events.publish(CoreEvent::CredentialExpired {
                repository_id: *repository_id,
            });
        }
        expired
    }

    /// 启动周期清理任务
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
            debug!("密码过期清理任务已停止");
        })
    }
}

fn verify(cipher: &SecretCipher, verifier: &[u8]) -> Result<()> {
    match cipher.decrypt(verifier) {
        Ok(plain) if plain == consts::VERIFIER_PLAINTEXT => Ok(()),
        _ => Err(BackupError::MasterKeyRejected),
    }
}
