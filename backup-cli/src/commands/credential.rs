use crate::app::CliApp;
use crate::cli::CredentialCommand;
use crate::utils::{
    ENV_MASTER_PASSWORD, ENV_NEW_MASTER_PASSWORD, ENV_REPOSITORY_PASSWORD, read_secret,
};
use anyhow::{Context, Result, bail};
use backup_core::credentials::StorageMode;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

pub async fn run_credential_command(app: &CliApp, cmd: CredentialCommand) -> Result<()> {
    let credentials = &app.services.credentials;
    match cmd {
        CredentialCommand::Set { repo } => {
            app.repositories.get(repo).await?;
            let secret = read_secret(ENV_REPOSITORY_PASSWORD, "仓库密码")?;
            app.ensure_unlocked().await?;
            app.repositories.set_credential(repo, secret).await?;
            match credentials.mode() {
                StorageMode::EncryptedStorage => info!("🔐 已加密保存仓库 #{} 的密码", repo),
                mode => warn!(
                    "⚠️  当前保存方式为 {}，密码不会保留到下次运行",
                    mode.as_str()
                ),
            }
        }
        CredentialCommand::Remove { repo } => {
            credentials.remove(repo).await?;
            info!("🗑️  已删除仓库 #{} 的密码", repo);
        }
        CredentialCommand::Mode { mode } => {
            if mode == StorageMode::EncryptedStorage {
                app.ensure_unlocked().await?;
            }
            let previous = credentials.mode();
            credentials.set_mode(mode).await?;
            if previous == StorageMode::EncryptedStorage && mode != previous {
                warn!("⚠️  已清除加密保存的全部仓库密码");
            }
            info!("✅ 密码保存方式: {}", mode.as_str());
        }
        CredentialCommand::Timeout { minutes } => {
            credentials.set_timeout(minutes).await?;
            if minutes == 0 {
                info!("✅ 缓存密码不再过期");
            } else {
                info!("✅ 缓存密码 {} 分钟未使用后过期", minutes);
            }
        }
        CredentialCommand::Unlock => {
            let master = read_secret(ENV_MASTER_PASSWORD, "主密码")?;
            credentials
                .unlock(&master)
                .await
                .context("主密码解锁失败")?;
            info!("🔓 主密码验证通过");
        }
        CredentialCommand::Passwd => {
            let old = read_secret(ENV_MASTER_PASSWORD, "当前主密码")?;
            let new = read_secret(ENV_NEW_MASTER_PASSWORD, "新主密码")?;
            change_master_password(app, &old, &new).await?;
        }
    }
    Ok(())
}

async fn change_master_password(
    app: &CliApp,
    old: &SecretString,
    new: &SecretString,
) -> Result<()> {
    if new.expose_secret().is_empty() {
        bail!("新主密码不能为空");
    }
    app.services
        .credentials
        .change_master_password(old, new)
        .await
        .context("更换主密码失败")?;
    info!("🔑 主密码已更换");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::BackupError;
    use backup_core::config::AppConfig;
    use backup_core::models::{BackendType, Repository};
    use backup_core::store::DuckDbStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passwd_keeps_saved_credentials_readable() {
        let mut config = AppConfig::default();
        config.credentials.storage_mode = StorageMode::EncryptedStorage;
        config.credentials.kdf_iterations = 1000;
        let store = DuckDbStore::new_memory().await.unwrap();
        let app = CliApp::assemble(config, Arc::new(store)).await.unwrap();
        let credentials = &app.services.credentials;

        credentials.unlock(&SecretString::from("old")).await.unwrap();
        let repo = app
            .repositories
            .create(
                Repository::new("本地", BackendType::Local, "/tmp/repo"),
                Some(SecretString::from("pw")),
                false,
            )
            .await
            .unwrap();

        let old = SecretString::from("old");
        let new = SecretString::from("new");
        let err = change_master_password(&app, &old, &SecretString::from(""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("不能为空"));

        let err = change_master_password(&app, &SecretString::from("nope"), &new)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::MasterKeyRejected)
        ));

        change_master_password(&app, &old, &new).await.unwrap();
        credentials.shutdown();
        assert!(credentials.unlock(&old).await.is_err());
        credentials.unlock(&new).await.unwrap();
        assert_eq!(
            credentials.get(repo.id).await.unwrap().unwrap().expose_secret(),
            "pw"
        );
    }
}
