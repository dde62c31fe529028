//! 会话持久化协作方
//!
//! 窄接口：load / store / delete。快照是尽力而为，失败由调用方记日志，绝不向上传播。
//! FileSessionStore 每会话一个 JSON 文件；NullSessionStore 供测试与无盘部署。

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use super::context::Context;

#[derive(Error, Debug)]
#[error("session persistence failure: {0}")]
pub struct PersistError(pub String);

/// 持久化协作方接口
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load_session(&self, id: &str) -> Result<Option<Context>, PersistError>;
    async fn store_session(&self, id: &str, context: &Context) -> Result<(), PersistError>;
    async fn delete_session(&self, id: &str) -> Result<(), PersistError>;
}

/// 空实现：不加载、不保存
pub struct NullSessionStore;

#[async_trait]
impl SessionPersistence for NullSessionStore {
    async fn load_session(&self, _id: &str) -> Result<Option<Context>, PersistError> {
        Ok(None)
    }

    async fn store_session(&self, _id: &str, _context: &Context) -> Result<(), PersistError> {
        Ok(())
    }

    async fn delete_session(&self, _id: &str) -> Result<(), PersistError> {
        Ok(())
    }
}

/// 文件存储：目录下每会话一个 JSON 文件
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // 会话 id 是内部生成的 uuid，这里仍做白名单过滤避免路径逃逸
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SessionPersistence for FileSessionStore {
    async fn load_session(&self, id: &str) -> Result<Option<Context>, PersistError> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let context =
                    serde_json::from_str(&raw).map_err(|e| PersistError(e.to_string()))?;
                Ok(Some(context))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError(e.to_string())),
        }
    }

    async fn store_session(&self, id: &str, context: &Context) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PersistError(e.to_string()))?;
        let raw = serde_json::to_string_pretty(context).map_err(|e| PersistError(e.to_string()))?;
        tokio::fs::write(self.path_for(id), raw)
            .await
            .map_err(|e| PersistError(e.to_string()))
    }

    async fn delete_session(&self, id: &str) -> Result<(), PersistError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::context::Turn;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let mut ctx = Context::new("session-a", "u1", 10);
        ctx.push_turn(Turn::user("hello")).unwrap();
        ctx.push_turn(Turn::assistant("hi", vec!["echo".to_string()]))
            .unwrap();

        store.store_session(&ctx.id.clone(), &ctx).await.unwrap();
        let loaded = store.load_session("session-a").await.unwrap().unwrap();
        assert_eq!(loaded.id, ctx.id);
        assert_eq!(loaded.turns().len(), 2);

        store.delete_session("session-a").await.unwrap();
        assert!(store.load_session("session-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load_session("nope").await.unwrap().is_none());
    }
}
