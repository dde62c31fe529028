//! 会话管理器
//!
//! 活跃会话表按 id 哈希分片（DashMap），同一会话内存中至多一个 Context，
//! 同一 Context 的写方由 tokio Mutex 串行化。空闲超过 ttl 的会话被定时清扫逐出，
//! 逐出与每轮结束都会触发尽力而为的快照。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::context::{Context, ContextError, Turn};
use super::persistence::SessionPersistence;

/// 会话管理器
pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<Context>>>,
    persistence: Arc<dyn SessionPersistence>,
    idle_ttl: Duration,
    max_turns: usize,
}

impl SessionManager {
    pub fn new(
        persistence: Arc<dyn SessionPersistence>,
        idle_ttl: Duration,
        max_turns: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            persistence,
            idle_ttl,
            max_turns,
        }
    }

    /// 取用或创建会话：内存 → 持久化加载 → 新建
    pub async fn get_or_create(
        &self,
        session_id: Option<&str>,
        user_id: &str,
    ) -> (String, Arc<Mutex<Context>>) {
        let id = session_id
            .map(String::from)
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4()));

        if let Some(existing) = self.sessions.get(&id) {
            return (id.clone(), Arc::clone(existing.value()));
        }

        let loaded = match self.persistence.load_session(&id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!("session load failed for {}: {}", id, e);
                None
            }
        };
        let context = loaded.map(|mut ctx| {
            ctx.touch();
            ctx
        });
        let context = context.unwrap_or_else(|| {
            crate::observability::Metrics::global()
                .sessions
                .created
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Context::new(&id, user_id, self.max_turns)
        });

        // 并发创建时保留先到者，保证同一 id 在内存中只有一个 Context
        let entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(context)));
        (id, Arc::clone(entry.value()))
    }

    /// 原子追加一轮并刷新活跃时间
    pub async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), ContextError> {
        if let Some(session) = self.sessions.get(session_id) {
            let mut context = session.value().lock().await;
            context.push_turn(turn)?;
        }
        Ok(())
    }

    /// 尽力而为的快照：失败记日志，不传播
    pub fn snapshot(&self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let context = Arc::clone(session.value());
        let persistence = Arc::clone(&self.persistence);
        let id = session_id.to_string();
        tokio::spawn(async move {
            let copy = context.lock().await.clone();
            if let Err(e) = persistence.store_session(&id, &copy).await {
                tracing::warn!("session snapshot failed for {}: {}", id, e);
            }
        });
    }

    /// 清扫空闲会话；逐出前快照。忙会话（Context 锁被持有）必然不空闲，直接跳过
    pub async fn sweep(&self) -> usize {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            if let Ok(context) = entry.value().try_lock() {
                if context.idle_longer_than(self.idle_ttl) {
                    expired.push((entry.key().clone(), context.clone()));
                }
            }
        }

        for (id, context) in &expired {
            if let Err(e) = self.persistence.store_session(id, context).await {
                tracing::warn!("snapshot before eviction failed for {}: {}", id, e);
            }
            self.sessions.remove(id);
        }

        if !expired.is_empty() {
            crate::observability::Metrics::global()
                .sessions
                .evicted
                .fetch_add(expired.len() as u64, std::sync::atomic::Ordering::Relaxed);
            tracing::info!("swept {} idle sessions", expired.len());
        }
        expired.len()
    }

    /// 后台清扫定时器；shutdown 取消时退出
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// 清空历史但保留会话（注册表遥测不受影响）
    pub async fn clear(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.value().lock().await.clear();
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::persistence::{FileSessionStore, NullSessionStore};

    fn manager_with(
        persistence: Arc<dyn SessionPersistence>,
        ttl: Duration,
    ) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(persistence, ttl, 10))
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_instance() {
        let manager = manager_with(Arc::new(NullSessionStore), Duration::from_secs(60));
        let (id, first) = manager.get_or_create(None, "u1").await;
        let (_, second) = manager.get_or_create(Some(&id), "u1").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_turn_ordering_across_queries() {
        let manager = manager_with(Arc::new(NullSessionStore), Duration::from_secs(60));
        let (id, _) = manager.get_or_create(None, "u1").await;
        manager.append_turn(&id, Turn::user("q1")).await.unwrap();
        manager
            .append_turn(&id, Turn::assistant("a1", vec![]))
            .await
            .unwrap();
        manager.append_turn(&id, Turn::user("q2")).await.unwrap();

        let (_, session) = manager.get_or_create(Some(&id), "u1").await;
        assert_eq!(session.lock().await.turns().len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions() {
        let manager = manager_with(Arc::new(NullSessionStore), Duration::from_millis(10));
        let (id, _) = manager.get_or_create(None, "u1").await;
        manager.append_turn(&id, Turn::user("hello")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.sweep().await, 1);
        assert_eq!(manager.active_count(), 0);

        // 逐出后再取同 id：全新（空）Context
        let (_, fresh) = manager.get_or_create(Some(&id), "u1").await;
        assert!(fresh.lock().await.turns().is_empty());
    }

    #[tokio::test]
    async fn test_eviction_snapshots_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionPersistence> = Arc::new(FileSessionStore::new(dir.path()));
        let manager = manager_with(Arc::clone(&store), Duration::from_millis(10));

        let (id, _) = manager.get_or_create(None, "u1").await;
        manager.append_turn(&id, Turn::user("hello")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.sweep().await;

        // 持久化里还有，再次 get_or_create 应加载回来
        let (_, reloaded) = manager.get_or_create(Some(&id), "u1").await;
        assert_eq!(reloaded.lock().await.turns().len(), 1);
    }
}
