//! 会话层：上下文、管理器与持久化协作方
//!
//! Context 是单个会话的全部跨查询状态；SessionManager 持有分片的活跃会话表，
//! 负责取用/逐出/快照；SessionPersistence 是外部持久化协作方的窄接口。

pub mod context;
pub mod manager;
pub mod persistence;

pub use context::{Context, ContextError, RunSummary, Turn, TurnRole};
pub use manager::SessionManager;
pub use persistence::{FileSessionStore, NullSessionStore, SessionPersistence};
