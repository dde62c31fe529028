//! 核心编排
//!
//! Orchestrator 门面组合注册表、规划器、执行器、会话层与 LLM 协作方；
//! error 定义对外错误分类；synthesizer 负责最终合成与确定性兜底；
//! shutdown 提供优雅关闭信号。

pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod synthesizer;

pub use error::{ErrorInfo, OrchestratorError};
pub use orchestrator::{Orchestrator, QueryRequest, QueryResult, ToolUse};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use synthesizer::Synthesizer;
