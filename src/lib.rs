//! Hive - 服务端智能体编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排门面、错误类型、合成器、优雅关闭
//! - **exec**: 计划执行器（并发调度、超时、重试、进度事件）
//! - **intent**: 查询分析（快速规则 + LLM 兜底）
//! - **llm**: LLM 协作方抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化与进程指标
//! - **plan**: 规划器与执行计划（DAG）
//! - **registry**: 工具目录（索引、评分、遥测、导入导出）
//! - **session**: 会话上下文与持久化协作方

pub mod config;
pub mod core;
pub mod exec;
pub mod intent;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod registry;
pub mod session;
