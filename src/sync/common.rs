//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康状态批量写入的公共接口

use crate::error::{CheckError, Result};
use crate::model::Instance;
use tokio::sync::oneshot;

/// 批量写入结果码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCode {
    /// 写入成功
    ExecuteSuccess,
    /// 存储层异常
    StoreLayerException,
    /// 写入器已关闭，请求被丢弃
    Cancelled,
}

/// 异步心跳写入的结果句柄
pub struct HeartbeatFuture {
    rx: Option<oneshot::Receiver<WriteCode>>,
    code: Option<WriteCode>,
}

impl HeartbeatFuture {
    pub(crate) fn new(rx: oneshot::Receiver<WriteCode>) -> Self {
        Self {
            rx: Some(rx),
            code: None,
        }
    }

    /// 创建已完成的句柄
    pub fn ready(code: WriteCode) -> Self {
        Self {
            rx: None,
            code: Some(code),
        }
    }

    /// 等待写入完成
    pub async fn wait(&mut self) -> Result<()> {
        let code = match (self.code, self.rx.take()) {
            (Some(code), _) => code,
            (None, Some(rx)) => rx.await.unwrap_or(WriteCode::Cancelled),
            (None, None) => WriteCode::Cancelled,
        };
        self.code = Some(code);
        match code {
            WriteCode::ExecuteSuccess => Ok(()),
            other => Err(CheckError::StoreError(format!(
                "batch health status write failed: {:?}",
                other
            ))),
        }
    }

    /// 写入结果码，尚未完成时返回None
    pub fn code(&self) -> Option<WriteCode> {
        self.code
    }
}

/// 批量写入控制器
///
/// 开启后，健康状态变更通过批量写入路径持久化，而不是逐条同步写入
pub trait BatchController: Send + Sync {
    /// 是否开启了心跳批量写入
    fn heartbeat_open(&self) -> bool;

    /// 提交一条健康状态变更
    fn async_heartbeat(&self, instance: &Instance, healthy: bool) -> HeartbeatFuture;
}
