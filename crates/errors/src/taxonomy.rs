//! 失败分类
//!
//! 适配器层负责把底层错误归入固定的几类，调度器只根据类别决定重试策略。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 适配器错误种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    ConnectionRefused,
    NoRouteToHost,
    Timeout,
    DnsFailure,
    Authentication,
    ResourceLimit,
    NotFound,
    Unsupported,
    /// 传输后内容摘要与声明不符
    IntegrityMismatch,
    Other,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterErrorKind::ConnectionRefused => "connection refused",
            AdapterErrorKind::NoRouteToHost => "no route to host",
            AdapterErrorKind::Timeout => "timeout",
            AdapterErrorKind::DnsFailure => "dns failure",
            AdapterErrorKind::Authentication => "authentication",
            AdapterErrorKind::ResourceLimit => "resource limit",
            AdapterErrorKind::NotFound => "not found",
            AdapterErrorKind::Unsupported => "unsupported",
            AdapterErrorKind::IntegrityMismatch => "integrity mismatch",
            AdapterErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// 带上下文的适配器错误（资源ID、操作名）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("资源 {resource_id} 执行 {operation} 失败 ({kind}): {message}")]
pub struct AdapterError {
    pub resource_id: String,
    pub operation: String,
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new<R, O, M>(resource_id: R, operation: O, kind: AdapterErrorKind, message: M) -> Self
    where
        R: Into<String>,
        O: Into<String>,
        M: Into<String>,
    {
        Self {
            resource_id: resource_id.into(),
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    /// 从IO错误归类
    pub fn from_io<R, O>(resource_id: R, operation: O, err: &std::io::Error) -> Self
    where
        R: Into<String>,
        O: Into<String>,
    {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::NotFound => AdapterErrorKind::NotFound,
            ErrorKind::PermissionDenied => AdapterErrorKind::Authentication,
            ErrorKind::ConnectionRefused => AdapterErrorKind::ConnectionRefused,
            ErrorKind::TimedOut => AdapterErrorKind::Timeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                AdapterErrorKind::ConnectionRefused
            }
            ErrorKind::StorageFull | ErrorKind::OutOfMemory => AdapterErrorKind::ResourceLimit,
            _ => AdapterErrorKind::Other,
        };
        Self::new(resource_id, operation, kind, err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            AdapterErrorKind::ConnectionRefused
                | AdapterErrorKind::NoRouteToHost
                | AdapterErrorKind::Timeout
                | AdapterErrorKind::DnsFailure
        )
    }

    pub fn failure_class(&self) -> FailureClass {
        match self.kind {
            AdapterErrorKind::ConnectionRefused
            | AdapterErrorKind::NoRouteToHost
            | AdapterErrorKind::Timeout
            | AdapterErrorKind::DnsFailure => FailureClass::Transient,
            AdapterErrorKind::Authentication => FailureClass::Authentication,
            AdapterErrorKind::ResourceLimit => FailureClass::ResourceLimit,
            AdapterErrorKind::NotFound
            | AdapterErrorKind::Unsupported
            | AdapterErrorKind::IntegrityMismatch
            | AdapterErrorKind::Other => FailureClass::Execution,
        }
    }

    pub fn into_failure(self) -> FailureReason {
        FailureReason::new(self.failure_class(), self.to_string())
    }
}

/// 任务失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 网络类临时故障，消耗一次重试
    Transient,
    /// 认证/授权失败，不重试
    Authentication,
    /// 内存、墙钟时间、磁盘等资源超限，不重试
    ResourceLimit,
    /// 任务自身执行失败（非零退出码），消耗一次重试
    Execution,
    /// 调度器自身原因（崩溃、重启），重新排队且不计入重试
    SchedulerCaused,
}

impl FailureClass {
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureClass::Authentication | FailureClass::ResourceLimit)
    }

    pub fn charges_retry(&self) -> bool {
        !matches!(self, FailureClass::SchedulerCaused)
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Transient => "临时故障",
            FailureClass::Authentication => "认证失败",
            FailureClass::ResourceLimit => "资源超限",
            FailureClass::Execution => "执行失败",
            FailureClass::SchedulerCaused => "调度器故障",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Authentication => "authentication",
            FailureClass::ResourceLimit => "resource_limit",
            FailureClass::Execution => "execution",
            FailureClass::SchedulerCaused => "scheduler_caused",
        }
    }
}

/// 交给HandleFailure的失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub class: FailureClass,
    pub message: String,
}

impl FailureReason {
    pub fn new<S: Into<String>>(class: FailureClass, message: S) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::new(FailureClass::Execution, message)
    }

    pub fn scheduler_caused<S: Into<String>>(message: S) -> Self {
        Self::new(FailureClass::SchedulerCaused, message)
    }

    /// 写入任务error字段的文本，带类别前缀便于区分
    pub fn describe(&self) -> String {
        format!("[{}] {}", self.class.label(), self.message)
    }
}
