use serde::de::DeserializeOwned;
use serde::Serialize;

use scheduler_errors::{SchedulerError, SchedulerResult};

/// JSON 文本列的读写
pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T, field: &str) -> SchedulerResult<String> {
    serde_json::to_string(value)
        .map_err(|e| SchedulerError::Serialization(format!("序列化字段 {field} 失败: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str, field: &str) -> SchedulerResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| SchedulerError::Serialization(format!("解析字段 {field} 失败: {e}")))
}
