use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scheduler_errors::SchedulerResult;

use crate::value_objects::ResourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    SshKey,
    Password,
    ApiKey,
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub kind: CredentialKind,
    pub owner_user_id: String,
}

/// 凭据明文，Debug输出时脱敏
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(pub Vec<u8>);

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(<{} bytes>)", self.0.len())
    }
}

/// 访问上下文，用于审计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext {
    pub purpose: String,
    pub task_id: Option<String>,
}

/// 凭据库，权限判定（属主/组/其他位与显式允许/拒绝）由实现负责
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn get_usable_credential_for_resource(
        &self,
        resource_id: &str,
        resource_type: ResourceType,
        user_id: &str,
        context: &AccessContext,
    ) -> SchedulerResult<(Credential, SecretBytes)>;
}
