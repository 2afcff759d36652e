//! 人员目录查询
//!
//! 把外部系统的员工编号、学生编号映射为内部用户和家长账号。
//! 真实目录由外部服务提供，这里只定义接口和两个简单实现。

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 学生档案
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    /// 目录中的内部标识
    pub id: String,
    pub code: String,
    pub name: String,
    /// 家长 ID 列表
    pub guardian_ids: Vec<String>,
}

/// 人员目录
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// 员工编号对应的内部用户 ID
    async fn resolve_employee(&self, employee_code: &str) -> Result<Option<String>>;
    async fn find_student(&self, student_code: &str) -> Result<Option<StudentProfile>>;
}

/// 直通目录：员工编号即用户 ID，不认识任何学生
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDirectory;

#[async_trait]
impl DirectoryLookup for PassthroughDirectory {
    async fn resolve_employee(&self, employee_code: &str) -> Result<Option<String>> {
        Ok(Some(employee_code.to_string()))
    }

    async fn find_student(&self, _student_code: &str) -> Result<Option<StudentProfile>> {
        Ok(None)
    }
}

/// 内存目录
#[derive(Debug, Default)]
pub struct StaticDirectory {
    employees: RwLock<HashMap<String, String>>,
    students: RwLock<HashMap<String, StudentProfile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_employee(&self, employee_code: &str, user_id: &str) {
        self.employees
            .write()
            .insert(employee_code.to_string(), user_id.to_string());
    }

    pub fn add_student(&self, profile: StudentProfile) {
        self.students.write().insert(profile.code.clone(), profile);
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectory {
    async fn resolve_employee(&self, employee_code: &str) -> Result<Option<String>> {
        Ok(self.employees.read().get(employee_code).cloned())
    }

    async fn find_student(&self, student_code: &str) -> Result<Option<StudentProfile>> {
        Ok(self.students.read().get(student_code).cloned())
    }
}
