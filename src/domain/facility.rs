// ==========================================
// 血液履约编排核心 - 机构与通知对象
// ==========================================
// Recipient: {Hospital, BloodBank, Donor, College} 标签联合
// 取代按模型名动态查找的通知目标
// ==========================================

use crate::domain::request::GeoPoint;
use crate::domain::types::FacilityKind;
use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// Facility - 医院/血站
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: String,
    pub name: String,
    pub kind: FacilityKind,
    pub location: GeoPoint,
    pub has_testing_capability: bool,
    pub active: bool,
}

// ==========================================
// College - 合作高校
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct College {
    pub college_id: String,
    pub name: String,
    pub coordinator_id: String,
    pub location: GeoPoint,
    pub active: bool,
}

// ==========================================
// Recipient - 通知接收方
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Hospital(String),
    BloodBank(String),
    Donor(String),
    College(String), // 高校协调员
}

impl Recipient {
    pub fn id(&self) -> &str {
        match self {
            Recipient::Hospital(id)
            | Recipient::BloodBank(id)
            | Recipient::Donor(id)
            | Recipient::College(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Recipient::Hospital(_) => "hospital",
            Recipient::BloodBank(_) => "blood_bank",
            Recipient::Donor(_) => "donor",
            Recipient::College(_) => "college",
        }
    }

    /// 按机构类型构造接收方
    pub fn for_facility(kind: FacilityKind, id: impl Into<String>) -> Self {
        match kind {
            FacilityKind::Hospital => Recipient::Hospital(id.into()),
            FacilityKind::BloodBank => Recipient::BloodBank(id.into()),
            FacilityKind::College => Recipient::College(id.into()),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id())
    }
}
