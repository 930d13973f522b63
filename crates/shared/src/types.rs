//! Common document types used across Classbook

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Collections
// =============================================================================

/// Collection names in the document store
pub mod collections {
    pub const PAYMENTS: &str = "payments";
    pub const STUDENTS: &str = "students";
    pub const TEACHERS: &str = "teachers";
    pub const BILLING_CHECK1: &str = "billing_check1";
    pub const BILLING_CHECK2: &str = "billing_check2";
    pub const BILLING_STATUS: &str = "billing_status";
    pub const CLASSNOTES: &str = "classnotes";
    pub const DIARIES: &str = "diaries";
    pub const QUIZLETS: &str = "quizlets";
    pub const BANNERS: &str = "banners";
    pub const POPUPS: &str = "popups";
}

// =============================================================================
// Student
// =============================================================================

/// Student document. Fields the service does not interpret are kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Prepaid remaining classes
    #[serde(default)]
    pub credits: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Student `paymentStatus` values written by the payment flow
pub mod payment_status {
    pub const PAID: &str = "paid";
}

// =============================================================================
// Teacher
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_student_keeps_unknown_fields() {
        let raw = json!({
            "name": "Ann",
            "phoneNumber": "010-1234-5678",
            "credits": 4,
            "teacher_name": "Kim",
            "memo": "prefers mornings"
        });
        let student: Student = serde_json::from_value(raw).unwrap();
        assert_eq!(student.credits, 4);
        assert_eq!(student.extra["teacher_name"], "Kim");

        let back = serde_json::to_value(&student).unwrap();
        assert_eq!(back["memo"], "prefers mornings");
        assert_eq!(back["phoneNumber"], "010-1234-5678");
        assert!(back.get("orderId").is_none());
    }

    #[test]
    fn test_student_credits_default_to_zero() {
        let student: Student = serde_json::from_value(json!({"name": "Ben"})).unwrap();
        assert_eq!(student.credits, 0);
        assert!(student.payment_status.is_none());
    }
}
