//! Monthly billing confirmation (check1 / check2)
//!
//! A teacher confirms a student's month (check1), then an admin confirms it
//! (check2). Each save upserts one detail document per `(student_name, yyyymm)`
//! and appends a row to the billing status log. Both writes go through a single
//! store batch, so a detail is never saved without its status row.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use classbook_shared::{collections, Document, DocumentStore, Filter, WriteOp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::month_key::{derive_month_key, now_in_offset, MonthKey};

/// Workflow step recorded in the billing status log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingStep {
    TeacherConfirm,
    AdminConfirm,
    PaymentConfirm,
    MessageConfirm,
}

impl BillingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStep::TeacherConfirm => "TeacherConfirm",
            BillingStep::AdminConfirm => "AdminConfirm",
            BillingStep::PaymentConfirm => "PaymentConfirm",
            BillingStep::MessageConfirm => "MessageConfirm",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TeacherConfirm" => Some(BillingStep::TeacherConfirm),
            "AdminConfirm" => Some(BillingStep::AdminConfirm),
            "PaymentConfirm" => Some(BillingStep::PaymentConfirm),
            "MessageConfirm" => Some(BillingStep::MessageConfirm),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which confirmation is being saved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Check1,
    Check2,
}

impl CheckKind {
    pub fn collection(&self) -> &'static str {
        match self {
            CheckKind::Check1 => collections::BILLING_CHECK1,
            CheckKind::Check2 => collections::BILLING_CHECK2,
        }
    }

    pub fn step(&self) -> BillingStep {
        match self {
            CheckKind::Check1 => BillingStep::TeacherConfirm,
            CheckKind::Check2 => BillingStep::AdminConfirm,
        }
    }

    pub fn all() -> [CheckKind; 2] {
        [CheckKind::Check1, CheckKind::Check2]
    }
}

/// A row of the billing status log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatusRow {
    pub yyyymm: String,
    pub step: BillingStep,
    #[serde(rename = "student_name")]
    pub student_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_by: Option<String>,
    #[serde(default)]
    pub meta: Value,
    pub saved_at: String,
}

/// Outcome of a check1/check2 save
#[derive(Debug, Clone)]
pub struct CheckSaved {
    pub month_key: MonthKey,
    pub detail: Document,
    pub status: Document,
}

/// Service for billing confirmations and the status log
pub struct BillingCheckService {
    store: Arc<dyn DocumentStore>,
    tz_offset_hours: i32,
}

impl BillingCheckService {
    pub fn new(store: Arc<dyn DocumentStore>, tz_offset_hours: i32) -> Self {
        Self {
            store,
            tz_offset_hours,
        }
    }

    fn now_local(&self) -> DateTime<FixedOffset> {
        now_in_offset(self.tz_offset_hours)
    }

    /// Save a confirmation from a raw request body
    pub async fn save_check(&self, kind: CheckKind, body: &Value) -> BillingResult<CheckSaved> {
        self.save_check_at(kind, body, self.now_local()).await
    }

    /// Same as [`Self::save_check`] with an explicit clock for the month fallback
    pub async fn save_check_at(
        &self,
        kind: CheckKind,
        body: &Value,
        now: DateTime<FixedOffset>,
    ) -> BillingResult<CheckSaved> {
        let student_name = required_str(body, "student_name")?;
        let month_key = derive_month_key(body, now);
        let saved_by = body.get("savedBy").and_then(Value::as_str);
        let meta = body.get("meta").cloned().unwrap_or_else(|| json!({}));
        let saved_at = timestamp();

        let mut detail = Map::new();
        detail.insert("student_name".into(), json!(student_name));
        detail.insert(
            "teacher_name".into(),
            body.get("teacher_name").cloned().unwrap_or(Value::Null),
        );
        detail.insert("yyyymm".into(), json!(month_key.yyyymm));
        detail.insert(
            "month".into(),
            json!({"year": month_key.year, "month": month_key.month}),
        );
        detail.insert("this_month_lines".into(), array_field(body, "this_month_lines"));
        detail.insert("next_month_lines".into(), array_field(body, "next_month_lines"));
        detail.insert(
            "final_save".into(),
            json!(body.get("final_save").and_then(Value::as_bool).unwrap_or(false)),
        );
        detail.insert("meta".into(), meta.clone());
        detail.insert("savedBy".into(), json!(saved_by));
        detail.insert("savedAt".into(), json!(saved_at));

        let status = BillingStatusRow {
            yyyymm: month_key.yyyymm.clone(),
            step: kind.step(),
            student_name: student_name.to_string(),
            saved_by: saved_by.map(str::to_string),
            meta,
            saved_at,
        };

        let key = Filter::new()
            .eq("student_name", student_name)
            .eq("yyyymm", month_key.yyyymm.as_str());
        let mut written = self
            .store
            .apply_batch(vec![
                WriteOp::upsert(kind.collection(), key, Value::Object(detail)),
                WriteOp::insert(collections::BILLING_STATUS, serde_json::to_value(&status)?),
            ])
            .await?
            .into_iter();

        let (Some(detail), Some(status)) = (written.next(), written.next()) else {
            return Err(BillingError::Internal("billing batch returned too few documents".to_string()));
        };

        tracing::info!(
            student = %student_name,
            yyyymm = %month_key.yyyymm,
            month_source = ?month_key.source,
            step = %kind.step(),
            "Billing check saved"
        );

        Ok(CheckSaved {
            month_key,
            detail,
            status,
        })
    }

    pub async fn get_check(
        &self,
        kind: CheckKind,
        student_name: &str,
        yyyymm: &str,
    ) -> BillingResult<Option<Document>> {
        Ok(self
            .store
            .find_one(
                kind.collection(),
                &Filter::new().eq("student_name", student_name).eq("yyyymm", yyyymm),
            )
            .await?)
    }

    pub async fn list_checks(&self, kind: CheckKind, yyyymm: Option<&str>) -> BillingResult<Vec<Document>> {
        let mut filter = Filter::new();
        if let Some(yyyymm) = yyyymm {
            filter = filter.eq("yyyymm", yyyymm);
        }
        Ok(self.store.find(kind.collection(), &filter).await?)
    }

    /// Append a workflow step to the status log
    pub async fn record_step(
        &self,
        step: BillingStep,
        student_name: &str,
        yyyymm: &str,
        saved_by: Option<&str>,
        meta: Value,
    ) -> BillingResult<Document> {
        if student_name.trim().is_empty() {
            return Err(BillingError::InvalidInput("student_name is required".to_string()));
        }
        let row = BillingStatusRow {
            yyyymm: yyyymm.to_string(),
            step,
            student_name: student_name.to_string(),
            saved_by: saved_by.map(str::to_string),
            meta: if meta.is_null() { json!({}) } else { meta },
            saved_at: timestamp(),
        };
        let doc = self
            .store
            .insert(collections::BILLING_STATUS, serde_json::to_value(&row)?)
            .await?;
        tracing::info!(student = %student_name, yyyymm = %yyyymm, step = %step, "Billing step recorded");
        Ok(doc)
    }

    /// Month key for a request body, using the service clock for the fallback
    pub fn month_key_for(&self, body: &Value) -> MonthKey {
        derive_month_key(body, self.now_local())
    }

    pub async fn list_status(
        &self,
        yyyymm: Option<&str>,
        student_name: Option<&str>,
    ) -> BillingResult<Vec<BillingStatusRow>> {
        let mut filter = Filter::new();
        if let Some(yyyymm) = yyyymm {
            filter = filter.eq("yyyymm", yyyymm);
        }
        if let Some(student_name) = student_name {
            filter = filter.eq("student_name", student_name);
        }
        let docs = self.store.find(collections::BILLING_STATUS, &filter).await?;
        docs.iter()
            .map(|d| d.decode::<BillingStatusRow>().map_err(BillingError::from))
            .collect()
    }

    /// Most recent step per student for a month
    pub async fn latest_steps(&self, yyyymm: &str) -> BillingResult<BTreeMap<String, BillingStatusRow>> {
        let rows = self.list_status(Some(yyyymm), None).await?;
        let mut latest: BTreeMap<String, BillingStatusRow> = BTreeMap::new();
        // Rows come back oldest first, so later rows overwrite earlier ones
        for row in rows {
            latest.insert(row.student_name.clone(), row);
        }
        Ok(latest)
    }

    /// Append status rows for details that have none.
    ///
    /// Returns the `(student_name, yyyymm)` pairs that were repaired.
    pub async fn reconcile_status_log(&self, kind: CheckKind) -> BillingResult<Vec<(String, String)>> {
        let details = self.store.find(kind.collection(), &Filter::new()).await?;
        let step = kind.step();
        let mut repaired = Vec::new();

        for detail in details {
            let (Some(student), Some(yyyymm)) = (detail.str_field("student_name"), detail.str_field("yyyymm"))
            else {
                tracing::warn!(doc_id = %detail.id, collection = kind.collection(), "Billing detail missing its key fields");
                continue;
            };

            let existing = self
                .store
                .find_one(
                    collections::BILLING_STATUS,
                    &Filter::new()
                        .eq("student_name", student)
                        .eq("yyyymm", yyyymm)
                        .eq("step", step.as_str()),
                )
                .await?;
            if existing.is_some() {
                continue;
            }

            self.record_step(step, student, yyyymm, Some("reconciler"), json!({"repaired": true}))
                .await?;
            tracing::warn!(student = %student, yyyymm = %yyyymm, step = %step, "Repaired missing billing status row");
            repaired.push((student.to_string(), yyyymm.to_string()));
        }

        Ok(repaired)
    }
}

fn required_str<'a>(body: &'a Value, field: &str) -> BillingResult<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BillingError::InvalidInput(format!("{} is required", field)))
}

fn array_field(body: &Value, field: &str) -> Value {
    body.get(field)
        .filter(|v| v.is_array())
        .cloned()
        .unwrap_or_else(|| json!([]))
}

fn timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
