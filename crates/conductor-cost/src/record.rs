use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::TokenUsage;

/// How a cost number was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostAccuracy {
    /// Provider-reported tokens priced by a configured table entry.
    Measured,
    /// Approximate calculation from the local pricing table only.
    Estimated,
    /// Not computed.
    Unavailable,
}

impl CostAccuracy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measured => "measured",
            Self::Estimated => "estimated",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "measured" => Some(Self::Measured),
            "estimated" => Some(Self::Estimated),
            "unavailable" => Some(Self::Unavailable),
            _ => None,
        }
    }
}

/// The money attached to one provider call. Currency is fixed to USD in
/// this version; the field is preserved for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAmount {
    pub amount: f64,
    pub currency: String,
    pub accuracy: CostAccuracy,
    /// Where the number came from, e.g. "pricing-table".
    pub source: String,
}

impl CostAmount {
    pub fn measured(amount: f64, source: impl Into<String>) -> Self {
        Self {
            amount,
            currency: "USD".into(),
            accuracy: CostAccuracy::Measured,
            source: source.into(),
        }
    }

    pub fn estimated(amount: f64, source: impl Into<String>) -> Self {
        Self {
            amount,
            currency: "USD".into(),
            accuracy: CostAccuracy::Estimated,
            source: source.into(),
        }
    }
}

/// One provider call, as recorded by the cost tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The provider the caller asked for.
    pub provider: String,
    pub model: String,
    /// The provider that actually served the call (differs when failover
    /// fired).
    pub actual_provider: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostAmount>,
}

impl CostRecord {
    /// Records without a cost descriptor count as unavailable.
    pub fn accuracy(&self) -> CostAccuracy {
        self.cost
            .as_ref()
            .map(|c| c.accuracy)
            .unwrap_or(CostAccuracy::Unavailable)
    }
}

/// Filter over cost records. Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub request_id: Option<String>,
}

impl CostFilter {
    pub fn matches(&self, record: &CostRecord) -> bool {
        if let Some(start) = self.start
            && record.timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end
            && record.timestamp > end
        {
            return false;
        }
        if let Some(ref provider) = self.provider
            && record.provider != *provider
        {
            return false;
        }
        if let Some(ref model) = self.model
            && record.model != *model
        {
            return false;
        }
        if let Some(ref workflow) = self.workflow_id
            && record.workflow_id.as_ref() != Some(workflow)
        {
            return false;
        }
        if let Some(ref user) = self.user_id
            && record.user_id.as_ref() != Some(user)
        {
            return false;
        }
        if let Some(ref run) = self.run_id
            && record.run_id.as_ref() != Some(run)
        {
            return false;
        }
        if let Some(ref request) = self.request_id
            && record.request_id != *request
        {
            return false;
        }
        true
    }
}

/// Counts of records per accuracy class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyBreakdown {
    pub measured: u64,
    pub estimated: u64,
    pub unavailable: u64,
}

impl AccuracyBreakdown {
    pub fn add(&mut self, accuracy: CostAccuracy) {
        match accuracy {
            CostAccuracy::Measured => self.measured += 1,
            CostAccuracy::Estimated => self.estimated += 1,
            CostAccuracy::Unavailable => self.unavailable += 1,
        }
    }

    /// If every record shares one accuracy class, that class; any mix is
    /// conservatively "estimated". An empty set is "unavailable".
    pub fn overall(&self) -> CostAccuracy {
        let total = self.measured + self.estimated + self.unavailable;
        if total == 0 || self.unavailable == total {
            CostAccuracy::Unavailable
        } else if self.measured == total {
            CostAccuracy::Measured
        } else {
            CostAccuracy::Estimated
        }
    }
}

/// Reducing fold over a set of cost records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAggregate {
    pub total_cost: f64,
    pub total_requests: u64,
    pub usage: TokenUsage,
    pub accuracy: CostAccuracy,
    pub breakdown: AccuracyBreakdown,
}

impl Default for CostAggregate {
    fn default() -> Self {
        Self {
            total_cost: 0.0,
            total_requests: 0,
            usage: TokenUsage::default(),
            accuracy: CostAccuracy::Unavailable,
            breakdown: AccuracyBreakdown::default(),
        }
    }
}

impl CostAggregate {
    pub fn add(&mut self, record: &CostRecord) {
        if let Some(ref cost) = record.cost {
            self.total_cost += cost.amount;
        }
        self.total_requests += 1;
        self.usage.merge(&record.usage);
        self.breakdown.add(record.accuracy());
        self.accuracy = self.breakdown.overall();
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CostRecord>) -> Self {
        let mut agg = Self::default();
        for record in records {
            agg.add(record);
        }
        agg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(provider: &str, cost: Option<CostAmount>) -> CostRecord {
        CostRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: "req".into(),
            run_id: None,
            step_name: None,
            workflow_id: None,
            user_id: None,
            provider: provider.into(),
            model: "m".into(),
            actual_provider: provider.into(),
            timestamp: Utc::now(),
            duration_ms: 10,
            usage: TokenUsage::new(10, 5),
            cost,
        }
    }

    #[test]
    fn all_measured_stays_measured() {
        let records = vec![
            record("a", Some(CostAmount::measured(0.01, "t"))),
            record("a", Some(CostAmount::measured(0.02, "t"))),
        ];
        let agg = CostAggregate::from_records(&records);
        assert!((agg.total_cost - 0.03).abs() < 1e-9);
        assert_eq!(agg.total_requests, 2);
        assert_eq!(agg.accuracy, CostAccuracy::Measured);
        assert_eq!(agg.usage.total_tokens, 30);
    }

    #[test]
    fn mixed_accuracy_is_estimated() {
        let records = vec![
            record("a", Some(CostAmount::measured(0.01, "t"))),
            record("b", Some(CostAmount::estimated(0.015, "t"))),
        ];
        let agg = CostAggregate::from_records(&records);
        assert_eq!(agg.accuracy, CostAccuracy::Estimated);
    }

    #[test]
    fn missing_cost_counts_as_unavailable() {
        let records = vec![record("a", None)];
        let agg = CostAggregate::from_records(&records);
        assert_eq!(agg.accuracy, CostAccuracy::Unavailable);
        assert_eq!(agg.breakdown.unavailable, 1);
        assert_eq!(agg.total_cost, 0.0);
    }

    #[test]
    fn measured_mixed_with_unavailable_is_estimated() {
        let records = vec![
            record("a", Some(CostAmount::measured(0.01, "t"))),
            record("a", None),
        ];
        let agg = CostAggregate::from_records(&records);
        assert_eq!(agg.accuracy, CostAccuracy::Estimated);
    }

    #[test]
    fn empty_set_is_unavailable() {
        let agg = CostAggregate::from_records(std::iter::empty());
        assert_eq!(agg.accuracy, CostAccuracy::Unavailable);
    }

    #[test]
    fn filter_matches_by_fields() {
        let r = record("a", None);
        let mut filter = CostFilter::default();
        assert!(filter.matches(&r));
        filter.provider = Some("a".into());
        assert!(filter.matches(&r));
        filter.provider = Some("b".into());
        assert!(!filter.matches(&r));
    }

    #[test]
    fn filter_time_range() {
        let r = record("a", None);
        let filter = CostFilter {
            start: Some(r.timestamp - chrono::Duration::seconds(10)),
            end: Some(r.timestamp + chrono::Duration::seconds(10)),
            ..Default::default()
        };
        assert!(filter.matches(&r));
        let filter = CostFilter {
            start: Some(r.timestamp + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!filter.matches(&r));
    }
}
