//! Aggregation job descriptors
//!
//! Jobs are plain data (JSON-deserializable) and are compiled once, before
//! any partition is touched. Compilation is where every validation happens.

use crate::{LogEntry, LogLensError, PartitionKey, Result, MAX_STATUS, MIN_STATUS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Group key used when a job has no `group_by`
pub const ALL_ROWS_KEY: &str = "*";

/// Field (or derived value) a record is grouped or counted by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyExtractor {
    ClientAddress,
    Timestamp,
    Url,
    StatusCode,
    UserAgent,
    /// First `prefix_len` characters of the timestamp
    TimeBucket { prefix_len: usize },
}

impl KeyExtractor {
    pub fn extract<'a>(&self, entry: &'a LogEntry) -> Cow<'a, str> {
        match self {
            KeyExtractor::ClientAddress => Cow::Borrowed(&entry.client_address),
            KeyExtractor::Timestamp => Cow::Borrowed(&entry.timestamp),
            KeyExtractor::Url => Cow::Borrowed(&entry.url),
            KeyExtractor::StatusCode => Cow::Owned(entry.status_code.to_string()),
            KeyExtractor::UserAgent => Cow::Borrowed(&entry.user_agent),
            KeyExtractor::TimeBucket { prefix_len } => {
                let ts = entry.timestamp.as_str();
                let end = ts
                    .char_indices()
                    .nth(*prefix_len)
                    .map(|(idx, _)| idx)
                    .unwrap_or(ts.len());
                Cow::Borrowed(&ts[..end])
            }
        }
    }

    fn validate(&self, timestamp_width: Option<usize>) -> Result<()> {
        if let KeyExtractor::TimeBucket { prefix_len } = self {
            if *prefix_len == 0 {
                return Err(LogLensError::InvalidJobSpec(
                    "time_bucket prefix_len must be positive".into(),
                ));
            }
            if let Some(width) = timestamp_width {
                if *prefix_len > width {
                    return Err(LogLensError::InvalidJobSpec(format!(
                        "time_bucket prefix_len {} exceeds timestamp width {}",
                        prefix_len, width
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::ClientAddress => f.write_str("client_address"),
            KeyExtractor::Timestamp => f.write_str("timestamp"),
            KeyExtractor::Url => f.write_str("url"),
            KeyExtractor::StatusCode => f.write_str("status_code"),
            KeyExtractor::UserAgent => f.write_str("user_agent"),
            KeyExtractor::TimeBucket { prefix_len } => {
                write!(f, "time_bucket(timestamp, {})", prefix_len)
            }
        }
    }
}

/// Record filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    StatusIn { statuses: Vec<u16> },
    /// Inclusive on both ends
    StatusBetween { min: u16, max: u16 },
    ClientAddress { address: String },
    UrlPrefix { prefix: String },
    UrlMatches { pattern: String },
    UserAgentContains { needle: String },
    /// Lexical, inclusive on both ends
    TimestampBetween { start: String, end: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn status_in(statuses: impl IntoIterator<Item = u16>) -> Self {
        Predicate::StatusIn {
            statuses: statuses.into_iter().collect(),
        }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::And { predicates }
    }

    pub fn or(predicates: Vec<Predicate>) -> Self {
        Predicate::Or { predicates }
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Validate and prepare for evaluation
    pub fn compile(&self) -> Result<CompiledPredicate> {
        Ok(match self {
            Predicate::StatusIn { statuses } => {
                if statuses.is_empty() {
                    return Err(LogLensError::InvalidJobSpec(
                        "status_in needs at least one status".into(),
                    ));
                }
                let mut statuses = statuses.clone();
                statuses.sort_unstable();
                statuses.dedup();
                CompiledPredicate::StatusIn(statuses)
            }
            Predicate::StatusBetween { min, max } => {
                if min > max {
                    return Err(LogLensError::InvalidJobSpec(format!(
                        "status_between min {} is greater than max {}",
                        min, max
                    )));
                }
                CompiledPredicate::StatusBetween(*min, *max)
            }
            Predicate::ClientAddress { address } => CompiledPredicate::ClientAddress(address.clone()),
            Predicate::UrlPrefix { prefix } => CompiledPredicate::UrlPrefix(prefix.clone()),
            Predicate::UrlMatches { pattern } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    LogLensError::InvalidJobSpec(format!("bad url pattern {:?}: {}", pattern, e))
                })?;
                CompiledPredicate::UrlMatches(regex)
            }
            Predicate::UserAgentContains { needle } => {
                CompiledPredicate::UserAgentContains(needle.clone())
            }
            Predicate::TimestampBetween { start, end } => {
                if start > end {
                    return Err(LogLensError::InvalidJobSpec(format!(
                        "timestamp_between start {:?} is after end {:?}",
                        start, end
                    )));
                }
                CompiledPredicate::TimestampBetween(start.clone(), end.clone())
            }
            Predicate::And { predicates } => {
                CompiledPredicate::And(compile_all("and", predicates)?)
            }
            Predicate::Or { predicates } => CompiledPredicate::Or(compile_all("or", predicates)?),
            Predicate::Not { predicate } => CompiledPredicate::Not(Box::new(predicate.compile()?)),
        })
    }
}

fn compile_all(op: &str, predicates: &[Predicate]) -> Result<Vec<CompiledPredicate>> {
    if predicates.is_empty() {
        return Err(LogLensError::InvalidJobSpec(format!(
            "{} needs at least one predicate",
            op
        )));
    }
    predicates.iter().map(Predicate::compile).collect()
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::StatusIn { statuses } => {
                let list: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
                write!(f, "status_code IN ({})", list.join(", "))
            }
            Predicate::StatusBetween { min, max } => {
                write!(f, "status_code BETWEEN {} AND {}", min, max)
            }
            Predicate::ClientAddress { address } => write!(f, "client_address = '{}'", address),
            Predicate::UrlPrefix { prefix } => write!(f, "url LIKE '{}%'", prefix),
            Predicate::UrlMatches { pattern } => write!(f, "url ~ '{}'", pattern),
            Predicate::UserAgentContains { needle } => {
                write!(f, "user_agent LIKE '%{}%'", needle)
            }
            Predicate::TimestampBetween { start, end } => {
                write!(f, "timestamp BETWEEN '{}' AND '{}'", start, end)
            }
            Predicate::And { predicates } => write_joined(f, predicates, " AND "),
            Predicate::Or { predicates } => write_joined(f, predicates, " OR "),
            Predicate::Not { predicate } => write!(f, "NOT ({})", predicate),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, predicates: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, p) in predicates.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", p)?;
    }
    f.write_str(")")
}

/// Predicate ready for evaluation
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    StatusIn(Vec<u16>),
    StatusBetween(u16, u16),
    ClientAddress(String),
    UrlPrefix(String),
    UrlMatches(Regex),
    UserAgentContains(String),
    TimestampBetween(String, String),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            CompiledPredicate::StatusIn(statuses) => statuses.binary_search(&entry.status_code).is_ok(),
            CompiledPredicate::StatusBetween(min, max) => {
                (*min..=*max).contains(&entry.status_code)
            }
            CompiledPredicate::ClientAddress(address) => entry.client_address == *address,
            CompiledPredicate::UrlPrefix(prefix) => entry.url.starts_with(prefix.as_str()),
            CompiledPredicate::UrlMatches(regex) => regex.is_match(&entry.url),
            CompiledPredicate::UserAgentContains(needle) => entry.user_agent.contains(needle.as_str()),
            CompiledPredicate::TimestampBetween(start, end) => {
                entry.timestamp.as_str() >= start.as_str() && entry.timestamp.as_str() <= end.as_str()
            }
            CompiledPredicate::And(ps) => ps.iter().all(|p| p.matches(entry)),
            CompiledPredicate::Or(ps) => ps.iter().any(|p| p.matches(entry)),
            CompiledPredicate::Not(p) => !p.matches(entry),
        }
    }

    /// False only when no entry of `partition` can ever match
    pub fn may_match_partition(&self, partition: PartitionKey) -> bool {
        match self {
            CompiledPredicate::StatusIn(statuses) => match partition {
                PartitionKey::Status(status) => statuses.binary_search(&status).is_ok(),
                PartitionKey::Default => statuses.iter().any(|s| !is_routable(*s)),
            },
            CompiledPredicate::StatusBetween(min, max) => match partition {
                PartitionKey::Status(status) => (*min..=*max).contains(&status),
                PartitionKey::Default => *min < MIN_STATUS || *max > MAX_STATUS,
            },
            CompiledPredicate::And(ps) => ps.iter().all(|p| p.may_match_partition(partition)),
            CompiledPredicate::Or(ps) => ps.iter().any(|p| p.may_match_partition(partition)),
            _ => true,
        }
    }
}

fn is_routable(status: u16) -> bool {
    (MIN_STATUS..=MAX_STATUS).contains(&status)
}

/// What is computed per group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateKind {
    #[default]
    Count,
    /// Number of distinct values of `of` per group
    CountDistinct { of: KeyExtractor },
    /// The k groups with the highest count
    TopK { k: usize },
}

/// Comparison used by `having`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl CompareOp {
    pub fn apply(&self, left: u64, right: u64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => left == right,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "=",
        }
    }
}

/// Threshold on the aggregated value of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Having {
    pub op: CompareOp,
    pub value: u64,
}

impl Having {
    pub fn matches(&self, value: u64) -> bool {
        self.op.apply(value, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Key,
    Value,
}

/// Explicit row ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub by: SortKey,
    #[serde(default)]
    pub descending: bool,
}

/// A grouped aggregation over the partitioned store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationJob {
    pub group_by: Option<KeyExtractor>,
    pub aggregate: AggregateKind,
    pub filter: Option<Predicate>,
    pub having: Option<Having>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Restrict the scan to these partitions; all partitions when absent
    pub partitions: Option<Vec<PartitionKey>>,
}

impl AggregationJob {
    /// `COUNT(*)`
    pub fn count() -> Self {
        Self::default()
    }

    /// `COUNT(DISTINCT of)`
    pub fn count_distinct(of: KeyExtractor) -> Self {
        Self {
            aggregate: AggregateKind::CountDistinct { of },
            ..Default::default()
        }
    }

    /// The `k` largest groups by count
    pub fn top_k(k: usize) -> Self {
        Self {
            aggregate: AggregateKind::TopK { k },
            ..Default::default()
        }
    }

    pub fn group_by(mut self, extractor: KeyExtractor) -> Self {
        self.group_by = Some(extractor);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn having(mut self, op: CompareOp, value: u64) -> Self {
        self.having = Some(Having { op, value });
        self
    }

    pub fn order_by(mut self, by: SortKey, descending: bool) -> Self {
        self.order_by = Some(OrderBy { by, descending });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn partitions(mut self, partitions: impl IntoIterator<Item = PartitionKey>) -> Self {
        self.partitions = Some(partitions.into_iter().collect());
        self
    }

    /// Parse a JSON job; any shape error is an invalid job
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LogLensError::InvalidJobSpec(e.to_string()))
    }

    /// Validate and compile
    pub fn compile(&self, timestamp_width: Option<usize>) -> Result<CompiledJob> {
        if let Some(group_by) = &self.group_by {
            group_by.validate(timestamp_width)?;
        }
        let distinct = match &self.aggregate {
            AggregateKind::Count => None,
            AggregateKind::TopK { k } => {
                if *k == 0 {
                    return Err(LogLensError::InvalidJobSpec("top_k needs k > 0".into()));
                }
                None
            }
            AggregateKind::CountDistinct { of } => {
                of.validate(timestamp_width)?;
                if self.group_by.as_ref() == Some(of) {
                    return Err(LogLensError::InvalidJobSpec(format!(
                        "count_distinct of {} is the group key",
                        of
                    )));
                }
                Some(of.clone())
            }
        };
        let filter = self.filter.as_ref().map(Predicate::compile).transpose()?;

        Ok(CompiledJob {
            group_by: self.group_by.clone(),
            distinct,
            filter,
        })
    }
}

impl fmt::Display for AggregationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self
            .group_by
            .as_ref()
            .map(|g| g.to_string())
            .unwrap_or_else(|| ALL_ROWS_KEY.to_string());
        let value = match &self.aggregate {
            AggregateKind::CountDistinct { of } => format!("COUNT(DISTINCT {})", of),
            _ => "COUNT(*)".to_string(),
        };
        write!(f, "SELECT {}, {} FROM logs", key, value)?;

        if let Some(partitions) = &self.partitions {
            let list: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
            write!(f, " PARTITION ({})", list.join(", "))?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        if let Some(group_by) = &self.group_by {
            write!(f, " GROUP BY {}", group_by)?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING value {} {}", having.op.symbol(), having.value)?;
        }
        if let AggregateKind::TopK { k } = &self.aggregate {
            write!(f, " TOP {}", k)?;
        }
        if let Some(order) = &self.order_by {
            let by = match order.by {
                SortKey::Key => "key",
                SortKey::Value => "value",
            };
            write!(f, " ORDER BY {} {}", by, if order.descending { "DESC" } else { "ASC" })?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

/// Validated job, shared read-only by every partition scan
#[derive(Debug, Clone)]
pub struct CompiledJob {
    pub group_by: Option<KeyExtractor>,
    pub distinct: Option<KeyExtractor>,
    pub filter: Option<CompiledPredicate>,
}

impl CompiledJob {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(entry))
    }

    pub fn may_match_partition(&self, partition: PartitionKey) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.may_match_partition(partition))
    }

    pub fn group_key<'a>(&self, entry: &'a LogEntry) -> Cow<'a, str> {
        match &self.group_by {
            Some(extractor) => extractor.extract(entry),
            None => Cow::Borrowed(ALL_ROWS_KEY),
        }
    }

    /// Value fed to the accumulator; empty for plain counts
    pub fn distinct_value<'a>(&self, entry: &'a LogEntry) -> Cow<'a, str> {
        match &self.distinct {
            Some(extractor) => extractor.extract(entry),
            None => Cow::Borrowed(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16, url: &str, ts: &str) -> LogEntry {
        LogEntry::new("192.168.0.1", ts, url, status, "Mozilla/5.0 (X11, Linux)")
    }

    #[test]
    fn test_extractors() {
        let e = entry(404, "/missing", "2025-02-25 13:00:15");
        assert_eq!(KeyExtractor::Url.extract(&e), "/missing");
        assert_eq!(KeyExtractor::StatusCode.extract(&e), "404");
        assert_eq!(
            KeyExtractor::TimeBucket { prefix_len: 13 }.extract(&e),
            "2025-02-25 13"
        );
        assert_eq!(
            KeyExtractor::TimeBucket { prefix_len: 40 }.extract(&e),
            "2025-02-25 13:00:15"
        );
    }

    #[test]
    fn test_predicates() {
        let e = entry(503, "/api/orders/17", "2025-02-25 13:00:15");
        let p = Predicate::and(vec![
            Predicate::status_in([500, 503]),
            Predicate::UrlMatches {
                pattern: r"^/api/orders/\d+$".into(),
            },
            Predicate::negate(Predicate::UserAgentContains {
                needle: "curl".into(),
            }),
        ])
        .compile()
        .unwrap();
        assert!(p.matches(&e));

        let between = Predicate::TimestampBetween {
            start: "2025-02-25 13:00:00".into(),
            end: "2025-02-25 13:00:15".into(),
        }
        .compile()
        .unwrap();
        assert!(between.matches(&e));
        assert!(!between.matches(&entry(200, "/", "2025-02-25 13:00:16")));
    }

    #[test]
    fn test_partition_pruning() {
        let p = Predicate::status_in([500, 503]).compile().unwrap();
        assert!(p.may_match_partition(PartitionKey::Status(500)));
        assert!(!p.may_match_partition(PartitionKey::Status(200)));
        assert!(!p.may_match_partition(PartitionKey::Default));

        let p = Predicate::StatusBetween { min: 0, max: 99 }.compile().unwrap();
        assert!(p.may_match_partition(PartitionKey::Default));
        assert!(!p.may_match_partition(PartitionKey::Status(100)));

        let p = Predicate::negate(Predicate::status_in([200])).compile().unwrap();
        assert!(p.may_match_partition(PartitionKey::Status(200)));
    }

    #[test]
    fn test_invalid_jobs() {
        let invalid = [
            AggregationJob::top_k(0),
            AggregationJob::count().group_by(KeyExtractor::TimeBucket { prefix_len: 0 }),
            AggregationJob::count().group_by(KeyExtractor::TimeBucket { prefix_len: 20 }),
            AggregationJob::count().filter(Predicate::status_in([])),
            AggregationJob::count().filter(Predicate::StatusBetween { min: 500, max: 400 }),
            AggregationJob::count().filter(Predicate::UrlMatches {
                pattern: "([".into(),
            }),
            AggregationJob::count().filter(Predicate::or(vec![])),
            AggregationJob::count_distinct(KeyExtractor::Url).group_by(KeyExtractor::Url),
        ];
        for job in invalid {
            assert!(
                matches!(job.compile(Some(19)), Err(LogLensError::InvalidJobSpec(_))),
                "{} should be rejected",
                job
            );
        }
    }

    #[test]
    fn test_from_json() {
        let job = AggregationJob::from_json(
            r#"{
                "group_by": {"kind": "url"},
                "aggregate": {"kind": "count"},
                "filter": {"op": "status_in", "statuses": [404]},
                "having": {"op": "gt", "value": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(
            job,
            AggregationJob::count()
                .group_by(KeyExtractor::Url)
                .filter(Predicate::status_in([404]))
                .having(CompareOp::Gt, 2)
        );

        let job = AggregationJob::from_json(
            r#"{"aggregate": {"kind": "top_k", "k": 5}, "partitions": ["200", "__default__"]}"#,
        )
        .unwrap();
        assert_eq!(job.aggregate, AggregateKind::TopK { k: 5 });
        assert_eq!(
            job.partitions,
            Some(vec![PartitionKey::Status(200), PartitionKey::Default])
        );

        for bad in [
            r#"{"group_by": {"kind": "referrer"}}"#,
            r#"{"filter": {"op": "status_like", "pattern": "5%"}}"#,
            r#"{"sort": "desc"}"#,
        ] {
            assert!(matches!(
                AggregationJob::from_json(bad),
                Err(LogLensError::InvalidJobSpec(_))
            ));
        }
    }

    #[test]
    fn test_display() {
        let job = AggregationJob::top_k(10)
            .group_by(KeyExtractor::Url)
            .filter(Predicate::status_in([200]))
            .limit(5);
        assert_eq!(
            job.to_string(),
            "SELECT url, COUNT(*) FROM logs WHERE status_code IN (200) GROUP BY url TOP 10 LIMIT 5"
        );
    }
}
