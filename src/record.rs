use crate::lattice::{AggregateKey, Dimension};
use crate::metric::Metrics;

/// VO types whose VO string is already a full VO name.
pub const DEFAULT_FULL_NAME_VO_TYPES: &[&str] = &["voms", "grid-vo-map/vomss"];

/// Separator between the VO name and the rest of a free-form VO string.
const VO_SEPARATOR: char = '.';

/// One completed computing job as stored by the accounting source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageRecord {
    pub record_id: String,
    pub global_user_name: String,
    pub vo_type: Option<String>,
    pub vo_name: Option<String>,
    pub machine_name: String,
    pub status: Option<String>,
    /// Epoch seconds when the record entered the source.
    pub insert_time: i64,
    /// Epoch seconds when the job completed.
    pub end_time: i64,
    pub cpu_duration: Option<i64>,
    pub wall_duration: Option<i64>,
    pub user_time: Option<i64>,
    pub kernel_time: Option<i64>,
    pub major_page_faults: Option<i64>,
}

/// Rules for turning a raw (type, string) VO pair into a VO name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoNameRules {
    full_name_types: Vec<String>,
}

impl VoNameRules {
    pub fn new<I, S>(full_name_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            full_name_types: full_name_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Derives the VO name.
    ///
    /// Empty strings stay empty. Full-name VO types pass through unchanged.
    /// Anything else keeps the prefix before the first `.`, or becomes empty
    /// when there is no `.` at all.
    pub fn derive(&self, vo_type: Option<&str>, vo_string: Option<&str>) -> String {
        let Some(vo_string) = vo_string.filter(|s| !s.is_empty()) else {
            return String::new();
        };

        if let Some(vo_type) = vo_type {
            if self.full_name_types.iter().any(|t| t == vo_type) {
                return vo_string.to_string();
            }
        }

        match vo_string.split_once(VO_SEPARATOR) {
            Some((prefix, _)) => prefix.to_string(),
            None => String::new(),
        }
    }
}

impl Default for VoNameRules {
    fn default() -> Self {
        Self::new(DEFAULT_FULL_NAME_VO_TYPES.iter().copied())
    }
}

/// Derives a VO name using the default full-name authorities.
pub fn derive_vo_name(vo_type: &str, vo_string: &str) -> String {
    VoNameRules::default().derive(Some(vo_type), Some(vo_string))
}

/// Dimension tuple of an aggregate row. Dimensions a key does not retain
/// are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionValues {
    pub user: Option<String>,
    pub vo: Option<String>,
    pub machine: Option<String>,
    pub status: Option<String>,
}

impl DimensionValues {
    /// Builds the full four-dimension tuple for a raw record.
    pub fn from_record(record: &UsageRecord, rules: &VoNameRules) -> Self {
        Self {
            user: Some(record.global_user_name.clone()),
            vo: Some(rules.derive(record.vo_type.as_deref(), record.vo_name.as_deref())),
            machine: Some(record.machine_name.clone()),
            status: Some(record.status.clone().unwrap_or_default()),
        }
    }

    pub fn get(&self, dim: Dimension) -> Option<&str> {
        match dim {
            Dimension::User => self.user.as_deref(),
            Dimension::Vo => self.vo.as_deref(),
            Dimension::Machine => self.machine.as_deref(),
            Dimension::Status => self.status.as_deref(),
        }
    }

    pub fn set(&mut self, dim: Dimension, value: Option<String>) {
        match dim {
            Dimension::User => self.user = value,
            Dimension::Vo => self.vo = value,
            Dimension::Machine => self.machine = value,
            Dimension::Status => self.status = value,
        }
    }

    /// Keeps only the dimensions `key` retains.
    pub fn project(&self, key: AggregateKey) -> Self {
        let keep = |dim: Dimension, value: &Option<String>| {
            if key.retains(dim) {
                value.clone()
            } else {
                None
            }
        };

        Self {
            user: keep(Dimension::User, &self.user),
            vo: keep(Dimension::Vo, &self.vo),
            machine: keep(Dimension::Machine, &self.machine),
            status: keep(Dimension::Status, &self.status),
        }
    }

    /// True if every dimension set in `filter` has the same value here.
    pub fn matches(&self, filter: &DimensionValues) -> bool {
        [
            Dimension::User,
            Dimension::Vo,
            Dimension::Machine,
            Dimension::Status,
        ]
        .into_iter()
        .all(|dim| match filter.get(dim) {
            Some(wanted) => self.get(dim) == Some(wanted),
            None => true,
        })
    }
}

/// One stored aggregate: dimension tuple, bucket identity and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateRow {
    pub dims: DimensionValues,
    /// Bucket width in seconds.
    pub resolution: i64,
    /// Inclusive last second of the bucket.
    pub t_epoch: i64,
    pub metrics: Metrics,
}
