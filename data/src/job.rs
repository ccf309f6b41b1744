use crate::message::ScoreSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// weights at or below this are treated as unset
pub const MIN_WEIGHT: f64 = 0.000001;

/// Solver arguments contributed by a job: bare flags and `--name value` pairs
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct JobArgs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, String>,
}

impl JobArgs {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// One named solver configuration that is run over and over
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Job {
    /// upper case region tag, e.g. NC
    #[serde(rename = "st")]
    pub region: String,
    /// unique key, e.g. NC_Congress
    pub name: String,

    #[serde(default, skip_serializing_if = "JobArgs::is_empty")]
    pub solver: JobArgs,
    #[serde(default, skip_serializing_if = "JobArgs::is_empty")]
    pub common: JobArgs,
    /// renderer arguments, not used by the runner but kept when the catalog is saved
    #[serde(default, skip_serializing_if = "JobArgs::is_empty")]
    pub drend: JobArgs,

    // unset 0.0 becomes 1.0, use `disabled` to drop a job entirely
    #[serde(default, skip_serializing_if = "is_unset")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,

    /// send even invalid results (for distributed debugging)
    #[serde(rename = "sendAnything", default, skip_serializing_if = "is_false")]
    pub send_anything: bool,
    /// only send results with a score below this
    #[serde(rename = "maxkmpp", default, skip_serializing_if = "is_unset")]
    pub max_score: f64,
    /// only send results with a spread below this
    #[serde(rename = "maxspread", default, skip_serializing_if = "is_unset")]
    pub max_spread: f64,

    /// where to fetch the dataset, falls back to the catalog's per region url
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
}

fn is_unset(value: &f64) -> bool {
    *value == 0.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Job {
    /// a job with default settings, mostly useful for building catalogs in code
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
            solver: JobArgs::default(),
            common: JobArgs::default(),
            drend: JobArgs::default(),
            weight: 0.0,
            disabled: false,
            send_anything: false,
            max_score: 0.0,
            max_spread: 0.0,
            data_url: None,
        }
    }

    /// effective selection weight, always > 0
    pub fn weight(&self) -> f64 {
        if self.weight <= MIN_WEIGHT {
            1.0
        } else {
            self.weight
        }
    }

    /// true if a result is above one of the configured send thresholds
    pub fn too_weak(&self, score: &ScoreSummary) -> bool {
        (self.max_score > 0.0 && score.kmpp > self.max_score)
            || (self.max_spread > 0.0 && score.spread > self.max_spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_weight_defaults_to_one() {
        let mut job = Job::new("NC_Congress", "NC");
        assert_eq!(job.weight(), 1.0);

        job.weight = 0.0000001;
        assert_eq!(job.weight(), 1.0);

        job.weight = 2.5;
        assert_eq!(job.weight(), 2.5);
    }

    #[test]
    fn thresholds_mark_weak_results() {
        let mut job = Job::new("NC_Congress", "NC");
        let score = ScoreSummary {
            kmpp: 41.2,
            spread: 1500.0,
            std: 400.0,
        };
        assert!(!job.too_weak(&score));

        job.max_score = 40.0;
        assert!(job.too_weak(&score));

        job.max_score = 50.0;
        job.max_spread = 1000.0;
        assert!(job.too_weak(&score));

        job.max_spread = 2000.0;
        assert!(!job.too_weak(&score));
    }

    #[test]
    fn parses_catalog_entry() {
        let job: Job = serde_json::from_str(
            r#"{"st":"NM","name":"NM_Senate","solver":{"kwargs":{"-g":"20000"}},"weight":3,"maxkmpp":90,"data":"https://example.com/NM.tar.gz"}"#,
        )
        .unwrap();

        assert_eq!(job.region, "NM");
        assert_eq!(job.solver.kwargs.get("-g").map(String::as_str), Some("20000"));
        assert!(job.common.is_empty());
        assert_eq!(job.weight(), 3.0);
        assert_eq!(job.max_score, 90.0);
        assert_eq!(job.data_url.as_deref(), Some("https://example.com/NM.tar.gz"));

        let blob = serde_json::to_string(&Job::new("X", "XX")).unwrap();
        assert_eq!(blob, r#"{"st":"XX","name":"X"}"#);
    }
}
