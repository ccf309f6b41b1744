use crate::job::Job;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_MAX_FAILURES_NUMERATOR: usize = 5;
pub const DEFAULT_MAX_FAILURES_DENOMINATOR: usize = 11;

/// Job catalog plus the global settings that travel with it
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    /// job name -> job
    #[serde(rename = "c", default)]
    pub jobs: BTreeMap<String, Job>,

    /// where to get the next version of this catalog
    #[serde(rename = "url", default, skip_serializing_if = "String::is_empty")]
    pub config_url: String,

    /// where to send results
    #[serde(rename = "post", default, skip_serializing_if = "String::is_empty")]
    pub post_url: String,

    /// unix seconds
    #[serde(rename = "ts", default, skip_serializing_if = "is_zero")]
    pub timestamp: i64,

    /// region -> dataset url, e.g. {"NM": "https://bot.bdistricting.com/2020/NM_1234.tar.gz"}
    #[serde(rename = "durls", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_urls: BTreeMap<String, String>,

    // solver crash/fail should not exceed mfn/mfd
    #[serde(rename = "mfn", default, skip_serializing_if = "is_unset")]
    pub max_failures_numerator: usize,
    #[serde(rename = "mfd", default, skip_serializing_if = "is_unset")]
    pub max_failures_denominator: usize,

    /// dotted path -> value, applied by the config server on top of the merged catalog
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overlays: BTreeMap<String, Value>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_unset(value: &usize) -> bool {
    *value == 0
}

impl Catalog {
    /// fill in the failure ratio when it was never configured
    pub fn normalize(&mut self) {
        if self.max_failures_denominator == 0 {
            self.max_failures_numerator = DEFAULT_MAX_FAILURES_NUMERATOR;
            self.max_failures_denominator = DEFAULT_MAX_FAILURES_DENOMINATOR;
        }
    }

    /// layer `other` on top of this catalog, jobs are merged by name and set values win
    pub fn merge(&mut self, other: Catalog) {
        self.jobs.extend(other.jobs);
        self.data_urls.extend(other.data_urls);
        self.overlays.extend(other.overlays);

        if !other.config_url.is_empty() {
            self.config_url = other.config_url;
        }
        if !other.post_url.is_empty() {
            self.post_url = other.post_url;
        }
        if other.timestamp != 0 {
            self.timestamp = other.timestamp;
        }
        if other.max_failures_denominator != 0 {
            self.max_failures_numerator = other.max_failures_numerator;
            self.max_failures_denominator = other.max_failures_denominator;
        }
    }
}

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("overlay {path} crosses non-object value at {segment}")]
    NotAnObject { path: String, segment: String },
    #[error("overlay path is empty")]
    EmptyPath,
}

/// write every `a.b.c -> value` overlay into a json tree, creating objects on the way
pub fn apply_overlays(
    target: &mut Value,
    overlays: &BTreeMap<String, Value>,
) -> Result<(), OverlayError> {
    for (path, value) in overlays {
        let mut segments = path.split('.').collect::<Vec<_>>();
        let Some(last) = segments.pop().filter(|last| !last.is_empty()) else {
            return Err(OverlayError::EmptyPath);
        };

        let mut node = &mut *target;
        for segment in segments {
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => {
                    return Err(OverlayError::NotAnObject {
                        path: path.clone(),
                        segment: segment.to_string(),
                    })
                }
            };
        }

        match node {
            Value::Object(map) => {
                map.insert(last.to_string(), value.clone());
            }
            _ => {
                return Err(OverlayError::NotAnObject {
                    path: path.clone(),
                    segment: last.to_string(),
                })
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_defaults_failure_ratio() {
        let mut catalog = Catalog::default();
        catalog.normalize();
        assert_eq!(catalog.max_failures_numerator, 5);
        assert_eq!(catalog.max_failures_denominator, 11);

        let mut catalog = Catalog {
            max_failures_numerator: 2,
            max_failures_denominator: 3,
            ..Default::default()
        };
        catalog.normalize();
        assert_eq!(catalog.max_failures_numerator, 2);
        assert_eq!(catalog.max_failures_denominator, 3);
    }

    #[test]
    fn merge_keeps_local_jobs_and_overrides_settings() {
        let mut local: Catalog = serde_json::from_value(json!({
            "c": {"A": {"st": "AA", "name": "A"}, "B": {"st": "BB", "name": "B", "weight": 2}},
            "post": "http://local/put",
            "durls": {"AA": "http://local/AA.tar.gz"}
        }))
        .unwrap();
        let server: Catalog = serde_json::from_value(json!({
            "c": {"B": {"st": "BB", "name": "B", "weight": 5}, "C": {"st": "CC", "name": "C"}},
            "url": "http://server/config.json",
            "durls": {"CC": "http://server/CC.tar.gz"},
            "mfn": 3,
            "mfd": 7
        }))
        .unwrap();

        local.merge(server);

        assert_eq!(local.jobs.len(), 3);
        assert_eq!(local.jobs["B"].weight, 5.0);
        assert_eq!(local.post_url, "http://local/put");
        assert_eq!(local.config_url, "http://server/config.json");
        assert_eq!(local.data_urls.len(), 2);
        assert_eq!(
            (local.max_failures_numerator, local.max_failures_denominator),
            (3, 7)
        );
    }

    #[test]
    fn overlays_create_intermediate_objects() {
        let mut tree = json!({"c": {"A": {"st": "AA", "name": "A"}}, "post": "x"});
        let overlays = BTreeMap::from([
            ("c.A.weight".to_string(), json!(4)),
            ("c.Z.disabled".to_string(), json!(true)),
            ("post".to_string(), json!("y")),
        ]);

        apply_overlays(&mut tree, &overlays).unwrap();

        assert_eq!(tree["c"]["A"]["weight"], 4);
        assert_eq!(tree["c"]["Z"]["disabled"], true);
        assert_eq!(tree["post"], "y");
    }

    #[test]
    fn overlays_refuse_to_cross_scalars() {
        let mut tree = json!({"post": "x"});
        let overlays = BTreeMap::from([("post.inner".to_string(), json!(1))]);

        assert!(matches!(
            apply_overlays(&mut tree, &overlays),
            Err(OverlayError::NotAnObject { .. })
        ));
    }
}
